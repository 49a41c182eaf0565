use crate::config::{Config, Rect};

/// Placement of one source in the mosaic. Fixed for the life of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CamSlot {
    pub index: usize,
    pub name: String,
    pub url: Option<String>,
    pub rect: Rect,
    pub present: bool,
}

impl CamSlot {
    pub fn cell_width(&self) -> u32 {
        self.rect.width
    }

    pub fn cell_height(&self) -> u32 {
        self.rect.height
    }
}

/// Cell `index` of a `rows`x`cols` grid over a `width`x`height` canvas, in row-major
/// order. Cell sizes are rounded down to even so every offset stays chroma aligned.
pub fn grid_cell(width: u32, height: u32, rows: u32, cols: u32, index: usize) -> Rect {
    let cell_width = (width / cols) & !1;
    let cell_height = (height / rows) & !1;
    let index = index as u32;
    Rect {
        x: (index % cols) * cell_width,
        y: (index / cols) * cell_height,
        width: cell_width,
        height: cell_height,
    }
}

/// Builds the slot list from a validated configuration. An explicit `rect` wins
/// over the grid position.
pub fn slots(config: &Config) -> Vec<CamSlot> {
    config
        .cells
        .iter()
        .enumerate()
        .map(|(index, cell)| {
            let rect = match (cell.rect, config.grid) {
                (Some(rect), _) => rect,
                (None, Some(grid)) => grid_cell(
                    config.output.width,
                    config.output.height,
                    grid.rows,
                    grid.cols,
                    index,
                ),
                (None, None) => Rect {
                    x: 0,
                    y: 0,
                    width: config.output.width,
                    height: config.output.height,
                },
            };
            CamSlot {
                index,
                name: cell.name.clone().unwrap_or_else(|| format!("cam{}", index)),
                url: cell.url.clone(),
                rect,
                present: cell.present,
            }
        })
        .collect()
}
