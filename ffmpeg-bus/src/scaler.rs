use ffmpeg_next::{format::Pixel, software::scaling};

/// Size of a `width`x`height` picture scaled to fit inside a `cell_width`x`cell_height`
/// cell with its aspect ratio kept. Both dimensions are rounded to the nearest
/// integer, then down to a multiple of 4.
pub fn fit_within(width: u32, height: u32, cell_width: u32, cell_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (0, 0);
    }
    let scale = f64::min(
        cell_width as f64 / width as f64,
        cell_height as f64 / height as f64,
    );
    let fit = |dim: u32| ((dim as f64 * scale + 0.5) as u32) & !3;
    (fit(width), fit(height))
}

/// Converts decoded frames of any format and size into YUV420P at a target size.
/// The swscale context is rebuilt only when the source or target geometry changes.
pub struct Scaler {
    context: Option<scaling::Context>,
    key: (Pixel, u32, u32, u32, u32),
}

unsafe impl Send for Scaler {}

impl Scaler {
    pub fn new() -> Self {
        Self {
            context: None,
            key: (Pixel::None, 0, 0, 0, 0),
        }
    }

    pub fn run(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        dst: &mut ffmpeg_next::frame::Video,
        width: u32,
        height: u32,
    ) -> anyhow::Result<()> {
        let key = (frame.format(), frame.width(), frame.height(), width, height);
        if self.context.is_none() || self.key != key {
            self.context = Some(scaling::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                Pixel::YUV420P,
                width,
                height,
                scaling::flag::Flags::FAST_BILINEAR,
            )?);
            self.key = key;
        }
        match self.context.as_mut() {
            Some(context) => context.run(frame, dst).map_err(|e| e.into()),
            None => Err(anyhow::anyhow!("scaler not initialized")),
        }
    }
}

impl Default for Scaler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_quarter_cell() {
        // exact 0.25 scale; 270 is not a multiple of 4
        assert_eq!(fit_within(1920, 1080, 480, 270), (480, 268));
        assert_eq!(fit_within(1920, 1080, 480, 272), (480, 268));
    }

    #[test]
    fn test_fit_keeps_aspect_in_tall_cell() {
        // limited by width: 640/1280 = 0.5
        assert_eq!(fit_within(1280, 720, 640, 480), (640, 360));
    }

    #[test]
    fn test_fit_rounds_down_to_multiple_of_four() {
        // 704x576 into 350x350: scale = 350/704, 576 * scale = 286.4 -> 286 -> 284
        let (w, h) = fit_within(704, 576, 350, 350);
        assert_eq!((w, h), (348, 284));
        assert_eq!(w % 4, 0);
        assert_eq!(h % 4, 0);
    }

    #[test]
    fn test_fit_zero_source() {
        assert_eq!(fit_within(0, 1080, 480, 270), (0, 0));
    }
}
