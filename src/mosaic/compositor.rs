use std::sync::Arc;
use std::time::Duration;

use ffmpeg_bus::picture::Picture;
use tokio_util::sync::CancellationToken;

use crate::mosaic::{layout::CamSlot, sync_buffer::SyncBuffer, ticker::Ticker};

/// Receives every finished canvas, on the compositor thread.
pub trait CanvasConsumer: Send {
    fn consume(&mut self, canvas: &Picture);
}

/// Paints the freshest picture of every cell into one canvas at the output rate.
pub struct Compositor {
    canvas: Picture,
    fps: u32,
    slots: Vec<CamSlot>,
    buffers: Vec<Option<Arc<SyncBuffer>>>,
    live: Vec<bool>,
}

impl Compositor {
    /// `buffers[i]` feeds `slots[i]`; `None` marks a disabled cell.
    pub fn new(
        width: u32,
        height: u32,
        fps: u32,
        slots: Vec<CamSlot>,
        buffers: Vec<Option<Arc<SyncBuffer>>>,
    ) -> Self {
        let live = vec![false; slots.len()];
        Self {
            canvas: Picture::blank(width, height),
            fps: fps.max(1),
            slots,
            buffers,
            live,
        }
    }

    /// Nominal time between two output frames, in microseconds.
    pub fn span(&self) -> i64 {
        1_000_000 / self.fps as i64
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis((1000.0 / self.fps as f64).round() as u64)
    }

    /// Composes one output frame.
    pub fn paint(&mut self) -> &Picture {
        self.canvas.clear();
        let span = self.span();
        for index in 0..self.slots.len() {
            let Some(buffer) = self.buffers.get(index).and_then(|b| b.as_ref()) else {
                continue;
            };
            let picture = buffer.pull(span);
            let slot = &self.slots[index];

            if picture.is_some() != self.live[index] {
                self.live[index] = picture.is_some();
                if picture.is_some() {
                    log::info!(target: "compositor", "{}: live", slot.name);
                } else {
                    log::warn!(target: "compositor", "{}: no picture, cell blanked", slot.name);
                }
            }
            let Some(picture) = picture else {
                continue;
            };

            let rect = slot.rect;
            if picture.width() > rect.width || picture.height() > rect.height {
                log::error!(
                    target: "compositor",
                    "{}: {}x{} picture is larger than its {}x{} cell",
                    slot.name,
                    picture.width(),
                    picture.height(),
                    rect.width,
                    rect.height
                );
                continue;
            }
            let x = rect.x + (((rect.width - picture.width()) / 2) & !1);
            let y = rect.y + (((rect.height - picture.height()) / 2) & !1);
            if let Err(e) = self.canvas.blit(&picture, x, y) {
                log::error!(target: "compositor", "{}: {:#}", slot.name, e);
            }
        }
        &self.canvas
    }

    /// Paints and hands out one canvas per period until `cancel` fires, then gives
    /// the consumer back.
    pub fn run<C: CanvasConsumer>(mut self, mut consumer: C, cancel: CancellationToken) -> C {
        let mut ticker = Ticker::new(self.period());
        log::info!(
            target: "compositor",
            "compositor started: {}x{} @ {} fps, {} cells",
            self.canvas.width(),
            self.canvas.height(),
            self.fps,
            self.slots.len()
        );
        while !cancel.is_cancelled() {
            consumer.consume(self.paint());
            let missed = ticker.wait();
            if missed > 0 {
                log::debug!(target: "compositor", "fell behind, skipped {} ticks", missed);
            }
        }
        log::info!(target: "compositor", "compositor stopped");
        consumer
    }
}
