use ffmpeg_bus::{encoder::PictureEncoder, picture::Picture};

use crate::{
    fault::{ErrorStreak, Faults},
    mosaic::compositor::CanvasConsumer,
    output::Outputs,
};

/// Encoder plus every output, driven synchronously by the compositor.
pub struct EncodeStage<E: PictureEncoder> {
    encoder: E,
    outputs: Outputs,
    faults: Faults,
    // trips on the first failure of a run, so each run is reported once
    errors: ErrorStreak,
    opened: bool,
}

impl<E: PictureEncoder> EncodeStage<E> {
    pub fn new(encoder: E, outputs: Outputs, faults: Faults) -> Self {
        Self {
            encoder,
            outputs,
            faults,
            errors: ErrorStreak::new(1),
            opened: false,
        }
    }

    /// Opens the encoder and hands the resulting stream parameters to every
    /// output before any packet is produced.
    pub fn initialize(&mut self) -> anyhow::Result<()> {
        let params = self.encoder.open()?;
        log::info!(
            target: "encoder",
            "stream parameters: {:?} {}x{} @ {}, headers {} bytes, generation {}",
            params.codec,
            params.width,
            params.height,
            params.frame_rate,
            params.headers.as_ref().map_or(0, |h| h.len()),
            params.generation
        );
        log::debug!(target: "encoder", "opening {} outputs", self.outputs.len());
        self.outputs.open_all(&params);
        self.opened = true;
        Ok(())
    }

    /// Starts a new coded stream; every output is reopened with the new parameters.
    pub fn reinitialize(&mut self) -> anyhow::Result<()> {
        log::info!(target: "encoder", "reinitializing encoder");
        self.opened = false;
        self.initialize()
    }

    pub fn close(&mut self) {
        self.outputs.close_all();
        self.opened = false;
    }
}

impl<E: PictureEncoder> CanvasConsumer for EncodeStage<E> {
    fn consume(&mut self, canvas: &Picture) {
        if !self.opened {
            return;
        }
        match self.encoder.encode(canvas) {
            Ok(packets) => {
                self.errors.succeed();
                for packet in &packets {
                    self.outputs.write_all(packet);
                }
            }
            Err(e) => {
                if self.errors.fail() {
                    self.faults.critical("encoder", format!("encode failed: {:#}", e));
                } else {
                    log::error!(target: "encoder", "encode failed: {:#}", e);
                }
            }
        }
    }
}
