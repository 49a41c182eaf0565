use std::sync::Arc;
use std::time::Duration;

use ffmpeg_bus::{
    encoder::{Encoder, EncoderSettings, PictureEncoder},
    output::AvOutput,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Config, Destination},
    fault::Faults,
    mosaic::{
        capture::{CaptureSource, CaptureState},
        compositor::Compositor,
        encode::EncodeStage,
        layout,
        sync_buffer::SyncBuffer,
    },
    output::{
        Outputs, OutputSink, PipelineEvent,
        fanout::{FanoutHub, FanoutMuxer, FanoutServer},
    },
};

const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

struct RunningSource {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<CaptureState>,
}

struct RunningCompositor<E: PictureEncoder> {
    cancel: CancellationToken,
    handle: JoinHandle<EncodeStage<E>>,
}

/// Sources, buffers, compositor, encoder and outputs of one mosaic.
pub struct Pipeline<E: PictureEncoder + 'static> {
    cancel: CancellationToken,
    faults: Faults,
    events_tx: mpsc::UnboundedSender<PipelineEvent>,
    events_rx: mpsc::UnboundedReceiver<PipelineEvent>,
    servers: Vec<FanoutServer>,
    sources: Vec<CaptureSource>,
    compositor: Option<Compositor>,
    stage: Option<EncodeStage<E>>,
    running_sources: Vec<RunningSource>,
    running_compositor: Option<RunningCompositor<E>>,
    stopped: bool,
}

impl Pipeline<Encoder> {
    /// Builds the whole pipeline from configuration: fan-out servers are bound and
    /// the encoder is opened here, so every fatal startup error surfaces before
    /// any source is started.
    pub async fn initialize(config: &Config, faults: Faults) -> anyhow::Result<Self> {
        let mut pipeline = Self::new(config, faults);
        match pipeline.build_outputs(config).await {
            Ok(outputs) => {
                let out = &config.output;
                let encoder = Encoder::new(EncoderSettings {
                    width: out.width,
                    height: out.height,
                    fps: out.fps,
                    crf: out.crf,
                    codec: out.encoder.clone(),
                    preset: out.preset.clone(),
                    global_header: out.global_header,
                });
                if let Err(e) = pipeline.initialize_stage(encoder, outputs).await {
                    pipeline.stop_all().await;
                    return Err(e);
                }
            }
            Err(e) => {
                pipeline.stop_all().await;
                return Err(e);
            }
        }
        Ok(pipeline)
    }

    async fn build_outputs(&mut self, config: &Config) -> anyhow::Result<Outputs> {
        let threshold = config.output_error_threshold;
        let mut sinks = Vec::new();
        for destination in config.destinations()? {
            let name = destination.url().to_string();
            let sink = match destination {
                Destination::Rtp { url } => OutputSink::new(
                    name,
                    Box::new(AvOutput::new(&url, "rtp")),
                    threshold,
                    self.events(),
                ),
                Destination::Rtmp { url } => OutputSink::new(
                    name,
                    Box::new(AvOutput::new(&url, "flv")),
                    threshold,
                    self.events(),
                ),
                Destination::WebSocket { port, .. } => {
                    let hub = Arc::new(FanoutHub::new(name.clone()));
                    let server =
                        FanoutServer::bind(port, hub.clone(), self.cancel.child_token()).await?;
                    self.servers.push(server);
                    OutputSink::new(name, Box::new(FanoutMuxer::new(hub)), threshold, self.events())
                        .with_annexb(true)
                }
            };
            sinks.push(sink);
        }
        Ok(Outputs::new(sinks))
    }
}

impl<E: PictureEncoder + 'static> Pipeline<E> {
    /// Lays out the cells and creates one buffer and capture source per present
    /// cell. Disabled cells get no buffer and stay blank.
    pub fn new(config: &Config, faults: Faults) -> Self {
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let slots = layout::slots(config);

        let mut sources = Vec::new();
        let mut buffers = Vec::with_capacity(slots.len());
        for slot in &slots {
            let url = match (&slot.url, slot.present) {
                (Some(url), true) => url.clone(),
                _ => {
                    log::info!(target: "pipeline", "{}: disabled", slot.name);
                    buffers.push(None);
                    continue;
                }
            };
            let buffer = Arc::new(SyncBuffer::new(
                slot.name.clone(),
                config.sync.capacity,
                config.sync.repeat_limit,
            ));
            sources.push(CaptureSource::new(
                slot.clone(),
                url,
                config.capture.clone(),
                buffer.clone(),
                faults.clone(),
                cancel.child_token(),
            ));
            buffers.push(Some(buffer));
        }

        let out = &config.output;
        let compositor = Compositor::new(out.width, out.height, out.fps, slots, buffers);

        Self {
            cancel,
            faults,
            events_tx,
            events_rx,
            servers: Vec::new(),
            sources,
            compositor: Some(compositor),
            stage: None,
            running_sources: Vec::new(),
            running_compositor: None,
            stopped: false,
        }
    }

    /// Sender for output sinks to report through.
    pub fn events(&self) -> mpsc::UnboundedSender<PipelineEvent> {
        self.events_tx.clone()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Opens the encoder and the outputs. Failure here is fatal.
    pub async fn initialize_stage(&mut self, encoder: E, outputs: Outputs) -> anyhow::Result<()> {
        let mut stage = EncodeStage::new(encoder, outputs, self.faults.clone());
        let (stage, result) = tokio::task::spawn_blocking(move || {
            let result = stage.initialize();
            (stage, result)
        })
        .await?;
        // kept even on failure so stop_all closes whatever was opened
        self.stage = Some(stage);
        if let Err(e) = result {
            self.faults
                .critical("encoder", format!("encoder initialization failed: {:#}", e));
            return Err(e);
        }
        Ok(())
    }

    /// Starts every capture source on its own thread, then the compositor.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.stopped {
            anyhow::bail!("pipeline already stopped");
        }
        if self.compositor.is_none() || self.stage.is_none() {
            anyhow::bail!("pipeline is not initialized");
        }
        let (Some(compositor), Some(stage)) = (self.compositor.take(), self.stage.take()) else {
            anyhow::bail!("pipeline is not initialized");
        };

        for source in self.sources.drain(..) {
            let name = source.name().to_string();
            let cancel = source.cancel_token();
            let handle = tokio::task::spawn_blocking(move || source.run());
            log::info!(target: "pipeline", "{}: capture started", name);
            self.running_sources.push(RunningSource {
                name,
                cancel,
                handle,
            });
        }

        let cancel = self.cancel.child_token();
        let token = cancel.clone();
        let handle = tokio::task::spawn_blocking(move || compositor.run(stage, token));
        self.running_compositor = Some(RunningCompositor { cancel, handle });
        log::info!(
            target: "pipeline",
            "pipeline started with {} sources",
            self.running_sources.len()
        );
        Ok(())
    }

    /// Waits for the next pipeline event. Only `Broken` exists; the caller is
    /// expected to answer it with [`Pipeline::stop_all`].
    pub async fn next_event(&mut self) -> Option<PipelineEvent> {
        self.events_rx.recv().await
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stops sources, compositor, outputs and servers, in that order. Safe to
    /// call more than once.
    pub async fn stop_all(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        log::info!(target: "pipeline", "stopping pipeline");

        for source in &self.running_sources {
            source.cancel.cancel();
        }
        for source in self.running_sources.drain(..) {
            match tokio::time::timeout(JOIN_TIMEOUT, source.handle).await {
                Ok(Ok(state)) => {
                    log::info!(target: "pipeline", "{}: capture ended in {:?}", source.name, state)
                }
                Ok(Err(e)) => log::error!(target: "pipeline", "{}: capture task: {}", source.name, e),
                Err(_) => log::warn!(
                    target: "pipeline",
                    "{}: capture did not stop within {:?}, detaching",
                    source.name,
                    JOIN_TIMEOUT
                ),
            }
        }

        if let Some(running) = self.running_compositor.take() {
            running.cancel.cancel();
            match tokio::time::timeout(JOIN_TIMEOUT, running.handle).await {
                Ok(Ok(stage)) => self.stage = Some(stage),
                Ok(Err(e)) => log::error!(target: "pipeline", "compositor task: {}", e),
                Err(_) => log::warn!(
                    target: "pipeline",
                    "compositor did not stop within {:?}, outputs left open",
                    JOIN_TIMEOUT
                ),
            }
        }

        if let Some(mut stage) = self.stage.take() {
            let closed = tokio::task::spawn_blocking(move || stage.close()).await;
            if let Err(e) = closed {
                log::error!(target: "pipeline", "closing outputs: {}", e);
            }
        }

        for server in &mut self.servers {
            server.shutdown().await;
        }
        self.servers.clear();
        self.sources.clear();
        self.compositor = None;
        self.cancel.cancel();
        log::info!(target: "pipeline", "pipeline stopped");
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
