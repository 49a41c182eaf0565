use ffmpeg_bus::{bsf, output::Muxer, packet::CodedPacket, params::StreamParameters};
use tokio::sync::mpsc;

use crate::{fault::ErrorStreak, output::PipelineEvent};

/// One destination: keyframe gating, header recovery, timestamp rebasing and
/// failure accounting in front of a [`Muxer`].
pub struct OutputSink {
    name: String,
    muxer: Box<dyn Muxer>,
    params: Option<StreamParameters>,
    opened: bool,
    /// Decode timestamp of the first keyframe written; unset until the header is out.
    first_dts: Option<i64>,
    errors: ErrorStreak,
    broken: bool,
    annexb: bool,
    events: mpsc::UnboundedSender<PipelineEvent>,
}

impl OutputSink {
    pub fn new(
        name: impl Into<String>,
        muxer: Box<dyn Muxer>,
        error_threshold: u32,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            muxer,
            params: None,
            opened: false,
            first_dts: None,
            errors: ErrorStreak::new(error_threshold),
            broken: false,
            annexb: false,
            events,
        }
    }

    /// Convert payloads to start-code delimited NAL units before muxing.
    pub fn with_annexb(mut self, annexb: bool) -> Self {
        self.annexb = annexb;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn open(&mut self, params: &StreamParameters) -> anyhow::Result<()> {
        self.opened = false;
        self.first_dts = None;
        self.params = Some(params.clone());
        log::info!(
            target: "output",
            "{}: opening for {:?} {}x{} (generation {})",
            self.name,
            params.codec,
            params.width,
            params.height,
            params.generation
        );
        self.muxer.open(params)?;
        self.opened = true;
        Ok(())
    }

    fn signal_broken(&mut self) {
        if self.broken {
            return;
        }
        self.broken = true;
        log::error!(target: "output", "{}: broken", self.name);
        let _ = self.events.send(PipelineEvent::Broken {
            output: self.name.clone(),
        });
    }

    fn count_error(&mut self) {
        if self.errors.fail() {
            log::error!(
                target: "output",
                "{}: {} consecutive errors",
                self.name,
                self.errors.count()
            );
            self.signal_broken();
        }
    }

    /// Writes the container header at the first keyframe, recovering parameter
    /// sets from it when the encoder did not supply them.
    fn start(&mut self, packet: &CodedPacket) -> bool {
        let Some(params) = self.params.as_mut() else {
            return false;
        };
        if params.headers.as_ref().is_none_or(|h| h.is_empty()) {
            match bsf::extract_parameter_sets(&bsf::to_annexb(packet.data())) {
                Some(headers) => {
                    log::info!(
                        target: "output",
                        "{}: recovered {} bytes of parameter sets from keyframe",
                        self.name,
                        headers.len()
                    );
                    *params = params.with_headers(headers);
                }
                None => log::warn!(
                    target: "output",
                    "{}: no parameter sets in first keyframe",
                    self.name
                ),
            }
        }
        let params = params.clone();
        match self.muxer.write_header(&params) {
            Ok(()) => {
                self.first_dts = Some(packet.dts());
                log::info!(
                    target: "output",
                    "{}: header written, first dts {}",
                    self.name,
                    packet.dts()
                );
                true
            }
            Err(e) => {
                log::error!(target: "output", "{}: write header failed: {:#}", self.name, e);
                self.count_error();
                false
            }
        }
    }

    pub fn write_packet(&mut self, packet: &CodedPacket) {
        if !self.opened {
            log::error!(target: "output", "{}: output context was not initialized", self.name);
            self.signal_broken();
            return;
        }

        let first_dts = match self.first_dts {
            Some(dts) => dts,
            None => {
                if !packet.is_key() || !self.start(packet) {
                    return;
                }
                packet.dts()
            }
        };

        let mut packet = packet.rebased(first_dts);
        if self.annexb {
            packet = packet.with_data(bsf::to_annexb(packet.data()));
        }

        match self.muxer.write_packet(&packet) {
            Ok(()) => self.errors.succeed(),
            Err(e) => {
                log::error!(target: "output", "{}: write error: {:#}", self.name, e);
                self.count_error();
            }
        }
    }

    pub fn close(&mut self) {
        if let Err(e) = self.muxer.close() {
            log::warn!(target: "output", "{}: close: {:#}", self.name, e);
        }
        if self.opened {
            log::info!(target: "output", "{}: closed", self.name);
        }
        self.opened = false;
        self.first_dts = None;
    }
}

#[cfg(test)]
#[path = "sink_test.rs"]
mod sink_test;
