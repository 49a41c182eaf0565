use ffmpeg_bus::{packet::CodedPacket, params::StreamParameters};

pub mod fanout;
pub mod sink;

pub use sink::OutputSink;

/// Events sent from the compositor thread to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// An output gave up; the whole pipeline has to stop.
    Broken { output: String },
}

/// Every configured output, fed in configuration order.
#[derive(Default)]
pub struct Outputs {
    sinks: Vec<OutputSink>,
}

impl Outputs {
    pub fn new(sinks: Vec<OutputSink>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// (Re)opens every output with fresh stream parameters. A failed output stays
    /// closed and reports itself broken on its next packet.
    pub fn open_all(&mut self, params: &StreamParameters) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.open(params) {
                log::error!(target: "output", "{}: open failed: {:#}", sink.name(), e);
            }
        }
    }

    pub fn write_all(&mut self, packet: &CodedPacket) {
        for sink in &mut self.sinks {
            sink.write_packet(packet);
        }
    }

    pub fn close_all(&mut self) {
        for sink in &mut self.sinks {
            sink.close();
        }
    }
}
