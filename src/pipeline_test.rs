use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use ffmpeg_bus::{
    encoder::PictureEncoder, output::Muxer, packet::CodedPacket, params::StreamParameters,
    picture::Picture,
};
use ffmpeg_next::{Rational, codec, format::Pixel};

use super::Pipeline;
use crate::{
    config::Config,
    fault::Faults,
    output::{OutputSink, Outputs, PipelineEvent},
};

const CONFIG: &str = r#"{
    "output": { "width": 32, "height": 16, "fps": 25 },
    "grid": { "rows": 1, "cols": 2 },
    "cells": [ { "present": false }, { "present": false } ],
    "output_error_threshold": 3
}"#;

struct KeyframeEncoder {
    fail_open: bool,
    index: i64,
}

impl PictureEncoder for KeyframeEncoder {
    fn open(&mut self) -> anyhow::Result<StreamParameters> {
        if self.fail_open {
            anyhow::bail!("encoder libx264 not found");
        }
        Ok(StreamParameters {
            codec: codec::Id::H264,
            width: 32,
            height: 16,
            frame_rate: Rational::new(25, 1),
            pixel_format: Pixel::YUV420P,
            headers: Some(Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42, 0xc0, 0x1f])),
            generation: 1,
        })
    }

    fn encode(&mut self, _picture: &Picture) -> anyhow::Result<Vec<CodedPacket>> {
        let ts = self.index * 40_000;
        self.index += 1;
        Ok(vec![CodedPacket::new(
            Bytes::from_static(&[0, 0, 1, 0x65, 0x88]),
            ts,
            ts,
            40_000,
            true,
        )])
    }
}

#[derive(Default)]
struct MuxerLog {
    writes: usize,
    closed: bool,
}

struct FlakyMuxer {
    log: Arc<Mutex<MuxerLog>>,
    fail_writes: bool,
}

impl Muxer for FlakyMuxer {
    fn open(&mut self, _params: &StreamParameters) -> anyhow::Result<()> {
        Ok(())
    }

    fn write_header(&mut self, _params: &StreamParameters) -> anyhow::Result<()> {
        Ok(())
    }

    fn write_packet(&mut self, _packet: &CodedPacket) -> anyhow::Result<()> {
        self.log.lock().unwrap().writes += 1;
        if self.fail_writes {
            anyhow::bail!("connection reset by peer");
        }
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().closed = true;
        Ok(())
    }
}

fn pipeline() -> Pipeline<KeyframeEncoder> {
    let config = Config::from_json(CONFIG).unwrap();
    Pipeline::new(&config, Faults::new())
}

fn sink(
    pipeline: &Pipeline<KeyframeEncoder>,
    name: &str,
    fail_writes: bool,
) -> (OutputSink, Arc<Mutex<MuxerLog>>) {
    let log = Arc::new(Mutex::new(MuxerLog::default()));
    let muxer = FlakyMuxer {
        log: log.clone(),
        fail_writes,
    };
    (
        OutputSink::new(name, Box::new(muxer), 3, pipeline.events()),
        log,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broken_output_tears_down_pipeline() {
    let mut pipeline = pipeline();
    let (healthy, healthy_log) = sink(&pipeline, "healthy", false);
    let (dead, dead_log) = sink(&pipeline, "dead", true);
    let encoder = KeyframeEncoder {
        fail_open: false,
        index: 0,
    };
    pipeline
        .initialize_stage(encoder, Outputs::new(vec![healthy, dead]))
        .await
        .unwrap();
    pipeline.start().unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), pipeline.next_event())
        .await
        .unwrap();
    assert_eq!(
        event,
        Some(PipelineEvent::Broken {
            output: "dead".to_string()
        })
    );

    pipeline.stop_all().await;
    assert!(pipeline.is_stopped());
    assert!(dead_log.lock().unwrap().writes >= 3);
    // the failing output never held back the other one
    assert!(healthy_log.lock().unwrap().writes >= 3);
    assert!(healthy_log.lock().unwrap().closed);
    assert!(dead_log.lock().unwrap().closed);
}

#[tokio::test]
async fn test_stop_all_is_idempotent() {
    let mut pipeline = pipeline();
    let (out, log) = sink(&pipeline, "out", false);
    let encoder = KeyframeEncoder {
        fail_open: false,
        index: 0,
    };
    pipeline
        .initialize_stage(encoder, Outputs::new(vec![out]))
        .await
        .unwrap();

    pipeline.stop_all().await;
    pipeline.stop_all().await;
    assert!(pipeline.is_stopped());
    assert!(log.lock().unwrap().closed);
    assert!(pipeline.start().is_err());
}

#[tokio::test]
async fn test_start_requires_initialized_encoder() {
    let mut pipeline = pipeline();
    assert!(pipeline.start().is_err());
}

#[tokio::test]
async fn test_encoder_open_failure_is_fatal() {
    let mut pipeline = pipeline();
    let mut faults = pipeline.faults().subscribe();
    let encoder = KeyframeEncoder {
        fail_open: true,
        index: 0,
    };
    let result = pipeline.initialize_stage(encoder, Outputs::default()).await;
    assert!(result.is_err());
    let fault = faults.try_recv().unwrap();
    assert_eq!(fault.origin, "encoder");
    pipeline.stop_all().await;
}
