use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "params.json";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub output: OutputConfig,
    #[serde(default)]
    pub grid: Option<Grid>,
    pub cells: Vec<CellConfig>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default = "default_output_error_threshold")]
    pub output_error_threshold: u32,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(default = "default_crf")]
    pub crf: u32,
    #[serde(default = "default_encoder")]
    pub encoder: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_true")]
    pub global_header: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Grid {
    pub rows: u32,
    pub cols: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CellConfig {
    #[serde(default = "default_true")]
    pub present: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub rect: Option<Rect>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub read_timeout_secs: u64,
    pub error_threshold: u32,
    pub tick_interval_ms: u64,
    pub rtsp_transport: String,
    pub reconnect: ReconnectConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: 20,
            error_threshold: 300,
            tick_interval_ms: 16,
            rtsp_transport: "tcp".to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub capacity: usize,
    pub repeat_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            repeat_limit: 100,
        }
    }
}

fn default_output_error_threshold() -> u32 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_crf() -> u32 {
    23
}

fn default_encoder() -> String {
    "libx264".to_string()
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_true() -> bool {
    true
}

/// Where an output URL sends the mosaic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// `rtp://`: point-to-point RTP.
    Rtp { url: String },
    /// `rtmp://` or `rtmps://`: FLV push.
    Rtmp { url: String },
    /// `ws://host:port`: fragmented MP4 fan-out served on `port`.
    WebSocket { url: String, port: u16 },
}

impl Destination {
    pub fn parse(url: &str) -> anyhow::Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| anyhow::anyhow!("output url {:?} has no scheme", url))?;
        match scheme.to_ascii_lowercase().as_str() {
            "rtp" => Ok(Self::Rtp {
                url: url.to_string(),
            }),
            "rtmp" | "rtmps" => Ok(Self::Rtmp {
                url: url.to_string(),
            }),
            "ws" => {
                let authority = rest.split(['/', '?']).next().unwrap_or_default();
                let port = authority
                    .rsplit_once(':')
                    .map(|(_, port)| port)
                    .ok_or_else(|| anyhow::anyhow!("websocket output {:?} needs a port", url))?;
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("websocket output {:?} has an invalid port", url))?;
                Ok(Self::WebSocket {
                    url: url.to_string(),
                    port,
                })
            }
            other => anyhow::bail!("unsupported output scheme {:?} in {:?}", other, url),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Rtp { url } | Self::Rtmp { url } | Self::WebSocket { url, .. } => url,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("config {}", path.display()))
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(text).context("parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let out = &self.output;
        if out.width == 0 || out.height == 0 || out.width % 2 != 0 || out.height % 2 != 0 {
            anyhow::bail!(
                "output size {}x{} must be even and non-zero",
                out.width,
                out.height
            );
        }
        if out.fps == 0 {
            anyhow::bail!("output fps must be positive");
        }
        if out.crf > 51 {
            anyhow::bail!("crf {} is out of range 0..=51", out.crf);
        }

        match self.grid {
            Some(grid) => {
                if grid.rows == 0 || grid.cols == 0 {
                    anyhow::bail!("grid {}x{} is empty", grid.rows, grid.cols);
                }
                let Some(expected) = grid.rows.checked_mul(grid.cols) else {
                    anyhow::bail!("grid {}x{} is too large", grid.rows, grid.cols);
                };
                if self.cells.len() != expected as usize {
                    anyhow::bail!(
                        "grid {}x{} needs {} cells, {} configured",
                        grid.rows,
                        grid.cols,
                        expected,
                        self.cells.len()
                    );
                }
            }
            None => {
                if let Some(index) = self.cells.iter().position(|c| c.rect.is_none()) {
                    anyhow::bail!("cell {} has no rect and no grid is configured", index);
                }
            }
        }

        for (index, cell) in self.cells.iter().enumerate() {
            if cell.present && cell.url.as_deref().is_none_or(str::is_empty) {
                anyhow::bail!("cell {} is present but has no url", index);
            }
            if let Some(rect) = cell.rect {
                if [rect.x, rect.y, rect.width, rect.height]
                    .iter()
                    .any(|v| v % 2 != 0)
                {
                    anyhow::bail!("cell {} rect {:?} must use even values", index, rect);
                }
                let right = rect.x.checked_add(rect.width);
                let bottom = rect.y.checked_add(rect.height);
                if rect.width == 0
                    || rect.height == 0
                    || right.is_none_or(|r| r > out.width)
                    || bottom.is_none_or(|b| b > out.height)
                {
                    anyhow::bail!(
                        "cell {} rect {:?} does not fit the {}x{} canvas",
                        index,
                        rect,
                        out.width,
                        out.height
                    );
                }
            }
        }

        for url in &self.outputs {
            Destination::parse(url)?;
        }

        if self.sync.capacity == 0 {
            anyhow::bail!("sync capacity must be positive");
        }
        if self.capture.reconnect.multiplier < 1.0 {
            anyhow::bail!("reconnect multiplier must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.capture.reconnect.jitter) {
            anyhow::bail!("reconnect jitter must be within 0..=1");
        }
        Ok(())
    }

    pub fn destinations(&self) -> anyhow::Result<Vec<Destination>> {
        self.outputs.iter().map(|u| Destination::parse(u)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD: &str = r#"{
        "output": { "width": 1280, "height": 720, "fps": 25, "crf": 28 },
        "grid": { "rows": 2, "cols": 2 },
        "cells": [
            { "url": "rtsp://cam1/stream" },
            { "url": "rtsp://cam2/stream", "name": "gate" },
            { "present": false },
            { "url": "rtsp://cam4/stream" }
        ],
        "outputs": ["rtp://239.0.0.1:5004", "rtmp://live/app/key", "ws://0.0.0.0:8081"]
    }"#;

    #[test]
    fn test_load_quad_with_defaults() {
        let config = Config::from_json(QUAD).unwrap();
        assert_eq!(config.cells.len(), 4);
        assert!(!config.cells[2].present);
        assert_eq!(config.output.encoder, "libx264");
        assert_eq!(config.output.preset, "veryfast");
        assert!(config.output.global_header);
        assert_eq!(config.capture.read_timeout_secs, 20);
        assert_eq!(config.capture.error_threshold, 300);
        assert_eq!(config.capture.rtsp_transport, "tcp");
        assert_eq!(config.sync.capacity, 60);
        assert_eq!(config.sync.repeat_limit, 100);
        assert_eq!(config.output_error_threshold, 300);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_cell_count_must_match_grid() {
        let text = QUAD.replace(r#"{ "present": false },"#, "");
        let err = Config::from_json(&text).unwrap_err();
        assert!(format!("{:#}", err).contains("needs 4 cells"));
    }

    #[test]
    fn test_rects_required_without_grid() {
        let text = r#"{
            "output": { "width": 640, "height": 480, "fps": 30 },
            "cells": [
                { "url": "rtsp://a", "rect": { "x": 0, "y": 0, "width": 320, "height": 240 } },
                { "url": "rtsp://b" }
            ]
        }"#;
        assert!(Config::from_json(text).is_err());
    }

    #[test]
    fn test_rect_must_be_even_and_inside() {
        let odd = r#"{
            "output": { "width": 640, "height": 480, "fps": 30 },
            "cells": [{ "url": "rtsp://a", "rect": { "x": 1, "y": 0, "width": 320, "height": 240 } }]
        }"#;
        assert!(Config::from_json(odd).is_err());
        let outside = r#"{
            "output": { "width": 640, "height": 480, "fps": 30 },
            "cells": [{ "url": "rtsp://a", "rect": { "x": 400, "y": 0, "width": 320, "height": 240 } }]
        }"#;
        assert!(Config::from_json(outside).is_err());
    }

    #[test]
    fn test_oversized_values_are_rejected() {
        let grid = r#"{
            "output": { "width": 640, "height": 480, "fps": 30 },
            "grid": { "rows": 65536, "cols": 65536 },
            "cells": []
        }"#;
        let err = Config::from_json(grid).unwrap_err();
        assert!(format!("{:#}", err).contains("too large"));
        let rect = r#"{
            "output": { "width": 640, "height": 480, "fps": 30 },
            "cells": [{ "url": "rtsp://a", "rect": { "x": 4294967294, "y": 0, "width": 320, "height": 240 } }]
        }"#;
        let err = Config::from_json(rect).unwrap_err();
        assert!(format!("{:#}", err).contains("does not fit"));
    }

    #[test]
    fn test_present_cell_needs_url() {
        let text = QUAD.replace(r#"{ "url": "rtsp://cam4/stream" }"#, "{}");
        assert!(Config::from_json(&text).is_err());
    }

    #[test]
    fn test_destination_parse() {
        assert_eq!(
            Destination::parse("rtp://127.0.0.1:5004").unwrap(),
            Destination::Rtp {
                url: "rtp://127.0.0.1:5004".to_string()
            }
        );
        assert!(matches!(
            Destination::parse("rtmps://host/app").unwrap(),
            Destination::Rtmp { .. }
        ));
        assert_eq!(
            Destination::parse("ws://0.0.0.0:8081/live").unwrap(),
            Destination::WebSocket {
                url: "ws://0.0.0.0:8081/live".to_string(),
                port: 8081
            }
        );
        assert!(Destination::parse("ws://0.0.0.0/live").is_err());
        assert!(Destination::parse("ws://host:99999").is_err());
        assert!(Destination::parse("srt://host:9000").is_err());
        assert!(Destination::parse("no-scheme").is_err());
    }

    #[test]
    fn test_bad_output_fails_validation() {
        let text = QUAD.replace("rtmp://live/app/key", "http://example/stream");
        assert!(Config::from_json(&text).is_err());
    }
}
