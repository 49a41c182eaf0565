use std::sync::Arc;
use std::time::{Duration, Instant};

use ffmpeg_bus::{
    decoder::Decoder,
    input::{self, AvInput},
    picture::PicturePool,
    scaler::{self, Scaler},
};
use ffmpeg_next::util::mathematics::rescale::{Rescale, TIME_BASE};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{CaptureConfig, ReconnectConfig},
    fault::{ErrorStreak, Faults},
    mosaic::{
        layout::CamSlot,
        sync_buffer::SyncBuffer,
        ticker::{Ticker, sleep_unless_cancelled},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Connecting,
    Capturing,
    Reconnecting,
    Stopped,
}

/// Result of one read-decode cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A picture went into the buffer.
    Published,
    /// A packet was consumed without producing a picture (other stream, decoder
    /// still buffering).
    Pending,
    /// A read or decode failed.
    Failed,
    /// Too many consecutive failures: the connection must be rebuilt.
    Reconnect,
}

/// Exponential reconnect delay with random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        let initial = Duration::from_millis(config.initial_delay_ms);
        Self {
            initial,
            max: Duration::from_millis(config.max_delay_ms).max(initial),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            base.mul_f64(1.0 + factor)
        } else {
            base
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Connection, decoder and rescaler for one mosaic cell.
///
/// Runs on its own blocking thread: `run` drives `capture_tick` from a ticker
/// and rebuilds the connection when reads or decodes keep failing. Every decoded
/// picture is scaled to fit the cell and pushed into the cell's [`SyncBuffer`].
pub struct CaptureSource {
    slot: CamSlot,
    url: String,
    settings: CaptureConfig,
    buffer: Arc<SyncBuffer>,
    faults: Faults,
    cancel: CancellationToken,
    state: CaptureState,
    input: Option<AvInput>,
    decoder: Option<Decoder>,
    scaler: Scaler,
    scaled: ffmpeg_next::frame::Video,
    pool: PicturePool,
    read_errors: ErrorStreak,
    decode_errors: ErrorStreak,
    last_read: Instant,
    backoff: Backoff,
}

impl CaptureSource {
    pub fn new(
        slot: CamSlot,
        url: String,
        settings: CaptureConfig,
        buffer: Arc<SyncBuffer>,
        faults: Faults,
        cancel: CancellationToken,
    ) -> Self {
        // enough for a full buffer plus the pictures the compositor still holds
        let pool = PicturePool::new(buffer.capacity() + 4);
        Self {
            read_errors: ErrorStreak::new(settings.error_threshold),
            decode_errors: ErrorStreak::new(settings.error_threshold),
            backoff: Backoff::new(&settings.reconnect),
            slot,
            url,
            settings,
            buffer,
            faults,
            cancel,
            state: CaptureState::Idle,
            input: None,
            decoder: None,
            scaler: Scaler::new(),
            scaled: ffmpeg_next::frame::Video::empty(),
            pool,
            last_read: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.read_timeout_secs)
    }

    /// Connects, probes the streams and opens a decoder for the first video stream.
    pub fn initialize(&mut self) -> anyhow::Result<()> {
        self.deinitialize();
        self.state = CaptureState::Connecting;
        log::info!(target: "capture", "{}: connecting to {}", self.slot.name, self.url);

        let opened = (|| {
            let options = input::network_options(&self.settings.rtsp_transport, self.read_timeout());
            let input = AvInput::new(&self.url, options)?;
            let stream = input
                .first_video_stream()
                .ok_or_else(|| anyhow::anyhow!("no video stream in {}", self.url))?;
            let decoder = Decoder::new(stream)?;
            log::info!(
                target: "capture",
                "{}: decoding stream {} ({:?}, {}x{} @ {:.2} fps)",
                self.slot.name,
                stream.index(),
                stream.codec_id(),
                stream.width(),
                stream.height(),
                stream.fps()
            );
            anyhow::Ok((input, decoder))
        })();

        match opened {
            Ok((input, decoder)) => {
                self.input = Some(input);
                self.decoder = Some(decoder);
                self.read_errors.succeed();
                self.decode_errors.succeed();
                self.last_read = Instant::now();
                self.state = CaptureState::Capturing;
                Ok(())
            }
            Err(e) => {
                self.state = CaptureState::Idle;
                Err(e)
            }
        }
    }

    /// Releases decoder and connection. Safe to call in any state.
    pub fn deinitialize(&mut self) {
        self.decoder = None;
        self.input = None;
        if self.state != CaptureState::Stopped {
            self.state = CaptureState::Idle;
        }
    }

    pub fn stop_capture(&mut self) {
        self.cancel.cancel();
        self.deinitialize();
        self.state = CaptureState::Stopped;
        log::info!(target: "capture", "{}: stopped", self.slot.name);
    }

    fn read_failed(&mut self) -> Tick {
        if self.read_errors.fail() {
            self.give_up("read", self.read_errors.count())
        } else {
            Tick::Failed
        }
    }

    fn decode_failed(&mut self) -> Tick {
        if self.decode_errors.fail() {
            self.give_up("decode", self.decode_errors.count())
        } else {
            Tick::Failed
        }
    }

    fn give_up(&self, what: &str, count: u32) -> Tick {
        self.faults.critical(
            "capture",
            format!(
                "{}: {} consecutive {} errors, reconnecting",
                self.slot.name, count, what
            ),
        );
        Tick::Reconnect
    }

    /// Reads one packet and, for the video stream, decodes and publishes what it
    /// yields.
    pub fn capture_tick(&mut self) -> Tick {
        if self.last_read.elapsed() > self.read_timeout() {
            log::warn!(
                target: "capture",
                "{}: no video read for {:?}",
                self.slot.name,
                self.read_timeout()
            );
            self.last_read = Instant::now();
            if self.read_failed() == Tick::Reconnect {
                return Tick::Reconnect;
            }
        }

        let (Some(input), Some(decoder)) = (self.input.as_mut(), self.decoder.as_mut()) else {
            return self.read_failed();
        };

        let packet = match input.read_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                log::warn!(target: "capture", "{}: end of stream", self.slot.name);
                return self.read_failed();
            }
            Err(e) => {
                log::error!(target: "capture", "{}: read error: {:#}", self.slot.name, e);
                return self.read_failed();
            }
        };
        if packet.index() != decoder.stream_index() {
            return Tick::Pending;
        }
        self.read_errors.succeed();
        self.last_read = Instant::now();

        if let Err(e) = decoder.send_packet(&packet) {
            log::error!(target: "capture", "{}: decode error: {:#}", self.slot.name, e);
            return self.decode_failed();
        }

        let mut tick = Tick::Pending;
        loop {
            let frame = match self.decoder.as_mut().map(|d| d.receive_frame()) {
                Some(Ok(Some(frame))) => frame,
                Some(Ok(None)) | None => break,
                Some(Err(e)) => {
                    log::error!(target: "capture", "{}: decode error: {:#}", self.slot.name, e);
                    return self.decode_failed();
                }
            };
            self.decode_errors.succeed();
            match self.publish(&frame) {
                Ok(()) => tick = Tick::Published,
                Err(e) => {
                    log::error!(target: "capture", "{}: dropped picture: {:#}", self.slot.name, e);
                }
            }
        }
        tick
    }

    /// Scales `frame` to fit the cell and pushes it with timestamps in microseconds.
    fn publish(&mut self, frame: &ffmpeg_next::frame::Video) -> anyhow::Result<()> {
        let time_base = match self.decoder.as_ref() {
            Some(decoder) => decoder.time_base(),
            None => anyhow::bail!("decoder closed"),
        };
        let pts = frame.timestamp().or(frame.pts()).unwrap_or(0);
        let dts = unsafe { (*frame.as_ptr()).pkt_dts };
        let dts = if dts == ffmpeg_next::ffi::AV_NOPTS_VALUE {
            pts
        } else {
            dts
        };

        let (width, height) = scaler::fit_within(
            frame.width(),
            frame.height(),
            self.slot.cell_width(),
            self.slot.cell_height(),
        );
        if width == 0 || height == 0 {
            anyhow::bail!(
                "{}x{} frame does not fit a {}x{} cell",
                frame.width(),
                frame.height(),
                self.slot.cell_width(),
                self.slot.cell_height()
            );
        }
        if self.scaled.width() != width || self.scaled.height() != height {
            self.scaled = ffmpeg_next::frame::Video::empty();
        }
        self.scaler.run(frame, &mut self.scaled, width, height)?;

        let mut picture = self.pool.acquire(width, height);
        picture.copy_from_video(&self.scaled)?;
        picture.set_timestamps(
            pts.rescale(time_base, TIME_BASE),
            dts.rescale(time_base, TIME_BASE),
        );
        self.buffer.push(self.pool.publish(picture));
        Ok(())
    }

    /// Tears the connection down and retries with backoff until it comes back or
    /// the source is stopped. Returns false when stopped.
    fn reconnect(&mut self) -> bool {
        self.reconnect_with(Self::initialize)
    }

    fn reconnect_with(
        &mut self,
        mut connect: impl FnMut(&mut Self) -> anyhow::Result<()>,
    ) -> bool {
        self.deinitialize();
        self.state = CaptureState::Reconnecting;
        loop {
            let delay = self.backoff.next_delay();
            log::warn!(
                target: "capture",
                "{}: reconnecting in {:?}",
                self.slot.name,
                delay
            );
            if !sleep_unless_cancelled(delay, &self.cancel) {
                return false;
            }
            match connect(self) {
                Ok(()) => {
                    self.backoff.reset();
                    self.buffer.reset();
                    log::info!(target: "capture", "{}: reinitialized", self.slot.name);
                    return true;
                }
                Err(e) => {
                    self.state = CaptureState::Reconnecting;
                    log::error!(target: "capture", "{}: reconnect failed: {:#}", self.slot.name, e);
                }
            }
        }
    }

    /// Capture loop. Returns once the cancel token fires.
    pub fn run(mut self) -> CaptureState {
        if self.state != CaptureState::Capturing {
            if let Err(e) = self.initialize() {
                log::error!(target: "capture", "{}: initialize failed: {:#}", self.slot.name, e);
                if !self.reconnect() {
                    self.stop_capture();
                    return self.state;
                }
            }
        }

        let mut ticker = Ticker::new(Duration::from_millis(self.settings.tick_interval_ms));
        while !self.cancel.is_cancelled() {
            match self.capture_tick() {
                Tick::Pending => continue,
                Tick::Published | Tick::Failed => {
                    ticker.wait();
                }
                Tick::Reconnect => {
                    if !self.reconnect() {
                        break;
                    }
                }
            }
        }

        self.stop_capture();
        self.state
    }
}

#[cfg(test)]
mod tests {
    use ffmpeg_bus::picture::Picture;

    use super::*;
    use crate::config::Rect;

    const NO_INPUT: &str = "/nonexistent/quadcast-test-input.mp4";

    fn reconnect_config(jitter: f64) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms: 500,
            max_delay_ms: 3_000,
            multiplier: 2.0,
            jitter,
        }
    }

    fn source(url: &str) -> CaptureSource {
        source_with(url, CaptureConfig::default(), Faults::new())
    }

    fn source_with(url: &str, settings: CaptureConfig, faults: Faults) -> CaptureSource {
        let slot = CamSlot {
            index: 0,
            name: "cam0".to_string(),
            url: Some(url.to_string()),
            rect: Rect {
                x: 0,
                y: 0,
                width: 320,
                height: 240,
            },
            present: true,
        };
        CaptureSource::new(
            slot,
            url.to_string(),
            settings,
            Arc::new(SyncBuffer::new("cam0", 4, 100)),
            faults,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_backoff_grows_to_cap() {
        let mut backoff = Backoff::new(&reconnect_config(0.0));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_jitter_stays_in_bounds() {
        let mut backoff = Backoff::new(&reconnect_config(0.2));
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay().as_millis();
            assert!((400..=600).contains(&delay), "delay {}", delay);
        }
    }

    #[test]
    fn test_initialize_failure_returns_to_idle() {
        let mut source = source("/nonexistent/quadcast-test-input.mp4");
        assert_eq!(source.state(), CaptureState::Idle);
        assert!(source.initialize().is_err());
        assert_eq!(source.state(), CaptureState::Idle);
        source.deinitialize();
        source.deinitialize();
        assert_eq!(source.state(), CaptureState::Idle);
    }

    #[test]
    fn test_tick_without_connection_counts_read_errors() {
        let mut source = source("/nonexistent/quadcast-test-input.mp4");
        for _ in 0..299 {
            assert_eq!(source.capture_tick(), Tick::Failed);
        }
        assert_eq!(source.capture_tick(), Tick::Reconnect);
    }

    #[test]
    fn test_error_streak_reports_one_critical_fault() {
        let faults = Faults::new();
        let mut rx = faults.subscribe();
        let mut source = source_with(NO_INPUT, CaptureConfig::default(), faults);
        let ticks: Vec<Tick> = (0..300).map(|_| source.capture_tick()).collect();
        assert_eq!(ticks.last(), Some(&Tick::Reconnect));
        let fault = rx.try_recv().unwrap();
        assert_eq!(fault.origin, "capture");
        assert!(fault.message.contains("300 consecutive read errors"));
        assert!(rx.try_recv().is_err());

        // the streak stays tripped until a read succeeds
        assert_eq!(source.capture_tick(), Tick::Failed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_read_watchdog_counts_as_read_error() {
        let settings = CaptureConfig {
            read_timeout_secs: 0,
            error_threshold: 2,
            ..CaptureConfig::default()
        };
        let mut source = source_with(NO_INPUT, settings, Faults::new());
        std::thread::sleep(Duration::from_millis(2));
        // the watchdog and the missing connection both count on the same tick
        assert_eq!(source.capture_tick(), Tick::Reconnect);

        let settings = CaptureConfig {
            error_threshold: 2,
            ..CaptureConfig::default()
        };
        let mut source = source_with(NO_INPUT, settings, Faults::new());
        assert_eq!(source.capture_tick(), Tick::Failed);
    }

    #[test]
    fn test_reconnect_resets_buffer() {
        let settings = CaptureConfig {
            reconnect: ReconnectConfig {
                initial_delay_ms: 1,
                max_delay_ms: 2,
                multiplier: 2.0,
                jitter: 0.0,
            },
            ..CaptureConfig::default()
        };
        let mut source = source_with("rtsp://cam0/stream", settings, Faults::new());
        for pts in [0, 40_000, 80_000] {
            let mut picture = Picture::new(4, 4);
            picture.set_timestamps(pts, pts);
            source.buffer.push(Arc::new(picture));
        }
        assert_eq!(source.buffer.occupancy(), 3);

        let mut attempts = 0;
        let reconnected = source.reconnect_with(|source: &mut CaptureSource| {
            attempts += 1;
            assert_eq!(source.state(), CaptureState::Reconnecting);
            if attempts < 3 {
                anyhow::bail!("connection refused");
            }
            source.state = CaptureState::Capturing;
            Ok(())
        });
        assert!(reconnected);
        assert_eq!(attempts, 3);
        assert_eq!(source.state(), CaptureState::Capturing);
        assert_eq!(source.buffer.occupancy(), 0);
        assert!(source.buffer.pull(40_000).is_none());
        assert_eq!(source.backoff.next_delay(), Duration::from_millis(1));
    }

    #[test]
    fn test_reconnect_gives_up_when_cancelled() {
        let mut source = source("rtsp://cam0/stream");
        source.cancel.cancel();
        let reconnected = source.reconnect_with(|_: &mut CaptureSource| Ok(()));
        assert!(!reconnected);
    }

    #[test]
    fn test_run_stops_when_cancelled() {
        let source = source("/nonexistent/quadcast-test-input.mp4");
        source.cancel.cancel();
        assert_eq!(source.run(), CaptureState::Stopped);
    }

    #[test]
    fn test_stop_is_terminal() {
        let mut source = source("/nonexistent/quadcast-test-input.mp4");
        source.stop_capture();
        source.deinitialize();
        assert_eq!(source.state(), CaptureState::Stopped);
        assert!(source.cancel.is_cancelled());
    }
}
