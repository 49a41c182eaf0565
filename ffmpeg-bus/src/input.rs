use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use ffmpeg_next::Dictionary;

use crate::{packet::RawPacket, stream::AvStream};

/// Demuxer options for network sources: transport for RTSP plus socket and
/// read/write timeouts, both in microseconds as FFmpeg expects them.
pub fn network_options(rtsp_transport: &str, timeout: Duration) -> Dictionary<'static> {
    let micros = timeout.as_micros().to_string();
    let mut opts = Dictionary::new();
    if !rtsp_transport.is_empty() {
        opts.set("rtsp_transport", rtsp_transport);
    }
    opts.set("timeout", &micros);
    opts.set("rw_timeout", &micros);
    opts
}

pub struct AvInput {
    inner: ffmpeg_next::format::context::Input,
    streams: HashMap<usize, AvStream>,
}

unsafe impl Send for AvInput {}

impl AvInput {
    pub fn new(url: &str, options: Dictionary) -> anyhow::Result<Self> {
        let path = Path::new(url);
        let input = ffmpeg_next::format::input_with_dictionary(path, options)
            .map_err(|e| anyhow::anyhow!("open input {}: {}", url, e))?;

        ffmpeg_next::format::context::input::dump(&input, 0, Some(url));

        let mut streams = HashMap::new();
        for stream in input.streams() {
            streams.insert(stream.index(), AvStream::from(stream));
        }

        Ok(Self {
            inner: input,
            streams,
        })
    }

    /// The first video stream in stream order.
    pub fn first_video_stream(&self) -> Option<&AvStream> {
        self.streams
            .values()
            .filter(|s| s.is_video())
            .min_by_key(|s| s.index())
    }

    /// Reads one packet. `Ok(None)` means end of stream; read failures are
    /// returned so the caller can count them.
    pub fn read_packet(&mut self) -> anyhow::Result<Option<RawPacket>> {
        let mut packet = ffmpeg_next::codec::packet::Packet::empty();
        match packet.read(&mut self.inner) {
            Ok(()) => Ok(Some(packet.into())),
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
