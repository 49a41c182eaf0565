use std::ffi::{CStr, c_char};

use ffmpeg_next::{Dictionary, Rational, util::mathematics::rescale::TIME_BASE};

use crate::{packet::CodedPacket, params::StreamParameters};

/// Time base requested for the output video stream. Muxers may override it in
/// `write_header`; the declared value is read back afterwards.
pub const STREAM_TIME_BASE: Rational = Rational(1, 90_000);

/// Destination-specific container writer.
///
/// The sink driving a muxer calls `open` with the current stream parameters, then
/// `write_header` once the parameter sets are known (at the first keyframe), then
/// `write_packet` with timestamps already rebased to the first keyframe and still
/// in microseconds. `close` must be safe to call repeatedly.
pub trait Muxer: Send {
    fn open(&mut self, params: &StreamParameters) -> anyhow::Result<()>;
    fn write_header(&mut self, params: &StreamParameters) -> anyhow::Result<()>;
    fn write_packet(&mut self, packet: &CodedPacket) -> anyhow::Result<()>;
    fn close(&mut self) -> anyhow::Result<()>;
}

/// One video stream inside an output format context.
pub(crate) struct Container {
    inner: ffmpeg_next::format::context::Output,
    stream_index: usize,
    time_base: Rational,
    have_written_header: bool,
    have_written_trailer: bool,
}

impl Container {
    pub(crate) fn new(inner: ffmpeg_next::format::context::Output) -> Self {
        Self {
            inner,
            stream_index: 0,
            time_base: STREAM_TIME_BASE,
            have_written_header: false,
            have_written_trailer: false,
        }
    }

    pub(crate) fn add_stream(&mut self, params: &StreamParameters) -> anyhow::Result<()> {
        let codec_parameters = params.to_codec_parameters()?;
        let mut writer_stream = self
            .inner
            .add_stream(ffmpeg_next::encoder::find(params.codec))?;
        writer_stream.set_parameters(codec_parameters);
        writer_stream.set_time_base(STREAM_TIME_BASE);
        writer_stream.set_avg_frame_rate(params.frame_rate);
        self.stream_index = writer_stream.index();
        Ok(())
    }

    pub(crate) fn output_mut(&mut self) -> &mut ffmpeg_next::format::context::Output {
        &mut self.inner
    }

    /// Refreshes the stream's codec parameters (extradata may have been recovered
    /// since `new`) and writes the container header.
    pub(crate) fn write_header(
        &mut self,
        params: &StreamParameters,
        options: Dictionary,
    ) -> anyhow::Result<()> {
        if self.have_written_header {
            return Ok(());
        }
        let codec_parameters = params.to_codec_parameters()?;
        match self.inner.stream_mut(self.stream_index) {
            Some(mut stream) => stream.set_parameters(codec_parameters),
            None => anyhow::bail!("output stream {} not found", self.stream_index),
        }
        self.inner.write_header_with(options)?;
        self.have_written_header = true;
        self.time_base = self
            .inner
            .stream(self.stream_index)
            .map(|s| s.time_base())
            .unwrap_or(STREAM_TIME_BASE);
        Ok(())
    }

    pub(crate) fn write_packet(&mut self, packet: &CodedPacket) -> anyhow::Result<()> {
        if !self.have_written_header {
            anyhow::bail!("header not written");
        }
        let mut p = ffmpeg_next::codec::packet::Packet::copy(packet.data());
        p.set_pts(Some(packet.pts()));
        p.set_dts(Some(packet.dts()));
        p.set_duration(packet.duration());
        if packet.is_key() {
            p.set_flags(ffmpeg_next::codec::packet::Flags::KEY);
        }
        p.set_stream(self.stream_index);
        p.set_position(-1);
        p.rescale_ts(TIME_BASE, self.time_base);
        p.write_interleaved(&mut self.inner)?;
        Ok(())
    }

    pub(crate) fn finish(&mut self) -> anyhow::Result<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.inner.write_trailer()?;
        }
        Ok(())
    }
}

/// Muxer for URL-addressed outputs: `rtp` for point-to-point and `flv` for
/// RTMP push.
pub struct AvOutput {
    url: String,
    format: String,
    container: Option<Container>,
}

unsafe impl Send for AvOutput {}

impl AvOutput {
    pub fn new(url: &str, format: &str) -> Self {
        Self {
            url: url.to_string(),
            format: format.to_string(),
            container: None,
        }
    }

    fn log_sdp(container: &mut Container) {
        let mut buf = [0 as c_char; 4096];
        let sdp = unsafe {
            let mut ctx = container.output_mut().as_mut_ptr();
            if ffmpeg_next::ffi::av_sdp_create(&mut ctx, 1, buf.as_mut_ptr(), buf.len() as i32) < 0
            {
                return;
            }
            CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
        };
        log::info!(target: "output", "rtp session description:\n{}", sdp);
    }
}

impl Muxer for AvOutput {
    fn open(&mut self, params: &StreamParameters) -> anyhow::Result<()> {
        self.close()?;
        let output = ffmpeg_next::format::output_as(&self.url, &self.format)
            .map_err(|e| anyhow::anyhow!("open output {} as {}: {}", self.url, self.format, e))?;
        let mut container = Container::new(output);
        container.add_stream(params)?;
        self.container = Some(container);
        Ok(())
    }

    fn write_header(&mut self, params: &StreamParameters) -> anyhow::Result<()> {
        let Some(container) = self.container.as_mut() else {
            anyhow::bail!("output {} is not open", self.url);
        };
        container.write_header(params, Dictionary::new())?;
        if self.format == "rtp" {
            Self::log_sdp(container);
        }
        Ok(())
    }

    fn write_packet(&mut self, packet: &CodedPacket) -> anyhow::Result<()> {
        match self.container.as_mut() {
            Some(container) => container.write_packet(packet),
            None => Err(anyhow::anyhow!("output {} is not open", self.url)),
        }
    }

    fn close(&mut self) -> anyhow::Result<()> {
        match self.container.take() {
            Some(mut container) => container.finish(),
            None => Ok(()),
        }
    }
}

impl Drop for AvOutput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!(target: "output", "close {}: {}", self.url, e);
        }
    }
}
