use bytes::Bytes;
use ffmpeg_next::{
    Dictionary, Rational,
    format::Pixel,
    util::mathematics::rescale::{Rescale, TIME_BASE},
};

use crate::{packet::CodedPacket, params::StreamParameters, picture::Picture};

/// Turns canvases into coded packets.
///
/// `open` must be called before `encode` and returns the parameters every output
/// needs before its first packet. Calling `open` again starts a new stream.
pub trait PictureEncoder: Send {
    fn open(&mut self) -> anyhow::Result<StreamParameters>;

    /// Submits one picture and returns whatever packets the codec has ready, which
    /// may be none while it fills its lookahead.
    fn encode(&mut self, picture: &Picture) -> anyhow::Result<Vec<CodedPacket>>;
}

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub crf: u32,
    pub codec: String,
    pub preset: String,
    /// Ask for parameter sets in extradata instead of only in keyframes.
    pub global_header: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 25,
            crf: 23,
            codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            global_header: true,
        }
    }
}

/// H.264 encoder configured for low latency: GOP of one second, zerolatency tune,
/// baseline profile, constant rate factor quality.
pub struct Encoder {
    settings: EncoderSettings,
    inner: Option<ffmpeg_next::codec::encoder::Video>,
    frame: Option<ffmpeg_next::frame::Video>,
    encoder_time_base: Rational,
    frame_index: i64,
    generation: u64,
}

unsafe impl Send for Encoder {}

impl Encoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            settings,
            inner: None,
            frame: None,
            encoder_time_base: Rational::new(1, 1),
            frame_index: 0,
            generation: 0,
        }
    }

    fn frame_rate(&self) -> Rational {
        Rational::new(self.settings.fps as i32, 1)
    }

    fn receive_packets(&mut self) -> anyhow::Result<Vec<CodedPacket>> {
        let Some(encoder) = self.inner.as_mut() else {
            anyhow::bail!("encoder is not open");
        };
        let duration = 1i64.rescale(self.encoder_time_base, TIME_BASE);
        let mut packets = Vec::new();
        loop {
            let mut packet = ffmpeg_next::codec::packet::Packet::empty();
            match encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    packet.rescale_ts(self.encoder_time_base, TIME_BASE);
                    let pts = packet.pts().unwrap_or(0);
                    packets.push(CodedPacket::new(
                        packet
                            .data()
                            .map(Bytes::copy_from_slice)
                            .unwrap_or_default(),
                        pts,
                        packet.dts().unwrap_or(pts),
                        duration,
                        packet.is_key(),
                    ));
                }
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    break;
                }
                Err(ffmpeg_next::Error::Eof) => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(packets)
    }
}

impl PictureEncoder for Encoder {
    fn open(&mut self) -> anyhow::Result<StreamParameters> {
        self.inner = None;
        self.frame = None;

        let settings = &self.settings;
        let codec = ffmpeg_next::encoder::find_by_name(&settings.codec)
            .ok_or(anyhow::anyhow!("codec not found: {}", settings.codec))?;
        let context = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = context.encoder().video()?;
        encoder.set_width(settings.width);
        encoder.set_height(settings.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_frame_rate(Some(self.frame_rate()));
        encoder.set_time_base(self.frame_rate().invert());
        encoder.set_gop(settings.fps);
        if settings.global_header {
            encoder.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = Dictionary::new();
        opts.set("preset", &settings.preset);
        opts.set("tune", "zerolatency");
        opts.set("crf", &settings.crf.to_string());
        opts.set("profile", "baseline");
        let encoder = encoder
            .open_with(opts)
            .map_err(|e| anyhow::anyhow!("open encoder {}: {}", settings.codec, e))?;

        let (encoder_time_base, headers) = unsafe {
            let ptr = encoder.0.as_ptr();
            let time_base: Rational = (*ptr).time_base.into();
            let headers = if (*ptr).extradata.is_null() || (*ptr).extradata_size <= 0 {
                None
            } else {
                Some(Bytes::copy_from_slice(std::slice::from_raw_parts(
                    (*ptr).extradata,
                    (*ptr).extradata_size as usize,
                )))
            };
            (time_base, headers)
        };

        self.frame = Some(ffmpeg_next::frame::Video::new(
            Pixel::YUV420P,
            settings.width,
            settings.height,
        ));
        self.inner = Some(encoder);
        self.encoder_time_base = encoder_time_base;
        self.frame_index = 0;
        self.generation += 1;

        log::info!(
            target: "encoder",
            "encoder opened: {} {}x{}@{} crf {} time_base {} headers {}",
            self.settings.codec,
            self.settings.width,
            self.settings.height,
            self.settings.fps,
            self.settings.crf,
            encoder_time_base,
            headers.as_ref().map(|h| h.len()).unwrap_or(0)
        );

        Ok(StreamParameters {
            codec: ffmpeg_next::codec::Id::H264,
            width: self.settings.width,
            height: self.settings.height,
            frame_rate: self.frame_rate(),
            pixel_format: Pixel::YUV420P,
            headers,
            generation: self.generation,
        })
    }

    fn encode(&mut self, picture: &Picture) -> anyhow::Result<Vec<CodedPacket>> {
        let (Some(encoder), Some(frame)) = (self.inner.as_mut(), self.frame.as_mut()) else {
            anyhow::bail!("encoder is not open");
        };

        unsafe {
            if ffmpeg_next::ffi::av_frame_make_writable(frame.as_mut_ptr()) < 0 {
                anyhow::bail!("encoder frame is not writable");
            }
        }
        picture.copy_to_video(frame)?;
        frame.set_pts(Some(self.frame_index));
        self.frame_index += 1;
        encoder.send_frame(frame)?;

        self.receive_packets()
    }
}
