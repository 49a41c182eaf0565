use ffmpeg_next::Rational;

use crate::{packet::RawPacket, stream::AvStream};

/// `AV_EF_EXPLODE`: abort decoding on minor error detection.
const ERR_RECOGNITION_EXPLODE: i32 = 1 << 3;

/// Video decoder for one input stream. Frames come out with timestamps in the
/// stream's time base.
pub struct Decoder {
    stream: AvStream,
    inner: ffmpeg_next::codec::decoder::Video,
}

unsafe impl Send for Decoder {}

impl Decoder {
    pub fn new(stream: &AvStream) -> anyhow::Result<Self> {
        if !stream.is_video() {
            return Err(anyhow::anyhow!("unsupported stream type"));
        }

        let mut decoder_ctx = ffmpeg_next::codec::Context::new();
        unsafe {
            (*decoder_ctx.as_mut_ptr()).time_base = stream.time_base().into();
        }
        decoder_ctx.set_parameters(stream.parameters().clone())?;
        unsafe {
            (*decoder_ctx.as_mut_ptr()).err_recognition = ERR_RECOGNITION_EXPLODE;
        }

        let video_decoder = decoder_ctx.decoder().video()?;
        if video_decoder.format() == ffmpeg_next::format::Pixel::None
            || video_decoder.width() == 0
            || video_decoder.height() == 0
        {
            return Err(anyhow::anyhow!("missing codec parameters"));
        }

        Ok(Self {
            stream: stream.clone(),
            inner: video_decoder,
        })
    }

    pub fn send_packet(&mut self, packet: &RawPacket) -> anyhow::Result<()> {
        self.inner.send_packet(packet.packet())?;
        Ok(())
    }

    /// Next decoded frame, or `None` when the decoder needs more input.
    pub fn receive_frame(&mut self) -> anyhow::Result<Option<ffmpeg_next::frame::Video>> {
        let mut frame = ffmpeg_next::frame::Video::empty();
        match self.inner.receive_frame(&mut frame) {
            Ok(()) => Ok(Some(frame)),
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn stream_index(&self) -> usize {
        self.stream.index()
    }

    pub fn time_base(&self) -> Rational {
        self.stream.time_base()
    }
}
