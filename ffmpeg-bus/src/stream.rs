use ffmpeg_next::{Rational, codec, format::stream::Stream, media};

/// Descriptor of one demuxed stream, detached from its format context so it can
/// outlive the borrow and move to the decoder.
#[derive(Clone)]
pub struct AvStream {
    index: usize,
    parameters: codec::Parameters,
    medium: media::Type,
    codec: codec::Id,
    width: u32,
    height: u32,
    time_base: Rational,
    frame_rate: Rational,
}

unsafe impl Send for AvStream {}

impl AvStream {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn parameters(&self) -> &codec::Parameters {
        &self.parameters
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn is_video(&self) -> bool {
        self.medium == media::Type::Video
    }

    pub fn codec_id(&self) -> codec::Id {
        self.codec
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Average frame rate as announced by the source; zero when unknown.
    pub fn fps(&self) -> f64 {
        if self.frame_rate.denominator() == 0 {
            return 0.0;
        }
        f64::from(self.frame_rate)
    }
}

impl From<Stream<'_>> for AvStream {
    fn from(stream: Stream<'_>) -> Self {
        let parameters = stream.parameters();
        let (width, height) = unsafe {
            let ptr = parameters.as_ptr();
            ((*ptr).width.max(0) as u32, (*ptr).height.max(0) as u32)
        };
        Self {
            index: stream.index(),
            medium: parameters.medium(),
            codec: parameters.id(),
            width,
            height,
            time_base: stream.time_base(),
            frame_rate: stream.avg_frame_rate(),
            parameters,
        }
    }
}

impl std::fmt::Debug for AvStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvStream")
            .field("index", &self.index)
            .field("codec", &self.codec)
            .field("size", &(self.width, self.height))
            .field("time_base", &self.time_base)
            .field("frame_rate", &self.frame_rate)
            .finish()
    }
}
