use bytes::Bytes;
use ffmpeg_next::{Rational, codec, format::Pixel};

use crate::bsf;

/// What an output needs to know about the encoded stream before its first packet.
///
/// `headers` holds the codec parameter sets (SPS/PPS for H.264) when the encoder
/// supplied them out of band; otherwise outputs recover them from the first keyframe.
/// `generation` increases every time the encoder is (re)opened.
#[derive(Debug, Clone)]
pub struct StreamParameters {
    pub codec: codec::Id,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub pixel_format: Pixel,
    pub headers: Option<Bytes>,
    pub generation: u64,
}

impl StreamParameters {
    pub fn with_headers(&self, headers: Bytes) -> Self {
        Self {
            headers: Some(headers),
            ..self.clone()
        }
    }

    /// Builds codec parameters for a muxer stream, copying `headers` into extradata.
    pub fn to_codec_parameters(&self) -> anyhow::Result<codec::Parameters> {
        let mut parameters = codec::Parameters::new();
        unsafe {
            let ptr = parameters.as_mut_ptr();
            (*ptr).codec_type = ffmpeg_next::media::Type::Video.into();
            (*ptr).codec_id = self.codec.into();
            (*ptr).codec_tag = 0;
            (*ptr).width = self.width as i32;
            (*ptr).height = self.height as i32;
            (*ptr).format = ffmpeg_next::ffi::AVPixelFormat::from(self.pixel_format) as i32;

            if let Some(headers) = self.headers.as_ref().filter(|h| !h.is_empty()) {
                let padding = ffmpeg_next::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
                let extradata = ffmpeg_next::ffi::av_mallocz(headers.len() + padding) as *mut u8;
                if extradata.is_null() {
                    anyhow::bail!("failed to allocate {} bytes of extradata", headers.len());
                }
                std::ptr::copy_nonoverlapping(headers.as_ptr(), extradata, headers.len());
                (*ptr).extradata = extradata;
                (*ptr).extradata_size = headers.len() as i32;
            }
        }
        Ok(parameters)
    }

    /// RFC 6381 codec string, e.g. `avc1.42c01f`. Falls back to the constrained
    /// baseline profile when no SPS is known yet.
    pub fn codec_string(&self) -> String {
        let profile = self
            .headers
            .as_ref()
            .and_then(|h| avc_profile(h))
            .unwrap_or([0x42, 0xc0, 0x1f]);
        format!(
            "avc1.{:02x}{:02x}{:02x}",
            profile[0], profile[1], profile[2]
        )
    }
}

/// profile_idc, constraint flags and level_idc from either an avcC record or
/// start-code delimited parameter sets.
fn avc_profile(headers: &[u8]) -> Option<[u8; 3]> {
    if bsf::is_avcc_headers(headers) {
        return Some([headers[1], headers[2], headers[3]]);
    }
    bsf::nal_units(headers)
        .find(|nal| nal.first().map(|b| b & 0x1f) == Some(bsf::NAL_SPS) && nal.len() >= 4)
        .map(|sps| [sps[1], sps[2], sps[3]])
}
