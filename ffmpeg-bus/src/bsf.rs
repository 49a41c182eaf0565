use bytes::{Bytes, BytesMut};

/// H.264 NAL unit types this crate cares about.
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

/// Shortest parameter-set run worth installing as stream headers.
const MIN_PARAMETER_SETS_LEN: usize = 8;

/// Check if codec headers are an AVCC (avcC record) rather than Annex B.
///
/// Returns true when packets from this encoder carry length-prefixed NAL units and
/// need conversion before going to a start-code based consumer.
pub fn is_avcc_headers(extradata: &[u8]) -> bool {
    if extradata.len() < 4 {
        return false;
    }

    // Check for Annex B start codes
    if is_annexb_packet(extradata) {
        return false;
    }

    // AVCC typically has configurationVersion = 1 as first byte
    extradata[0] == 0x01 && extradata.len() >= 7
}

/// Check if packet data is in Annex B format by looking at the start codes.
pub fn is_annexb_packet(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    if data[0] == 0x00 && data[1] == 0x00 && data[2] == 0x00 && data[3] == 0x01 {
        return true;
    }
    if data[0] == 0x00 && data[1] == 0x00 && data[2] == 0x01 {
        return true;
    }
    false
}

/// Annex B start code (4-byte)
const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// Converts AVCC (4-byte length + NAL) to Annex B (start code + NAL).
/// Does not use FFmpeg BSF; ffmpeg_next does not expose AVBSFContext in its ffi.
pub fn convert_avcc_to_annexb(avcc: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    let mut i = 0;
    while i + 4 <= avcc.len() {
        let len = (u32::from(avcc[i]) << 24
            | u32::from(avcc[i + 1]) << 16
            | u32::from(avcc[i + 2]) << 8
            | u32::from(avcc[i + 3])) as usize;
        i += 4;
        if len == 0 || i + len > avcc.len() {
            break;
        }
        out.extend_from_slice(START_CODE);
        out.extend_from_slice(&avcc[i..i + len]);
        i += len;
    }
    out.freeze()
}

/// Returns the payload in Annex B form. Data already using start codes is shared,
/// anything else is converted into a new buffer.
pub fn to_annexb(data: &Bytes) -> Bytes {
    if data.is_empty() || is_annexb_packet(data) {
        data.clone()
    } else {
        convert_avcc_to_annexb(data)
    }
}

/// Offsets of every 3-byte start code (`00 00 01`) that is followed by a NAL header.
fn start_codes(data: &[u8]) -> impl Iterator<Item = usize> + '_ {
    (0..data.len().saturating_sub(3))
        .filter(move |&i| data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1)
}

/// Iterates the NAL units of an Annex B buffer, without their start codes.
pub fn nal_units(data: &[u8]) -> impl Iterator<Item = &[u8]> + '_ {
    let starts: Vec<usize> = start_codes(data).collect();
    (0..starts.len()).map(move |n| {
        let begin = starts[n] + 3;
        let mut end = starts.get(n + 1).copied().unwrap_or(data.len());
        // the leading zero of a 4-byte start code belongs to the next unit
        while end > begin && data[end - 1] == 0 && n + 1 < starts.len() {
            end -= 1;
        }
        &data[begin..end]
    })
}

/// Recovers SPS/PPS from an Annex B keyframe.
///
/// The run starts at the start code of the first SPS and ends at the start code of
/// the first unit after it that is neither SPS nor PPS. Runs shorter than
/// eight bytes, or an SPS with nothing after it, yield `None`.
pub fn extract_parameter_sets(data: &[u8]) -> Option<Bytes> {
    let mut begin = None;
    for offset in start_codes(data) {
        let nal_type = data[offset + 3] & 0x1f;
        match begin {
            None if nal_type == NAL_SPS => begin = Some(offset),
            Some(start) if nal_type != NAL_SPS && nal_type != NAL_PPS => {
                if offset - start < MIN_PARAMETER_SETS_LEN {
                    return None;
                }
                return Some(Bytes::copy_from_slice(&data[start..offset]));
            }
            _ => {}
        }
    }
    None
}
