use bytes::Bytes;

/// A demuxed packet on its way to the decoder.
pub struct RawPacket {
    packet: ffmpeg_next::codec::packet::Packet,
}

impl RawPacket {
    pub fn index(&self) -> usize {
        self.packet.stream()
    }

    pub fn packet(&self) -> &ffmpeg_next::codec::packet::Packet {
        &self.packet
    }
}

impl From<ffmpeg_next::codec::packet::Packet> for RawPacket {
    fn from(packet: ffmpeg_next::codec::packet::Packet) -> Self {
        Self { packet }
    }
}

/// One encoded access unit. Timestamps and duration are in microseconds
/// (`ffmpeg_next::util::mathematics::rescale::TIME_BASE`). The payload is shared
/// between every output; outputs that need to reformat it work on a copy.
#[derive(Debug, Clone)]
pub struct CodedPacket {
    data: Bytes,
    pts: i64,
    dts: i64,
    duration: i64,
    is_key: bool,
}

impl CodedPacket {
    pub fn new(data: Bytes, pts: i64, dts: i64, duration: i64, is_key: bool) -> Self {
        Self {
            data,
            pts,
            dts,
            duration,
            is_key,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn pts(&self) -> i64 {
        self.pts
    }

    pub fn dts(&self) -> i64 {
        self.dts
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Same timing, different payload.
    pub fn with_data(&self, data: Bytes) -> Self {
        Self {
            data,
            ..self.clone()
        }
    }

    /// Shifts both timestamps back by `origin`.
    pub fn rebased(&self, origin: i64) -> Self {
        Self {
            pts: self.pts - origin,
            dts: self.dts - origin,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebased_keeps_payload_and_duration() {
        let packet = CodedPacket::new(Bytes::from_static(&[1, 2, 3]), 5_000, 4_000, 40_000, true);
        let rebased = packet.rebased(4_000);
        assert_eq!((rebased.pts(), rebased.dts()), (1_000, 0));
        assert_eq!(rebased.duration(), 40_000);
        assert!(rebased.is_key());
        assert_eq!(rebased.data(), packet.data());
    }

    #[test]
    fn test_raw_packet_keeps_stream_index() {
        let mut packet = ffmpeg_next::codec::packet::Packet::copy(&[0, 0, 1, 0x65]);
        packet.set_stream(2);
        let raw = RawPacket::from(packet);
        assert_eq!(raw.index(), 2);
        assert_eq!(raw.packet().size(), 4);
    }

    #[test]
    fn test_with_data_leaves_original_untouched() {
        let packet = CodedPacket::new(Bytes::from_static(&[9]), 1, 1, 1, false);
        let copy = packet.with_data(Bytes::from_static(&[0, 0, 0, 1, 9]));
        assert_eq!(packet.size(), 1);
        assert_eq!(copy.size(), 5);
        assert_eq!(copy.pts(), 1);
    }
}
