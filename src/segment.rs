use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::config::SessionParams;
use crate::error::RssiError;
use crate::seq::SeqNum;

/// version number carried in the high nibble of the handshake header's fifth byte
const PROTOCOL_VERSION: u8 = 1;

/// handshake headers are 24 bytes, all other headers 8 bytes
pub const SYN_HEADER_LEN: usize = 24;
pub const REGULAR_HEADER_LEN: usize = 8;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SegFlags: u8 {
        const SYN  = 0x80;
        const ACK  = 0x40;
        const NAK  = 0x20;
        const RST  = 0x10;
        const NUL  = 0x08;
        const BUSY = 0x01;
    }
}

/// A decoded segment. This is the unit that travels in a single datagram.
///
/// Every header starts with the same four bytes:
/// ```text
///  0          1       2     3
/// +----------+-------+-----+-----+
/// | hdr len  | flags | seq | ack |
/// +----------+-------+-----+-----+
/// ```
/// Non-handshake segments continue with a little-endian payload length and two
/// reserved bytes:
/// ```text
///  4              6          8
/// +--------------+----------+---------...
/// | payload len  | reserved | payload
/// +--------------+----------+---------...
/// ```
/// Handshake (`Syn`) segments instead carry the proposed session parameters at
/// fixed offsets up to byte 22, followed by an optional additive 16-bit
/// checksum over bytes 0..22:
/// ```text
///  4        5        6        8         10        12        14       15
/// +--------+--------+--------+---------+---------+---------+--------+--------+
/// | max    | ver/chk| max    | retrans | cum ack | null    | max    | max    |
/// | outst. |        | seg sz | timeout | timeout | timeout | cumack | retran |
/// +--------+--------+--------+---------+---------+---------+--------+--------+
///  16       17       18              22         24
/// +--------+--------+---------------+----------+
/// | unit   | rsvd   | connection id | checksum |
/// +--------+--------+---------------+----------+
/// ```
/// All multi-byte fields are little-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// handshake proposal (client) or handshake reply carrying the agreed
    /// parameter set (server, with `ack` present)
    Syn {
        seq: SeqNum,
        ack: Option<SeqNum>,
        checksum_enabled: bool,
        params: SessionParams,
        connection_id: u32,
    },
    /// bare cumulative acknowledgement; does not consume a sequence number
    Ack { seq: SeqNum, ack: SeqNum, busy: bool },
    /// negative acknowledgement asking for retransmission from `nak` onwards;
    /// does not consume a sequence number
    NegAck { seq: SeqNum, nak: SeqNum },
    /// unconditional teardown
    Rst { seq: SeqNum },
    /// keepalive; consumes a sequence number and is retransmittable
    Nul { seq: SeqNum, ack: SeqNum, busy: bool },
    /// application payload; consumes a sequence number and is retransmittable
    Data {
        seq: SeqNum,
        ack: SeqNum,
        busy: bool,
        payload: Bytes,
    },
}

fn checksum(header: &[u8]) -> u16 {
    let mut sum = 0u16;
    for word in header.chunks_exact(2) {
        sum = sum.wrapping_add(u16::from_le_bytes([word[0], word[1]]));
    }
    sum
}

fn busy_bit(busy: bool) -> SegFlags {
    if busy {
        SegFlags::BUSY
    } else {
        SegFlags::empty()
    }
}

impl Segment {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Segment::Syn {
                seq,
                ack,
                checksum_enabled,
                params,
                connection_id,
            } => {
                let start = buf.len();
                let mut flags = SegFlags::SYN;
                if ack.is_some() {
                    flags |= SegFlags::ACK;
                }
                buf.put_u8(SYN_HEADER_LEN as u8);
                buf.put_u8(flags.bits());
                buf.put_u8(seq.to_raw());
                buf.put_u8(ack.map(SeqNum::to_raw).unwrap_or(0));
                buf.put_u8(params.max_outstanding_segments);
                buf.put_u8((PROTOCOL_VERSION << 4) | if *checksum_enabled { 0x04 } else { 0 });
                buf.put_u16_le(params.max_segment_size);
                buf.put_u16_le(params.retransmit_timeout);
                buf.put_u16_le(params.cum_ack_timeout);
                buf.put_u16_le(params.null_timeout);
                buf.put_u8(params.max_cum_ack);
                buf.put_u8(params.max_retransmissions);
                buf.put_u8(params.timeout_unit);
                buf.put_u8(0);
                buf.put_u32_le(*connection_id);
                let ck = if *checksum_enabled {
                    checksum(&buf[start..start + 22])
                } else {
                    0
                };
                buf.put_u16_le(ck);
            }
            Segment::Ack { seq, ack, busy } => {
                Self::ser_regular(buf, SegFlags::ACK | busy_bit(*busy), *seq, ack.to_raw(), &[]);
            }
            Segment::NegAck { seq, nak } => {
                // the ack byte carries the highest in-order sequence number,
                //  i.e. the predecessor of the retransmit-from point
                Self::ser_regular(buf, SegFlags::ACK | SegFlags::NAK, *seq, nak.prev().to_raw(), &[]);
            }
            Segment::Rst { seq } => {
                Self::ser_regular(buf, SegFlags::RST, *seq, 0, &[]);
            }
            Segment::Nul { seq, ack, busy } => {
                Self::ser_regular(buf, SegFlags::NUL | SegFlags::ACK | busy_bit(*busy), *seq, ack.to_raw(), &[]);
            }
            Segment::Data { seq, ack, busy, payload } => {
                Self::ser_regular(buf, SegFlags::ACK | busy_bit(*busy), *seq, ack.to_raw(), payload);
            }
        }
    }

    fn ser_regular(buf: &mut BytesMut, flags: SegFlags, seq: SeqNum, ack: u8, payload: &[u8]) {
        buf.put_u8(REGULAR_HEADER_LEN as u8);
        buf.put_u8(flags.bits());
        buf.put_u8(seq.to_raw());
        buf.put_u8(ack);
        buf.put_u16_le(payload.len() as u16);
        buf.put_u16_le(0);
        buf.put_slice(payload);
    }

    pub fn deser(buf: &[u8]) -> Result<Segment, RssiError> {
        if buf.len() < REGULAR_HEADER_LEN {
            return Err(RssiError::MalformedSegment("truncated header"));
        }
        let flags = SegFlags::from_bits(buf[1]).ok_or(RssiError::MalformedSegment("unknown flags"))?;
        let seq = SeqNum::from_raw(buf[2]);
        let ack = SeqNum::from_raw(buf[3]);

        if flags.contains(SegFlags::SYN) {
            return Self::deser_syn(buf, flags, seq, ack);
        }

        if buf[0] as usize != REGULAR_HEADER_LEN {
            return Err(RssiError::MalformedSegment("header length mismatch"));
        }
        let payload_len = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        if buf.len() != REGULAR_HEADER_LEN + payload_len {
            return Err(RssiError::MalformedSegment("payload length mismatch"));
        }

        let busy = flags.contains(SegFlags::BUSY);
        if flags.contains(SegFlags::RST) {
            return Ok(Segment::Rst { seq });
        }
        if flags.contains(SegFlags::NUL) {
            if payload_len != 0 {
                return Err(RssiError::MalformedSegment("payload length mismatch"));
            }
            return Ok(Segment::Nul { seq, ack, busy });
        }
        if flags.contains(SegFlags::NAK) {
            return Ok(Segment::NegAck { seq, nak: ack.next() });
        }
        if flags.contains(SegFlags::ACK) {
            return if payload_len > 0 {
                Ok(Segment::Data {
                    seq,
                    ack,
                    busy,
                    payload: Bytes::copy_from_slice(&buf[REGULAR_HEADER_LEN..]),
                })
            } else {
                Ok(Segment::Ack { seq, ack, busy })
            };
        }
        Err(RssiError::MalformedSegment("no segment kind flag"))
    }

    fn deser_syn(buf: &[u8], flags: SegFlags, seq: SeqNum, ack: SeqNum) -> Result<Segment, RssiError> {
        if buf.len() < SYN_HEADER_LEN {
            return Err(RssiError::MalformedSegment("truncated header"));
        }
        if buf[0] as usize != SYN_HEADER_LEN || buf.len() != SYN_HEADER_LEN {
            return Err(RssiError::MalformedSegment("header length mismatch"));
        }
        if buf[5] >> 4 != PROTOCOL_VERSION {
            return Err(RssiError::MalformedSegment("unsupported version"));
        }
        let checksum_enabled = buf[5] & 0x04 != 0;
        if checksum_enabled {
            let expected = u16::from_le_bytes([buf[22], buf[23]]);
            if checksum(&buf[..22]) != expected {
                return Err(RssiError::MalformedSegment("bad checksum"));
            }
        }
        let params = SessionParams {
            max_outstanding_segments: buf[4],
            max_segment_size: u16::from_le_bytes([buf[6], buf[7]]),
            retransmit_timeout: u16::from_le_bytes([buf[8], buf[9]]),
            cum_ack_timeout: u16::from_le_bytes([buf[10], buf[11]]),
            null_timeout: u16::from_le_bytes([buf[12], buf[13]]),
            max_cum_ack: buf[14],
            max_retransmissions: buf[15],
            timeout_unit: buf[16],
        };
        let connection_id = u32::from_le_bytes([buf[18], buf[19], buf[20], buf[21]]);
        Ok(Segment::Syn {
            seq,
            ack: if flags.contains(SegFlags::ACK) { Some(ack) } else { None },
            checksum_enabled,
            params,
            connection_id,
        })
    }

    pub fn seq(&self) -> SeqNum {
        match self {
            Segment::Syn { seq, .. }
            | Segment::Ack { seq, .. }
            | Segment::NegAck { seq, .. }
            | Segment::Rst { seq }
            | Segment::Nul { seq, .. }
            | Segment::Data { seq, .. } => *seq,
        }
    }

    /// the cumulative acknowledgement this segment carries, if any
    pub fn ack_num(&self) -> Option<SeqNum> {
        match self {
            Segment::Syn { ack, .. } => *ack,
            Segment::Ack { ack, .. } | Segment::Nul { ack, .. } | Segment::Data { ack, .. } => Some(*ack),
            Segment::NegAck { nak, .. } => Some(nak.prev()),
            Segment::Rst { .. } => None,
        }
    }

    pub fn busy(&self) -> Option<bool> {
        match self {
            Segment::Ack { busy, .. } | Segment::Nul { busy, .. } | Segment::Data { busy, .. } => Some(*busy),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Segment::Syn { .. } => "SYN",
            Segment::Ack { .. } => "ACK",
            Segment::NegAck { .. } => "NAK",
            Segment::Rst { .. } => "RST",
            Segment::Nul { .. } => "NUL",
            Segment::Data { .. } => "DATA",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn syn_params() -> SessionParams {
        SessionParams {
            max_outstanding_segments: 4,
            max_segment_size: 512,
            retransmit_timeout: 20,
            cum_ack_timeout: 5,
            null_timeout: 2000,
            max_cum_ack: 2,
            max_retransmissions: 10,
            timeout_unit: 3,
        }
    }

    #[rstest]
    #[case::ack(
        Segment::Ack { seq: SeqNum::from_raw(5), ack: SeqNum::from_raw(9), busy: false },
        vec![8, 0x40, 5, 9, 0, 0, 0, 0],
    )]
    #[case::ack_busy(
        Segment::Ack { seq: SeqNum::from_raw(5), ack: SeqNum::from_raw(9), busy: true },
        vec![8, 0x41, 5, 9, 0, 0, 0, 0],
    )]
    #[case::neg_ack(
        Segment::NegAck { seq: SeqNum::from_raw(5), nak: SeqNum::from_raw(10) },
        vec![8, 0x60, 5, 9, 0, 0, 0, 0],
    )]
    #[case::neg_ack_wrapping(
        Segment::NegAck { seq: SeqNum::from_raw(1), nak: SeqNum::from_raw(0) },
        vec![8, 0x60, 1, 255, 0, 0, 0, 0],
    )]
    #[case::rst(
        Segment::Rst { seq: SeqNum::from_raw(200) },
        vec![8, 0x10, 200, 0, 0, 0, 0, 0],
    )]
    #[case::nul(
        Segment::Nul { seq: SeqNum::from_raw(7), ack: SeqNum::from_raw(3), busy: true },
        vec![8, 0x49, 7, 3, 0, 0, 0, 0],
    )]
    #[case::data(
        Segment::Data { seq: SeqNum::from_raw(4), ack: SeqNum::from_raw(8), busy: false, payload: Bytes::from_static(&[1, 2, 3]) },
        vec![8, 0x40, 4, 8, 3, 0, 0, 0, 1, 2, 3],
    )]
    #[case::syn_plain(
        Segment::Syn {
            seq: SeqNum::from_raw(0),
            ack: None,
            checksum_enabled: false,
            params: SessionParams {
                max_outstanding_segments: 8,
                max_segment_size: 1024,
                retransmit_timeout: 100,
                cum_ack_timeout: 5,
                null_timeout: 3000,
                max_cum_ack: 2,
                max_retransmissions: 15,
                timeout_unit: 3,
            },
            connection_id: 1,
        },
        vec![24, 0x80, 0, 0, 8, 0x10, 0x00, 0x04, 100, 0, 5, 0, 0xB8, 0x0B, 2, 15, 3, 0, 1, 0, 0, 0, 0, 0],
    )]
    #[case::syn_ack_checksummed(
        Segment::Syn {
            seq: SeqNum::from_raw(10),
            ack: Some(SeqNum::from_raw(99)),
            checksum_enabled: true,
            params: syn_params(),
            connection_id: 0x11223344,
        },
        vec![24, 0xC0, 10, 99, 4, 0x14, 0x00, 0x02, 20, 0, 5, 0, 0xD0, 0x07, 2, 10, 3, 0, 0x44, 0x33, 0x22, 0x11, 0x7A, 0x8F],
    )]
    fn test_ser_deser(#[case] segment: Segment, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        segment.ser(&mut buf);
        assert_eq!(buf.to_vec(), expected);
        assert_eq!(Segment::deser(&expected), Ok(segment));
    }

    #[rstest]
    #[case::empty(vec![], "truncated header")]
    #[case::short(vec![8, 0x40, 5], "truncated header")]
    #[case::unknown_flag_bit(vec![8, 0x42, 5, 9, 0, 0, 0, 0], "unknown flags")]
    #[case::wrong_header_len(vec![12, 0x40, 5, 9, 0, 0, 0, 0], "header length mismatch")]
    #[case::payload_len_too_big(vec![8, 0x40, 5, 9, 4, 0, 0, 0, 1, 2, 3], "payload length mismatch")]
    #[case::payload_len_too_small(vec![8, 0x40, 5, 9, 2, 0, 0, 0, 1, 2, 3], "payload length mismatch")]
    #[case::nul_with_payload(vec![8, 0x48, 7, 3, 1, 0, 0, 0, 42], "payload length mismatch")]
    #[case::no_kind(vec![8, 0x01, 5, 9, 0, 0, 0, 0], "no segment kind flag")]
    #[case::truncated_syn(vec![24, 0x80, 0, 0, 8, 0x10, 0x00, 0x04, 100, 0, 5, 0], "truncated header")]
    #[case::syn_wrong_header_len(
        vec![8, 0x80, 0, 0, 8, 0x10, 0x00, 0x04, 100, 0, 5, 0, 0xB8, 0x0B, 2, 15, 3, 0, 1, 0, 0, 0, 0, 0],
        "header length mismatch",
    )]
    #[case::syn_bad_version(
        vec![24, 0x80, 0, 0, 8, 0x20, 0x00, 0x04, 100, 0, 5, 0, 0xB8, 0x0B, 2, 15, 3, 0, 1, 0, 0, 0, 0, 0],
        "unsupported version",
    )]
    fn test_deser_malformed(#[case] buf: Vec<u8>, #[case] expected: &'static str) {
        assert_eq!(Segment::deser(&buf), Err(RssiError::MalformedSegment(expected)));
    }

    #[test]
    fn test_corrupted_syn_fails_checksum() {
        let segment = Segment::Syn {
            seq: SeqNum::from_raw(10),
            ack: Some(SeqNum::from_raw(99)),
            checksum_enabled: true,
            params: syn_params(),
            connection_id: 0x11223344,
        };
        let mut buf = BytesMut::new();
        segment.ser(&mut buf);

        let mut corrupted = buf.to_vec();
        corrupted[8] ^= 0x01;
        assert_eq!(Segment::deser(&corrupted), Err(RssiError::MalformedSegment("bad checksum")));
    }

    #[test]
    fn test_corrupted_syn_without_checksum_goes_undetected() {
        let segment = Segment::Syn {
            seq: SeqNum::from_raw(10),
            ack: None,
            checksum_enabled: false,
            params: syn_params(),
            connection_id: 7,
        };
        let mut buf = BytesMut::new();
        segment.ser(&mut buf);

        let mut corrupted = buf.to_vec();
        corrupted[8] = corrupted[8].wrapping_add(1);
        let decoded = Segment::deser(&corrupted).unwrap();
        match decoded {
            Segment::Syn { params, .. } => assert_eq!(params.retransmit_timeout, 21),
            other => panic!("unexpected segment {:?}", other),
        }
    }

    #[test]
    fn test_accessors() {
        let data = Segment::Data {
            seq: SeqNum::from_raw(4),
            ack: SeqNum::from_raw(8),
            busy: true,
            payload: Bytes::from_static(b"x"),
        };
        assert_eq!(data.seq(), SeqNum::from_raw(4));
        assert_eq!(data.ack_num(), Some(SeqNum::from_raw(8)));
        assert_eq!(data.busy(), Some(true));
        assert_eq!(data.kind_name(), "DATA");

        let rst = Segment::Rst { seq: SeqNum::from_raw(1) };
        assert_eq!(rst.ack_num(), None);
        assert_eq!(rst.busy(), None);

        let nak = Segment::NegAck { seq: SeqNum::from_raw(1), nak: SeqNum::from_raw(12) };
        assert_eq!(nak.ack_num(), Some(SeqNum::from_raw(11)));
    }
}
