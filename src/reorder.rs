use std::collections::BTreeMap;

use bytes::Bytes;

use crate::seq::SeqNum;

/// verdict for an arriving sequenced segment
#[derive(Debug, PartialEq, Eq)]
pub enum Accept {
    /// in-order arrival; the payloads are ready for the application, in order.
    /// Keepalive segments advance the cursor but contribute no payload, so the
    /// vec may be empty.
    Delivered(Vec<Bytes>),
    /// ahead of the cursor; held back, a gap remains
    Buffered,
    /// behind the cursor, already buffered, or outside the receive window
    Duplicate,
}

/// Receive-side reorder buffer. Tracks the next expected sequence number and
/// holds out-of-order arrivals (up to one window ahead) until the gap closes.
///
/// Buffered entries are keyed by raw sequence number. The map is only ever
/// probed point-wise, so the wrap of the 8-bit space does not matter for its
/// ordering.
#[derive(Debug)]
pub struct ReorderBuffer {
    expected_next: SeqNum,
    window: u8,
    buffered: BTreeMap<u8, Bytes>,
}

impl ReorderBuffer {
    pub fn new(window: u8) -> Self {
        ReorderBuffer {
            expected_next: SeqNum::ZERO,
            window,
            buffered: BTreeMap::new(),
        }
    }

    /// set the cursor to the peer's first sequenced segment after the handshake
    pub fn seed(&mut self, expected_next: SeqNum) {
        self.expected_next = expected_next;
        self.buffered.clear();
    }

    pub fn set_window(&mut self, window: u8) {
        self.window = window;
    }

    pub fn expected_next(&self) -> SeqNum {
        self.expected_next
    }

    /// the highest sequence number received in order, i.e. the cumulative
    /// acknowledgement to send to the peer
    pub fn highest_contiguous(&self) -> SeqNum {
        self.expected_next.prev()
    }

    pub fn has_gap(&self) -> bool {
        !self.buffered.is_empty()
    }

    pub fn accept(&mut self, seq: SeqNum, payload: Bytes) -> Accept {
        if seq == self.expected_next {
            let mut delivered = Vec::new();
            Self::push_payload(&mut delivered, payload);
            self.expected_next = self.expected_next.next();

            // the gap may have closed; drain everything now contiguous
            while let Some(buffered) = self.buffered.remove(&self.expected_next.to_raw()) {
                Self::push_payload(&mut delivered, buffered);
                self.expected_next = self.expected_next.next();
            }
            return Accept::Delivered(delivered);
        }

        if seq.at_or_before(self.highest_contiguous()) {
            return Accept::Duplicate;
        }
        if seq.distance_from(self.expected_next) >= self.window {
            // too far ahead to be a legitimate in-window arrival
            return Accept::Duplicate;
        }
        if self.buffered.contains_key(&seq.to_raw()) {
            return Accept::Duplicate;
        }
        self.buffered.insert(seq.to_raw(), payload);
        Accept::Buffered
    }

    fn push_payload(delivered: &mut Vec<Bytes>, payload: Bytes) {
        if !payload.is_empty() {
            delivered.push(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn payload(tag: u8) -> Bytes {
        Bytes::copy_from_slice(&[tag])
    }

    fn tags(delivered: &Accept) -> Vec<u8> {
        match delivered {
            Accept::Delivered(v) => v.iter().map(|b| b[0]).collect(),
            other => panic!("expected Delivered, got {:?}", other),
        }
    }

    fn buffer_at(expected: u8) -> ReorderBuffer {
        let mut b = ReorderBuffer::new(8);
        b.seed(SeqNum::from_raw(expected));
        b
    }

    #[test]
    fn test_in_order_delivery() {
        let mut b = buffer_at(5);
        assert_eq!(tags(&b.accept(SeqNum::from_raw(5), payload(5))), vec![5]);
        assert_eq!(tags(&b.accept(SeqNum::from_raw(6), payload(6))), vec![6]);
        assert_eq!(b.expected_next(), SeqNum::from_raw(7));
        assert_eq!(b.highest_contiguous(), SeqNum::from_raw(6));
    }

    #[test]
    fn test_gap_then_cascade() {
        let mut b = buffer_at(5);
        assert_eq!(b.accept(SeqNum::from_raw(7), payload(7)), Accept::Buffered);
        assert_eq!(b.accept(SeqNum::from_raw(8), payload(8)), Accept::Buffered);
        assert!(b.has_gap());
        // highest contiguous does not move while the gap is open
        assert_eq!(b.highest_contiguous(), SeqNum::from_raw(4));

        assert_eq!(tags(&b.accept(SeqNum::from_raw(5), payload(5))), vec![5]);
        assert_eq!(tags(&b.accept(SeqNum::from_raw(6), payload(6))), vec![6, 7, 8]);
        assert!(!b.has_gap());
        assert_eq!(b.expected_next(), SeqNum::from_raw(9));
    }

    #[rstest]
    #[case::behind(4)]
    #[case::far_behind(200)]
    fn test_duplicate_behind_cursor(#[case] seq: u8) {
        let mut b = buffer_at(5);
        assert_eq!(b.accept(SeqNum::from_raw(seq), payload(0)), Accept::Duplicate);
        assert_eq!(b.expected_next(), SeqNum::from_raw(5));
    }

    #[test]
    fn test_duplicate_of_buffered() {
        let mut b = buffer_at(5);
        assert_eq!(b.accept(SeqNum::from_raw(7), payload(7)), Accept::Buffered);
        assert_eq!(b.accept(SeqNum::from_raw(7), payload(7)), Accept::Duplicate);
    }

    #[test]
    fn test_beyond_window_rejected() {
        let mut b = buffer_at(5);
        assert_eq!(b.accept(SeqNum::from_raw(13), payload(0)), Accept::Duplicate);
        assert_eq!(b.accept(SeqNum::from_raw(12), payload(12)), Accept::Buffered);
    }

    #[test]
    fn test_wrap_around() {
        let mut b = buffer_at(254);
        assert_eq!(b.accept(SeqNum::from_raw(0), payload(10)), Accept::Buffered);
        assert_eq!(tags(&b.accept(SeqNum::from_raw(254), payload(14))), vec![14]);
        assert_eq!(tags(&b.accept(SeqNum::from_raw(255), payload(15))), vec![15, 10]);
        assert_eq!(b.expected_next(), SeqNum::from_raw(1));
    }

    #[test]
    fn test_keepalives_advance_without_delivering() {
        let mut b = buffer_at(5);
        assert_eq!(b.accept(SeqNum::from_raw(5), Bytes::new()), Accept::Delivered(vec![]));
        assert_eq!(b.accept(SeqNum::from_raw(7), payload(7)), Accept::Buffered);
        assert_eq!(b.accept(SeqNum::from_raw(6), Bytes::new()), Accept::Delivered(vec![payload(7)]));
        assert_eq!(b.expected_next(), SeqNum::from_raw(8));
    }

    #[test]
    fn test_seed_resets_state() {
        let mut b = buffer_at(5);
        assert_eq!(b.accept(SeqNum::from_raw(7), payload(7)), Accept::Buffered);
        b.seed(SeqNum::from_raw(100));
        assert!(!b.has_gap());
        assert_eq!(tags(&b.accept(SeqNum::from_raw(100), payload(1))), vec![1]);
    }
}
