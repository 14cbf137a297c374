use std::collections::VecDeque;

use bytes::Bytes;
use tokio::time::Instant;

use crate::error::RssiError;
use crate::seq::SeqNum;

/// A segment awaiting acknowledgement. The encoded wire representation is kept
/// so that a retransmission resends byte-identical data.
#[derive(Debug)]
pub struct SendWindowEntry {
    pub seq: SeqNum,
    pub bytes: Bytes,
    pub sent_at: Instant,
    pub attempts: u8,
}

/// The outbound retransmission buffer. Entries are kept in send order, which
/// with a single sender counter is also wrap-aware sequence order, so
/// cumulative acknowledgement is truncation from the front.
///
/// The limit is renegotiated during the handshake; the window never holds more
/// than `limit` unacknowledged segments.
#[derive(Debug)]
pub struct SendWindow {
    limit: usize,
    entries: VecDeque<SendWindowEntry>,
}

impl SendWindow {
    pub fn new(limit: usize) -> Self {
        SendWindow {
            limit,
            entries: VecDeque::new(),
        }
    }

    /// shrink or grow to the negotiated limit; never evicts in-flight entries
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn push(&mut self, seq: SeqNum, bytes: Bytes, now: Instant) -> Result<(), RssiError> {
        if self.is_full() {
            return Err(RssiError::WindowFull);
        }
        self.entries.push_back(SendWindowEntry {
            seq,
            bytes,
            sent_at: now,
            attempts: 1,
        });
        Ok(())
    }

    /// Drop every entry at or before `ack`, returning how many were freed. An
    /// acknowledgement for a sequence number not in the window frees nothing.
    pub fn acknowledge(&mut self, ack: SeqNum) -> usize {
        let mut freed = 0;
        while let Some(front) = self.entries.front() {
            if front.seq.at_or_before(ack) {
                self.entries.pop_front();
                freed += 1;
            } else {
                break;
            }
        }
        freed
    }

    /// the entry whose retransmission deadline governs the retransmit timer
    pub fn oldest_unacked_mut(&mut self) -> Option<&mut SendWindowEntry> {
        self.entries.front_mut()
    }

    /// Encoded bytes of every entry from `from` onwards, in send order. Used
    /// for negative-acknowledgement retransmission; entries before `from` were
    /// implicitly acknowledged and are dropped by the caller via
    /// [`SendWindow::acknowledge`].
    pub fn entries_from(&self, from: SeqNum) -> Vec<Bytes> {
        self.entries
            .iter()
            .filter(|e| !e.seq.at_or_before(from.prev()))
            .map(|e| e.bytes.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn window_with(seqs: &[u8]) -> SendWindow {
        let mut w = SendWindow::new(16);
        for &s in seqs {
            w.push(SeqNum::from_raw(s), Bytes::copy_from_slice(&[s]), Instant::now()).unwrap();
        }
        w
    }

    fn remaining(w: &SendWindow) -> Vec<u8> {
        w.entries.iter().map(|e| e.seq.to_raw()).collect()
    }

    #[test]
    fn test_push_until_full() {
        let mut w = SendWindow::new(2);
        let now = Instant::now();
        w.push(SeqNum::from_raw(1), Bytes::new(), now).unwrap();
        w.push(SeqNum::from_raw(2), Bytes::new(), now).unwrap();
        assert!(w.is_full());
        assert_eq!(w.push(SeqNum::from_raw(3), Bytes::new(), now), Err(RssiError::WindowFull));

        w.acknowledge(SeqNum::from_raw(1));
        assert!(!w.is_full());
        w.push(SeqNum::from_raw(3), Bytes::new(), now).unwrap();
        assert_eq!(remaining(&w), vec![2, 3]);
    }

    #[rstest]
    #[case::middle(&[10, 11, 12, 13, 14], 12, 3, &[13, 14])]
    #[case::all(&[10, 11, 12], 12, 3, &[])]
    #[case::none_stale(&[10, 11, 12], 9, 0, &[10, 11, 12])]
    #[case::wrapping(&[254, 255, 0, 1], 0, 3, &[1])]
    #[case::empty(&[], 5, 0, &[])]
    fn test_acknowledge(
        #[case] seqs: &[u8],
        #[case] ack: u8,
        #[case] expected_freed: usize,
        #[case] expected_remaining: &[u8],
    ) {
        let mut w = window_with(seqs);
        assert_eq!(w.acknowledge(SeqNum::from_raw(ack)), expected_freed);
        assert_eq!(remaining(&w), expected_remaining);
    }

    #[rstest]
    #[case::from_middle(&[7, 8, 9, 10], 9, &[9, 10])]
    #[case::from_start(&[7, 8, 9, 10], 7, &[7, 8, 9, 10])]
    #[case::past_end(&[7, 8, 9], 10, &[])]
    #[case::wrapping(&[254, 255, 0, 1], 0, &[0, 1])]
    fn test_entries_from(#[case] seqs: &[u8], #[case] from: u8, #[case] expected: &[u8]) {
        let w = window_with(seqs);
        let bytes = w.entries_from(SeqNum::from_raw(from));
        let seqs_out: Vec<u8> = bytes.iter().map(|b| b[0]).collect();
        assert_eq!(seqs_out, expected);
    }

    #[test]
    fn test_oldest_unacked() {
        let mut w = window_with(&[3, 4, 5]);
        assert_eq!(w.oldest_unacked_mut().unwrap().seq, SeqNum::from_raw(3));
        w.oldest_unacked_mut().unwrap().attempts += 1;
        assert_eq!(w.entries[0].attempts, 2);

        w.acknowledge(SeqNum::from_raw(3));
        assert_eq!(w.oldest_unacked_mut().unwrap().seq, SeqNum::from_raw(4));
        assert_eq!(w.oldest_unacked_mut().unwrap().attempts, 1);
    }
}
