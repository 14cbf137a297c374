use std::cmp::{max, min};
use std::time::Duration;

use anyhow::bail;

/// The tunable session limits and timeouts that are exchanged during the
/// handshake. Each side proposes a set; the server combines them component-wise
/// (see [`SessionParams::negotiate`]) and echoes the agreed set in its reply.
/// Once the session is open the agreed set is immutable.
///
/// All timeout fields are raw counts of the session's timeout unit (a negative
/// power of ten of a second, e.g. unit 3 = milliseconds).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionParams {
    /// upper bound for unacknowledged outbound segments (send window size)
    pub max_outstanding_segments: u8,
    /// upper bound for the payload of a single data segment, in bytes
    pub max_segment_size: u16,
    /// retransmission timeout, in timeout units
    pub retransmit_timeout: u16,
    /// cumulative acknowledgement timeout, in timeout units
    pub cum_ack_timeout: u16,
    /// keepalive interval, in timeout units
    pub null_timeout: u16,
    /// number of unacknowledged received segments that forces an immediate ack
    pub max_cum_ack: u8,
    /// retransmission attempts per segment before the session is declared dead
    pub max_retransmissions: u8,
    /// negative power of ten of a second (3 = milliseconds, 6 = microseconds)
    pub timeout_unit: u8,
}

impl SessionParams {
    /// Combine a local and a remote proposal component-wise, each field in its
    /// safety-conservative direction: the smaller window / segment size / ack
    /// accumulation, the larger timeouts and retry budget. The timeout unit is
    /// taken from the local (server) side, which is the side performing the
    /// negotiation.
    pub fn negotiate(&self, remote: &SessionParams) -> SessionParams {
        SessionParams {
            max_outstanding_segments: min(self.max_outstanding_segments, remote.max_outstanding_segments),
            max_segment_size: min(self.max_segment_size, remote.max_segment_size),
            retransmit_timeout: max(self.retransmit_timeout, remote.retransmit_timeout),
            cum_ack_timeout: max(self.cum_ack_timeout, remote.cum_ack_timeout),
            null_timeout: max(self.null_timeout, remote.null_timeout),
            max_cum_ack: min(self.max_cum_ack, remote.max_cum_ack),
            max_retransmissions: max(self.max_retransmissions, remote.max_retransmissions),
            timeout_unit: self.timeout_unit,
        }
    }

    fn unit_duration(&self, raw: u16) -> Duration {
        // validate() bounds timeout_unit, so the exponent cannot underflow
        Duration::from_nanos(raw as u64 * 10u64.pow(9 - self.timeout_unit as u32))
    }

    pub fn retransmit_duration(&self) -> Duration {
        self.unit_duration(self.retransmit_timeout)
    }

    pub fn cum_ack_duration(&self) -> Duration {
        self.unit_duration(self.cum_ack_timeout)
    }

    pub fn null_duration(&self) -> Duration {
        self.unit_duration(self.null_timeout)
    }

    /// The deadline after which a silent peer is declared dead. This is not a
    /// negotiated field; it is fixed at three keepalive intervals so that a
    /// single lost keepalive does not kill a healthy session.
    pub fn peer_silence_duration(&self) -> Duration {
        self.null_duration() * 3
    }
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            max_outstanding_segments: 8,
            max_segment_size: 1024,
            retransmit_timeout: 100,
            cum_ack_timeout: 5,
            null_timeout: 3000,
            max_cum_ack: 2,
            max_retransmissions: 15,
            timeout_unit: 3,
        }
    }
}

/// Engine configuration: the local handshake proposal plus the knobs that are
/// purely local to this side of the connection.
#[derive(Clone, Debug)]
pub struct RssiConfig {
    /// the parameter set proposed to the peer during the handshake
    pub params: SessionParams,

    /// whether to request header checksums on handshake segments
    pub checksum_enabled: bool,

    /// Capacity of the ordered-delivery queue towards the application. When
    /// the queue is full the local busy flag is raised and the peer stops
    /// sending new data until the application catches up.
    pub delivery_queue_depth: usize,

    /// default upper bound for how long an application write may wait for
    /// send-window space (adjustable per session)
    pub send_timeout: Duration,
}

impl Default for RssiConfig {
    fn default() -> Self {
        RssiConfig {
            params: SessionParams::default(),
            checksum_enabled: true,
            delivery_queue_depth: 64,
            send_timeout: Duration::from_secs(10),
        }
    }
}

impl RssiConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.params.max_outstanding_segments == 0 {
            bail!("max outstanding segments must be at least 1");
        }
        if self.params.max_outstanding_segments > 127 {
            // wrap-aware comparisons need the window to stay well inside half
            //  the 8-bit sequence space
            bail!("max outstanding segments must be at most 127");
        }
        if self.params.max_segment_size == 0 {
            bail!("max segment size must be at least 1 byte");
        }
        if self.params.retransmit_timeout == 0 || self.params.null_timeout == 0 {
            bail!("retransmit timeout and null timeout must be non-zero");
        }
        if self.params.max_retransmissions == 0 {
            bail!("max retransmissions must be at least 1");
        }
        if !(3..=6).contains(&self.params.timeout_unit) {
            bail!("timeout unit must be between 3 (milliseconds) and 6 (microseconds)");
        }
        if self.delivery_queue_depth == 0 {
            bail!("delivery queue depth must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn params(
        max_outstanding: u8,
        max_segment: u16,
        retransmit: u16,
        cum_ack: u16,
        null: u16,
        max_cum_ack: u8,
        max_retran: u8,
        unit: u8,
    ) -> SessionParams {
        SessionParams {
            max_outstanding_segments: max_outstanding,
            max_segment_size: max_segment,
            retransmit_timeout: retransmit,
            cum_ack_timeout: cum_ack,
            null_timeout: null,
            max_cum_ack,
            max_retransmissions: max_retran,
            timeout_unit: unit,
        }
    }

    #[test]
    fn test_negotiate_conservative_directions() {
        let server = params(4, 512, 20, 5, 2000, 2, 10, 3);
        let client = params(8, 1024, 10, 8, 3000, 3, 15, 3);

        let agreed = server.negotiate(&client);

        assert_eq!(agreed.max_outstanding_segments, 4);
        assert_eq!(agreed.max_segment_size, 512);
        assert_eq!(agreed.retransmit_timeout, 20);
        assert_eq!(agreed.cum_ack_timeout, 8);
        assert_eq!(agreed.null_timeout, 3000);
        assert_eq!(agreed.max_cum_ack, 2);
        assert_eq!(agreed.max_retransmissions, 15);
        assert_eq!(agreed.timeout_unit, 3);
    }

    #[test]
    fn test_negotiate_is_symmetric_except_unit() {
        let a = params(4, 512, 20, 5, 2000, 2, 10, 3);
        let b = params(8, 1024, 10, 8, 3000, 3, 15, 4);

        let ab = a.negotiate(&b);
        let ba = b.negotiate(&a);

        assert_eq!(ab.timeout_unit, 3);
        assert_eq!(ba.timeout_unit, 4);
        assert_eq!(SessionParams { timeout_unit: 0, ..ab }, SessionParams { timeout_unit: 0, ..ba });
    }

    #[rstest]
    #[case::milliseconds(3, 20, Duration::from_millis(20))]
    #[case::hundred_micros(4, 7, Duration::from_micros(700))]
    #[case::microseconds(6, 150, Duration::from_micros(150))]
    fn test_unit_scaling(#[case] unit: u8, #[case] raw: u16, #[case] expected: Duration) {
        let p = SessionParams { timeout_unit: unit, retransmit_timeout: raw, ..SessionParams::default() };
        assert_eq!(p.retransmit_duration(), expected);
    }

    #[test]
    fn test_peer_silence_is_three_keepalives() {
        let p = SessionParams { null_timeout: 100, timeout_unit: 3, ..SessionParams::default() };
        assert_eq!(p.peer_silence_duration(), Duration::from_millis(300));
    }

    #[rstest]
    #[case::zero_window(|c: &mut RssiConfig| c.params.max_outstanding_segments = 0)]
    #[case::window_too_big(|c: &mut RssiConfig| c.params.max_outstanding_segments = 128)]
    #[case::zero_segment(|c: &mut RssiConfig| c.params.max_segment_size = 0)]
    #[case::zero_retransmit(|c: &mut RssiConfig| c.params.retransmit_timeout = 0)]
    #[case::zero_null(|c: &mut RssiConfig| c.params.null_timeout = 0)]
    #[case::zero_retries(|c: &mut RssiConfig| c.params.max_retransmissions = 0)]
    #[case::bad_unit(|c: &mut RssiConfig| c.params.timeout_unit = 9)]
    #[case::zero_queue(|c: &mut RssiConfig| c.delivery_queue_depth = 0)]
    fn test_validate_rejects(#[case] break_it: fn(&mut RssiConfig)) {
        let mut config = RssiConfig::default();
        assert!(config.validate().is_ok());
        break_it(&mut config);
        assert!(config.validate().is_err());
    }
}
