use thiserror::Error;

/// Protocol-level error taxonomy.
///
/// Only the fatal kinds ever reach the session owner; the transient kinds
/// (`MalformedSegment`, `DuplicateOrStale`, `WindowFull`) are absorbed inside the
/// engine and show up in the session counters instead.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RssiError {
    /// A datagram could not be decoded into a segment. The datagram is dropped
    /// and counted, it never reaches the application.
    #[error("malformed segment: {0}")]
    MalformedSegment(&'static str),

    /// A segment was already delivered or is outside the receive window.
    /// Dropped and counted, not an error to the caller.
    #[error("duplicate or stale segment")]
    DuplicateOrStale,

    /// The send window holds the negotiated maximum of unacknowledged segments
    /// and the wait for an acknowledgement exceeded the caller's timeout.
    #[error("send window full")]
    WindowFull,

    /// The oldest unacknowledged segment was retransmitted the negotiated
    /// maximum number of times without being acknowledged. Fatal: the session
    /// is closed.
    #[error("retransmission limit exceeded")]
    RetransmitLimitExceeded,

    /// Nothing was received from the peer within the silence deadline. Fatal:
    /// the session is closed.
    #[error("peer silent beyond the negotiated timeout")]
    PeerSilent,

    /// The peer sent a reset segment. The session is closed immediately; this
    /// may well be a graceful teardown on the peer's side.
    #[error("connection reset by peer")]
    PeerReset,

    /// The session is closed (or was closed while a caller was blocked on it).
    #[error("session is closed")]
    SessionClosed,

    /// A handshake segment arrived with a connection id that does not belong
    /// to this session. The current session is superseded.
    #[error("connection id mismatch")]
    ConnectionIdMismatch,
}

impl RssiError {
    /// true for the kinds that force the session into the closed state
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RssiError::RetransmitLimitExceeded
                | RssiError::PeerSilent
                | RssiError::PeerReset
                | RssiError::ConnectionIdMismatch
        )
    }
}
