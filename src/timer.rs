use tokio::time::Instant;

/// the four per-session deadlines
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// oldest unacknowledged outbound segment must be resent
    Retransmit,
    /// pending cumulative acknowledgement must be flushed
    CumAck,
    /// keepalive must be sent to prove liveness
    Nul,
    /// nothing heard from the peer; the session is dead when this fires
    PeerSilence,
}

const ALL_KINDS: [TimerKind; 4] = [
    TimerKind::Retransmit,
    TimerKind::CumAck,
    TimerKind::Nul,
    TimerKind::PeerSilence,
];

/// a single one-shot re-armable deadline
#[derive(Debug, Default)]
struct Deadline(Option<Instant>);

impl Deadline {
    fn arm(&mut self, at: Instant) {
        self.0 = Some(at);
    }

    fn cancel(&mut self) {
        self.0 = None;
    }

    fn take_if_due(&mut self, now: Instant) -> bool {
        match self.0 {
            Some(at) if at <= now => {
                self.0 = None;
                true
            }
            _ => false,
        }
    }
}

/// All session deadlines as plain data. The owning time loop asks for the
/// earliest deadline, sleeps until it, and collects whatever is due; keeping
/// the set free of tokio sleep state makes the expiry logic unit-testable.
#[derive(Debug, Default)]
pub struct TimerSet {
    retransmit: Deadline,
    cum_ack: Deadline,
    nul: Deadline,
    peer_silence: Deadline,
}

impl TimerSet {
    fn slot(&mut self, kind: TimerKind) -> &mut Deadline {
        match kind {
            TimerKind::Retransmit => &mut self.retransmit,
            TimerKind::CumAck => &mut self.cum_ack,
            TimerKind::Nul => &mut self.nul,
            TimerKind::PeerSilence => &mut self.peer_silence,
        }
    }

    fn slot_ref(&self, kind: TimerKind) -> &Deadline {
        match kind {
            TimerKind::Retransmit => &self.retransmit,
            TimerKind::CumAck => &self.cum_ack,
            TimerKind::Nul => &self.nul,
            TimerKind::PeerSilence => &self.peer_silence,
        }
    }

    pub fn arm(&mut self, kind: TimerKind, at: Instant) {
        self.slot(kind).arm(at);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.slot(kind).cancel();
    }

    pub fn cancel_all(&mut self) {
        for kind in ALL_KINDS {
            self.cancel(kind);
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slot_ref(kind).0.is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [self.retransmit.0, self.cum_ack.0, self.nul.0, self.peer_silence.0]
            .into_iter()
            .flatten()
            .min()
    }

    /// Disarm and return every due timer, in fixed priority order
    /// (retransmission before acknowledgement housekeeping).
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        ALL_KINDS
            .into_iter()
            .filter(|&kind| self.slot(kind).take_if_due(now))
            .collect()
    }
}
