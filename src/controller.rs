use std::cmp::min;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{RssiConfig, SessionParams};
use crate::datagram::DatagramSink;
use crate::error::RssiError;
use crate::reorder::{Accept, ReorderBuffer};
use crate::segment::Segment;
use crate::send_window::SendWindow;
use crate::seq::SeqNum;
use crate::timer::{TimerKind, TimerSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// initial state: nothing sent or received yet
    Listen,
    /// client: proposal sent, waiting for the reply
    SynSent,
    /// server: reply sent, waiting for the completing acknowledgement
    SynReceived,
    Open,
    /// local teardown in progress
    Closing,
    /// terminal; a closed connection never reopens
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Connection health counters. Written from inside the engine, readable by the
/// application at any time; all accesses are relaxed because the counters are
/// diagnostics, not synchronization.
#[derive(Debug, Default)]
pub struct SessionStats {
    down: AtomicU32,
    dropped: AtomicU32,
    retransmitted: AtomicU32,
    local_busy: AtomicU32,
    remote_busy: AtomicU32,
}

impl SessionStats {
    /// number of times the connection was torn down by a fatal condition
    pub fn down_count(&self) -> u32 {
        self.down.load(Ordering::Relaxed)
    }

    /// datagrams discarded without effect (malformed, duplicate, unexpected)
    pub fn drop_count(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn retransmit_count(&self) -> u32 {
        self.retransmitted.load(Ordering::Relaxed)
    }

    /// times the local side raised its busy flag
    pub fn local_busy_count(&self) -> u32 {
        self.local_busy.load(Ordering::Relaxed)
    }

    /// times the peer raised its busy flag
    pub fn remote_busy_count(&self) -> u32 {
        self.remote_busy.load(Ordering::Relaxed)
    }

    fn inc_down(&self) {
        self.down.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn add_retransmit(&self, n: u32) {
        self.retransmitted.fetch_add(n, Ordering::Relaxed);
    }

    fn inc_local_busy(&self) {
        self.local_busy.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_remote_busy(&self) {
        self.remote_busy.fetch_add(1, Ordering::Relaxed);
    }
}

fn encode(segment: &Segment) -> Bytes {
    let mut buf = BytesMut::new();
    segment.ser(&mut buf);
    buf.freeze()
}

struct Inner {
    config: RssiConfig,
    sink: Arc<dyn DatagramSink>,
    role: Role,
    state: ConnState,
    /// agreed parameter set once the handshake completes; the local proposal
    /// before that
    negotiated: SessionParams,
    connection_id: u32,
    next_seq: SeqNum,
    send_window: SendWindow,
    reorder: ReorderBuffer,
    timers: TimerSet,
    local_busy: bool,
    remote_busy: bool,
    /// sequenced segments received since the last acknowledgement we sent
    unacked_rx: u8,
    fatal: Option<RssiError>,
    /// encoded handshake reply, kept for idempotent re-answering of a
    /// retransmitted proposal
    last_syn_reply: Option<Bytes>,
    stats: Arc<SessionStats>,
    state_tx: watch::Sender<ConnState>,
    /// bumped whenever send-window space may have appeared (or the connection
    /// died); blocked senders re-check on every change
    window_rev: watch::Sender<u64>,
    /// bumped whenever a timer deadline changed; the timer loop re-sleeps
    timer_rev: watch::Sender<u64>,
}

impl Inner {
    fn bump_window(&self) {
        self.window_rev.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn bump_timer(&self) {
        self.timer_rev.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn set_state(&mut self, state: ConnState) {
        if self.state != state {
            debug!("connection state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
            self.bump_window();
        }
    }

    fn take_seq(&mut self) -> SeqNum {
        let seq = self.next_seq;
        self.next_seq = seq.next();
        seq
    }

    fn can_send(&self) -> bool {
        self.state == ConnState::Open && !self.send_window.is_full() && !self.remote_busy
    }

    /// an acknowledgement carrying the current receive cursor; does not
    /// consume a sequence number
    fn bare_ack(&self) -> Segment {
        Segment::Ack {
            seq: self.next_seq,
            ack: self.reorder.highest_contiguous(),
            busy: self.local_busy,
        }
    }

    /// housekeeping after any outbound segment: a carried acknowledgement
    /// makes a pending cumulative ack redundant, and any transmission proves
    /// our own liveness
    fn note_sent(&mut self, segment: &Segment) {
        if segment.ack_num().is_some() {
            self.timers.cancel(TimerKind::CumAck);
            self.unacked_rx = 0;
        }
        if self.state == ConnState::Open {
            self.timers.arm(TimerKind::Nul, Instant::now() + self.negotiated.null_duration());
        }
        self.bump_timer();
    }

    /// send an unreliable segment (never retransmitted)
    async fn transmit(&mut self, segment: &Segment) {
        trace!("sending {} segment, seq {}", segment.kind_name(), segment.seq());
        let bytes = encode(segment);
        self.sink.send_datagram(&bytes).await;
        self.note_sent(segment);
    }

    /// send a sequenced segment and keep it for retransmission until it is
    /// acknowledged
    async fn transmit_reliable(&mut self, segment: &Segment) -> Result<(), RssiError> {
        trace!("sending {} segment, seq {}", segment.kind_name(), segment.seq());
        let bytes = encode(segment);
        self.send_window.push(segment.seq(), bytes.clone(), Instant::now())?;
        if !self.timers.is_armed(TimerKind::Retransmit) {
            self.timers.arm(TimerKind::Retransmit, Instant::now() + self.negotiated.retransmit_duration());
        }
        self.sink.send_datagram(&bytes).await;
        self.note_sent(segment);
        Ok(())
    }

    fn apply_ack(&mut self, ack: SeqNum) {
        if ack.follows(self.next_seq.prev()) {
            // acknowledges a sequence number we never consumed
            return;
        }
        let freed = self.send_window.acknowledge(ack);
        if freed == 0 {
            return;
        }
        if self.send_window.is_empty() {
            self.timers.cancel(TimerKind::Retransmit);
        } else {
            self.timers.arm(TimerKind::Retransmit, Instant::now() + self.negotiated.retransmit_duration());
        }
        self.bump_timer();
        self.bump_window();

        if self.state == ConnState::SynReceived && self.send_window.is_empty() {
            // our handshake reply was acknowledged
            self.open();
        }
    }

    fn note_remote_busy(&mut self, busy: bool) {
        if busy == self.remote_busy {
            return;
        }
        self.remote_busy = busy;
        if busy {
            debug!("peer signalled busy, suspending data transmission");
            self.stats.inc_remote_busy();
        } else {
            debug!("peer cleared its busy flag");
            self.bump_window();
        }
    }

    fn open(&mut self) {
        info!("connection open, id {:08x}, agreed parameters {:?}", self.connection_id, self.negotiated);
        self.set_state(ConnState::Open);
        let now = Instant::now();
        self.timers.arm(TimerKind::Nul, now + self.negotiated.null_duration());
        self.timers.arm(TimerKind::PeerSilence, now + self.negotiated.peer_silence_duration());
        self.bump_timer();
    }

    fn adopt_params(&mut self, params: SessionParams) {
        self.negotiated = params;
        self.send_window.set_limit(params.max_outstanding_segments as usize);
        self.reorder.set_window(params.max_outstanding_segments);
    }

    fn force_close(&mut self, error: Option<RssiError>) {
        if self.state == ConnState::Closed {
            return;
        }
        if let Some(e) = error {
            warn!("connection {:08x} going down: {}", self.connection_id, e);
            self.fatal = Some(e);
            self.stats.inc_down();
        } else {
            info!("connection {:08x} closed", self.connection_id);
        }
        self.timers.cancel_all();
        self.send_window.clear();
        self.set_state(ConnState::Closed);
        self.bump_timer();
    }

    async fn on_datagram(&mut self, buf: &[u8]) -> Vec<Bytes> {
        if self.state == ConnState::Closed {
            return vec![];
        }
        let segment = match Segment::deser(buf) {
            Ok(segment) => segment,
            Err(e) => {
                debug!("dropping undecodable datagram ({} bytes): {}", buf.len(), e);
                self.stats.inc_drop();
                return vec![];
            }
        };
        trace!("received {} segment, seq {}", segment.kind_name(), segment.seq());

        // any decodable datagram proves the peer is alive
        if self.state == ConnState::Open {
            self.timers.arm(TimerKind::PeerSilence, Instant::now() + self.negotiated.peer_silence_duration());
            self.bump_timer();
        }
        if let Some(busy) = segment.busy() {
            self.note_remote_busy(busy);
        }
        // handshake segments are validated before their ack takes effect
        if !matches!(segment, Segment::Syn { .. }) {
            if let Some(ack) = segment.ack_num() {
                self.apply_ack(ack);
            }
        }

        match segment {
            Segment::Syn { seq, ack: None, checksum_enabled, params, connection_id } => {
                self.on_syn_proposal(seq, checksum_enabled, params, connection_id).await;
            }
            Segment::Syn { seq, ack: Some(ack), params, connection_id, .. } => {
                self.on_syn_reply(seq, ack, params, connection_id).await;
            }
            Segment::Ack { .. } => {
                // fully handled by the common ack/busy processing above
            }
            Segment::NegAck { nak, .. } => {
                self.on_neg_ack(nak).await;
            }
            Segment::Rst { .. } => {
                self.force_close(Some(RssiError::PeerReset));
            }
            Segment::Nul { seq, .. } => {
                return self.on_sequenced(seq, Bytes::new()).await;
            }
            Segment::Data { seq, payload, .. } => {
                return self.on_sequenced(seq, payload).await;
            }
        }
        vec![]
    }

    async fn on_syn_proposal(&mut self, seq: SeqNum, checksum_enabled: bool, params: SessionParams, connection_id: u32) {
        if self.role != Role::Server {
            self.stats.inc_drop();
            return;
        }
        match self.state {
            ConnState::Listen => {
                let agreed = self.config.params.negotiate(&params);
                debug!("proposal from peer: {:?}, agreed: {:?}", params, agreed);
                self.connection_id = connection_id;
                self.adopt_params(agreed);
                self.reorder.seed(seq.next());

                let reply = Segment::Syn {
                    seq: self.take_seq(),
                    ack: Some(seq),
                    checksum_enabled: checksum_enabled && self.config.checksum_enabled,
                    params: agreed,
                    connection_id,
                };
                self.last_syn_reply = Some(encode(&reply));
                if self.transmit_reliable(&reply).await.is_ok() {
                    self.set_state(ConnState::SynReceived);
                }
            }
            ConnState::SynReceived | ConnState::Open if connection_id == self.connection_id => {
                // retransmitted proposal; our reply was lost
                self.stats.inc_drop();
                if let Some(reply) = self.last_syn_reply.clone() {
                    self.sink.send_datagram(&reply).await;
                }
            }
            ConnState::SynReceived | ConnState::Open => {
                // a proposal for a different connection supersedes this one
                self.force_close(Some(RssiError::ConnectionIdMismatch));
            }
            _ => self.stats.inc_drop(),
        }
    }

    async fn on_syn_reply(&mut self, seq: SeqNum, ack: SeqNum, params: SessionParams, connection_id: u32) {
        if self.role != Role::Client || connection_id != self.connection_id {
            self.stats.inc_drop();
            return;
        }
        self.apply_ack(ack);
        match self.state {
            ConnState::SynSent => {
                // adopt the agreed set verbatim and complete the handshake
                self.adopt_params(params);
                self.reorder.seed(seq.next());
                self.open();
                let ack = self.bare_ack();
                self.transmit(&ack).await;
            }
            ConnState::Open => {
                // retransmitted reply; our completing ack was lost
                self.stats.inc_drop();
                let ack = self.bare_ack();
                self.transmit(&ack).await;
            }
            _ => self.stats.inc_drop(),
        }
    }

    /// peer asks for immediate retransmission of everything from `nak` onwards
    async fn on_neg_ack(&mut self, nak: SeqNum) {
        let resend = self.send_window.entries_from(nak);
        if resend.is_empty() {
            return;
        }
        debug!("peer requested retransmission from seq {}, resending {} segments", nak, resend.len());
        self.stats.add_retransmit(resend.len() as u32);
        for bytes in &resend {
            self.sink.send_datagram(bytes).await;
        }
        self.timers.arm(TimerKind::Retransmit, Instant::now() + self.negotiated.retransmit_duration());
        self.bump_timer();
    }

    async fn on_sequenced(&mut self, seq: SeqNum, payload: Bytes) -> Vec<Bytes> {
        if self.state != ConnState::Open {
            self.stats.inc_drop();
            return vec![];
        }
        let before = self.reorder.expected_next();
        match self.reorder.accept(seq, payload) {
            Accept::Delivered(payloads) => {
                let advanced = self.reorder.expected_next().distance_from(before);
                self.unacked_rx = self.unacked_rx.saturating_add(advanced);
                if self.unacked_rx >= self.negotiated.max_cum_ack {
                    let ack = self.bare_ack();
                    self.transmit(&ack).await;
                } else if !self.timers.is_armed(TimerKind::CumAck) {
                    self.timers.arm(TimerKind::CumAck, Instant::now() + self.negotiated.cum_ack_duration());
                    self.bump_timer();
                }
                payloads
            }
            Accept::Buffered => {
                let nak = Segment::NegAck {
                    seq: self.next_seq,
                    nak: self.reorder.expected_next(),
                };
                self.transmit(&nak).await;
                vec![]
            }
            Accept::Duplicate => {
                self.stats.inc_drop();
                // re-ack so the peer stops resending
                let ack = self.bare_ack();
                self.transmit(&ack).await;
                vec![]
            }
        }
    }

    async fn on_retransmit_due(&mut self) {
        let max_attempts = self.negotiated.max_retransmissions;
        let rto = self.negotiated.retransmit_duration();
        let resend = match self.send_window.oldest_unacked_mut() {
            None => return,
            Some(entry) if entry.attempts > max_attempts => None,
            Some(entry) => {
                entry.attempts += 1;
                entry.sent_at = Instant::now();
                Some(entry.bytes.clone())
            }
        };
        match resend {
            None => self.force_close(Some(RssiError::RetransmitLimitExceeded)),
            Some(bytes) => {
                self.stats.add_retransmit(1);
                self.sink.send_datagram(&bytes).await;
                self.timers.arm(TimerKind::Retransmit, Instant::now() + rto);
                self.bump_timer();
            }
        }
    }

    async fn on_nul_due(&mut self) {
        if self.state != ConnState::Open {
            return;
        }
        if self.send_window.is_full() {
            // window full; data segments are proving liveness anyway
            self.timers.arm(TimerKind::Nul, Instant::now() + self.negotiated.null_duration());
            self.bump_timer();
            return;
        }
        let keepalive = Segment::Nul {
            seq: self.take_seq(),
            ack: self.reorder.highest_contiguous(),
            busy: self.local_busy,
        };
        if let Err(e) = self.transmit_reliable(&keepalive).await {
            debug!("keepalive not queued: {}", e);
        }
    }

    async fn on_cum_ack_due(&mut self) {
        if self.state == ConnState::Open && self.unacked_rx > 0 {
            let ack = self.bare_ack();
            self.transmit(&ack).await;
        }
    }
}

/// The per-connection protocol state machine. All mutation happens under one
/// write lock; the lock is held across socket sends but never across waits for
/// the application or the peer.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<RwLock<Inner>>,
    stats: Arc<SessionStats>,
    state_rx: watch::Receiver<ConnState>,
    window_rx: watch::Receiver<u64>,
    timer_rx: watch::Receiver<u64>,
}

impl Controller {
    pub fn new(config: RssiConfig, sink: Arc<dyn DatagramSink>, role: Role) -> Controller {
        let (state_tx, state_rx) = watch::channel(ConnState::Listen);
        let (window_tx, window_rx) = watch::channel(0u64);
        let (timer_tx, timer_rx) = watch::channel(0u64);
        let stats = Arc::new(SessionStats::default());

        let window_limit = config.params.max_outstanding_segments;
        let inner = Inner {
            negotiated: config.params,
            config,
            sink,
            role,
            state: ConnState::Listen,
            connection_id: rand::random::<u32>(),
            next_seq: SeqNum::from_raw(rand::random::<u8>()),
            send_window: SendWindow::new(window_limit as usize),
            reorder: ReorderBuffer::new(window_limit),
            timers: TimerSet::default(),
            local_busy: false,
            remote_busy: false,
            unacked_rx: 0,
            fatal: None,
            last_syn_reply: None,
            stats: stats.clone(),
            state_tx,
            window_rev: window_tx,
            timer_rev: timer_tx,
        };

        Controller {
            inner: Arc::new(RwLock::new(inner)),
            stats,
            state_rx,
            window_rx,
            timer_rx,
        }
    }

    /// client side: send the handshake proposal
    pub async fn start_connect(&self) {
        let mut inner = self.inner.write().await;
        let syn = Segment::Syn {
            seq: inner.take_seq(),
            ack: None,
            checksum_enabled: inner.config.checksum_enabled,
            params: inner.config.params,
            connection_id: inner.connection_id,
        };
        info!("connecting, id {:08x}", inner.connection_id);
        match inner.transmit_reliable(&syn).await {
            Ok(()) => inner.set_state(ConnState::SynSent),
            Err(e) => debug!("handshake proposal not queued: {}", e),
        }
    }

    /// Process one inbound datagram, returning any payloads that became
    /// deliverable to the application (in order).
    pub async fn on_datagram(&self, buf: &[u8]) -> Vec<Bytes> {
        let mut inner = self.inner.write().await;
        inner.on_datagram(buf).await
    }

    /// Queue application data, splitting it into segments of at most the
    /// negotiated maximum size. Blocks while the send window is full or the
    /// peer is busy, up to `timeout`; a partial write leaves the already
    /// queued segments in flight.
    pub async fn send_data(&self, payload: &[u8], timeout: Duration) -> Result<(), RssiError> {
        if payload.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        let mut window_watch = self.window_rx.clone();
        let mut offset = 0;
        loop {
            {
                let mut inner = self.inner.write().await;
                // snapshot the revision while holding the lock so a bump
                // between the check below and the wait is not lost
                window_watch.borrow_and_update();
                match inner.state {
                    ConnState::Closed => {
                        return Err(inner.fatal.unwrap_or(RssiError::SessionClosed));
                    }
                    ConnState::Open => {
                        while offset < payload.len() && inner.can_send() {
                            let chunk_len = min(inner.negotiated.max_segment_size as usize, payload.len() - offset);
                            let chunk = Bytes::copy_from_slice(&payload[offset..offset + chunk_len]);
                            let segment = Segment::Data {
                                seq: inner.take_seq(),
                                ack: inner.reorder.highest_contiguous(),
                                busy: inner.local_busy,
                                payload: chunk,
                            };
                            inner.transmit_reliable(&segment).await?;
                            offset += chunk_len;
                        }
                        if offset >= payload.len() {
                            return Ok(());
                        }
                    }
                    _ => {
                        // handshake still in progress
                    }
                }
            }
            tokio::select! {
                changed = window_watch.changed() => {
                    if changed.is_err() {
                        return Err(RssiError::SessionClosed);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(RssiError::WindowFull);
                }
            }
        }
    }

    /// graceful local teardown: tell the peer, then close
    pub async fn close(&self) {
        let mut inner = self.inner.write().await;
        if matches!(inner.state, ConnState::Closed | ConnState::Listen) {
            inner.force_close(None);
            return;
        }
        inner.set_state(ConnState::Closing);
        let rst = Segment::Rst { seq: inner.next_seq };
        let bytes = encode(&rst);
        inner.sink.send_datagram(&bytes).await;
        inner.force_close(None);
    }

    /// Raise or clear the local busy flag. A change is announced to the peer
    /// immediately via a bare acknowledgement.
    pub async fn set_local_busy(&self, busy: bool) {
        let mut inner = self.inner.write().await;
        if inner.local_busy == busy {
            return;
        }
        inner.local_busy = busy;
        if busy {
            inner.stats.inc_local_busy();
        }
        if inner.state == ConnState::Open {
            let ack = inner.bare_ack();
            inner.transmit(&ack).await;
        }
    }

    /// fire every expired timer; called by the session's timer loop
    pub async fn handle_due_timers(&self) {
        let mut inner = self.inner.write().await;
        for kind in inner.timers.take_due(Instant::now()) {
            match kind {
                TimerKind::Retransmit => inner.on_retransmit_due().await,
                TimerKind::CumAck => inner.on_cum_ack_due().await,
                TimerKind::Nul => inner.on_nul_due().await,
                TimerKind::PeerSilence => inner.force_close(Some(RssiError::PeerSilent)),
            }
            if inner.state == ConnState::Closed {
                break;
            }
        }
    }

    pub async fn next_timer_deadline(&self) -> Option<Instant> {
        self.inner.read().await.timers.next_deadline()
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    pub fn connection_state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnState> {
        self.state_rx.clone()
    }

    pub fn timer_watch(&self) -> watch::Receiver<u64> {
        self.timer_rx.clone()
    }

    pub async fn negotiated_params(&self) -> SessionParams {
        self.inner.read().await.negotiated
    }

    pub async fn connection_id(&self) -> u32 {
        self.inner.read().await.connection_id
    }

    /// the fatal condition that closed the connection, if any
    pub async fn fatal_error(&self) -> Option<RssiError> {
        self.inner.read().await.fatal
    }
}
