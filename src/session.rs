use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{RssiConfig, SessionParams};
use crate::controller::{ConnState, Controller, Role, SessionStats};
use crate::datagram::PeerSink;
use crate::error::RssiError;
use crate::segment::Segment;

/// big enough for any UDP payload
const MAX_DATAGRAM_LEN: usize = 65536;

/// An established (or establishing) connection: the protocol state machine
/// plus the two background loops that drive it, one feeding it inbound
/// datagrams and one firing its timers.
///
/// Dropping the session aborts the loops; the peer then sees the connection
/// die through its silence deadline. Call [`Session::close`] first for a
/// graceful teardown.
pub struct Session {
    controller: Controller,
    delivery_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    send_timeout: std::sync::Mutex<Duration>,
    recv_task: JoinHandle<()>,
    timer_task: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.recv_task.abort();
        self.timer_task.abort();
    }
}

impl Session {
    fn start(controller: Controller, socket: Arc<UdpSocket>, peer: SocketAddr, config: &RssiConfig) -> Session {
        let (delivery_tx, delivery_rx) = mpsc::channel(config.delivery_queue_depth);
        let recv_task = tokio::spawn(recv_loop(controller.clone(), socket, peer, delivery_tx));
        let timer_task = tokio::spawn(timer_loop(controller.clone()));
        Session {
            controller,
            delivery_rx: tokio::sync::Mutex::new(delivery_rx),
            send_timeout: std::sync::Mutex::new(config.send_timeout),
            recv_task,
            timer_task,
        }
    }

    /// Reliable ordered write. Data longer than the negotiated maximum
    /// segment size is split; the peer receives the pieces as separate reads,
    /// in order.
    pub async fn send(&self, data: &[u8]) -> Result<(), RssiError> {
        let timeout = *self.send_timeout.lock().unwrap();
        self.controller.send_data(data, timeout).await
    }

    /// Next piece of application data, in order. Buffered data remains
    /// readable after the connection closed; once it is drained this returns
    /// the error that closed the connection.
    pub async fn recv(&self) -> Result<Bytes, RssiError> {
        let mut rx = self.delivery_rx.lock().await;
        match rx.recv().await {
            Some(payload) => Ok(payload),
            None => Err(self.controller.fatal_error().await.unwrap_or(RssiError::SessionClosed)),
        }
    }

    /// graceful teardown: the peer is told before the connection closes
    pub async fn close(&self) {
        self.controller.close().await;
    }

    pub fn set_send_timeout(&self, timeout: Duration) {
        *self.send_timeout.lock().unwrap() = timeout;
    }

    pub fn state(&self) -> ConnState {
        self.controller.connection_state()
    }

    /// resolves once the connection is closed, for whatever reason
    pub async fn wait_closed(&self) {
        let mut state = self.controller.state_watch();
        let _ = state.wait_for(|s| *s == ConnState::Closed).await;
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.controller.stats()
    }

    pub async fn negotiated_params(&self) -> SessionParams {
        self.controller.negotiated_params().await
    }

    pub async fn connection_id(&self) -> u32 {
        self.controller.connection_id().await
    }
}

/// resolves once the connection reaches `Closed`, yielding nothing
async fn closed(state: &mut watch::Receiver<ConnState>) {
    let _ = state.wait_for(|s| *s == ConnState::Closed).await;
}

async fn recv_loop(controller: Controller, socket: Arc<UdpSocket>, peer: SocketAddr, delivery: mpsc::Sender<Bytes>) {
    let mut state = controller.state_watch();
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        if from != peer {
                            debug!("ignoring datagram from unrelated address {}", from);
                            continue;
                        }
                        let correlation_id = Uuid::new_v4();
                        let delivered = controller
                            .on_datagram(&buf[..len])
                            .instrument(trace_span!("recv", %correlation_id))
                            .await;
                        for payload in delivered {
                            if delivery.capacity() == 0 {
                                // the application is not keeping up; tell the
                                // peer before blocking on the queue
                                controller.set_local_busy(true).await;
                            }
                            tokio::select! {
                                sent = delivery.send(payload) => {
                                    if sent.is_err() {
                                        debug!("application side gone, closing connection");
                                        controller.close().await;
                                        return;
                                    }
                                }
                                _ = closed(&mut state) => {
                                    debug!("connection closed while delivering, stopping receive loop");
                                    return;
                                }
                            }
                            controller.set_local_busy(false).await;
                        }
                    }
                    Err(e) => {
                        warn!("error receiving datagram: {}", e);
                    }
                }
            }
            _ = closed(&mut state) => {
                debug!("connection closed, stopping receive loop");
                return;
            }
        }
    }
}

async fn timer_loop(controller: Controller) {
    let mut timer_rev = controller.timer_watch();
    let mut state = controller.state_watch();
    loop {
        // mark the revision seen before reading the deadline, so a deadline
        // change after the read wakes the select below
        timer_rev.borrow_and_update();
        let deadline = controller.next_timer_deadline().await;
        tokio::select! {
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                controller.handle_due_timers().await;
            }
            changed = timer_rev.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = closed(&mut state) => {
                debug!("connection closed, stopping timer loop");
                return;
            }
        }
    }
}

/// the connecting side
pub struct Client {
    session: Session,
}

impl Client {
    /// Bind an ephemeral local port and run the handshake against
    /// `server_addr`. Resolves once the connection is open, or with the error
    /// that killed the attempt.
    pub async fn connect(config: RssiConfig, server_addr: SocketAddr) -> anyhow::Result<Client> {
        config.validate()?;
        let bind_addr: SocketAddr = if server_addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let sink = Arc::new(PeerSink::new(socket.clone(), server_addr));
        let controller = Controller::new(config.clone(), sink, Role::Client);
        let session = Session::start(controller, socket, server_addr, &config);
        session.controller.start_connect().await;

        let mut state = session.controller.state_watch();
        let settled = *state.wait_for(|s| matches!(s, ConnState::Open | ConnState::Closed)).await?;
        if settled == ConnState::Closed {
            let error = session.controller.fatal_error().await.unwrap_or(RssiError::SessionClosed);
            return Err(error.into());
        }
        Ok(Client { session })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl std::ops::Deref for Client {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

/// the accepting side: a bound socket waiting for handshake proposals
pub struct Server {
    socket: Arc<UdpSocket>,
    config: RssiConfig,
}

impl Server {
    pub async fn listen(config: RssiConfig, bind_addr: SocketAddr) -> anyhow::Result<Server> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("listening on {}", socket.local_addr()?);
        Ok(Server { socket, config })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait for a handshake proposal and run the handshake. One live session
    /// per listener: inbound traffic belongs to the accepted session until it
    /// is gone, then `accept` can serve a reconnect.
    pub async fn accept(&self) -> anyhow::Result<Session> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            match Segment::deser(&buf[..len]) {
                Ok(Segment::Syn { ack: None, .. }) => {
                    debug!("handshake proposal from {}", peer);
                    let sink = Arc::new(PeerSink::new(self.socket.clone(), peer));
                    let controller = Controller::new(self.config.clone(), sink, Role::Server);
                    let proposal = buf[..len].to_vec();
                    let session = Session::start(controller, self.socket.clone(), peer, &self.config);
                    session.controller.on_datagram(&proposal).await;

                    let mut state = session.controller.state_watch();
                    let settled = *state.wait_for(|s| matches!(s, ConnState::Open | ConnState::Closed)).await?;
                    if settled == ConnState::Closed {
                        debug!("handshake with {} failed, back to listening", peer);
                        continue;
                    }
                    return Ok(session);
                }
                _ => {
                    debug!("ignoring non-handshake datagram from {}", peer);
                }
            }
        }
    }
}
