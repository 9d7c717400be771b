//! Owns a single UDP endpoint and multiplexes many peers onto it, driving
//! each [`Connection`]'s tick and datagram routing from one `tokio` event
//! loop.
//!
//! The core owns the socket and the tick timer directly — so this embeds a
//! small `tokio::select!` loop, the same shape as the legacy client and
//! server's single `libuv` loop driving one timer and one UDP handle.
//! Connections are keyed by peer address and exclusively owned here, rather
//! than each holding a reference back to its manager.

use std::{net::SocketAddr, sync::Arc, time::{Duration, Instant}};

use ahash::AHashMap;
use bytes::{BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::{
    config::ConnectionManagerOptions,
    connection::{Connection, ConnectionEvent},
    frame::SessionRequest,
    loss::PacketLoss,
    opcode::Opcode,
    stats::Stats,
    status::ConnectionStatus,
};

type NewConnectionCb = Box<dyn FnMut(SocketAddr) + Send>;
type StateChangeCb = Box<dyn FnMut(SocketAddr, ConnectionStatus, ConnectionStatus) + Send>;
type PacketRecvCb = Box<dyn FnMut(SocketAddr, Bytes) + Send>;
type ErrorCb = Box<dyn FnMut(Option<SocketAddr>, String) + Send>;

/// Multiplexes every peer `(address, port)` onto one bound UDP socket.
///
/// A connection is identified to callers by its peer [`SocketAddr`]; the
/// manager is the sole owner of the [`Connection`] values themselves, so
/// callers operate on them by address rather than holding their own
/// reference.
pub struct ConnectionManager {
    socket: Arc<UdpSocket>,
    options: Arc<ConnectionManagerOptions>,
    connections: AHashMap<SocketAddr, Connection>,
    loss: PacketLoss,

    on_new_connection: Option<NewConnectionCb>,
    on_connection_state_change: Option<StateChangeCb>,
    on_packet_recv: Option<PacketRecvCb>,
    on_error_message: Option<ErrorCb>,
}

impl ConnectionManager {
    /// Binds `0.0.0.0:{options.port}` with address reuse and, where
    /// permitted, raises the socket receive buffer to
    /// `options.socket_recv_buffer_bytes`.
    pub async fn bind(options: ConnectionManagerOptions) -> std::io::Result<Self> {
        let addr = SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, options.port));
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        if let Err(err) = socket.set_recv_buffer_size(options.socket_recv_buffer_bytes) {
            warn!(%err, requested = options.socket_recv_buffer_bytes, "failed to raise socket receive buffer size");
        }
        let socket = UdpSocket::from_std(socket.into())?;

        Ok(Self {
            socket: Arc::new(socket),
            loss: PacketLoss::new(options.simulated_in_packet_loss, options.simulated_out_packet_loss),
            options: Arc::new(options),
            connections: AHashMap::default(),
            on_new_connection: None,
            on_connection_state_change: None,
            on_packet_recv: None,
            on_error_message: None,
        })
    }

    /// The address actually bound, including the OS-assigned port when
    /// `options.port == 0`.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Registers a callback fired once per newly accepted inbound session
    ///.
    pub fn set_on_new_connection(&mut self, cb: impl FnMut(SocketAddr) + Send + 'static) {
        self.on_new_connection = Some(Box::new(cb));
    }

    /// Registers a callback fired synchronously on every status transition
    ///.
    pub fn set_on_connection_state_change(
        &mut self,
        cb: impl FnMut(SocketAddr, ConnectionStatus, ConnectionStatus) + Send + 'static,
    ) {
        self.on_connection_state_change = Some(Box::new(cb));
    }

    /// Registers a callback fired once per application payload delivered.
    /// The ordering guarantee applies per stream, not across this
    /// callback's overall invocation order.
    pub fn set_on_packet_recv(&mut self, cb: impl FnMut(SocketAddr, Bytes) + Send + 'static) {
        self.on_packet_recv = Some(Box::new(cb));
    }

    /// Registers a callback fired for every recoverable problem:
    /// framing errors, CRC mismatches, decode failures, and manager-level
    /// problems with no specific peer (`None`).
    pub fn set_on_error_message(&mut self, cb: impl FnMut(Option<SocketAddr>, String) + Send + 'static) {
        self.on_error_message = Some(Box::new(cb));
    }

    /// Starts an outbound session to `addr`, priming its first
    /// `SessionRequest` immediately rather than waiting for the next tick.
    /// Returns `addr` itself, used as the connection's handle in every
    /// other manager method.
    pub async fn connect(&mut self, addr: SocketAddr) -> SocketAddr {
        let now = Instant::now();
        let connect_code: u32 = rand::random();
        let mut conn = Connection::connect(connect_code, Arc::clone(&self.options), now);
        let (ready, events) = conn.tick(now, self.tick_interval());
        self.connections.insert(addr, conn);
        self.emit_events(addr, events);
        self.send_all(addr, ready).await;
        addr
    }

    /// Sends an unsolicited `OutOfSession` datagram to `peer`, e.g. to tell
    /// a stray client there is nothing listening for it.
    pub async fn send_disconnect(&self, peer: SocketAddr) {
        self.send_out_of_session(peer).await;
    }

    /// Queues an application payload on an existing connection
    /// (fire-and-forget — silently a no-op for an unknown
    /// peer). The resulting wire datagrams go out coalesced, at the
    /// latest by the next [`Self::tick`].
    pub fn queue_packet(&mut self, peer: SocketAddr, data: &[u8], stream: u8, reliable: bool) {
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.queue_packet(data, stream, reliable);
        }
    }

    /// Closes a connection: flushes its coalesce buffer, emits
    /// `SessionDisconnect`, and transitions it toward removal. A no-op for
    /// an unknown peer or one already closing.
    pub async fn close(&mut self, peer: SocketAddr) {
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        let events = conn.close();
        let ready = conn.drain_ready_to_send();
        self.emit_events(peer, events);
        self.send_all(peer, ready).await;
    }

    /// Accumulated counters for one connection, if it still exists.
    #[must_use]
    pub fn get_stats(&self, peer: SocketAddr) -> Option<&Stats> {
        self.connections.get(&peer).map(Connection::get_stats)
    }

    /// Zeroes one connection's counters, if it still exists.
    pub fn reset_stats(&mut self, peer: SocketAddr) {
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.reset_stats();
        }
    }

    /// Current lifecycle status of one connection, if it still exists.
    #[must_use]
    pub fn status(&self, peer: SocketAddr) -> Option<ConnectionStatus> {
        self.connections.get(&peer).map(Connection::status)
    }

    /// Number of connections currently tracked (any status).
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Reads exactly one inbound datagram off the socket and routes it,
    /// blocking until one arrives. A lower-level building block than
    /// [`Self::run`], for callers (including tests) that want to interleave
    /// their own event sources with the manager's socket instead of
    /// handing it the whole event loop.
    pub async fn recv_one(&mut self) -> std::io::Result<SocketAddr> {
        let mut buf = vec![0u8; 65536];
        let (len, peer) = self.socket.recv_from(&mut buf).await?;
        self.on_datagram(peer, &buf[..len]).await;
        Ok(peer)
    }

    /// Routes one inbound UDP datagram, already read off the socket, to
    /// the connection for `peer` — creating a server-side connection from
    /// a `SessionRequest` if none exists yet, or replying `OutOfSession` to
    /// anything else from an unrecognized peer.
    pub async fn on_datagram(&mut self, peer: SocketAddr, raw: &[u8]) {
        if self.loss.should_drop_inbound() {
            return;
        }
        let now = Instant::now();

        if !self.connections.contains_key(&peer) {
            self.on_datagram_from_unknown_peer(peer, raw, now).await;
            return;
        }

        let conn = self
            .connections
            .get_mut(&peer)
            .expect("just checked contains_key");
        let (ready, events) = conn.on_datagram(raw, now);
        self.emit_events(peer, events);
        self.send_all(peer, ready).await;
    }

    async fn on_datagram_from_unknown_peer(&mut self, peer: SocketAddr, raw: &[u8], now: Instant) {
        if raw.len() < 2 {
            self.report_error(Some(peer), "datagram too short to route".to_string());
            return;
        }
        let is_session_request =
            raw[0] == 0x00 && raw[1] == Opcode::SessionRequest.as_u8();
        if !is_session_request {
            if raw[1] != Opcode::OutOfSession.as_u8() {
                self.send_out_of_session(peer).await;
            }
            return;
        }

        match SessionRequest::decode(&raw[2..]) {
            Ok(req) => {
                let encode_key: u32 = rand::random();
                let mut conn =
                    Connection::accept(req.connect_code, encode_key, Arc::clone(&self.options), now);
                let ready = conn.drain_ready_to_send();
                self.connections.insert(peer, conn);
                debug!(%peer, connect_code = req.connect_code, "accepted inbound session");
                if let Some(cb) = &mut self.on_new_connection {
                    cb(peer);
                }
                self.send_all(peer, ready).await;
            }
            Err(err) => self.report_error(Some(peer), err.to_string()),
        }
    }

    /// Runs one tick's worth of housekeeping across every connection:
    /// budget replenishment, resend scanning, coalesce flush, keep-alive
    /// emission, staleness checks, and removal of anything that finished
    /// its `Disconnecting` grace period (its `tick()`).
    pub async fn tick(&mut self) {
        let now = Instant::now();
        let tick_interval = self.tick_interval();
        let peers: Vec<SocketAddr> = self.connections.keys().copied().collect();

        for peer in peers {
            let Some(conn) = self.connections.get_mut(&peer) else {
                continue;
            };
            let (ready, events) = conn.tick(now, tick_interval);
            self.emit_events(peer, events);
            self.send_all(peer, ready).await;

            if self
                .connections
                .get(&peer)
                .is_some_and(|c| c.status() == ConnectionStatus::Disconnected)
            {
                self.connections.remove(&peer);
            }
        }
    }

    /// Runs forever, alternating between reading one inbound datagram and
    /// firing the periodic tick — the single-threaded cooperative loop.
    /// Both branches of the `select!` run to completion without
    /// interleaving, so no lock is ever held across a callback.
    pub async fn run(&mut self) -> std::io::Result<()> {
        let mut interval = tokio::time::interval(self.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buf = vec![0u8; 65536];

        loop {
            tokio::select! {
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, peer)) => self.on_datagram(peer, &buf[..len]).await,
                        Err(err) => self.report_error(None, format!("udp recv failed: {err}")),
                    }
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.options.tic_rate_hertz.max(1)))
    }

    async fn send_out_of_session(&self, peer: SocketAddr) {
        let mut w = BytesMut::with_capacity(2);
        w.put_u8(0x00);
        w.put_u8(Opcode::OutOfSession.as_u8());
        if let Err(err) = self.socket.send_to(&w, peer).await {
            warn!(%peer, %err, "failed to send OutOfSession");
        }
    }

    async fn send_all(&self, peer: SocketAddr, datagrams: Vec<Bytes>) {
        for datagram in datagrams {
            if self.loss.should_drop_outbound() {
                continue;
            }
            if let Err(err) = self.socket.send_to(&datagram, peer).await {
                warn!(%peer, %err, "udp send failed");
            }
        }
    }

    fn emit_events(&mut self, peer: SocketAddr, events: Vec<ConnectionEvent>) {
        for event in events {
            match event {
                ConnectionEvent::StatusChanged { from, to } => {
                    if let Some(cb) = &mut self.on_connection_state_change {
                        cb(peer, from, to);
                    }
                }
                ConnectionEvent::PacketRecv(bytes) => {
                    if let Some(cb) = &mut self.on_packet_recv {
                        cb(peer, bytes);
                    }
                }
                ConnectionEvent::Error(message) => {
                    if let Some(cb) = &mut self.on_error_message {
                        cb(Some(peer), message);
                    } else {
                        warn!(%peer, %message, "connection error");
                    }
                }
            }
        }
    }

    fn report_error(&mut self, peer: Option<SocketAddr>, message: String) {
        if let Some(cb) = &mut self.on_error_message {
            cb(peer, message);
        } else {
            warn!(?peer, %message, "manager error");
        }
    }
}
