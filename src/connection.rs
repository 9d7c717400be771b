//! Per-peer state machine: reliability, fragmentation, encoding, CRC,
//! coalescing, keep-alive, stats and send budget.
//!
//! A [`Connection`] never touches a socket itself — [`crate::manager`] owns
//! the UDP endpoint and drains [`Connection::tick`]/[`Connection::on_datagram`]
//! for wire bytes to actually send: sans-IO, driven by an external
//! poll/flush split.

use std::{sync::Arc, time::Instant};

use bytes::{Bytes, BytesMut, BufMut};
use tracing::{debug, trace, warn};

use crate::{
    budget::SendBudget,
    coalesce::{CoalesceBuffer, PushResult},
    config::ConnectionManagerOptions,
    crc,
    encode::{self, EncodePass},
    error::{DecodeError, FramingError},
    fragment::{self, Reassembler},
    frame::{
        AckHeader, FragmentHeader, ReliableHeader, SessionDisconnect, SessionStatRequest,
        SessionStatResponse,
    },
    opcode::{Opcode, STREAM_COUNT},
    rtt::RollingPing,
    seq::Seq,
    stats::Stats,
    status::ConnectionStatus,
    stream::ReliableStream,
};

/// Something a [`Connection`] wants the owning [`crate::manager::ConnectionManager`]
/// to surface to the application.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection moved from one status to another.
    StatusChanged {
        /// Status before the transition.
        from: ConnectionStatus,
        /// Status after the transition.
        to: ConnectionStatus,
    },
    /// An application payload was delivered, in the order submitted on its
    /// stream (reliable) or as received (unreliable).
    PacketRecv(Bytes),
    /// Something recoverable went wrong; the connection was not torn down.
    Error(String),
}

/// Per-peer protocol state machine.
pub struct Connection {
    options: Arc<ConnectionManagerOptions>,
    status: ConnectionStatus,

    connect_code: u32,
    encode_key: u32,
    max_packet_size: u32,
    crc_length: u8,
    encode_passes: [EncodePass; 2],
    is_initiator: bool,

    streams: [ReliableStream; STREAM_COUNT],
    fragments: [Option<Reassembler>; STREAM_COUNT],

    coalesce: CoalesceBuffer,
    budget: SendBudget,
    ping: RollingPing,
    stats: Stats,

    connecting_since: Instant,
    last_connect_attempt: Option<Instant>,
    last_send: Instant,
    last_recv: Instant,
    last_hold_flush: Instant,
    close_time: Option<Instant>,
    last_session_stats: Option<Instant>,

    ready_to_send: Vec<Bytes>,
}

impl Connection {
    /// Creates an outbound (client-initiated) connection, starting in
    /// `Connecting` and about to emit its first `SessionRequest`.
    #[must_use]
    pub fn connect(connect_code: u32, options: Arc<ConnectionManagerOptions>, now: Instant) -> Self {
        let mut conn = Self::new_inner(connect_code, 0, &options, true, now);
        conn.options = options;
        conn
    }

    /// Creates an inbound (server-accepted) connection from a peer's
    /// `SessionRequest`, starting in `Connected` Leaves the
    /// initial `SessionResponse` queued in [`Self::drain_ready_to_send`]
    /// for the caller (the manager) to actually put on the wire.
    #[must_use]
    pub fn accept(
        connect_code: u32,
        encode_key: u32,
        options: Arc<ConnectionManagerOptions>,
        now: Instant,
    ) -> Self {
        let mut conn = Self::new_inner(connect_code, encode_key, &options, false, now);
        conn.options = options;
        conn.status = ConnectionStatus::Connected;
        conn.send_session_response(now);
        conn
    }

    fn new_inner(
        connect_code: u32,
        encode_key: u32,
        options: &Arc<ConnectionManagerOptions>,
        is_initiator: bool,
        now: Instant,
    ) -> Self {
        Self {
            options: Arc::clone(options),
            status: ConnectionStatus::Connecting,
            connect_code,
            encode_key,
            max_packet_size: options.max_packet_size,
            crc_length: options.crc_length,
            encode_passes: options.encode_passes,
            is_initiator,
            streams: std::array::from_fn(|_| ReliableStream::new()),
            fragments: std::array::from_fn(|_| None),
            coalesce: CoalesceBuffer::new(),
            budget: SendBudget::new(options.outgoing_data_rate, options.outgoing_data_rate),
            ping: RollingPing::new(),
            stats: Stats::new(),
            connecting_since: now,
            last_connect_attempt: None,
            last_send: now,
            last_recv: now,
            last_hold_flush: now,
            close_time: None,
            last_session_stats: None,
            ready_to_send: Vec::new(),
        }
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Accumulated counters for this connection.
    #[must_use]
    pub fn get_stats(&self) -> &Stats {
        &self.stats
    }

    /// Zeroes every counter, keeping the connection itself intact.
    pub fn reset_stats(&mut self) {
        self.stats = Stats::new();
    }

    /// The session identifier chosen by the initiator.
    #[must_use]
    pub fn connect_code(&self) -> u32 {
        self.connect_code
    }

    fn transition(&mut self, to: ConnectionStatus, events: &mut Vec<ConnectionEvent>) {
        if self.status == to || !self.status.can_transition_to(to) {
            return;
        }
        let from = self.status;
        self.status = to;
        events.push(ConnectionEvent::StatusChanged { from, to });
    }

    /// Queues an application payload for delivery:
    /// `queue_packet(bytes, stream, reliable)`.
    ///
    /// `stream` selects one of the four independent reliable streams; it is
    /// ignored when `reliable` is `false`; out-of-range values wrap modulo
    /// [`STREAM_COUNT`].
    pub fn queue_packet(&mut self, data: &[u8], stream: u8, reliable: bool) {
        self.stats.bytes_before_encode += data.len() as u64;
        if !self.reliable_sends_allowed() {
            return;
        }
        if reliable {
            self.queue_reliable(data, stream % STREAM_COUNT as u8);
        } else {
            self.queue_unreliable(data);
        }
    }

    fn reliable_sends_allowed(&self) -> bool {
        matches!(
            self.status,
            ConnectionStatus::Connecting | ConnectionStatus::Connected
        )
    }

    fn queue_reliable(&mut self, data: &[u8], stream_idx: u8) {
        let header_len = ReliableHeader::LEN;
        // One extra byte of headroom: the Compression pass's marker byte
        // (`encode::with_marker`) always adds exactly one byte even when a
        // payload doesn't compress, so a frame sized to fit exactly at
        // `max_packet_size` pre-encode would overrun it post-encode.
        let max_body = (self.max_packet_size as usize)
            .saturating_sub(self.crc_length as usize)
            .saturating_sub(2 + header_len)
            .saturating_sub(1);
        let now = Instant::now();
        let delay = self.options.initial_resend_delay_ms(self.ping.estimate().as_secs_f64() * 1000.0);
        let stream = &mut self.streams[stream_idx as usize];

        if data.len() <= max_body {
            let seq = stream.peek_next_send();
            let frame = build_reliable_frame(Opcode::packet(stream_idx), seq.0, None, data);
            stream.send(frame.clone(), false, now, delay);
            self.queue_raw_frame(frame);
            return;
        }

        // Only the first fragment carries the 4-byte `total_size` prefix, so
        // only it loses that much body capacity; every later fragment uses
        // the full `max_body` the plain reliable header allows (mirrors the
        // original's `sublen` vs `max_raw_size` split).
        let first_fragment_body = max_body.saturating_sub(4).max(1);
        let pieces = fragment::split_first_fragment_smaller(data, first_fragment_body, max_body);
        for (i, piece) in pieces.iter().enumerate() {
            let total_size = if i == 0 { Some(data.len() as u32) } else { None };
            let seq = self.streams[stream_idx as usize].peek_next_send();
            let frame = build_reliable_frame(Opcode::fragment(stream_idx), seq.0, total_size, piece);
            self.streams[stream_idx as usize].send(frame.clone(), true, now, delay);
            self.queue_raw_frame(frame);
        }
    }

    fn queue_unreliable(&mut self, data: &[u8]) {
        let frame = if data.first() == Some(&0x00) {
            let mut w = BytesMut::with_capacity(data.len() + 2);
            w.put_u8(0x00);
            w.put_u8(Opcode::Padding.as_u8());
            w.put_slice(data);
            w.freeze()
        } else {
            Bytes::copy_from_slice(data)
        };
        self.queue_raw_frame(frame);
    }

    /// Sends `SessionDisconnect`, flushes, and transitions toward shutdown.
    /// Idempotent: calling this on an already-closing connection is a
    /// no-op (: "`close()` called twice has the same effect as
    /// once").
    pub fn close(&mut self) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        if matches!(
            self.status,
            ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected
        ) {
            return events;
        }
        let frame = SessionDisconnect {
            connect_code: self.connect_code,
        }
        .encode();
        self.queue_raw_frame(frame);
        self.flush_coalesce();
        self.close_time = Some(Instant::now());
        self.transition(ConnectionStatus::Disconnecting, &mut events);
        events
    }

    /// Whether [`Self::close_time`] plus `connection_close_time` has
    /// elapsed, meaning the manager should erase this connection.
    #[must_use]
    pub fn ready_to_erase(&self, now: Instant) -> bool {
        self.close_time.is_some_and(|t| {
            now.saturating_duration_since(t).as_millis()
                >= u128::from(self.options.connection_close_time)
        })
    }

    /// Handles one inbound datagram already routed to this connection by
    /// address. `raw` is exactly the UDP payload. Returns any datagrams a
    /// force-flush of the coalesce buffer produced (e.g. an immediate ack)
    /// alongside whatever events to surface — callers must send these, not
    /// just whatever [`Self::tick`] returns next, or a force-flushed
    /// datagram is silently dropped on the next tick (see
    /// [`Self::drain_ready_to_send`]).
    pub fn on_datagram(&mut self, raw: &[u8], now: Instant) -> (Vec<Bytes>, Vec<ConnectionEvent>) {
        let mut events = Vec::new();
        self.last_recv = now;
        self.stats.bytes_recv += raw.len() as u64;
        self.stats.packets_recv += 1;

        match self.decode_datagram(raw) {
            Ok(body) => self.dispatch(&body, now, &mut events),
            Err(err) => events.push(ConnectionEvent::Error(err.to_string())),
        }
        (self.drain_ready_to_send(), events)
    }

    /// Takes whatever wire-ready datagrams have accumulated since the last
    /// drain, leaving the accumulator empty. [`Self::tick`] and
    /// [`Self::on_datagram`] both funnel through this so nothing queued by
    /// one is lost if the caller only acts on the other's return value.
    pub fn drain_ready_to_send(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.ready_to_send)
    }

    fn decode_datagram(&self, raw: &[u8]) -> Result<Bytes, DecodeError> {
        if raw.first() == Some(&0x00)
            && matches!(
                raw.get(1).copied().and_then(Opcode::from_u8),
                Some(Opcode::SessionRequest | Opcode::SessionResponse)
            )
        {
            return Ok(Bytes::copy_from_slice(raw));
        }

        let crc_len = self.crc_length as usize;
        let (body, trailer) = if crc_len == 0 {
            (raw, &[][..])
        } else {
            if raw.len() < crc_len {
                return Err(FramingError::TooShort {
                    len: raw.len(),
                    need: crc_len,
                }
                .into());
            }
            raw.split_at(raw.len() - crc_len)
        };
        if !self.options.skip_crc_validation && !crc::verify(body, trailer, self.encode_key) {
            let computed = crc::checksum(body, self.encode_key);
            return Err(DecodeError::CrcMismatch {
                expected: crc_trailer_as_u32(trailer),
                computed,
            });
        }

        let mut decoded = Bytes::copy_from_slice(body);
        for pass in self.encode_passes.iter().rev() {
            decoded = encode::unapply(*pass, &decoded, self.encode_key)?;
        }
        Ok(decoded)
    }

    fn dispatch(&mut self, body: &[u8], now: Instant, events: &mut Vec<ConnectionEvent>) {
        let Some(&first) = body.first() else {
            return;
        };
        if first != 0x00 {
            events.push(ConnectionEvent::PacketRecv(Bytes::copy_from_slice(body)));
            self.stats.bytes_after_decode += body.len() as u64;
            return;
        }
        let Some(opcode_byte) = body.get(1).copied() else {
            events.push(ConnectionEvent::Error("truncated protocol frame".into()));
            return;
        };
        let Some(opcode) = Opcode::from_u8(opcode_byte) else {
            events.push(ConnectionEvent::Error(
                FramingError::UnknownOpcode(opcode_byte).to_string(),
            ));
            return;
        };
        let rest = &body[2..];

        if let Some(stream_idx) = opcode.packet_stream() {
            self.handle_packet(stream_idx, rest, false, now, events);
            return;
        }
        if let Some(stream_idx) = opcode.fragment_stream() {
            self.handle_packet(stream_idx, rest, true, now, events);
            return;
        }
        if let Some(stream_idx) = opcode.ack_stream() {
            if let Ok(ack) = AckHeader::decode(rest) {
                let samples = self.streams[stream_idx as usize].apply_ack(Seq(ack.sequence), now);
                self.sample_pings(&samples);
            }
            return;
        }
        if let Some(stream_idx) = opcode.out_of_order_ack_stream() {
            if let Ok(ack) = AckHeader::decode(rest) {
                if let Some(sample) =
                    self.streams[stream_idx as usize].apply_out_of_order_ack(Seq(ack.sequence), now)
                {
                    self.sample_pings(std::slice::from_ref(&sample));
                }
            }
            return;
        }

        match opcode {
            Opcode::Combined => match crate::frame::parse_combined(rest) {
                Ok(items) => {
                    for item in items {
                        self.dispatch(item, now, events);
                    }
                }
                Err(e) => events.push(ConnectionEvent::Error(e.to_string())),
            },
            Opcode::AppCombined => match crate::frame::parse_app_combined(rest) {
                Ok(items) => {
                    for item in items {
                        self.dispatch(item, now, events);
                    }
                }
                Err(e) => events.push(ConnectionEvent::Error(e.to_string())),
            },
            Opcode::SessionDisconnect => {
                self.transition(ConnectionStatus::Disconnecting, events);
                self.close_time = Some(now);
            }
            Opcode::SessionResponse => {
                if let Ok(resp) = crate::frame::SessionResponse::decode(rest) {
                    self.apply_session_response(&resp, events);
                }
            }
            Opcode::SessionRequest => {
                // A SessionRequest for an already-established session with
                // a matching connect_code is a retransmitted/duplicate
                // handshake (the peer's first reply never arrived) —
                // re-send SessionResponse idempotently rather than erroring.
                if self.status == ConnectionStatus::Connected {
                    if let Ok(req) = crate::frame::SessionRequest::decode(rest) {
                        if req.connect_code == self.connect_code {
                            self.send_session_response(now);
                        }
                    }
                }
            }
            Opcode::KeepAlive | Opcode::OutboundPing | Opcode::Padding => {
                if opcode == Opcode::Padding {
                    events.push(ConnectionEvent::PacketRecv(Bytes::copy_from_slice(rest)));
                }
            }
            Opcode::SessionStatRequest => {
                if let Ok(req) = SessionStatRequest::decode(rest) {
                    self.stats.sync_remote_sent_packets = req.packets_sent;
                    self.stats.sync_remote_recv_packets = req.packets_recv;
                    self.stats.sync_sent_packets = self.stats.packets_sent;
                    self.stats.sync_recv_packets = self.stats.packets_recv;
                    let response = SessionStatResponse {
                        timestamp: req.timestamp,
                        our_timestamp: now_millis(now),
                        client_sent: req.packets_sent,
                        client_recv: req.packets_recv,
                        server_sent: self.stats.packets_sent as u32,
                        server_recv: self.stats.packets_recv as u32,
                    };
                    self.queue_raw_frame(response.encode());
                }
            }
            Opcode::SessionStatResponse => {
                if let Ok(resp) = SessionStatResponse::decode(rest) {
                    self.stats.sync_remote_sent_packets = resp.server_sent;
                    self.stats.sync_remote_recv_packets = resp.server_recv;
                    self.stats.sync_sent_packets = self.stats.packets_sent;
                    self.stats.sync_recv_packets = self.stats.packets_recv;
                }
            }
            _ => {
                trace!(?opcode, "unhandled opcode in dispatch");
            }
        }
    }

    fn handle_packet(
        &mut self,
        stream_idx: u8,
        rest: &[u8],
        is_fragment: bool,
        now: Instant,
        events: &mut Vec<ConnectionEvent>,
    ) {
        let decode_result = if is_fragment {
            // Whether this is a "first" fragment is ambiguous until we know
            // the sequence's relation to any in-progress reassembly; try
            // decoding with a total_size prefix, since a fresh reassembly
            // (no reassembler yet for this stream) implies first == true.
            let first = self.fragments[stream_idx as usize].is_none();
            FragmentHeader::decode(rest, first).map(|(h, payload)| (h.sequence, payload, Some(h.total_size)))
        } else {
            ReliableHeader::decode(rest).map(|(h, payload)| (h.sequence, payload, None))
        };
        let Ok((sequence, payload, total_size)) = decode_result else {
            events.push(ConnectionEvent::Error("malformed reliable header".into()));
            return;
        };

        let stream = &mut self.streams[stream_idx as usize];
        let expected = stream.next_recv();
        let order = crate::seq::compare(expected, Seq(sequence));
        match order {
            crate::seq::Order::Future => {
                let ack = build_ack_frame(Opcode::out_of_order_ack(stream_idx), sequence);
                self.queue_raw_frame(ack);
                let tagged = tag_fragment_payload(is_fragment, total_size, payload);
                self.streams[stream_idx as usize].receive(Seq(sequence), tagged);
            }
            crate::seq::Order::Past => {
                let last = self.streams[stream_idx as usize].last_in_order();
                let ack = build_ack_frame(Opcode::ack(stream_idx), last.0);
                self.queue_raw_frame(ack);
            }
            crate::seq::Order::Current => {
                let tagged = tag_fragment_payload(is_fragment, total_size, payload);
                self.streams[stream_idx as usize].receive(Seq(sequence), tagged);
                let drained = self.streams[stream_idx as usize].drain_in_order();
                let ack_through = self.streams[stream_idx as usize].last_in_order();
                let ack = build_ack_frame(Opcode::ack(stream_idx), ack_through.0);
                self.queue_raw_frame(ack);
                for item in drained {
                    self.deliver_stream_payload(stream_idx, item, events);
                }
            }
        }
    }

    fn deliver_stream_payload(&mut self, stream_idx: u8, tagged: Bytes, events: &mut Vec<ConnectionEvent>) {
        let (is_fragment, total_size, payload) = untag_fragment_payload(&tagged);
        if !is_fragment {
            self.stats.bytes_after_decode += payload.len() as u64;
            events.push(ConnectionEvent::PacketRecv(Bytes::copy_from_slice(payload)));
            return;
        }

        let slot = &mut self.fragments[stream_idx as usize];
        if slot.is_none() {
            let Some(total) = total_size else {
                warn!("fragment without total_size and no reassembly in progress");
                return;
            };
            *slot = Some(Reassembler::new(total as usize));
        }
        let reassembler = slot.as_mut().expect("just initialized above");
        let offset = reassembler.received_bytes();
        match reassembler.write(offset, payload) {
            Ok(true) => {
                let reassembler = slot.take().expect("checked Some above");
                let message = reassembler.finish();
                self.stats.bytes_after_decode += message.len() as u64;
                events.push(ConnectionEvent::PacketRecv(message));
            }
            Ok(false) => {}
            Err(e) => {
                *slot = None;
                events.push(ConnectionEvent::Error(e.to_string()));
            }
        }
    }

    fn sample_pings(&mut self, samples: &[std::time::Duration]) {
        for sample in samples {
            self.ping.update(*sample);
        }
        if !samples.is_empty() {
            self.stats.ping = crate::stats::PingStats {
                min_ms: self.ping.min().map(|d| d.as_secs_f64() * 1000.0),
                max_ms: self.ping.max().map(|d| d.as_secs_f64() * 1000.0),
                last_ms: Some(self.ping.last().as_secs_f64() * 1000.0),
                avg_ms: Some(self.ping.estimate().as_secs_f64() * 1000.0),
            };
        }
    }

    fn queue_raw_frame(&mut self, frame: Bytes) {
        match self
            .coalesce
            .push(frame, self.max_packet_size as usize, self.options.hold_size)
        {
            PushResult::Queued => {}
            PushResult::TooLargeToCombine(item) => self.emit_wire_datagram(item),
            PushResult::FlushedThenQueued(flushed, _) => {
                for item in flushed {
                    self.emit_wire_datagram(item);
                }
            }
        }
    }

    fn flush_coalesce(&mut self) {
        for item in self.coalesce.take() {
            self.emit_wire_datagram(item);
        }
        self.last_hold_flush = Instant::now();
    }

    fn emit_wire_datagram(&mut self, raw: Bytes) {
        let mut encoded = raw;
        let skip_encode = matches!(encoded.first(), Some(0x00))
            && matches!(
                encoded.get(1).copied().and_then(Opcode::from_u8),
                Some(Opcode::SessionRequest | Opcode::SessionResponse)
            );
        if !skip_encode {
            for pass in &self.encode_passes {
                encoded = encode::apply(*pass, &encoded, self.encode_key);
            }
            if self.crc_length > 0 {
                let crc_val = crc::checksum(&encoded, self.encode_key);
                let trailer = crc::truncate(crc_val, self.crc_length);
                let mut with_crc = BytesMut::with_capacity(encoded.len() + trailer.len());
                with_crc.put_slice(&encoded);
                with_crc.put_slice(&trailer);
                encoded = with_crc.freeze();
            }
        }
        if encoded.len() as u32 > self.max_packet_size {
            warn!(len = encoded.len(), "dropping oversized wire datagram");
            return;
        }
        if self.options.outgoing_data_rate > 0.0 && !self.budget.can_afford(encoded.len()) {
            self.stats.dropped_by_budget += 1;
            return;
        }
        if self.options.outgoing_data_rate > 0.0 {
            self.budget.spend(encoded.len());
        }
        self.stats.bytes_sent += encoded.len() as u64;
        self.stats.packets_sent += 1;
        self.last_send = Instant::now();
        self.ready_to_send.push(encoded);
    }

    /// Runs one tick's worth of housekeeping: budget replenishment, resend
    /// scanning, coalesce flush, keep-alive emission and staleness checks.
    /// Returns wire-ready datagrams to actually send and any events to
    /// surface.
    pub fn tick(&mut self, now: Instant, tick_interval: std::time::Duration) -> (Vec<Bytes>, Vec<ConnectionEvent>) {
        let mut events = Vec::new();

        self.budget.replenish(tick_interval);
        self.check_staleness(now, &mut events);
        if matches!(self.status, ConnectionStatus::Disconnected) {
            return (self.drain_ready_to_send(), events);
        }

        self.maybe_resend_connect(now);
        self.run_resend_scan(now, &mut events);

        if now.saturating_duration_since(self.last_hold_flush).as_millis()
            >= u128::from(self.options.hold_length_ms)
            && !self.coalesce.is_empty()
        {
            self.flush_coalesce();
        }

        self.maybe_keepalive(now);

        if self.ready_to_erase(now) {
            self.transition(ConnectionStatus::Disconnected, &mut events);
        }

        (self.drain_ready_to_send(), events)
    }

    fn maybe_resend_connect(&mut self, now: Instant) {
        if !self.is_initiator || self.status != ConnectionStatus::Connecting {
            return;
        }
        let due = self.last_connect_attempt.is_none_or(|last| {
            now.saturating_duration_since(last).as_millis() >= u128::from(self.options.connect_delay_ms)
        });
        if due {
            let frame = crate::frame::SessionRequest {
                protocol_version: self.options.protocol_version,
                connect_code: self.connect_code,
                max_packet_size: self.max_packet_size,
            }
            .encode();
            self.ready_to_send.push(frame);
            self.last_connect_attempt = Some(now);
        }
    }

    fn check_staleness(&mut self, now: Instant, events: &mut Vec<ConnectionEvent>) {
        match self.status {
            ConnectionStatus::Connecting => {
                if now.saturating_duration_since(self.connecting_since).as_millis()
                    >= u128::from(self.options.connect_stale_ms)
                {
                    self.transition(ConnectionStatus::Disconnecting, events);
                    self.close_time = Some(now);
                }
            }
            ConnectionStatus::Connected => {
                if now.saturating_duration_since(self.last_recv).as_millis()
                    >= u128::from(self.options.stale_connection_ms)
                {
                    self.transition(ConnectionStatus::Disconnecting, events);
                    self.close_time = Some(now);
                }
            }
            _ => {}
        }
    }

    fn run_resend_scan(&mut self, now: Instant, events: &mut Vec<ConnectionEvent>) {
        let mut budget_packets = self.options.resend_window.max_packets;
        let mut budget_bytes = self.options.resend_window.max_bytes;

        for stream in &mut self.streams {
            if let Some(oldest) = stream.oldest_first_sent() {
                if now.saturating_duration_since(oldest).as_millis()
                    >= u128::from(self.options.resend_timeout)
                {
                    events.push(ConnectionEvent::Error(
                        "resend timeout exceeded, closing connection".into(),
                    ));
                    self.transition(ConnectionStatus::Disconnecting, events);
                    self.close_time = Some(now);
                    return;
                }
            }
            if !stream.resend_scan_needed(now) {
                continue;
            }
            let due = stream.due_for_resend(
                now,
                self.options.resend_delay_max,
                &mut budget_packets,
                &mut budget_bytes,
            );
            for (_, datagram, is_fragment) in due {
                if is_fragment {
                    self.stats.resent_fragments += 1;
                } else {
                    self.stats.resent_full += 1;
                }
                // Budget is enforced uniformly at the point each datagram
                // actually reaches the wire (`emit_wire_datagram`), post
                // coalescing and encoding, not here against the raw frame.
                self.queue_raw_frame(datagram);
            }
        }
    }

    fn maybe_keepalive(&mut self, now: Instant) {
        if self.options.keepalive_delay_ms == 0 || self.status != ConnectionStatus::Connected {
            return;
        }
        if now.saturating_duration_since(self.last_send).as_millis()
            >= u128::from(self.options.keepalive_delay_ms)
        {
            let mut w = BytesMut::with_capacity(2);
            w.put_u8(0x00);
            w.put_u8(Opcode::KeepAlive.as_u8());
            self.queue_raw_frame(w.freeze());
        }
    }

    /// Applies a `SessionResponse` to a still-`Connecting` outbound
    /// connection, transitioning it to `Connected`.
    pub fn apply_session_response(
        &mut self,
        resp: &crate::frame::SessionResponse,
        events: &mut Vec<ConnectionEvent>,
    ) {
        if self.status != ConnectionStatus::Connecting || resp.connect_code != self.connect_code {
            debug!("ignoring unmatched or late SessionResponse");
            return;
        }
        self.encode_key = resp.encode_key;
        self.crc_length = resp.crc_bytes;
        self.encode_passes = [
            EncodePass::from_u8(resp.encode_pass1),
            EncodePass::from_u8(resp.encode_pass2),
        ];
        self.max_packet_size = resp.max_packet_size;
        self.transition(ConnectionStatus::Connected, events);
    }

    /// Emits `SessionResponse` directly (bypassing coalescing, like
    /// `SessionRequest`'s own emission in [`Self::maybe_resend_connect`]) —
    /// used both for the initial handshake reply and for an idempotent
    /// re-reply to a duplicate `SessionRequest`.
    fn send_session_response(&mut self, now: Instant) {
        let resp = crate::frame::SessionResponse {
            connect_code: self.connect_code,
            encode_key: self.encode_key,
            crc_bytes: self.crc_length,
            encode_pass1: self.encode_passes[0].as_u8(),
            encode_pass2: self.encode_passes[1].as_u8(),
            max_packet_size: self.max_packet_size,
        };
        self.ready_to_send.push(resp.encode());
        self.last_send = now;
    }
}

fn build_reliable_frame(opcode: Opcode, sequence: u16, total_size: Option<u32>, payload: &[u8]) -> Bytes {
    let mut w = BytesMut::with_capacity(2 + 2 + 4 + payload.len());
    w.put_u8(0x00);
    w.put_u8(opcode.as_u8());
    w.put_u16(sequence);
    if let Some(total) = total_size {
        w.put_u32(total);
    }
    w.put_slice(payload);
    w.freeze()
}

fn build_ack_frame(opcode: Opcode, sequence: u16) -> Bytes {
    let mut w = BytesMut::with_capacity(4);
    w.put_u8(0x00);
    w.put_u8(opcode.as_u8());
    w.put_u16(sequence);
    w.freeze()
}

fn crc_trailer_as_u32(trailer: &[u8]) -> u32 {
    match trailer.len() {
        2 => u32::from(u16::from_be_bytes([trailer[0], trailer[1]])),
        4 => u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]),
        _ => 0,
    }
}

fn now_millis(now: Instant) -> u64 {
    // `Instant` has no epoch; approximate with elapsed-since-process-start,
    // which is sufficient since this value is only ever an opaque echoed
    // timestamp between peers running this crate.
    now.elapsed().as_millis() as u64
}

/// Prefixes a stream-delivered payload with one byte marking whether it is
/// a fragment piece, and (for fragments) the `total_size` if this is the
/// first piece of a message. This lets `drain_in_order` hand back
/// self-describing buffers without a side channel.
fn tag_fragment_payload(is_fragment: bool, total_size: Option<u32>, payload: &[u8]) -> Bytes {
    let mut w = BytesMut::with_capacity(payload.len() + 5);
    if is_fragment {
        if let Some(total) = total_size {
            w.put_u8(1);
            w.put_u32(total);
        } else {
            w.put_u8(2);
        }
    } else {
        w.put_u8(0);
    }
    w.put_slice(payload);
    w.freeze()
}

fn untag_fragment_payload(tagged: &Bytes) -> (bool, Option<u32>, &[u8]) {
    match tagged[0] {
        0 => (false, None, &tagged[1..]),
        1 => {
            let total = u32::from_be_bytes([tagged[1], tagged[2], tagged[3], tagged[4]]);
            (true, Some(total), &tagged[5..])
        }
        _ => (true, None, &tagged[1..]),
    }
}
