//! Tunable knobs for a [`crate::manager::ConnectionManager`],
//! with defaults matching the legacy client/server's compiled-in values.
//!
//! Field names follow the legacy public API rather than a restructured,
//! Rust-ier shape, so a reader porting tuning values from the legacy config
//! files can match them one-to-one.

use crate::encode::EncodePass;

/// Per-scan caps on how much resend work one connection will do, to keep a
/// single busy peer from starving every other connection on the manager's
/// tick (its `MAX_CLIENT_RECV_PACKETS_PER_WINDOW` /
/// `MAX_CLIENT_RECV_BYTES_PER_WINDOW`).
#[derive(Debug, Clone, Copy)]
pub struct ResendWindow {
    /// Maximum datagrams resent in a single scan.
    pub max_packets: u32,
    /// Maximum bytes resent in a single scan.
    pub max_bytes: u32,
}

impl Default for ResendWindow {
    fn default() -> Self {
        Self {
            max_packets: 300,
            max_bytes: 140 * 1024,
        }
    }
}

/// All tunables for a [`crate::manager::ConnectionManager`] and the
/// connections it owns.
#[derive(Debug, Clone)]
pub struct ConnectionManagerOptions {
    /// UDP port the manager binds, `0.0.0.0:port` with address reuse.
    pub port: u16,
    /// Protocol version carried in `SessionRequest`, checked by the peer
    /// before it will reply with `SessionResponse`. Bump when the wire
    /// format changes incompatibly.
    pub protocol_version: u32,
    /// Largest datagram either side will send or receive.
    pub max_packet_size: u32,
    /// CRC trailer width negotiated in `SessionResponse`: 0, 2 or 4.
    pub crc_length: u8,
    /// The two ordered encode passes, applied `[0]` then `[1]` on send,
    /// unwound `[1]` then `[0]` on receive.
    pub encode_passes: [EncodePass; 2],

    /// Tick frequency driving resend scans, budget replenishment, coalesce
    /// flush and keep-alive checks. Default 100 Hz.
    pub tic_rate_hertz: u32,

    /// Coalesce buffer's periodic flush interval.
    pub hold_length_ms: u32,
    /// Coalesce buffer's maximum held sub-packet count before a forced
    /// flush (its third force-flush condition).
    pub hold_size: usize,

    /// Base term added to `rolling_ping * resend_delay_factor` when a
    /// newly-sent packet's initial resend delay is computed.
    pub resend_delay_ms: u32,
    /// Multiplier applied to the rolling ping estimate in the same
    /// formula.
    pub resend_delay_factor: f64,
    /// Lower clamp for a packet's resend delay.
    pub resend_delay_min: u32,
    /// Upper clamp for a packet's resend delay, also the ceiling each
    /// doubling saturates at.
    pub resend_delay_max: u32,
    /// How long since `first_sent` an unacked packet can go before the
    /// whole connection is closed.
    pub resend_timeout: u32,
    /// Per-scan resend caps, see [`ResendWindow`].
    pub resend_window: ResendWindow,

    /// How often an outbound `connect()` re-emits `SessionRequest` while
    /// awaiting `SessionResponse`.
    pub connect_delay_ms: u32,
    /// How long `Connecting` can persist before giving up.
    pub connect_stale_ms: u32,
    /// How long `Connected` can go without receiving any traffic before
    /// being considered stale.
    pub stale_connection_ms: u32,

    /// How long since the last send before an automatic `KeepAlive` is
    /// emitted. `0` disables keep-alives.
    pub keepalive_delay_ms: u32,
    /// Grace period a connection spends in `Disconnecting` before the
    /// manager erases it.
    pub connection_close_time: u32,

    /// Kilobytes per second this side will spend sending to one peer.
    /// `0.0` disables budgeting entirely (unbounded sends).
    pub outgoing_data_rate: f64,

    /// Percent chance, 0.0-100.0, of dropping an inbound datagram before
    /// it reaches decoding. Test-only; defaults to 0.
    pub simulated_in_packet_loss: f64,
    /// Percent chance, 0.0-100.0, of dropping an outbound datagram before
    /// it reaches the socket. Test-only; defaults to 0.
    pub simulated_out_packet_loss: f64,

    /// Accept every datagram's CRC unconditionally (still computed and
    /// appended on send). Test-only escape hatch.
    pub skip_crc_validation: bool,

    /// Socket receive buffer size requested via `SO_RCVBUF`
    /// (`SO_RCVBUFFORCE` tried first, falling back on `EPERM`),
    pub socket_recv_buffer_bytes: usize,
}

impl Default for ConnectionManagerOptions {
    fn default() -> Self {
        Self {
            port: 0,
            protocol_version: 3,
            max_packet_size: 512,
            crc_length: 2,
            encode_passes: [EncodePass::Compression, EncodePass::Xor],

            tic_rate_hertz: 100,

            hold_length_ms: 10,
            hold_size: 10,

            resend_delay_ms: 300,
            resend_delay_factor: 1.0,
            resend_delay_min: 300,
            resend_delay_max: 5_000,
            resend_timeout: 15_000,
            resend_window: ResendWindow::default(),

            connect_delay_ms: 500,
            connect_stale_ms: 5_000,
            stale_connection_ms: 30_000,

            keepalive_delay_ms: 9_000,
            connection_close_time: 3_000,

            outgoing_data_rate: 0.0,

            simulated_in_packet_loss: 0.0,
            simulated_out_packet_loss: 0.0,

            skip_crc_validation: false,

            socket_recv_buffer_bytes: 512 * 1024,
        }
    }
}

impl ConnectionManagerOptions {
    /// Computes a newly-sent packet's initial resend delay from the
    /// connection's current rolling ping estimate.
    #[must_use]
    pub fn initial_resend_delay_ms(&self, rolling_ping_ms: f64) -> u32 {
        let computed = rolling_ping_ms * self.resend_delay_factor + f64::from(self.resend_delay_ms);
        (computed as u32).clamp(self.resend_delay_min, self.resend_delay_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_legacy_constants() {
        let opts = ConnectionManagerOptions::default();
        assert_eq!(opts.resend_window.max_packets, 300);
        assert_eq!(opts.resend_window.max_bytes, 140 * 1024);
        assert_eq!(opts.crc_length, 2);
    }

    #[test]
    fn initial_resend_delay_is_clamped() {
        let opts = ConnectionManagerOptions {
            resend_delay_factor: 2.0,
            resend_delay_ms: 0,
            resend_delay_min: 50,
            resend_delay_max: 1_000,
            ..ConnectionManagerOptions::default()
        };
        assert_eq!(opts.initial_resend_delay_ms(10.0), 50);
        assert_eq!(opts.initial_resend_delay_ms(300.0), 600);
        assert_eq!(opts.initial_resend_delay_ms(10_000.0), 1_000);
    }
}
