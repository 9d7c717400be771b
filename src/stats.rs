//! Per-connection counters, plus the remote-side sync fields exchanged via
//! `SessionStatRequest`/`SessionStatResponse`.

/// Rolling min/max/last/avg view over the connection's ping samples,
/// mirroring [`crate::rtt::RollingPing`] but exposed as plain numbers for
/// callers that just want to report status.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingStats {
    /// Smallest observed round trip, in milliseconds.
    pub min_ms: Option<f64>,
    /// Largest observed round trip, in milliseconds.
    pub max_ms: Option<f64>,
    /// Most recent round trip, in milliseconds.
    pub last_ms: Option<f64>,
    /// Current smoothed estimate, in milliseconds.
    pub avg_ms: Option<f64>,
}

/// Accumulated counters for one connection's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Application bytes handed to [`crate::connection::Connection`] to
    /// send, before fragmentation, coalescing or encoding.
    pub bytes_before_encode: u64,
    /// Wire bytes actually sent, after encoding and CRC trailers.
    pub bytes_sent: u64,
    /// Wire bytes received, before decoding.
    pub bytes_recv: u64,
    /// Application bytes delivered to the caller, after decoding and
    /// reassembly.
    pub bytes_after_decode: u64,

    /// Datagrams sent, including resends and coalesced sub-packets.
    pub packets_sent: u64,
    /// Datagrams received, including coalesced sub-packets.
    pub packets_recv: u64,

    /// Whole (unfragmented) reliable packets retransmitted.
    pub resent_full: u64,
    /// Fragment pieces retransmitted.
    pub resent_fragments: u64,

    /// Outbound datagrams dropped because [`crate::budget::SendBudget`]
    /// could not afford them this tick.
    pub dropped_by_budget: u64,

    /// The peer's last-reported `sent`/`recv` counters from a
    /// `SessionStatRequest`/`SessionStatResponse` exchange, and our own
    /// counters at the moment of that exchange,
    pub sync_remote_sent_packets: u32,
    /// See [`Self::sync_remote_sent_packets`].
    pub sync_remote_recv_packets: u32,
    /// Our own `packets_sent` at the time of the last stat sync.
    pub sync_sent_packets: u64,
    /// Our own `packets_recv` at the time of the last stat sync.
    pub sync_recv_packets: u64,

    /// Rolling ping view, updated from [`crate::rtt::RollingPing`].
    pub ping: PingStats,
}

impl Stats {
    /// Creates a zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_zero() {
        let stats = Stats::new();
        assert_eq!(stats.bytes_sent, 0);
        assert_eq!(stats.resent_full, 0);
        assert!(stats.ping.avg_ms.is_none());
    }
}
