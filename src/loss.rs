//! Simulated packet loss for testing (`simulated_in_packet_loss`/
//! `simulated_out_packet_loss`).
//!
//! Uses `rand`/`rand_distr` to randomly drop messages, exercising
//! retransmission and reassembly paths under adverse conditions. Daybreak's
//! own knobs are a bare percent-chance drop with no delay distribution, so
//! this module only implements the drop half of that style of conditioner.

use rand::Rng;

/// Per-connection (or per-manager, shared) uniform drop simulator.
///
/// Percentages are clamped to `0.0..=100.0` on construction so a
/// misconfigured value can never be interpreted as "always keep" or
/// silently panic a distribution constructor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketLoss {
    in_percent: f64,
    out_percent: f64,
}

impl PacketLoss {
    /// Builds a conditioner from its two percent knobs.
    #[must_use]
    pub fn new(in_percent: f64, out_percent: f64) -> Self {
        Self {
            in_percent: in_percent.clamp(0.0, 100.0),
            out_percent: out_percent.clamp(0.0, 100.0),
        }
    }

    /// Whether an inbound datagram should be dropped before it reaches
    /// decoding, rolled fresh for every call.
    #[must_use]
    pub fn should_drop_inbound(self) -> bool {
        Self::roll(self.in_percent)
    }

    /// Whether an outbound datagram should be dropped before it reaches
    /// the socket, rolled fresh for every call.
    #[must_use]
    pub fn should_drop_outbound(self) -> bool {
        Self::roll(self.out_percent)
    }

    fn roll(percent: f64) -> bool {
        if percent <= 0.0 {
            return false;
        }
        if percent >= 100.0 {
            return true;
        }
        rand::thread_rng().gen_bool(percent / 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_percent_never_drops() {
        let loss = PacketLoss::new(0.0, 0.0);
        for _ in 0..1000 {
            assert!(!loss.should_drop_inbound());
            assert!(!loss.should_drop_outbound());
        }
    }

    #[test]
    fn hundred_percent_always_drops() {
        let loss = PacketLoss::new(100.0, 100.0);
        for _ in 0..1000 {
            assert!(loss.should_drop_inbound());
            assert!(loss.should_drop_outbound());
        }
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let loss = PacketLoss::new(-5.0, 250.0);
        assert!(!loss.should_drop_inbound());
        assert!(loss.should_drop_outbound());
    }

    #[test]
    fn directions_are_independent() {
        let loss = PacketLoss::new(100.0, 0.0);
        assert!(loss.should_drop_inbound());
        assert!(!loss.should_drop_outbound());
    }
}
