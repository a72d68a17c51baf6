use std::time::Duration;

use super::protocol::{sequence_greater_than, ACK_WINDOW};

const RTT_ALPHA: f32 = 0.1;
const RTT_VARIANCE_FACTOR: f32 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Newest sequence seen so far; the window slid forward.
    Newer,
    /// Older than the newest but inside the window and not seen before.
    OutOfOrder,
    Duplicate,
    /// Too far behind the newest sequence to be tracked.
    Stale,
}

impl ReceiveOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, ReceiveOutcome::Newer | ReceiveOutcome::OutOfOrder)
    }
}

/// Remote sequence bookkeeping. The newest sequence plus the 32-bit window
/// behind it double as the set of recently received sequences used for
/// duplicate rejection.
#[derive(Debug, Default)]
pub struct ReceiveTracker {
    last_received: u16,
    received_bitfield: u32,
    has_received: bool,
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&mut self, sequence: u16) -> ReceiveOutcome {
        if !self.has_received {
            self.has_received = true;
            self.last_received = sequence;
            self.received_bitfield = 0;
            return ReceiveOutcome::Newer;
        }

        if sequence_greater_than(sequence, self.last_received) {
            let gap = u32::from(sequence.wrapping_sub(self.last_received));
            self.received_bitfield = if gap <= u32::from(ACK_WINDOW) {
                self.received_bitfield.checked_shl(gap).unwrap_or(0) | (1 << (gap - 1))
            } else {
                0
            };
            self.last_received = sequence;
            return ReceiveOutcome::Newer;
        }

        let distance = self.last_received.wrapping_sub(sequence);
        if distance == 0 {
            return ReceiveOutcome::Duplicate;
        }
        if distance > ACK_WINDOW {
            return ReceiveOutcome::Stale;
        }

        let bit = 1u32 << (distance - 1);
        if self.received_bitfield & bit != 0 {
            return ReceiveOutcome::Duplicate;
        }
        self.received_bitfield |= bit;
        ReceiveOutcome::OutOfOrder
    }

    pub fn has_received(&self) -> bool {
        self.has_received
    }

    pub fn ack_data(&self) -> (u16, u32) {
        (self.last_received, self.received_bitfield)
    }
}

/// Smoothed round-trip estimate in milliseconds.
#[derive(Debug, Default, Clone)]
pub struct RttEstimator {
    srtt: f32,
    rtt_var: f32,
    samples: u64,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sample_ms: f32) {
        if self.samples == 0 {
            self.srtt = sample_ms;
            self.rtt_var = sample_ms / 2.0;
        } else {
            let diff = (sample_ms - self.srtt).abs();
            self.rtt_var += RTT_ALPHA * (diff - self.rtt_var);
            self.srtt += RTT_ALPHA * (sample_ms - self.srtt);
        }
        self.samples += 1;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// `max(floor, srtt + 4 * rtt_var)`; just the floor until the first sample.
    pub fn retry_timeout(&self, floor: Duration) -> Duration {
        let estimate_ms = self.srtt + RTT_VARIANCE_FACTOR * self.rtt_var;
        let estimate = Duration::from_secs_f32(estimate_ms.max(0.0) / 1000.0);
        estimate.max(floor)
    }
}
