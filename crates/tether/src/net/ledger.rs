use std::collections::HashMap;
use std::time::Duration;

use super::config::ConnectionConfig;
use super::protocol::{Packet, PacketFlags, PacketType};
use super::tracking::{ReceiveOutcome, ReceiveTracker, RttEstimator};

const INITIAL_SEQUENCE: u16 = 1;
/// The retry timeout doubles per expired sweep up to 2^6 times the estimate.
const MAX_BACKOFF_SHIFT: u32 = 6;

#[derive(Debug, Clone)]
pub struct InFlightPacket {
    pub packet: Packet,
    pub send_time: Duration,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundDecision {
    Deliver,
    AckOnly,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundResult {
    pub decision: InboundDecision,
    /// Local reliable sequences this packet acknowledged for the first time.
    pub acked: Vec<u16>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetrySweep {
    /// Re-stamped copies to put back on the wire, oldest first.
    pub resend: Vec<Packet>,
    /// Sequences that exhausted their retries and were given up on.
    pub failed: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("in-flight table is full ({0} unacknowledged reliable packets)")]
pub struct LedgerFull(pub usize);

/// Per-connection sequence, acknowledgment and retransmission state.
#[derive(Debug)]
pub struct ReliabilityLedger {
    local_sequence: u16,
    receive_tracker: ReceiveTracker,
    in_flight: HashMap<u16, InFlightPacket>,
    rtt: RttEstimator,
    max_in_flight: usize,
    max_retries: u32,
    min_retry_timeout: Duration,
    max_retry_timeout: Duration,
    backoff_shift: u32,
}

impl ReliabilityLedger {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            local_sequence: INITIAL_SEQUENCE,
            receive_tracker: ReceiveTracker::new(),
            in_flight: HashMap::new(),
            rtt: RttEstimator::new(),
            max_in_flight: config.max_in_flight,
            max_retries: config.max_retries,
            min_retry_timeout: config.min_retry_timeout,
            max_retry_timeout: config.max_retry_timeout,
            backoff_shift: 0,
        }
    }

    pub fn local_sequence(&self) -> u16 {
        self.local_sequence
    }

    pub fn remote_sequence(&self) -> u16 {
        self.receive_tracker.ack_data().0
    }

    pub fn ack_data(&self) -> (u16, u32) {
        self.receive_tracker.ack_data()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, sequence: u16) -> bool {
        self.in_flight.contains_key(&sequence)
    }

    pub fn in_flight(&self, sequence: u16) -> Option<&InFlightPacket> {
        self.in_flight.get(&sequence)
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Current retransmission timeout: the RTT estimate doubled once per
    /// sweep that has expired something since the last clean sample, capped
    /// at `max_retry_timeout` unless the estimate itself is larger.
    pub fn retry_timeout(&self) -> Duration {
        let base = self.rtt.retry_timeout(self.min_retry_timeout);
        let backed_off = base.saturating_mul(1 << self.backoff_shift);
        backed_off.min(self.max_retry_timeout.max(base))
    }

    pub fn backoff_shift(&self) -> u32 {
        self.backoff_shift
    }

    pub fn prepare_outbound(
        &mut self,
        packet_type: PacketType,
        flags: PacketFlags,
        payload: Vec<u8>,
        now: Duration,
    ) -> Result<Packet, LedgerFull> {
        let reliable = flags.contains(PacketFlags::RELIABLE);
        if reliable && self.in_flight.len() >= self.max_in_flight {
            return Err(LedgerFull(self.max_in_flight));
        }

        let mut packet = Packet::new(packet_type, flags, payload);
        packet.sequence = self.local_sequence;
        self.local_sequence = self.local_sequence.wrapping_add(1);
        self.stamp(&mut packet, now);

        if reliable {
            self.in_flight.insert(
                packet.sequence,
                InFlightPacket {
                    packet: packet.clone(),
                    send_time: now,
                    retry_count: 0,
                },
            );
        }

        Ok(packet)
    }

    pub fn process_inbound(&mut self, packet: &Packet, now: Duration) -> InboundResult {
        let outcome = self.receive_tracker.record_received(packet.sequence);
        if !outcome.is_accepted() {
            log::debug!(
                "dropping {:?} packet {} ({:?})",
                packet.packet_type,
                packet.sequence,
                outcome
            );
            return InboundResult {
                decision: InboundDecision::Drop,
                acked: Vec::new(),
            };
        }
        if outcome == ReceiveOutcome::OutOfOrder {
            log::debug!("accepted out-of-order packet {}", packet.sequence);
        }

        let mut acked = Vec::new();
        for sequence in packet.acknowledged() {
            let Some(entry) = self.in_flight.remove(&sequence) else {
                continue;
            };
            // A retransmitted entry's send time no longer matches the copy
            // being acknowledged, so it yields no sample. The backoff keeps
            // growing until a packet makes it through on its first copy.
            if entry.retry_count == 0 {
                let sample = now.saturating_sub(entry.send_time).as_secs_f32() * 1000.0;
                self.rtt.update(sample);
                self.backoff_shift = 0;
            }
            acked.push(sequence);
        }

        let decision = match packet.packet_type {
            PacketType::Ack | PacketType::Heartbeat => InboundDecision::AckOnly,
            _ => InboundDecision::Deliver,
        };

        InboundResult { decision, acked }
    }

    pub fn collect_retransmits(&mut self, now: Duration) -> RetrySweep {
        let timeout = self.retry_timeout();

        let mut expired: Vec<u16> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.send_time) >= timeout)
            .map(|(&sequence, _)| sequence)
            .collect();
        // Oldest first: larger distance behind the next local sequence.
        let next = self.local_sequence;
        expired.sort_by_key(|&sequence| std::cmp::Reverse(next.wrapping_sub(sequence)));

        let (ack, ack_bits) = self.receive_tracker.ack_data();
        let mut sweep = RetrySweep::default();

        for sequence in expired {
            let Some(entry) = self.in_flight.get_mut(&sequence) else {
                continue;
            };

            // The handshake keeps retrying until the connect timeout.
            if entry.retry_count >= self.max_retries
                && entry.packet.packet_type != PacketType::Connect
            {
                self.in_flight.remove(&sequence);
                sweep.failed.push(sequence);
                continue;
            }

            entry.retry_count += 1;
            entry.send_time = now;
            entry.packet.ack = ack;
            entry.packet.ack_bits = ack_bits;
            entry.packet.timestamp = timestamp_ms(now);
            sweep.resend.push(entry.packet.clone());
        }

        if !sweep.resend.is_empty() && self.backoff_shift < MAX_BACKOFF_SHIFT {
            self.backoff_shift += 1;
            log::trace!("retry timeout backed off to {:?}", self.retry_timeout());
        }

        sweep
    }

    fn stamp(&self, packet: &mut Packet, now: Duration) {
        let (ack, ack_bits) = self.receive_tracker.ack_data();
        packet.ack = ack;
        packet.ack_bits = ack_bits;
        packet.timestamp = timestamp_ms(now);
    }
}

/// Milliseconds on the wire wrap every ~49 days; only deltas are meaningful.
fn timestamp_ms(now: Duration) -> u32 {
    now.as_millis() as u32
}
