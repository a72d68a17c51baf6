use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_duplicate: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub decode_errors: u64,
    pub rtt_ms: f32,
    pub rtt_variance_ms: f32,
    pub in_flight: usize,
}

impl NetworkStats {
    /// `packets_lost / max(1, packets_sent)`
    pub fn packet_loss_rate(&self) -> f32 {
        self.packets_lost as f32 / self.packets_sent.max(1) as f32
    }
}

/// Registry-level counters, mostly for datagrams that never reach a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub datagrams_dropped: u64,
    pub decode_errors: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connections_removed: u64,
}
