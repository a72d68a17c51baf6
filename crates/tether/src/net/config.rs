use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Upper bound on how long a `Disconnect` waits for its acknowledgment.
    pub disconnect_grace: Duration,
    /// Floor for the RTT-derived retransmission timeout.
    pub min_retry_timeout: Duration,
    /// Ceiling for the backed-off timeout. An RTT estimate above it still wins.
    pub max_retry_timeout: Duration,
    /// Retransmissions before a reliable packet is given up on. The `Connect`
    /// handshake is exempt and is bounded by `connect_timeout` instead.
    pub max_retries: u32,
    pub max_in_flight: usize,
    pub max_consecutive_failures: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            disconnect_grace: Duration::from_secs(1),
            min_retry_timeout: Duration::from_millis(100),
            max_retry_timeout: Duration::from_secs(3),
            max_retries: 10,
            max_in_flight: 1024,
            max_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_connections: usize,
    /// How long a disconnected or failed connection lingers before removal,
    /// so late acknowledgments can still be answered.
    pub removal_grace: Duration,
    pub connection: ConnectionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 32,
            removal_grace: Duration::from_secs(1),
            connection: ConnectionConfig::default(),
        }
    }
}
