use std::net::SocketAddr;
use std::time::Duration;

use tether::net::{ConnectionConfig, EngineConfig, PacketLossSimulation};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub tick_rate: u32,
    pub max_connections: usize,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    /// Peer to connect to. `None` runs the node as a listening echo server.
    pub connect: Option<SocketAddr>,
    pub send_interval: Duration,
    pub message_count: u32,
    pub packet_loss: Option<PacketLossSimulation>,
    pub seed: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            max_connections: 32,
            heartbeat_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10),
            connect: None,
            send_interval: Duration::from_millis(100),
            message_count: 10,
            packet_loss: None,
            seed: 0,
        }
    }
}

impl NodeConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_connections: self.max_connections,
            connection: ConnectionConfig {
                heartbeat_interval: self.heartbeat_interval,
                idle_timeout: self.idle_timeout,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
