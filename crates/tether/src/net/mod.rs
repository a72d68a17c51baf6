mod config;
mod connection;
mod endpoint;
mod error;
mod ledger;
mod protocol;
mod simulator;
mod stats;
mod tracking;
mod transport;

pub use config::{ConnectionConfig, EngineConfig};
pub use connection::{
    ConnectCallback, Connection, ConnectionRole, ConnectionState, DisconnectCallback,
    ErrorCallback, PacketCallback,
};
pub use endpoint::{AcceptHandler, NetworkEngine, SharedEngine};
pub use error::{ConnectionError, ErrorCategory, FailureReason, NetError};
pub use ledger::{
    InFlightPacket, InboundDecision, InboundResult, LedgerFull, ReliabilityLedger, RetrySweep,
};
pub use protocol::{
    sequence_greater_than, sequence_less_than, Packet, PacketError, PacketFlags, PacketType,
    ACK_WINDOW, DEFAULT_PORT, HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE,
};
pub use simulator::{
    LossyTransport, PacketLossSimulation, SimulatedNetwork, SimulatedTransport, SimulationStats,
};
pub use stats::{EngineStats, NetworkStats};
pub use tracking::{ReceiveOutcome, ReceiveTracker, RttEstimator};
pub use transport::{Transport, UdpTransport};
