pub mod net;

pub use net::{
    Connection, ConnectionConfig, ConnectionError, ConnectionState, EngineConfig, ErrorCategory,
    NetError, NetworkEngine, NetworkStats, Packet, PacketError, PacketFlags, PacketType,
    SharedEngine, Transport, UdpTransport, DEFAULT_PORT, MAX_PAYLOAD_SIZE,
};
