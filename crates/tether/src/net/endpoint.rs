use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::config::EngineConfig;
use super::connection::{Connection, ConnectionRole, ConnectionState};
use super::error::NetError;
use super::protocol::{Packet, PacketType};
use super::stats::EngineStats;
use super::transport::Transport;

/// Upper bound on datagrams read from the transport in a single `update`.
const MAX_DATAGRAMS_PER_POLL: usize = 1024;

pub type AcceptHandler = Box<dyn FnMut(&mut Connection) + Send>;

/// Registry of connections keyed by remote address, driving one transport.
pub struct NetworkEngine<T: Transport> {
    transport: T,
    config: EngineConfig,
    connections: HashMap<SocketAddr, Connection>,
    local_port: u16,
    listening: bool,
    initialized: bool,
    accept_handler: Option<AcceptHandler>,
    stats: EngineStats,
}

impl<T: Transport> NetworkEngine<T> {
    pub fn new(transport: T, config: EngineConfig) -> Self {
        Self {
            transport,
            config,
            connections: HashMap::new(),
            local_port: 0,
            listening: false,
            initialized: false,
            accept_handler: None,
            stats: EngineStats::default(),
        }
    }

    pub fn initialize(&mut self) -> bool {
        if self.initialized {
            return true;
        }

        match self.transport.local_addr() {
            Ok(addr) => {
                self.local_port = addr.port();
                self.initialized = true;
                log::info!("Network engine initialized on {}", addr);
                true
            }
            Err(e) => {
                log::error!("Failed to initialize network engine: {}", e);
                false
            }
        }
    }

    /// Sends a `Disconnect` to every live peer and drops all connections.
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }

        for connection in self.connections.values_mut() {
            connection.disconnect();
        }
        self.flush();

        log::info!(
            "Network engine shut down ({} connections dropped)",
            self.connections.len()
        );
        self.stats.connections_removed += self.connections.len() as u64;
        self.connections.clear();
        self.listening = false;
        self.initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn set_listening(&mut self, listening: bool) {
        self.listening = listening;
    }

    pub fn set_accept_handler(&mut self, handler: impl FnMut(&mut Connection) + Send + 'static) {
        self.accept_handler = Some(Box::new(handler));
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }

    pub fn connection(&self, addr: SocketAddr) -> Option<&Connection> {
        self.connections.get(&addr)
    }

    pub fn connection_mut(&mut self, addr: SocketAddr) -> Option<&mut Connection> {
        self.connections.get_mut(&addr)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.state() == ConnectionState::Connected)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.connections.len()
    }

    fn live_count(&self) -> usize {
        self.connections.values().filter(|c| !c.is_terminal()).count()
    }

    pub fn connect(&mut self, addr: SocketAddr) -> Result<(), NetError> {
        if let Some(connection) = self.connections.get_mut(&addr) {
            connection.connect(addr)?;
            return Ok(());
        }

        if self.live_count() >= self.config.max_connections {
            return Err(NetError::CapacityReached(self.config.max_connections));
        }

        let mut connection = Connection::new(addr, self.local_port, self.config.connection.clone());
        connection.connect(addr)?;
        self.connections.insert(addr, connection);
        Ok(())
    }

    pub fn disconnect(&mut self, addr: SocketAddr) -> Result<(), NetError> {
        let connection = self
            .connections
            .get_mut(&addr)
            .ok_or(NetError::UnknownPeer(addr))?;
        connection.disconnect();
        Ok(())
    }

    pub fn send(&mut self, addr: SocketAddr, payload: &[u8], reliable: bool) -> Result<u16, NetError> {
        let connection = self
            .connections
            .get_mut(&addr)
            .ok_or(NetError::UnknownPeer(addr))?;
        Ok(connection.send_packet(payload, reliable)?)
    }

    /// Routes one datagram. Never panics, whatever the bytes.
    pub fn on_datagram_received(&mut self, bytes: &[u8], from: SocketAddr) {
        self.stats.datagrams_received += 1;

        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.decode_errors += 1;
                match self.connections.get_mut(&from) {
                    Some(connection) => connection.receive_malformed(&e),
                    None => {
                        self.stats.datagrams_dropped += 1;
                        log::debug!("Dropping malformed datagram from {}: {}", from, e);
                    }
                }
                return;
            }
        };

        if let Some(connection) = self.connections.get_mut(&from) {
            // A finished peer reconnecting from the same address starts over.
            let restart = connection.is_terminal()
                && connection.role() == ConnectionRole::Server
                && packet.packet_type == PacketType::Connect
                && self.listening;
            if !restart {
                connection.receive_packet(packet, bytes.len());
                return;
            }
            self.connections.remove(&from);
        }

        if packet.packet_type != PacketType::Connect {
            self.stats.datagrams_dropped += 1;
            log::debug!(
                "Dropping {:?} packet from unknown peer {}",
                packet.packet_type,
                from
            );
            return;
        }

        if !self.listening {
            self.stats.connections_rejected += 1;
            log::debug!("Rejecting connection from {}: not listening", from);
            return;
        }

        if self.live_count() >= self.config.max_connections {
            self.stats.connections_rejected += 1;
            log::warn!(
                "Rejecting connection from {}: limit of {} reached",
                from,
                self.config.max_connections
            );
            return;
        }

        log::info!("Accepting connection from {}", from);
        let mut connection = Connection::accept(from, self.local_port, self.config.connection.clone());
        if let Some(handler) = self.accept_handler.as_mut() {
            handler(&mut connection);
        }
        connection.receive_packet(packet, bytes.len());
        self.connections.insert(from, connection);
        self.stats.connections_accepted += 1;
    }

    pub fn update(&mut self, delta: Duration) {
        if !self.initialized {
            return;
        }

        self.poll_transport();

        for connection in self.connections.values_mut() {
            connection.update(delta);
        }

        self.flush();
        self.remove_finished();
    }

    fn poll_transport(&mut self) {
        for _ in 0..MAX_DATAGRAMS_PER_POLL {
            match self.transport.receive() {
                Ok(Some((bytes, from))) => self.on_datagram_received(&bytes, from),
                Ok(None) => break,
                Err(e) => {
                    self.stats.receive_errors += 1;
                    log::warn!("Transport receive error: {}", e);
                    break;
                }
            }
        }
    }

    fn flush(&mut self) {
        for (addr, connection) in self.connections.iter_mut() {
            for datagram in connection.take_outgoing() {
                match self.transport.send(&datagram, *addr) {
                    Ok(_) => self.stats.datagrams_sent += 1,
                    Err(e) => {
                        self.stats.send_errors += 1;
                        log::warn!("Failed to send to {}: {}", addr, e);
                    }
                }
            }
        }
    }

    fn remove_finished(&mut self) {
        let grace = self.config.removal_grace;
        let before = self.connections.len();

        self.connections.retain(|addr, connection| {
            let expired = connection.is_terminal() && connection.time_in_state() >= grace;
            if expired {
                log::info!("Removing connection to {} ({:?})", addr, connection.state());
            }
            !expired
        });

        self.stats.connections_removed += (before - self.connections.len()) as u64;
    }
}

/// Cloneable handle for driving an engine from several threads. Every call
/// takes the single engine lock.
pub struct SharedEngine<T: Transport> {
    inner: Arc<Mutex<NetworkEngine<T>>>,
}

impl<T: Transport> Clone for SharedEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> SharedEngine<T> {
    pub fn new(engine: NetworkEngine<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkEngine<T>> {
        // Engine state stays consistent across a panicking callback.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut NetworkEngine<T>) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn update(&self, delta: Duration) {
        self.lock().update(delta);
    }

    pub fn on_datagram_received(&self, bytes: &[u8], from: SocketAddr) {
        self.lock().on_datagram_received(bytes, from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::error::ConnectionError;
    use crate::net::protocol::PacketFlags;
    use crate::net::simulator::{SimulatedNetwork, SimulatedTransport};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const TICK: Duration = Duration::from_millis(16);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn engine(network: &SimulatedNetwork, port: u16, config: EngineConfig) -> NetworkEngine<SimulatedTransport> {
        let mut engine = NetworkEngine::new(network.endpoint(addr(port)), config);
        assert!(engine.initialize());
        engine
    }

    fn connect_packet() -> Vec<u8> {
        let mut packet = Packet::new(PacketType::Connect, PacketFlags::RELIABLE, Vec::new());
        packet.sequence = 1;
        packet.encode().unwrap()
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let network = SimulatedNetwork::new(1);
        let mut engine = NetworkEngine::new(network.endpoint(addr(4000)), EngineConfig::default());

        assert!(engine.initialize());
        assert!(engine.initialize());
        assert_eq!(engine.local_port(), 4000);
    }

    #[test]
    fn test_not_listening_rejects_connect() {
        let network = SimulatedNetwork::new(1);
        let mut engine = engine(&network, 4000, EngineConfig::default());

        engine.on_datagram_received(&connect_packet(), addr(5000));

        assert_eq!(engine.total_count(), 0);
        assert_eq!(engine.stats().connections_rejected, 1);
    }

    #[test]
    fn test_accept_handler_runs_before_first_packet() {
        let network = SimulatedNetwork::new(1);
        let mut engine = engine(&network, 4000, EngineConfig::default());
        engine.set_listening(true);

        let connected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&connected);
        engine.set_accept_handler(move |connection| {
            let sink = Arc::clone(&sink);
            let peer = connection.remote_addr();
            connection.on_connect(move || sink.lock().unwrap().push(peer));
        });

        engine.on_datagram_received(&connect_packet(), addr(5000));

        assert_eq!(*connected.lock().unwrap(), vec![addr(5000)]);
        assert_eq!(engine.connected_count(), 1);
        assert_eq!(engine.stats().connections_accepted, 1);
    }

    #[test]
    fn test_capacity_limit() {
        let network = SimulatedNetwork::new(1);
        let config = EngineConfig {
            max_connections: 2,
            ..Default::default()
        };
        let mut engine = engine(&network, 4000, config);
        engine.set_listening(true);

        for port in 5000..5003 {
            engine.on_datagram_received(&connect_packet(), addr(port));
        }

        assert_eq!(engine.total_count(), 2);
        assert_eq!(engine.stats().connections_rejected, 1);
        assert_eq!(engine.connect(addr(6000)), Err(NetError::CapacityReached(2)));
    }

    #[test]
    fn test_non_connect_from_unknown_peer_is_dropped() {
        let network = SimulatedNetwork::new(1);
        let mut engine = engine(&network, 4000, EngineConfig::default());
        engine.set_listening(true);

        let mut packet = Packet::new(PacketType::ReliableData, PacketFlags::RELIABLE, vec![1]);
        packet.sequence = 1;
        engine.on_datagram_received(&packet.encode().unwrap(), addr(5000));

        assert_eq!(engine.total_count(), 0);
        assert_eq!(engine.stats().datagrams_dropped, 1);
    }

    #[test]
    fn test_random_garbage_never_creates_connections() {
        let network = SimulatedNetwork::new(1);
        let mut engine = engine(&network, 4000, EngineConfig::default());
        engine.set_listening(true);
        let mut rng = StdRng::seed_from_u64(99);

        for i in 0..5000u32 {
            let len = rng.gen_range(0..64);
            let mut bytes: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            // Never a well-formed Connect.
            if bytes.len() > 4 && bytes[4] == 0 {
                bytes[4] = 0xEE;
            }
            engine.on_datagram_received(&bytes, addr(5000 + (i % 7) as u16));
        }

        assert_eq!(engine.total_count(), 0);
        let stats = engine.stats();
        assert_eq!(stats.datagrams_received, 5000);
        assert_eq!(stats.datagrams_dropped, 5000);
    }

    #[test]
    fn test_unknown_peer_errors() {
        let network = SimulatedNetwork::new(1);
        let mut engine = engine(&network, 4000, EngineConfig::default());

        assert_eq!(engine.send(addr(5000), b"x", true), Err(NetError::UnknownPeer(addr(5000))));
        assert_eq!(engine.disconnect(addr(5000)), Err(NetError::UnknownPeer(addr(5000))));
    }

    #[test]
    fn test_send_before_connected() {
        let network = SimulatedNetwork::new(1);
        let mut engine = engine(&network, 4000, EngineConfig::default());

        engine.connect(addr(5000)).unwrap();
        assert_eq!(
            engine.send(addr(5000), b"x", true),
            Err(NetError::Connection(ConnectionError::NotConnected))
        );
        assert_eq!(
            engine.connect(addr(5000)),
            Err(NetError::Connection(ConnectionError::AlreadyConnecting))
        );
    }

    #[test]
    fn test_failed_connection_removed_after_grace() {
        let network = SimulatedNetwork::new(1);
        let mut engine = engine(&network, 4000, EngineConfig::default());

        // Nobody answers at this address.
        engine.connect(addr(5000)).unwrap();

        let mut ticks = 0;
        while engine.connection(addr(5000)).is_some_and(|c| !c.is_terminal()) {
            engine.update(TICK);
            ticks += 1;
            assert!(ticks < 1000);
        }
        assert_eq!(engine.total_count(), 1);

        for _ in 0..70 {
            engine.update(TICK);
        }
        assert_eq!(engine.total_count(), 0);
        assert_eq!(engine.stats().connections_removed, 1);
    }

    #[test]
    fn test_shared_engine_across_threads() {
        let network = SimulatedNetwork::new(1);
        let mut server = engine(&network, 4000, EngineConfig::default());
        server.set_listening(true);
        let shared = SharedEngine::new(server);

        let feeder = shared.clone();
        let handle = std::thread::spawn(move || {
            feeder.on_datagram_received(&connect_packet(), addr(5000));
        });
        handle.join().unwrap();

        shared.update(TICK);
        assert_eq!(shared.with(|engine| engine.connected_count()), 1);
        // The ConnectAck went out through the simulated network.
        assert!(network.stats().sent >= 1);
    }
}
