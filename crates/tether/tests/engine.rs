use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether::net::{
    Connection, ConnectionState, EngineConfig, ErrorCategory, NetworkEngine, PacketLossSimulation,
    PacketType, SimulatedNetwork, SimulatedTransport,
};

const TICK: Duration = Duration::from_millis(16);

#[derive(Default)]
struct Events {
    connects: usize,
    disconnects: usize,
    payloads: Vec<u32>,
    errors: Vec<ErrorCategory>,
}

fn attach(connection: &mut Connection, events: &Arc<Mutex<Events>>) {
    let e = Arc::clone(events);
    connection.on_connect(move || e.lock().unwrap().connects += 1);
    let e = Arc::clone(events);
    connection.on_disconnect(move || e.lock().unwrap().disconnects += 1);
    let e = Arc::clone(events);
    connection.on_packet(move |packet_type, payload| {
        assert_eq!(packet_type, PacketType::ReliableData);
        let value = u32::from_le_bytes(payload.try_into().unwrap());
        e.lock().unwrap().payloads.push(value);
    });
    let e = Arc::clone(events);
    connection.on_error(move |category, _| e.lock().unwrap().errors.push(category));
}

struct Harness {
    network: SimulatedNetwork,
    client: NetworkEngine<SimulatedTransport>,
    server: NetworkEngine<SimulatedTransport>,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    client_events: Arc<Mutex<Events>>,
    server_events: Arc<Mutex<Events>>,
}

impl Harness {
    fn new(seed: u64, conditions: PacketLossSimulation) -> Self {
        let network = SimulatedNetwork::new(seed);
        network.set_conditions(conditions);

        let client_addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let server_addr: SocketAddr = "10.0.0.2:27015".parse().unwrap();

        let mut client = NetworkEngine::new(network.endpoint(client_addr), EngineConfig::default());
        let mut server = NetworkEngine::new(network.endpoint(server_addr), EngineConfig::default());
        assert!(client.initialize());
        assert!(server.initialize());
        server.set_listening(true);

        let server_events = Arc::new(Mutex::new(Events::default()));
        let sink = Arc::clone(&server_events);
        server.set_accept_handler(move |connection| attach(connection, &sink));

        Self {
            network,
            client,
            server,
            client_addr,
            server_addr,
            client_events: Arc::new(Mutex::new(Events::default())),
            server_events,
        }
    }

    fn connect(&mut self) {
        self.client.connect(self.server_addr).unwrap();
        let connection = self.client.connection_mut(self.server_addr).unwrap();
        attach(connection, &self.client_events);
    }

    fn tick(&mut self) {
        self.network.advance(TICK);
        self.client.update(TICK);
        self.server.update(TICK);
    }

    fn tick_until(&mut self, limit: usize, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..limit {
            if done(self) {
                return true;
            }
            self.tick();
        }
        done(self)
    }

    fn client_state(&self) -> Option<ConnectionState> {
        self.client.connection(self.server_addr).map(|c| c.state())
    }

    fn server_state(&self) -> Option<ConnectionState> {
        self.server.connection(self.client_addr).map(|c| c.state())
    }
}

fn deliver_numbered(conditions: PacketLossSimulation, seed: u64) -> Harness {
    let mut harness = Harness::new(seed, conditions);
    harness.connect();

    assert!(harness.tick_until(1000, |h| {
        h.client_state() == Some(ConnectionState::Connected)
            && h.server_state() == Some(ConnectionState::Connected)
    }));

    for i in 0..100u32 {
        harness
            .client
            .send(harness.server_addr, &i.to_le_bytes(), true)
            .unwrap();
        harness.tick();
        harness.tick();
    }

    let events = Arc::clone(&harness.server_events);
    assert!(harness.tick_until(3000, |_| events.lock().unwrap().payloads.len() >= 100));
    // Let any straggling retransmissions land.
    for _ in 0..200 {
        harness.tick();
    }
    harness
}

#[test]
fn test_lossless_delivery() {
    let harness = deliver_numbered(PacketLossSimulation::default(), 1);

    let events = harness.server_events.lock().unwrap();
    assert_eq!(events.payloads, (0..100).collect::<Vec<u32>>());
    assert_eq!(events.connects, 1);
    assert!(events.errors.is_empty());

    let stats = harness.client.connection(harness.server_addr).unwrap().stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.packets_lost, 0);
}

#[test]
fn test_delivery_under_ten_percent_loss() {
    let harness = deliver_numbered(PacketLossSimulation::with_loss(10.0), 1234);

    let mut payloads = harness.server_events.lock().unwrap().payloads.clone();
    assert_eq!(payloads.len(), 100, "every payload delivered exactly once");
    payloads.sort();
    assert_eq!(payloads, (0..100).collect::<Vec<u32>>());

    let client = harness.client.connection(harness.server_addr).unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.stats().in_flight, 0);
    assert!(client.stats().packets_lost > 0);
    assert!(harness.network.stats().dropped > 0);
    assert!(harness.client_events.lock().unwrap().errors.is_empty());
}

#[test]
fn test_delivery_with_duplication_and_reordering() {
    let conditions = PacketLossSimulation {
        enabled: true,
        loss_percent: 5.0,
        duplicate_percent: 20.0,
        reorder_percent: 20.0,
        min_latency_ms: 10,
        max_latency_ms: 40,
    };
    let harness = deliver_numbered(conditions, 77);

    let mut payloads = harness.server_events.lock().unwrap().payloads.clone();
    assert_eq!(payloads.len(), 100);
    payloads.sort();
    assert_eq!(payloads, (0..100).collect::<Vec<u32>>());

    let server = harness.server.connection(harness.client_addr).unwrap();
    assert!(server.stats().packets_duplicate > 0);
}

fn fixed_latency(latency_ms: u32) -> PacketLossSimulation {
    PacketLossSimulation {
        enabled: true,
        min_latency_ms: latency_ms,
        max_latency_ms: latency_ms,
        ..Default::default()
    }
}

#[test]
fn test_rtt_estimate_above_retry_floor() {
    let harness = deliver_numbered(fixed_latency(150), 21);

    let events = harness.server_events.lock().unwrap();
    assert_eq!(events.payloads, (0..100).collect::<Vec<u32>>());
    assert!(events.errors.is_empty());
    assert!(harness.client_events.lock().unwrap().errors.is_empty());

    let client = harness.client.connection(harness.server_addr).unwrap();
    let stats = client.stats();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(
        (280.0..400.0).contains(&stats.rtt_ms),
        "rtt estimate {} ms on a 300 ms link",
        stats.rtt_ms
    );
    // Only the first few packets go out before an estimate exists.
    assert!(stats.packets_lost <= 8, "{} packets counted lost", stats.packets_lost);
    assert!(stats.packet_loss_rate() < 0.1);
    assert_eq!(stats.in_flight, 0);
}

#[test]
fn test_high_latency_link_stays_up() {
    let harness = deliver_numbered(fixed_latency(700), 22);

    let events = harness.server_events.lock().unwrap();
    assert_eq!(events.payloads, (0..100).collect::<Vec<u32>>());
    assert!(events.errors.is_empty());
    assert!(harness.client_events.lock().unwrap().errors.is_empty());

    let client = harness.client.connection(harness.server_addr).unwrap();
    let stats = client.stats();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(
        (1350.0..1600.0).contains(&stats.rtt_ms),
        "rtt estimate {} ms on a 1400 ms link",
        stats.rtt_ms
    );
    assert!(stats.packets_lost <= 10, "{} packets counted lost", stats.packets_lost);
    assert_eq!(stats.in_flight, 0);
}

#[test]
fn test_idle_timeout_fires_once() {
    let mut harness = Harness::new(5, PacketLossSimulation::default());
    harness.connect();
    assert!(harness.tick_until(100, |h| h.client_state() == Some(ConnectionState::Connected)));

    let cut = PacketLossSimulation::with_loss(100.0);
    harness
        .network
        .set_link_conditions(harness.client_addr, harness.server_addr, cut.clone());
    harness
        .network
        .set_link_conditions(harness.server_addr, harness.client_addr, cut);

    assert!(harness.tick_until(1000, |h| h.client_state() == Some(ConnectionState::Failed)));
    for _ in 0..30 {
        harness.tick();
    }

    let events = harness.client_events.lock().unwrap();
    assert_eq!(events.disconnects, 1);
    assert_eq!(events.errors, vec![ErrorCategory::Timeout]);
    let server_events = harness.server_events.lock().unwrap();
    assert_eq!(server_events.disconnects, 1);
    assert_eq!(server_events.errors, vec![ErrorCategory::Timeout]);
}

#[test]
fn test_graceful_disconnect_and_removal() {
    let mut harness = Harness::new(9, PacketLossSimulation::default());
    harness.connect();
    assert!(harness.tick_until(100, |h| h.server_state() == Some(ConnectionState::Connected)));

    harness.client.disconnect(harness.server_addr).unwrap();
    assert_eq!(harness.client_state(), Some(ConnectionState::Disconnecting));

    assert!(harness.tick_until(20, |h| {
        h.client_state() == Some(ConnectionState::Disconnected)
            && h.server_state() == Some(ConnectionState::Disconnected)
    }));
    assert!(harness.tick_until(100, |h| h.client.total_count() == 0 && h.server.total_count() == 0));

    assert_eq!(harness.client_events.lock().unwrap().disconnects, 1);
    assert_eq!(harness.server_events.lock().unwrap().disconnects, 1);
    assert!(harness.client_events.lock().unwrap().errors.is_empty());
    assert_eq!(harness.server.stats().connections_removed, 1);
}

#[test]
fn test_reconnect_after_disconnect() {
    let mut harness = Harness::new(11, PacketLossSimulation::default());
    harness.connect();
    assert!(harness.tick_until(100, |h| h.server_state() == Some(ConnectionState::Connected)));

    harness.client.disconnect(harness.server_addr).unwrap();
    assert!(harness.tick_until(100, |h| h.client.total_count() == 0 && h.server.total_count() == 0));

    harness.connect();
    assert!(harness.tick_until(100, |h| h.server_state() == Some(ConnectionState::Connected)));
    assert_eq!(harness.server.stats().connections_accepted, 2);
}

#[test]
fn test_shutdown_notifies_peers() {
    let mut harness = Harness::new(13, PacketLossSimulation::default());
    harness.connect();
    assert!(harness.tick_until(100, |h| h.server_state() == Some(ConnectionState::Connected)));

    harness.client.shutdown();
    assert_eq!(harness.client.total_count(), 0);
    assert!(!harness.client.is_initialized());

    assert!(harness.tick_until(10, |h| h.server_state() == Some(ConnectionState::Disconnected)));
    assert_eq!(harness.server_events.lock().unwrap().disconnects, 1);
}
