use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::transport::Transport;

/// Extra hold-back applied to a datagram picked for reordering.
const REORDER_DELAY_MS: std::ops::RangeInclusive<u64> = 20..=60;

/// Impairments applied to datagrams on send. Percentages are 0..=100.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
    pub duplicate_percent: f32,
    pub reorder_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
}

impl PacketLossSimulation {
    pub fn with_loss(loss_percent: f32) -> Self {
        Self {
            enabled: true,
            loss_percent,
            ..Default::default()
        }
    }

    fn roll(rng: &mut StdRng, percent: f32) -> bool {
        percent > 0.0 && rng.r#gen::<f32>() * 100.0 < percent
    }

    pub fn should_drop(&self, rng: &mut StdRng) -> bool {
        self.enabled && Self::roll(rng, self.loss_percent)
    }

    pub fn should_duplicate(&self, rng: &mut StdRng) -> bool {
        self.enabled && Self::roll(rng, self.duplicate_percent)
    }

    pub fn should_reorder(&self, rng: &mut StdRng) -> bool {
        self.enabled && Self::roll(rng, self.reorder_percent)
    }

    pub fn latency(&self, rng: &mut StdRng) -> Duration {
        if !self.enabled || self.max_latency_ms == 0 {
            return Duration::ZERO;
        }
        let min = self.min_latency_ms.min(self.max_latency_ms);
        Duration::from_millis(rng.gen_range(min..=self.max_latency_ms) as u64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
}

#[derive(Debug)]
struct DelayedDatagram {
    release_time: Duration,
    order: u64,
    from: SocketAddr,
    to: SocketAddr,
    bytes: Vec<u8>,
}

impl PartialEq for DelayedDatagram {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time && self.order == other.order
    }
}

impl Eq for DelayedDatagram {}

impl PartialOrd for DelayedDatagram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedDatagram {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .release_time
            .cmp(&self.release_time)
            .then_with(|| other.order.cmp(&self.order))
    }
}

struct NetworkState {
    rng: StdRng,
    clock: Duration,
    conditions: PacketLossSimulation,
    links: HashMap<(SocketAddr, SocketAddr), PacketLossSimulation>,
    in_transit: BinaryHeap<DelayedDatagram>,
    inboxes: HashMap<SocketAddr, VecDeque<(Vec<u8>, SocketAddr)>>,
    next_order: u64,
    stats: SimulationStats,
}

impl NetworkState {
    fn conditions_for(&self, from: SocketAddr, to: SocketAddr) -> PacketLossSimulation {
        self.links
            .get(&(from, to))
            .unwrap_or(&self.conditions)
            .clone()
    }

    fn schedule(&mut self, from: SocketAddr, to: SocketAddr, bytes: Vec<u8>, delay: Duration) {
        if delay.is_zero() {
            self.deliver(from, to, bytes);
            return;
        }
        let order = self.next_order;
        self.next_order += 1;
        self.in_transit.push(DelayedDatagram {
            release_time: self.clock + delay,
            order,
            from,
            to,
            bytes,
        });
    }

    fn deliver(&mut self, from: SocketAddr, to: SocketAddr, bytes: Vec<u8>) {
        match self.inboxes.get_mut(&to) {
            Some(inbox) => {
                inbox.push_back((bytes, from));
                self.stats.delivered += 1;
            }
            None => self.stats.dropped += 1,
        }
    }

    fn release_due(&mut self) {
        while self
            .in_transit
            .peek()
            .is_some_and(|delayed| delayed.release_time <= self.clock)
        {
            if let Some(delayed) = self.in_transit.pop() {
                self.deliver(delayed.from, delayed.to, delayed.bytes);
            }
        }
    }
}

/// In-memory datagram network shared by any number of [`SimulatedTransport`]s.
///
/// Randomness comes from one seeded generator, so a run is reproducible as
/// long as the endpoints send in the same order. Delayed datagrams are
/// released by [`SimulatedNetwork::advance`].
#[derive(Clone)]
pub struct SimulatedNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl SimulatedNetwork {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                rng: StdRng::seed_from_u64(seed),
                clock: Duration::ZERO,
                conditions: PacketLossSimulation::default(),
                links: HashMap::new(),
                in_transit: BinaryHeap::new(),
                inboxes: HashMap::new(),
                next_order: 0,
                stats: SimulationStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn endpoint(&self, addr: SocketAddr) -> SimulatedTransport {
        self.lock().inboxes.entry(addr).or_default();
        SimulatedTransport {
            addr,
            network: self.clone(),
        }
    }

    pub fn set_conditions(&self, conditions: PacketLossSimulation) {
        self.lock().conditions = conditions;
    }

    /// Overrides the global conditions for datagrams sent from `from` to `to`.
    pub fn set_link_conditions(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        conditions: PacketLossSimulation,
    ) {
        self.lock().links.insert((from, to), conditions);
    }

    pub fn clear_link_conditions(&self, from: SocketAddr, to: SocketAddr) {
        self.lock().links.remove(&(from, to));
    }

    pub fn advance(&self, delta: Duration) {
        let mut state = self.lock();
        state.clock += delta;
        state.release_due();
    }

    /// Places a datagram straight into `to`'s inbox, bypassing all impairments.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
        self.lock().deliver(from, to, bytes.to_vec());
    }

    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.lock().inboxes.get(&addr).map_or(0, VecDeque::len)
    }

    pub fn in_transit(&self) -> usize {
        self.lock().in_transit.len()
    }

    pub fn stats(&self) -> SimulationStats {
        self.lock().stats.clone()
    }

    fn send(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
        let mut state = self.lock();
        state.stats.sent += 1;

        let conditions = state.conditions_for(from, to);
        if conditions.should_drop(&mut state.rng) {
            state.stats.dropped += 1;
            return;
        }

        let copies = if conditions.should_duplicate(&mut state.rng) {
            state.stats.duplicated += 1;
            2
        } else {
            1
        };

        for _ in 0..copies {
            let mut delay = conditions.latency(&mut state.rng);
            if conditions.should_reorder(&mut state.rng) {
                state.stats.reordered += 1;
                delay += Duration::from_millis(state.rng.gen_range(REORDER_DELAY_MS));
            }
            state.schedule(from, to, bytes.to_vec(), delay);
        }
    }

    fn receive(&self, addr: SocketAddr) -> Option<(Vec<u8>, SocketAddr)> {
        self.lock().inboxes.get_mut(&addr)?.pop_front()
    }
}

pub struct SimulatedTransport {
    addr: SocketAddr,
    network: SimulatedNetwork,
}

impl SimulatedTransport {
    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }
}

impl Transport for SimulatedTransport {
    fn send(&mut self, bytes: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.network.send(self.addr, to, bytes);
        Ok(bytes.len())
    }

    fn receive(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        Ok(self.network.receive(self.addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// Applies loss, duplication and reordering to outgoing datagrams of a real
/// transport. Reordered datagrams are held back until the following send.
/// Latency is not simulated here.
pub struct LossyTransport<T> {
    inner: T,
    conditions: PacketLossSimulation,
    rng: StdRng,
    held: Option<(Vec<u8>, SocketAddr)>,
    stats: SimulationStats,
}

impl<T: Transport> LossyTransport<T> {
    pub fn new(inner: T, conditions: PacketLossSimulation, seed: u64) -> Self {
        Self {
            inner,
            conditions,
            rng: StdRng::seed_from_u64(seed),
            held: None,
            stats: SimulationStats::default(),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    fn release_held(&mut self) -> io::Result<()> {
        if let Some((bytes, to)) = self.held.take() {
            self.inner.send(&bytes, to)?;
            self.stats.delivered += 1;
        }
        Ok(())
    }
}

impl<T: Transport> Transport for LossyTransport<T> {
    fn send(&mut self, bytes: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.stats.sent += 1;

        if self.conditions.should_drop(&mut self.rng) {
            self.stats.dropped += 1;
            return Ok(bytes.len());
        }

        if self.held.is_none() && self.conditions.should_reorder(&mut self.rng) {
            self.stats.reordered += 1;
            self.held = Some((bytes.to_vec(), to));
            return Ok(bytes.len());
        }

        let sent = self.inner.send(bytes, to)?;
        self.stats.delivered += 1;
        if self.conditions.should_duplicate(&mut self.rng) {
            self.stats.duplicated += 1;
            self.inner.send(bytes, to)?;
        }
        self.release_held()?;
        Ok(sent)
    }

    fn receive(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        self.inner.receive()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
