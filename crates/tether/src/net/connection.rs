use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use super::config::ConnectionConfig;
use super::error::{ConnectionError, ErrorCategory, FailureReason};
use super::ledger::{InboundDecision, LedgerFull, ReliabilityLedger};
use super::protocol::{Packet, PacketError, PacketFlags, PacketType, MAX_PAYLOAD_SIZE};
use super::stats::NetworkStats;

pub type ConnectCallback = Box<dyn FnMut() + Send>;
pub type DisconnectCallback = Box<dyn FnMut() + Send>;
pub type PacketCallback = Box<dyn FnMut(PacketType, &[u8]) + Send>;
pub type ErrorCallback = Box<dyn FnMut(ErrorCategory, &str) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Client,
    Server,
}

/// One subscriber per event. Callbacks run synchronously inside
/// `receive_raw`, `update` and `send_packet`.
#[derive(Default)]
struct Callbacks {
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
    on_packet: Option<PacketCallback>,
    on_error: Option<ErrorCallback>,
}

pub struct Connection {
    remote_addr: SocketAddr,
    local_port: u16,
    role: ConnectionRole,
    state: ConnectionState,
    config: ConnectionConfig,
    ledger: ReliabilityLedger,
    stats: NetworkStats,
    clock: Duration,
    state_entered_at: Duration,
    last_received_time: Duration,
    last_sent_time: Duration,
    ack_pending: bool,
    disconnect_sequence: Option<u16>,
    remote_disconnect: bool,
    consecutive_failures: u32,
    failure: Option<FailureReason>,
    connect_notified: bool,
    disconnect_notified: bool,
    callbacks: Callbacks,
    outgoing: VecDeque<Vec<u8>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("failure", &self.failure)
            .field("in_flight", &self.ledger.in_flight_len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(remote_addr: SocketAddr, local_port: u16, config: ConnectionConfig) -> Self {
        Self::with_role(remote_addr, local_port, config, ConnectionRole::Client)
    }

    /// Server side of a connection, created for a peer whose `Connect` is
    /// about to be fed through `receive_raw`.
    pub fn accept(remote_addr: SocketAddr, local_port: u16, config: ConnectionConfig) -> Self {
        Self::with_role(remote_addr, local_port, config, ConnectionRole::Server)
    }

    fn with_role(
        remote_addr: SocketAddr,
        local_port: u16,
        config: ConnectionConfig,
        role: ConnectionRole,
    ) -> Self {
        Self {
            remote_addr,
            local_port,
            role,
            state: ConnectionState::Disconnected,
            ledger: ReliabilityLedger::new(&config),
            config,
            stats: NetworkStats::default(),
            clock: Duration::ZERO,
            state_entered_at: Duration::ZERO,
            last_received_time: Duration::ZERO,
            last_sent_time: Duration::ZERO,
            ack_pending: false,
            disconnect_sequence: None,
            remote_disconnect: false,
            consecutive_failures: 0,
            failure: None,
            connect_notified: false,
            disconnect_notified: false,
            callbacks: Callbacks::default(),
            outgoing: VecDeque::new(),
        }
    }

    pub fn on_connect(&mut self, callback: impl FnMut() + Send + 'static) {
        self.callbacks.on_connect = Some(Box::new(callback));
    }

    pub fn on_disconnect(&mut self, callback: impl FnMut() + Send + 'static) {
        self.callbacks.on_disconnect = Some(Box::new(callback));
    }

    pub fn on_packet(&mut self, callback: impl FnMut(PacketType, &[u8]) + Send + 'static) {
        self.callbacks.on_packet = Some(Box::new(callback));
    }

    pub fn on_error(&mut self, callback: impl FnMut(ErrorCategory, &str) + Send + 'static) {
        self.callbacks.on_error = Some(Box::new(callback));
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.failure
    }

    pub fn ledger(&self) -> &ReliabilityLedger {
        &self.ledger
    }

    pub fn time_in_state(&self) -> Duration {
        self.clock.saturating_sub(self.state_entered_at)
    }

    pub fn stats(&self) -> NetworkStats {
        let rtt = self.ledger.rtt();
        NetworkStats {
            rtt_ms: rtt.srtt(),
            rtt_variance_ms: rtt.rtt_var(),
            in_flight: self.ledger.in_flight_len(),
            ..self.stats.clone()
        }
    }

    /// Encoded datagrams waiting to be handed to the transport.
    pub fn take_outgoing(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.outgoing.drain(..)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Clears all per-lifetime state so a finished connection can be reused.
    /// Callbacks stay registered.
    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.ledger = ReliabilityLedger::new(&self.config);
        self.stats = NetworkStats::default();
        self.state_entered_at = self.clock;
        self.last_received_time = self.clock;
        self.last_sent_time = self.clock;
        self.ack_pending = false;
        self.disconnect_sequence = None;
        self.remote_disconnect = false;
        self.consecutive_failures = 0;
        self.failure = None;
        self.connect_notified = false;
        self.disconnect_notified = false;
        self.outgoing.clear();
    }

    pub fn connect(&mut self, remote_addr: SocketAddr) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Connecting => return Err(ConnectionError::AlreadyConnecting),
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                return Err(ConnectionError::AlreadyConnected);
            }
            ConnectionState::Failed => self.reset(),
            ConnectionState::Disconnected => {
                if self.disconnect_notified {
                    self.reset();
                }
            }
        }

        log::info!("Connecting to {}", remote_addr);
        self.remote_addr = remote_addr;
        self.role = ConnectionRole::Client;
        self.last_received_time = self.clock;
        self.transition(ConnectionState::Connecting);
        self.send_control(PacketType::Connect, PacketFlags::RELIABLE)?;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }

        log::info!("Disconnecting from {}", self.remote_addr);
        if let Ok(sequence) = self.send_control(PacketType::Disconnect, PacketFlags::RELIABLE) {
            self.disconnect_sequence = Some(sequence);
            self.transition(ConnectionState::Disconnecting);
        }
    }

    pub fn send_packet(&mut self, payload: &[u8], reliable: bool) -> Result<u16, ConnectionError> {
        if self.state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ConnectionError::PayloadTooLarge(payload.len()));
        }

        let (packet_type, flags) = if reliable {
            (PacketType::ReliableData, PacketFlags::RELIABLE)
        } else {
            (PacketType::Data, PacketFlags::empty())
        };
        self.send(packet_type, flags, payload.to_vec())
    }

    pub fn receive_raw(&mut self, data: &[u8]) {
        match Packet::decode(data) {
            Ok(packet) => self.receive_packet(packet, data.len()),
            Err(e) => self.receive_malformed(&e),
        }
    }

    pub(crate) fn receive_malformed(&mut self, error: &PacketError) {
        self.stats.decode_errors += 1;
        log::debug!("Malformed datagram from {}: {}", self.remote_addr, error);
        self.emit_error(ErrorCategory::Decode, &error.to_string());
    }

    pub(crate) fn receive_packet(&mut self, packet: Packet, wire_len: usize) {
        self.stats.packets_received += 1;
        self.stats.bytes_received += wire_len as u64;

        // Any datagram from the peer proves it is alive, duplicates included.
        self.last_received_time = self.clock;

        let result = self.ledger.process_inbound(&packet, self.clock);
        if result.decision == InboundDecision::Drop {
            self.stats.packets_duplicate += 1;
            // The earlier acknowledgment may have been lost; answer again.
            if packet.is_reliable() {
                self.ack_pending = true;
            }
            return;
        }

        if packet.is_reliable() {
            self.ack_pending = true;
        }

        if !result.acked.is_empty() {
            self.consecutive_failures = 0;
        }
        let disconnect_acked = self
            .disconnect_sequence
            .is_some_and(|sequence| result.acked.contains(&sequence));

        // Finished connections still acknowledge, but raise nothing.
        if self.disconnect_notified {
            return;
        }

        match packet.packet_type {
            PacketType::Connect => {
                if self.role == ConnectionRole::Server
                    && matches!(
                        self.state,
                        ConnectionState::Disconnected | ConnectionState::Connecting
                    )
                {
                    if self
                        .send_control(PacketType::ConnectAck, PacketFlags::RELIABLE)
                        .is_ok()
                    {
                        self.set_connected();
                    }
                }
            }
            PacketType::ConnectAck => {
                if self.state == ConnectionState::Connecting {
                    self.set_connected();
                }
            }
            PacketType::Disconnect => {
                if self.state != ConnectionState::Disconnected {
                    log::info!("{} requested disconnect", self.remote_addr);
                    self.remote_disconnect = true;
                    if self.state != ConnectionState::Disconnecting {
                        self.transition(ConnectionState::Disconnecting);
                    }
                }
            }
            PacketType::Heartbeat | PacketType::Ack => {}
            PacketType::Data | PacketType::ReliableData | PacketType::Unknown(_) => {
                // Data before the ConnectAck means the ConnectAck was lost.
                if self.state == ConnectionState::Connecting && self.role == ConnectionRole::Client {
                    self.set_connected();
                }
                if self.state == ConnectionState::Connected {
                    if let Some(callback) = self.callbacks.on_packet.as_mut() {
                        callback(packet.packet_type, &packet.payload);
                    }
                }
            }
        }

        if disconnect_acked && self.state == ConnectionState::Disconnecting {
            self.finish_disconnect();
        }
    }

    pub fn update(&mut self, delta: Duration) {
        self.clock += delta;

        match self.state {
            ConnectionState::Connecting => {
                if self.time_in_state() >= self.config.connect_timeout {
                    self.fail(FailureReason::ConnectTimeout);
                    return;
                }
            }
            ConnectionState::Connected => {
                let idle = self.clock.saturating_sub(self.last_received_time);
                if idle >= self.config.idle_timeout {
                    self.fail(FailureReason::IdleTimeout);
                    return;
                }
            }
            ConnectionState::Disconnecting => {
                if self.remote_disconnect {
                    self.flush_ack();
                    self.finish_disconnect();
                    return;
                }
                if self.time_in_state() >= self.config.disconnect_grace {
                    log::debug!("Disconnect from {} not acknowledged in time", self.remote_addr);
                    self.finish_disconnect();
                    return;
                }
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.flush_ack();
                return;
            }
        }

        let sweep = self.ledger.collect_retransmits(self.clock);
        for packet in &sweep.resend {
            self.stats.packets_lost += 1;
            log::debug!(
                "Retransmitting {:?} packet {} to {}",
                packet.packet_type,
                packet.sequence,
                self.remote_addr
            );
            self.enqueue(packet);
        }
        for sequence in sweep.failed {
            self.delivery_failed(sequence);
            if self.is_terminal() {
                return;
            }
        }

        self.flush_ack();

        if self.state == ConnectionState::Connected
            && self.clock.saturating_sub(self.last_sent_time) >= self.config.heartbeat_interval
        {
            let _ = self.send_control(PacketType::Heartbeat, PacketFlags::empty());
        }
    }

    fn delivery_failed(&mut self, sequence: u16) {
        self.stats.packets_lost += 1;
        self.consecutive_failures += 1;
        log::warn!(
            "Reliable packet {} to {} not acknowledged after {} retries",
            sequence,
            self.remote_addr,
            self.config.max_retries
        );
        self.emit_error(
            ErrorCategory::DeliveryFailure,
            &format!(
                "reliable packet {} was not acknowledged after {} retries",
                sequence, self.config.max_retries
            ),
        );

        if self.state == ConnectionState::Connected
            && self.consecutive_failures >= self.config.max_consecutive_failures
        {
            self.fail(FailureReason::DeliveryFailures);
        }
    }

    fn flush_ack(&mut self) {
        if self.ack_pending {
            let _ = self.send_control(PacketType::Ack, PacketFlags::empty());
        }
    }

    fn send_control(&mut self, packet_type: PacketType, flags: PacketFlags) -> Result<u16, ConnectionError> {
        self.send(packet_type, flags, Vec::new())
    }

    fn send(
        &mut self,
        packet_type: PacketType,
        flags: PacketFlags,
        payload: Vec<u8>,
    ) -> Result<u16, ConnectionError> {
        match self.ledger.prepare_outbound(packet_type, flags, payload, self.clock) {
            Ok(packet) => {
                self.enqueue(&packet);
                Ok(packet.sequence)
            }
            Err(LedgerFull(capacity)) => {
                self.fail(FailureReason::LedgerFull);
                Err(ConnectionError::LedgerFull(capacity))
            }
        }
    }

    fn enqueue(&mut self, packet: &Packet) {
        match packet.encode() {
            Ok(bytes) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += bytes.len() as u64;
                self.last_sent_time = self.clock;
                // Every header carries the current acknowledgment state.
                self.ack_pending = false;
                self.outgoing.push_back(bytes);
            }
            Err(e) => log::error!("Failed to encode packet {}: {}", packet.sequence, e),
        }
    }

    fn set_connected(&mut self) {
        log::info!("Connected to {}", self.remote_addr);
        self.transition(ConnectionState::Connected);
        if !self.connect_notified {
            self.connect_notified = true;
            if let Some(callback) = self.callbacks.on_connect.as_mut() {
                callback();
            }
        }
    }

    fn finish_disconnect(&mut self) {
        log::info!("Disconnected from {}", self.remote_addr);
        self.transition(ConnectionState::Disconnected);
        self.notify_disconnect();
    }

    fn fail(&mut self, reason: FailureReason) {
        if self.is_terminal() {
            return;
        }

        log::warn!("Connection to {} failed: {}", self.remote_addr, reason.as_str());
        self.failure = Some(reason);
        self.transition(ConnectionState::Failed);
        self.emit_error(reason.category(), reason.as_str());
        self.notify_disconnect();
    }

    fn notify_disconnect(&mut self) {
        if self.disconnect_notified {
            return;
        }
        self.disconnect_notified = true;
        if let Some(callback) = self.callbacks.on_disconnect.as_mut() {
            callback();
        }
    }

    fn emit_error(&mut self, category: ErrorCategory, message: &str) {
        if let Some(callback) = self.callbacks.on_error.as_mut() {
            callback(category, message);
        }
    }

    fn transition(&mut self, state: ConnectionState) {
        if self.state != state {
            log::debug!("{}: {:?} -> {:?}", self.remote_addr, self.state, state);
        }
        self.state = state;
        self.state_entered_at = self.clock;
    }
}
