use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use tether::net::{
    ConnectionState, EngineStats, LossyTransport, NetworkEngine, Transport, UdpTransport,
};

use crate::config::NodeConfig;
use crate::events::{attach, NodeEvent};

type NodeTransport = Box<dyn Transport + Send>;

/// How long a client waits for outstanding echoes once everything it sent is
/// acknowledged.
const ECHO_LINGER: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Clone, Copy)]
struct ClientProgress {
    sent: u32,
    echoes: u32,
    since_last_send: Duration,
    lingering: Duration,
    disconnect_requested: bool,
}

pub struct Node {
    engine: NetworkEngine<NodeTransport>,
    config: NodeConfig,
    local_addr: SocketAddr,
    events_rx: Receiver<NodeEvent>,
    progress: ClientProgress,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    running: Arc<AtomicBool>,
}

impl Node {
    pub fn new(bind_addr: &str, config: NodeConfig) -> Result<Self> {
        let udp = UdpTransport::bind(bind_addr)
            .with_context(|| format!("failed to bind {}", bind_addr))?;
        let local_addr = udp.local_addr()?;

        let transport: NodeTransport = match &config.packet_loss {
            Some(sim) => {
                log::info!(
                    "Simulating {:.1}% outgoing packet loss (seed {})",
                    sim.loss_percent,
                    config.seed
                );
                Box::new(LossyTransport::new(udp, sim.clone(), config.seed))
            }
            None => Box::new(udp),
        };

        let mut engine = NetworkEngine::new(transport, config.engine_config());
        if !engine.initialize() {
            bail!("network engine failed to initialize on {}", local_addr);
        }

        let (events_tx, events_rx) = mpsc::channel();

        match config.connect {
            Some(peer) => {
                engine.connect(peer)?;
                if let Some(connection) = engine.connection_mut(peer) {
                    attach(connection, &events_tx);
                }
            }
            None => {
                engine.set_listening(true);
                let tx = events_tx.clone();
                engine.set_accept_handler(move |connection| attach(connection, &tx));
            }
        }

        Ok(Self {
            engine,
            tick_duration: config.tick_duration(),
            config,
            local_addr,
            events_rx,
            progress: ClientProgress::default(),
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared stop flag; clearing it makes `run` shut the engine down and return.
    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    pub fn echoes_received(&self) -> u32 {
        self.progress.echoes
    }

    pub fn run(&mut self) {
        while self.is_running() {
            self.tick_once();
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.engine.shutdown();
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        let delta = now - self.last_tick_time;
        self.last_tick_time = now;
        self.accumulator += delta;

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick();
        }
    }

    fn tick(&mut self) {
        self.engine.update(self.tick_duration);

        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }

        if let Some(peer) = self.config.connect {
            self.drive_client(peer);
        }
    }

    fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Connected { addr } => {
                log::info!("Peer {} connected", addr);
            }
            NodeEvent::Disconnected { addr } => {
                log::info!("Peer {} disconnected", addr);
                if self.config.connect == Some(addr) {
                    self.running.store(false, Ordering::SeqCst);
                }
            }
            NodeEvent::Payload {
                addr,
                reliable,
                data,
            } => {
                if self.config.connect.is_some() {
                    self.progress.echoes += 1;
                    log::info!("Echo from {}: {}", addr, String::from_utf8_lossy(&data));
                } else {
                    log::debug!("Echoing {} bytes to {}", data.len(), addr);
                    if let Err(e) = self.engine.send(addr, &data, reliable) {
                        log::warn!("Failed to echo to {}: {}", addr, e);
                    }
                }
            }
            NodeEvent::Error {
                addr,
                category,
                message,
            } => {
                log::warn!("{} error on {}: {}", category, addr, message);
            }
        }
    }

    fn drive_client(&mut self, peer: SocketAddr) {
        let Some(connection) = self.engine.connection(peer) else {
            self.running.store(false, Ordering::SeqCst);
            return;
        };
        if connection.state() != ConnectionState::Connected {
            return;
        }
        let in_flight = connection.stats().in_flight;

        if self.progress.sent < self.config.message_count {
            self.progress.since_last_send += self.tick_duration;
            if self.progress.since_last_send >= self.config.send_interval {
                self.progress.since_last_send = Duration::ZERO;
                let message = format!("message {}", self.progress.sent);
                match self.engine.send(peer, message.as_bytes(), true) {
                    Ok(sequence) => {
                        log::info!("Sent '{}' as packet {}", message, sequence);
                        self.progress.sent += 1;
                    }
                    Err(e) => log::warn!("Failed to send to {}: {}", peer, e),
                }
            }
            return;
        }

        if in_flight > 0 || self.progress.disconnect_requested {
            return;
        }
        self.progress.lingering += self.tick_duration;
        if self.progress.echoes >= self.progress.sent || self.progress.lingering >= ECHO_LINGER {
            log::info!(
                "All {} messages acknowledged ({} echoed), disconnecting",
                self.config.message_count,
                self.progress.echoes
            );
            self.progress.disconnect_requested = true;
            let _ = self.engine.disconnect(peer);
        }
    }
}
