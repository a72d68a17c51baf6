mod config;
mod events;
mod node;

use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use config::NodeConfig;
use node::Node;
use tether::net::PacketLossSimulation;

#[derive(Parser)]
#[command(name = "tether-node")]
#[command(about = "Reliable UDP peer: echo server, or client sending numbered messages")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = tether::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, help = "Connect to this peer instead of listening")]
    connect: Option<SocketAddr>,

    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_connections: usize,

    #[arg(long, default_value_t = 1000)]
    heartbeat_ms: u64,

    #[arg(long, default_value_t = 10)]
    idle_timeout_secs: u64,

    #[arg(long, default_value_t = 100, help = "Delay between client messages")]
    send_interval_ms: u64,

    #[arg(long, default_value_t = 10, help = "Number of reliable messages a client sends")]
    count: u32,

    #[arg(long, help = "Enable outgoing packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Seed for the loss simulation")]
    seed: u64,

    #[arg(long, help = "Stop after this many seconds")]
    duration_secs: Option<u64>,
}

/// Clears `running` when `q` is entered on stdin, or after `duration` if set.
fn spawn_stop_watchers(running: Arc<AtomicBool>, duration: Option<Duration>) {
    if let Some(duration) = duration {
        let running = Arc::clone(&running);
        std::thread::spawn(move || {
            std::thread::sleep(duration);
            log::info!("Run time of {:?} elapsed, stopping", duration);
            running.store(false, Ordering::SeqCst);
        });
    }

    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if matches!(line.trim(), "q" | "quit") {
                running.store(false, Ordering::SeqCst);
                break;
            }
        }
    });
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    // A client without an explicit port takes an ephemeral one.
    let port = match (args.connect, args.port) {
        (Some(_), tether::DEFAULT_PORT) => 0,
        (_, port) => port,
    };
    let bind_addr = format!("{}:{}", args.bind, port);

    let packet_loss = args
        .simulate_packet_loss
        .then(|| PacketLossSimulation::with_loss(args.loss_percent));

    let config = NodeConfig {
        tick_rate: args.tick_rate,
        max_connections: args.max_connections,
        heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        connect: args.connect,
        send_interval: Duration::from_millis(args.send_interval_ms),
        message_count: args.count,
        packet_loss,
        seed: args.seed,
    };

    let mut node = Node::new(&bind_addr, config)?;
    match args.connect {
        Some(peer) => log::info!("Node on {} connecting to {}", node.local_addr(), peer),
        None => log::info!("Node listening on {} (enter 'q' to stop)", node.local_addr()),
    }
    spawn_stop_watchers(node.running(), args.duration_secs.map(Duration::from_secs));

    node.run();

    let stats = node.stats();
    log::info!(
        "Node stopped: {} datagrams sent, {} received, {} dropped, {} echoes",
        stats.datagrams_sent,
        stats.datagrams_received,
        stats.datagrams_dropped,
        node.echoes_received()
    );

    Ok(())
}
