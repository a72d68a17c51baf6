use std::net::SocketAddr;
use std::sync::mpsc::Sender;

use tether::net::{Connection, ErrorCategory, PacketType};

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Connected {
        addr: SocketAddr,
    },
    Disconnected {
        addr: SocketAddr,
    },
    Payload {
        addr: SocketAddr,
        reliable: bool,
        data: Vec<u8>,
    },
    Error {
        addr: SocketAddr,
        category: ErrorCategory,
        message: String,
    },
}

/// Forwards every callback of `connection` into `events`.
pub fn attach(connection: &mut Connection, events: &Sender<NodeEvent>) {
    let addr = connection.remote_addr();

    let tx = events.clone();
    connection.on_connect(move || {
        let _ = tx.send(NodeEvent::Connected { addr });
    });

    let tx = events.clone();
    connection.on_disconnect(move || {
        let _ = tx.send(NodeEvent::Disconnected { addr });
    });

    let tx = events.clone();
    connection.on_packet(move |packet_type, payload| {
        let _ = tx.send(NodeEvent::Payload {
            addr,
            reliable: packet_type == PacketType::ReliableData,
            data: payload.to_vec(),
        });
    });

    let tx = events.clone();
    connection.on_error(move |category, message| {
        let _ = tx.send(NodeEvent::Error {
            addr,
            category,
            message: message.to_string(),
        });
    });
}
