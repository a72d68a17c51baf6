use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use super::protocol::MAX_PACKET_SIZE;

// Oversized datagrams must reach the codec intact so it can reject them.
const RECV_BUFFER_SIZE: usize = MAX_PACKET_SIZE + 512;

/// Byte-buffer I/O boundary the engine drives. Implementations never block.
pub trait Transport {
    fn send(&mut self, bytes: &[u8], to: SocketAddr) -> io::Result<usize>;

    /// `Ok(None)` when nothing is waiting.
    fn receive(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, bytes: &[u8], to: SocketAddr) -> io::Result<usize> {
        (**self).send(bytes, to)
    }

    fn receive(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        (**self).receive()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: Box<[u8; RECV_BUFFER_SIZE]>,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;
        log::info!("UDP transport bound to {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            recv_buffer: Box::new([0u8; RECV_BUFFER_SIZE]),
        })
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, bytes: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(bytes, to)
    }

    fn receive(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer[..]) {
                Ok((size, addr)) => return Ok(Some((self.recv_buffer[..size].to_vec(), addr))),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                // ICMP port unreachable from an earlier send surfaces here on some platforms.
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_for_datagram(transport: &mut UdpTransport) -> Option<(Vec<u8>, SocketAddr)> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Ok(Some(datagram)) = transport.receive() {
                return Some(datagram);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_empty_socket_returns_none() {
        let mut transport = UdpTransport::bind("127.0.0.1:0").unwrap();
        assert!(transport.receive().unwrap().is_none());
    }

    #[test]
    fn test_send_and_receive() {
        let mut a = UdpTransport::bind("127.0.0.1:0").unwrap();
        let mut b = UdpTransport::bind("127.0.0.1:0").unwrap();
        let b_addr = b.local_addr().unwrap();

        let sent = a.send(b"ping", b_addr).unwrap();
        assert_eq!(sent, 4);

        let (bytes, from) = wait_for_datagram(&mut b).expect("datagram not received");
        assert_eq!(bytes, b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn test_oversized_datagram_is_not_truncated_to_packet_size() {
        let mut a = UdpTransport::bind("127.0.0.1:0").unwrap();
        let mut b = UdpTransport::bind("127.0.0.1:0").unwrap();

        let big = vec![7u8; MAX_PACKET_SIZE + 10];
        a.send(&big, b.local_addr().unwrap()).unwrap();

        let (bytes, _) = wait_for_datagram(&mut b).expect("datagram not received");
        assert_eq!(bytes.len(), MAX_PACKET_SIZE + 10);
    }
}
