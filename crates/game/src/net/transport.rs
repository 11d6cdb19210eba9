use std::io;
use std::net::{SocketAddr, UdpSocket};

use super::frame::{self, MTU};

/// UDP facade bound to one peer. Every outgoing datagram is prefixed
/// with the connection salt and CRC-sealed; sends past the handshake
/// never block and never surface socket errors to callers.
pub struct Transport {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    salt: [u8; 4],
}

impl Transport {
    pub fn new(socket: UdpSocket, peer: Option<SocketAddr>, salt: [u8; 4]) -> Self {
        Self { socket, peer, salt }
    }

    pub fn salt(&self) -> [u8; 4] {
        self.salt
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Seal `salt ‖ body` and emit it. `body` is the tag byte plus
    /// payload; oversize datagrams are dropped here as a last line of
    /// defence (callers check against the MTU before queueing).
    pub fn send(&self, body: &[u8]) {
        let mut framed = Vec::with_capacity(body.len() + 4);
        framed.extend_from_slice(&self.salt);
        framed.extend_from_slice(body);
        let data = frame::seal(&framed);

        if data.len() > MTU {
            log::warn!("dropping {} byte datagram over the mtu", data.len());
            return;
        }

        let result = match self.peer {
            Some(addr) => self.socket.send_to(&data, addr),
            None => self.socket.send(&data),
        };
        if let Err(e) = result {
            log::debug!("udp send failed: {}", e);
        }
    }

    /// Non-blocking receive. `None` means no datagram is ready; socket
    /// errors are treated the same way since transport failures must
    /// never escape the connection.
    pub fn try_recv(&self, buf: &mut [u8]) -> Option<usize> {
        match self.socket.recv_from(buf) {
            Ok((size, addr)) => {
                if let Some(peer) = self.peer {
                    if addr != peer {
                        return Some(0);
                    }
                }
                Some(size)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                log::debug!("udp recv failed: {}", e);
                None
            }
        }
    }
}
