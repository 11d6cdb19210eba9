use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::connection::Connection;
use super::frame::{self, MTU};
use super::packets::Packet;
use super::transport::Transport;
use super::wire::WireError;

pub const CONN_TAG: &[u8; 4] = b"CONN";
pub const CHAL_TAG: &[u8; 4] = b"CHAL";

/// Half-open handshakes kept server-side; FIFO eviction beyond this.
const PENDING_LIMIT: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake response failed checksum verification")]
    BadChecksum,
    #[error("unexpected handshake response")]
    BadResponse,
    #[error("handshake response echoed the wrong salt")]
    WrongSalt,
    #[error(transparent)]
    Wire(#[from] WireError),
}

fn xor_salt(a: &[u8], b: &[u8]) -> [u8; 4] {
    [a[0] ^ b[0], a[1] ^ b[1], a[2] ^ b[2], a[3] ^ b[3]]
}

/// Client side of the three-way handshake. Both client datagrams are
/// padded to the MTU so the exchange cannot be used for amplification.
/// On success the socket is switched to non-blocking polling and the
/// optional INITIAL `payload` has been delivered to the server.
pub fn connect<A: ToSocketAddrs>(
    addr: A,
    timeout: Duration,
    payload: Option<&Packet>,
) -> Result<Connection, NetError> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_read_timeout(Some(timeout))?;
    socket.connect(addr)?;

    let client_salt: [u8; 4] = rand::random::<u32>().to_be_bytes();

    let mut body = Vec::with_capacity(MTU - 4);
    body.extend_from_slice(CONN_TAG);
    body.extend_from_slice(&client_salt);
    body.resize(MTU - 4, 0);

    let start = Instant::now();
    socket.send(&frame::seal(&body))?;

    let mut buf = [0u8; MTU];
    let size = socket.recv(&mut buf)?;
    let rtt = start.elapsed();
    let data = &buf[..size];

    if data.len() < 20 || !frame::verify(data) {
        return Err(NetError::BadChecksum);
    }
    if data[4..8] != *CHAL_TAG {
        return Err(NetError::BadResponse);
    }

    let challenge = &data[8..12];
    if data[12..16] != client_salt {
        return Err(NetError::WrongSalt);
    }
    let salt = xor_salt(&client_salt, &data[16..20]);

    let mut response = Vec::with_capacity(MTU - 4);
    response.extend_from_slice(CHAL_TAG);
    response.extend_from_slice(challenge);
    response.extend_from_slice(&salt);
    match payload {
        Some(packet) => {
            response.push(packet.tag());
            packet.write(&mut response);
        }
        None => response.push(0),
    }
    response.resize(MTU - 4, 0);
    socket.send(&frame::seal(&response))?;

    // Give the final handshake datagram a head start over game traffic.
    std::thread::sleep(rtt / 2);

    socket.set_read_timeout(None)?;
    socket.set_nonblocking(true)?;
    Ok(Connection::new(Transport::new(socket, None, salt)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pending {
    addr: SocketAddr,
    salt: [u8; 4],
    challenge: [u8; 4],
}

/// Connection table plus the queues the application drains: received
/// packets and freshly established connections with their INITIAL
/// payloads.
#[derive(Default)]
pub struct HandlerState {
    pub connections: HashMap<SocketAddr, Connection>,
    pending: VecDeque<Pending>,
    pub inbox: Vec<(SocketAddr, Packet)>,
    pub joins: Vec<(SocketAddr, Option<Packet>)>,
}

impl HandlerState {
    fn route(&mut self, socket: &UdpSocket, addr: SocketAddr, data: &[u8]) {
        if let Some(connection) = self.connections.get_mut(&addr) {
            for packet in connection.receive(data) {
                self.inbox.push((addr, packet));
            }
        } else {
            self.handle_connection_packet(socket, addr, data);
        }
    }

    fn handle_connection_packet(&mut self, socket: &UdpSocket, addr: SocketAddr, data: &[u8]) {
        // Short datagrams cannot have paid the padding cost.
        if data.len() < MTU {
            log::debug!("handshake datagram below the mtu from {}", addr);
            return;
        }
        if !frame::verify(data) {
            log::debug!("handshake datagram with a bad checksum from {}", addr);
            return;
        }

        if data[4..8] == *CONN_TAG {
            let client_salt = &data[8..12];
            let server_salt: [u8; 4] = rand::random::<u32>().to_be_bytes();
            let challenge: [u8; 4] = rand::random::<u32>().to_be_bytes();

            let mut response = Vec::with_capacity(20);
            response.extend_from_slice(CHAL_TAG);
            response.extend_from_slice(&challenge);
            response.extend_from_slice(client_salt);
            response.extend_from_slice(&server_salt);
            if let Err(e) = socket.send_to(&frame::seal(&response), addr) {
                log::debug!("failed to answer connection request: {}", e);
            }

            self.pending.push_back(Pending {
                addr,
                salt: xor_salt(client_salt, &server_salt),
                challenge,
            });
            if self.pending.len() > PENDING_LIMIT {
                self.pending.pop_front();
            }
        } else if data[4..8] == *CHAL_TAG {
            let entry = Pending {
                addr,
                salt: [data[12], data[13], data[14], data[15]],
                challenge: [data[8], data[9], data[10], data[11]],
            };
            match self.pending.iter().position(|p| *p == entry) {
                Some(index) => {
                    self.pending.remove(index);
                }
                None => {
                    log::debug!("invalid challenge attempt from {}", addr);
                    return;
                }
            }

            let payload_tag = data[16];
            let payload = if payload_tag == 0 {
                None
            } else {
                match Packet::read(payload_tag, &data[17..]) {
                    Ok(packet) => Some(packet),
                    Err(e) => {
                        log::warn!("unreadable handshake payload from {}: {}", addr, e);
                        None
                    }
                }
            };

            let cloned = match socket.try_clone() {
                Ok(socket) => socket,
                Err(e) => {
                    log::error!("failed to clone the server socket: {}", e);
                    return;
                }
            };
            let transport = Transport::new(cloned, Some(addr), entry.salt);
            log::info!("connection established with {}", addr);
            // A completed handshake replaces any previous connection
            // from the same address.
            self.connections.insert(addr, Connection::new(transport));
            self.joins.push((addr, payload));
        } else {
            log::debug!("unknown handshake tag from {}", addr);
        }
    }
}

/// Cooperative server acceptor: the owner calls [`poll`](Self::poll)
/// to drain the socket and drive retransmission.
pub struct ConnectionHandler {
    socket: UdpSocket,
    pub state: HandlerState,
}

impl ConnectionHandler {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            state: HandlerState::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn poll(&mut self) {
        let mut buf = [0u8; MTU];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((size, addr)) => self.state.route(&self.socket, addr, &buf[..size]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("server recv failed: {}", e);
                    break;
                }
            }
        }
        self.update();
    }

    pub fn update(&mut self) {
        for connection in self.state.connections.values_mut() {
            connection.update();
        }
    }

    pub fn send_all(&mut self, packet: &Packet) {
        for connection in self.state.connections.values_mut() {
            if let Err(e) = connection.send(packet) {
                log::warn!("broadcast failed: {}", e);
            }
        }
    }

    pub fn disconnect(&mut self, addr: SocketAddr) {
        self.state.connections.remove(&addr);
    }
}

/// Threaded server acceptor: a network thread blocks on the socket and
/// deposits packets into [`HandlerState`] under the mutex; the tick
/// thread takes the lock once per tick to drain and reply.
pub struct ThreadedConnectionHandler {
    socket: UdpSocket,
    state: Arc<Mutex<HandlerState>>,
    stopped: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadedConnectionHandler {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        let state = Arc::new(Mutex::new(HandlerState::default()));
        let stopped = Arc::new(AtomicBool::new(false));

        let thread_socket = socket.try_clone()?;
        let thread_state = Arc::clone(&state);
        let thread_stopped = Arc::clone(&stopped);
        let thread = std::thread::Builder::new()
            .name("network".into())
            .spawn(move || {
                let mut buf = [0u8; MTU];
                loop {
                    let (size, addr) = match thread_socket.recv_from(&mut buf) {
                        Ok(received) => received,
                        Err(e) => {
                            if thread_stopped.load(Ordering::SeqCst) {
                                break;
                            }
                            log::debug!("server recv failed: {}", e);
                            continue;
                        }
                    };
                    if thread_stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    let mut state = match thread_state.lock() {
                        Ok(state) => state,
                        Err(_) => break,
                    };
                    state.route(&thread_socket, addr, &buf[..size]);
                }
            })?;

        Ok(Self {
            socket,
            state,
            stopped,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn lock(&self) -> MutexGuard<'_, HandlerState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn update(&self) {
        let mut state = self.lock();
        for connection in state.connections.values_mut() {
            connection.update();
        }
    }

    pub fn send_all(&self, packet: &Packet) {
        let mut state = self.lock();
        for connection in state.connections.values_mut() {
            if let Err(e) = connection.send(packet) {
                log::warn!("broadcast failed: {}", e);
            }
        }
    }

    pub fn disconnect(&self, addr: SocketAddr) {
        self.lock().connections.remove(&addr);
    }

    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Wake the blocked receive with an empty datagram to ourselves.
        if let Ok(addr) = self.socket.local_addr() {
            if let Ok(socket) = UdpSocket::bind("127.0.0.1:0") {
                let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));
                let _ = socket.send_to(&[], target);
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ThreadedConnectionHandler {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}
