use std::net::UdpSocket;
use std::thread;
use std::time::{Duration, Instant};

use glam::DVec2;

use tumble::net::frame;
use tumble::net::{Connection, ConnectionHandler, MTU, Packet, PlayerIntro, Transport, connect};

fn connected_pair() -> (Connection, Connection) {
    let a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    let addr_a = a.local_addr().unwrap();
    let addr_b = b.local_addr().unwrap();
    let salt = [0xde, 0xad, 0xbe, 0xef];
    (
        Connection::new(Transport::new(a, Some(addr_b), salt)),
        Connection::new(Transport::new(b, Some(addr_a), salt)),
    )
}

/// Pull raw datagrams off a connection's socket without letting the
/// connection see them, so tests can drop and duplicate selectively.
fn drain_raw(connection: &Connection) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 2048];
    while let Ok((size, _)) = connection.transport().socket().recv_from(&mut buf) {
        out.push(buf[..size].to_vec());
    }
    out
}

fn reliable_seq(datagram: &[u8]) -> u16 {
    u16::from_be_bytes([datagram[9], datagram[10]])
}

#[test]
fn reliable_gap_recovery() {
    let (mut a, mut b) = connected_pair();
    // Collapse the retransmission timer to its 10ms floor.
    a.rtt = 0.0;
    a.rtt_dev = 0.0;

    for id in 0..10u32 {
        a.send(&Packet::DeleteObject { tick: 0, id }).unwrap();
    }
    a.update();
    thread::sleep(Duration::from_millis(30));

    // First delivery: drop sequences 3 and 7, duplicate the rest.
    let mut delivered = Vec::new();
    for datagram in drain_raw(&b) {
        let seq = reliable_seq(&datagram);
        if seq == 3 || seq == 7 {
            continue;
        }
        delivered.extend(b.receive(&datagram));
        delivered.extend(b.receive(&datagram));
    }
    assert_eq!(delivered.len(), 3, "only the prefix before the gap surfaces");

    // Acks flow back, then the gap retransmits after the timeout.
    thread::sleep(Duration::from_millis(10));
    a.poll();
    thread::sleep(Duration::from_millis(20));
    a.update();
    thread::sleep(Duration::from_millis(30));

    for datagram in drain_raw(&b) {
        delivered.extend(b.receive(&datagram));
    }

    let ids: Vec<u32> = delivered
        .iter()
        .map(|packet| match packet {
            Packet::DeleteObject { id, .. } => *id,
            other => panic!("unexpected packet {:?}", other),
        })
        .collect();
    assert_eq!(ids, (0..10).collect::<Vec<u32>>());
    assert!(a.packet_loss > 0.0, "retransmissions feed the loss estimate");
}

#[test]
fn big_transfer_converges_under_heavy_loss() {
    let (mut a, mut b) = connected_pair();

    let body = "lorem ipsum ".repeat(19_000); // ~228 KB, ~193 slices
    a.send(&Packet::Script { body: body.clone() }).unwrap();

    let deadline = Instant::now() + Duration::from_secs(15);
    let mut received = None;
    let mut counter = 0u64;
    while received.is_none() && Instant::now() < deadline {
        a.update();
        thread::sleep(Duration::from_millis(5));
        for datagram in drain_raw(&b) {
            counter += 1;
            // Deterministic 50% slice loss.
            if counter % 2 == 0 {
                continue;
            }
            for packet in b.receive(&datagram) {
                received = Some(packet);
            }
        }
        a.poll();
    }

    match received {
        Some(Packet::Script { body: got }) => assert_eq!(got, body),
        other => panic!("big transfer did not complete: {:?}", other.is_some()),
    }
}

#[test]
fn handshake_establishes_a_connection_end_to_end() {
    let mut handler = ConnectionHandler::bind("127.0.0.1:0").unwrap();
    let addr = handler.local_addr().unwrap();

    let client_thread = thread::spawn(move || {
        let intro = Packet::InitConnectionServer {
            players: vec![PlayerIntro {
                name: "alice".into(),
                colour: [1, 2, 3],
            }],
        };
        connect(addr, Duration::from_secs(2), Some(&intro))
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut joins = Vec::new();
    while joins.is_empty() && Instant::now() < deadline {
        handler.poll();
        joins.append(&mut handler.state.joins);
        thread::sleep(Duration::from_millis(5));
    }
    let mut client = client_thread.join().unwrap().expect("handshake failed");

    assert_eq!(joins.len(), 1);
    let (peer, payload) = &joins[0];
    match payload {
        Some(Packet::InitConnectionServer { players }) => {
            assert_eq!(players.len(), 1);
            assert_eq!(players[0].name, "alice");
            assert_eq!(players[0].colour, [1, 2, 3]);
        }
        other => panic!("missing init payload: {:?}", other),
    }

    // A malformed datagram afterwards is tolerated.
    let noise = UdpSocket::bind("127.0.0.1:0").unwrap();
    noise.send_to(&[0xff; 64], addr).unwrap();
    thread::sleep(Duration::from_millis(10));
    handler.poll();
    assert_eq!(handler.state.connections.len(), 1);

    // Traffic flows over the established connection in both classes.
    {
        let connection = handler.state.connections.get_mut(peer).unwrap();
        connection
            .send(&Packet::LevelProps {
                gravity: DVec2::new(0.0, 0.3),
                spawn: DVec2::new(5.0, -5.0),
            })
            .unwrap();
        connection
            .send(&Packet::Disconnect {
                reason: "hello".into(),
            })
            .unwrap();
    }
    handler.poll();
    thread::sleep(Duration::from_millis(30));

    let packets = client.poll();
    assert!(packets.iter().any(|packet| matches!(
        packet,
        Packet::LevelProps { gravity, .. } if (gravity.y - 0.3).abs() < 1e-9
    )));
    assert!(
        packets
            .iter()
            .any(|packet| matches!(packet, Packet::Disconnect { .. }))
    );
}

#[test]
fn half_open_handshakes_evict_fifo() {
    let mut handler = ConnectionHandler::bind("127.0.0.1:0").unwrap();
    let addr = handler.local_addr().unwrap();

    // 17 clients that never send step 3.
    let mut sockets = Vec::new();
    for i in 0..17u32 {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut body = Vec::with_capacity(MTU - 4);
        body.extend_from_slice(b"CONN");
        body.extend_from_slice(&i.to_be_bytes());
        body.resize(MTU - 4, 0);
        socket.send_to(&frame::seal(&body), addr).unwrap();
        sockets.push(socket);
    }
    thread::sleep(Duration::from_millis(30));
    handler.poll();
    assert!(handler.state.connections.is_empty());

    // A real client still gets through.
    let client_thread =
        thread::spawn(move || connect(addr, Duration::from_secs(2), None));
    let deadline = Instant::now() + Duration::from_secs(5);
    while handler.state.connections.is_empty() && Instant::now() < deadline {
        handler.poll();
        thread::sleep(Duration::from_millis(5));
    }
    client_thread
        .join()
        .unwrap()
        .expect("eviction must not block new handshakes");
    assert_eq!(handler.state.connections.len(), 1);
}

#[test]
fn unpadded_connection_requests_are_ignored() {
    let mut handler = ConnectionHandler::bind("127.0.0.1:0").unwrap();
    let addr = handler.local_addr().unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut body = Vec::new();
    body.extend_from_slice(b"CONN");
    body.extend_from_slice(&7u32.to_be_bytes());
    socket.send_to(&frame::seal(&body), addr).unwrap();

    thread::sleep(Duration::from_millis(20));
    handler.poll();

    let mut buf = [0u8; 64];
    assert!(
        socket.recv_from(&mut buf).is_err(),
        "a sub-mtu request must draw no response"
    );
}
