use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use super::chunk::{ChunkReceiver, ChunkSender};
use super::frame::{self, MTU};
use super::packets::{Packet, PacketKind};
use super::seq::{PacketCache, Seq};
use super::transport::Transport;
use super::wire::{self, WireError};

/// RFC 2988 gains and floor.
const RTT_GAIN: f64 = 1.0 / 8.0;
const RTT_DEV_GAIN: f64 = 1.0 / 4.0;
const RTO_GRANULARITY: f64 = 0.01;
const RTO_K: f64 = 4.0;

const LOSS_GAIN: f64 = 0.05;

/// How many slots of the send window each update pass visits. The
/// cache can hold 256 in-flight packets, but scanning only the 32 the
/// ack bitfield spans acts as send-side back-pressure: packets beyond
/// the window sit untransmitted until the head drains.
const SEND_SCAN: i32 = 32;

/// Per-peer delivery engine over a [`Transport`]: unreliable, reliable
/// and fragmented sends, ack generation, retransmission, and RTT/loss
/// estimation.
pub struct Connection {
    transport: Transport,

    earliest_sending: Seq,
    latest_sending: Seq,
    sending_packets: PacketCache<(Vec<u8>, Option<Instant>)>,

    earliest_unreceived: Seq,
    latest_received: Option<Seq>,
    received_packets: PacketCache<Packet>,

    chunk_queue: VecDeque<ChunkSender>,
    next_chunk_id: u8,
    sending_chunk: Option<ChunkSender>,
    chunk_receiver: Option<ChunkReceiver>,

    pub rtt: f64,
    pub rtt_dev: f64,
    pub packet_loss: f64,
    pub last_received: Instant,
}

impl Connection {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            earliest_sending: Seq::ZERO,
            latest_sending: Seq::ZERO,
            sending_packets: PacketCache::new(),
            earliest_unreceived: Seq::ZERO,
            latest_received: None,
            received_packets: PacketCache::new(),
            chunk_queue: VecDeque::new(),
            next_chunk_id: 0,
            sending_chunk: None,
            chunk_receiver: None,
            rtt: 0.0,
            rtt_dev: 3.0,
            packet_loss: 0.0,
            last_received: Instant::now(),
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.transport.peer()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn send(&mut self, packet: &Packet) -> Result<(), WireError> {
        let tag = packet.tag();
        match packet.kind() {
            PacketKind::Big => {
                let payload = packet.encode();
                let sender = ChunkSender::new(self.next_chunk_id, tag, &payload)?;
                self.next_chunk_id = self.next_chunk_id.wrapping_add(1);
                self.chunk_queue.push_back(sender);
                Ok(())
            }
            PacketKind::Reliable => {
                let mut data = vec![tag];
                data.extend_from_slice(&self.latest_sending.0.to_be_bytes());
                packet.write(&mut data);
                if data.len() + 8 > MTU {
                    return Err(WireError::Oversize {
                        len: data.len() + 8,
                        limit: MTU,
                    });
                }
                self.sending_packets.insert(self.latest_sending, (data, None));
                self.latest_sending = self.latest_sending.increment(1);
                Ok(())
            }
            PacketKind::Normal => {
                let mut data = vec![tag];
                packet.write(&mut data);
                if data.len() + 8 > MTU {
                    return Err(WireError::Oversize {
                        len: data.len() + 8,
                        limit: MTU,
                    });
                }
                self.transport.send(&data);
                Ok(())
            }
            PacketKind::Initial => Err(WireError::Unroutable),
        }
    }

    fn timeout_interval(&self) -> f64 {
        self.rtt + f64::max(RTO_GRANULARITY, RTO_K * self.rtt_dev)
    }

    pub fn update_rtt(&mut self, sample: f64) {
        self.rtt_dev = self.rtt_dev * (1.0 - RTT_DEV_GAIN) + (sample - self.rtt).abs() * RTT_DEV_GAIN;
        self.rtt = self.rtt * (1.0 - RTT_GAIN) + sample * RTT_GAIN;
    }

    fn packet_lost(&mut self) {
        self.packet_loss = self.packet_loss * (1.0 - LOSS_GAIN) + LOSS_GAIN;
    }

    fn packet_received(&mut self) {
        self.packet_loss *= 1.0 - LOSS_GAIN;
    }

    /// Drive retransmission and the chunk pipeline. Called once per
    /// application tick.
    pub fn update(&mut self) {
        let now = Instant::now();
        let interval = self.timeout_interval();

        let mut losses = 0;
        for i in 0..SEND_SCAN {
            let seq = self.earliest_sending.increment(i);
            if let Some((data, send_time)) = self.sending_packets.get_mut(seq) {
                let due = match send_time {
                    None => true,
                    Some(ts) => now.duration_since(*ts).as_secs_f64() > interval,
                };
                if due {
                    if send_time.is_some() {
                        losses += 1;
                        log::trace!("retransmitting reliable packet {}", seq);
                    }
                    self.transport.send(data);
                    *send_time = Some(now);
                }
            }
        }
        for _ in 0..losses {
            self.packet_lost();
        }

        match self.sending_chunk.as_ref().map(|chunk| chunk.done) {
            None => {
                if let Some(mut sender) = self.chunk_queue.pop_front() {
                    sender.initial_burst(&self.transport);
                    self.sending_chunk = Some(sender);
                }
            }
            Some(true) => {
                // The next chunk inherits the pacing deadline so the
                // 256 KiB/s budget spans the whole queue.
                let deadline = self.sending_chunk.as_ref().and_then(|chunk| chunk.deadline);
                match self.chunk_queue.pop_front() {
                    Some(mut next) => {
                        next.deadline = deadline;
                        self.sending_chunk = Some(next);
                    }
                    None => self.sending_chunk = None,
                }
            }
            Some(false) => {}
        }
        if let Some(chunk) = &mut self.sending_chunk {
            chunk.update(&self.transport);
        }
    }

    /// Process one raw datagram. Returns the packets it surfaced to the
    /// application, which for a reliable arrival can be a whole run of
    /// previously buffered packets.
    pub fn receive(&mut self, data: &[u8]) -> Vec<Packet> {
        if !frame::verify(data) {
            log::debug!("dropping datagram with a bad checksum");
            return Vec::new();
        }
        if data.len() < 9 {
            return Vec::new();
        }
        if data[4..8] != self.transport.salt() {
            log::debug!("dropping datagram with the wrong salt");
            return Vec::new();
        }

        self.last_received = Instant::now();

        let tag = data[8];
        let payload = &data[9..];
        if tag == 0 {
            self.handle_ack(payload);
            return Vec::new();
        }

        match Packet::kind_of(tag) {
            None => {
                log::debug!("dropping datagram with unknown tag {}", tag);
                Vec::new()
            }
            Some(PacketKind::Initial) => Vec::new(),
            Some(PacketKind::Normal) => match Packet::read(tag, payload) {
                Ok(packet) => vec![packet],
                Err(e) => {
                    log::debug!("dropping malformed packet: {}", e);
                    Vec::new()
                }
            },
            Some(PacketKind::Reliable) => self.receive_reliable(tag, payload),
            Some(PacketKind::Big) => self.receive_big(tag, payload),
        }
    }

    fn receive_reliable(&mut self, tag: u8, payload: &[u8]) -> Vec<Packet> {
        if payload.len() < 2 {
            return Vec::new();
        }
        let seq = Seq(u16::from_be_bytes([payload[0], payload[1]]));

        if !self.received_packets.contains(seq) {
            let packet = match Packet::read(tag, &payload[2..]) {
                Ok(packet) => packet,
                Err(e) => {
                    log::debug!("dropping malformed reliable packet: {}", e);
                    return Vec::new();
                }
            };
            self.latest_received = Some(match self.latest_received {
                None => seq,
                Some(latest) => latest.later(seq),
            });
            self.received_packets.insert(seq, packet);
        }

        self.send_reliable_ack();

        let mut packets = Vec::new();
        if self.earliest_unreceived == seq {
            let latest = match self.latest_received {
                Some(latest) => latest,
                None => return packets,
            };
            let mut cursor = self.earliest_unreceived;
            while cursor == latest || cursor.precedes(latest) {
                match self.received_packets.get(cursor) {
                    Some(packet) => packets.push(packet.clone()),
                    None => break,
                }
                cursor = cursor.increment(1);
            }
            self.earliest_unreceived = cursor;
        }
        packets
    }

    fn receive_big(&mut self, tag: u8, payload: &[u8]) -> Vec<Packet> {
        if payload.is_empty() {
            return Vec::new();
        }

        let replace = match &self.chunk_receiver {
            None => true,
            Some(receiver) => match receiver.chunk_id {
                Some(current) => {
                    if current.wrapping_add(1) == payload[0] {
                        if !receiver.done {
                            log::warn!("big packet dropped: a new chunk superseded it");
                        }
                        true
                    } else {
                        false
                    }
                }
                None => false,
            },
        };
        if replace {
            self.chunk_receiver = Some(ChunkReceiver::new(tag));
        }

        let Some(receiver) = &mut self.chunk_receiver else {
            return Vec::new();
        };
        match receiver.receive(tag, payload, &self.transport) {
            Some(assembled) => match Packet::read(tag, &assembled) {
                Ok(packet) => vec![packet],
                Err(e) => {
                    log::debug!("dropping malformed big packet: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }

    fn handle_ack(&mut self, payload: &[u8]) {
        match payload.len() {
            // chunk id + 32 byte slice bitfield
            33 => {
                let Some(chunk) = &mut self.sending_chunk else {
                    log::debug!("big ack arrived while nothing is sending");
                    return;
                };
                if chunk.chunk_id != payload[0] {
                    log::debug!("big ack for the wrong chunk id");
                    return;
                }
                chunk.handle_ack(&payload[1..]);
            }
            // latest sequence + 32 packet bitfield
            6 => {
                let latest = Seq(u16::from_be_bytes([payload[0], payload[1]]));
                let bits = wire::unpack_bits(&payload[2..6]);
                self.packet_received();

                let now = Instant::now();
                for i in 0..=bits.len() {
                    let acked = if i == 0 { true } else { bits[i - 1] };
                    if !acked {
                        continue;
                    }
                    let seq = latest.increment(-(i as i32));
                    let sample = match self.sending_packets.get(seq) {
                        Some((_, Some(ts))) => Some(now.duration_since(*ts).as_secs_f64()),
                        _ => None,
                    };
                    if let Some(sample) = sample {
                        self.update_rtt(sample);
                    }
                    self.sending_packets.remove(seq);
                    while !self.sending_packets.contains(self.earliest_sending)
                        && self.earliest_sending.precedes(self.latest_sending)
                    {
                        self.earliest_sending = self.earliest_sending.increment(1);
                    }
                }
            }
            _ => log::debug!("dropping ack with invalid size {}", payload.len()),
        }
    }

    fn send_reliable_ack(&self) {
        let Some(latest) = self.latest_received else {
            return;
        };
        let flags: Vec<bool> = (0..32)
            .map(|i| self.received_packets.contains(latest.increment(-(i + 1))))
            .collect();
        let mut body = vec![0u8];
        body.extend_from_slice(&latest.0.to_be_bytes());
        body.extend_from_slice(&wire::pack_bits(&flags));
        self.transport.send(&body);
    }

    /// Drain the socket (non-blocking) and surface application packets.
    pub fn poll(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut buf = [0u8; MTU];
        while let Some(size) = self.transport.try_recv(&mut buf) {
            packets.extend(self.receive(&buf[..size]));
        }
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    fn loopback_pair() -> (Transport, Transport) {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let addr_a = a.local_addr().unwrap();
        let addr_b = b.local_addr().unwrap();
        let salt = [9, 8, 7, 6];
        (
            Transport::new(a, Some(addr_b), salt),
            Transport::new(b, Some(addr_a), salt),
        )
    }

    #[test]
    fn normal_packets_arrive_immediately() {
        let (ta, tb) = loopback_pair();
        let mut a = Connection::new(ta);
        let mut b = Connection::new(tb);

        let packet = Packet::Disconnect {
            reason: "bye".into(),
        };
        a.send(&packet).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(b.poll(), vec![packet]);
    }

    #[test]
    fn reliable_packets_wait_for_the_update_pass() {
        let (ta, tb) = loopback_pair();
        let mut a = Connection::new(ta);
        let mut b = Connection::new(tb);

        let packet = Packet::DeleteObject { tick: 1, id: 2 };
        a.send(&packet).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(b.poll().is_empty());

        a.update();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(b.poll(), vec![packet]);
    }

    #[test]
    fn wrong_salt_is_dropped() {
        let (ta, tb) = loopback_pair();
        let a = Connection::new(ta);
        let mut b = Connection::new(tb);

        let mut body = vec![1, 2, 3, 4];
        body.push(15);
        body.extend_from_slice(b"nope");
        let sealed = frame::seal(&body);
        let b_addr = b.transport().socket().local_addr().unwrap();
        a.transport().socket().send_to(&sealed, b_addr).ok();

        std::thread::sleep(std::time::Duration::from_millis(20));
        let before = b.last_received;
        assert!(b.poll().is_empty());
        assert_eq!(b.last_received, before);
    }

    #[test]
    fn oversize_sends_are_rejected() {
        let (ta, _tb) = loopback_pair();
        let mut a = Connection::new(ta);
        let packet = Packet::Disconnect {
            reason: "x".repeat(MTU),
        };
        assert!(matches!(
            a.send(&packet),
            Err(WireError::Oversize { .. })
        ));
    }

    #[test]
    fn initial_packets_cannot_be_routed() {
        let (ta, _tb) = loopback_pair();
        let mut a = Connection::new(ta);
        let packet = Packet::InitConnectionServer { players: vec![] };
        assert!(matches!(a.send(&packet), Err(WireError::Unroutable)));
    }
}
