use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::frame::MTU;
use super::transport::Transport;
use super::wire::{self, WireError};

/// crc(4) + salt(4) + tag(1) + chunk id(1) + slice count(1) + slice index(1)
const SLICE_HEADER: usize = 12;
pub const SLICE_DATA: usize = MTU - SLICE_HEADER;

/// The one-byte slice count field caps a chunk at 255 slices.
pub const MAX_SLICES: usize = 255;

const INITIAL_BURST: usize = 128;

/// Steady-state pacing: one slice per this many seconds, i.e. 256 KiB/s.
fn slice_pace() -> Duration {
    Duration::from_secs_f64(MTU as f64 / (256.0 * 1024.0))
}

/// Outbound side of one BIG packet: owns the slices and a fair
/// retransmit ring that keeps cycling until every slice is acked.
pub struct ChunkSender {
    pub chunk_id: u8,
    slices: Vec<Vec<u8>>,
    send_queue: VecDeque<usize>,
    pub deadline: Option<Instant>,
    pub done: bool,
}

impl ChunkSender {
    pub fn new(chunk_id: u8, tag: u8, payload: &[u8]) -> Result<Self, WireError> {
        let count = payload.len().div_ceil(SLICE_DATA).max(1);
        if count > MAX_SLICES {
            return Err(WireError::Oversize {
                len: payload.len(),
                limit: MAX_SLICES * SLICE_DATA,
            });
        }

        let mut slices = Vec::with_capacity(count);
        let mut send_queue = VecDeque::with_capacity(count);
        for index in 0..count {
            let start = index * SLICE_DATA;
            let end = (start + SLICE_DATA).min(payload.len());
            let mut slice = Vec::with_capacity(4 + end - start);
            slice.extend_from_slice(&[tag, chunk_id, count as u8, index as u8]);
            slice.extend_from_slice(&payload[start..end]);
            slices.push(slice);
            send_queue.push_back(index);
        }

        Ok(Self {
            chunk_id,
            slices,
            send_queue,
            deadline: None,
            done: false,
        })
    }

    /// Fire the first wave of slices, then let the pacer take over.
    pub fn initial_burst(&mut self, transport: &Transport) {
        let burst = self.send_queue.len().min(INITIAL_BURST);
        for _ in 0..burst {
            if let Some(index) = self.send_queue.pop_front() {
                transport.send(&self.slices[index]);
                self.send_queue.push_back(index);
            }
        }
        self.deadline = Some(Instant::now() + slice_pace() * 5);
    }

    /// Selective ack over all 256 slice indices.
    pub fn handle_ack(&mut self, bitfield: &[u8]) {
        let acked = wire::unpack_bits(bitfield);
        self.send_queue
            .retain(|&index| !acked.get(index).copied().unwrap_or(false));
        if self.send_queue.is_empty() {
            self.done = true;
        }
    }

    /// Retransmit slices that have come due, rotating the ring so every
    /// outstanding slice gets equal airtime.
    pub fn update(&mut self, transport: &Transport) {
        let Some(mut deadline) = self.deadline else {
            return;
        };
        let now = Instant::now();
        let pace = slice_pace();
        let mut sent = 0;
        while deadline < now && sent < self.send_queue.len() {
            if let Some(index) = self.send_queue.pop_front() {
                self.send_queue.push_back(index);
                transport.send(&self.slices[index]);
            }
            deadline += pace;
            sent += 1;
        }
        self.deadline = Some(deadline);
    }
}

/// Inbound side of one BIG packet. Acks every slice it sees so the
/// sender can retire them.
pub struct ChunkReceiver {
    tag: u8,
    pub chunk_id: Option<u8>,
    slices: Vec<Option<Vec<u8>>>,
    remaining: usize,
    pub done: bool,
}

impl ChunkReceiver {
    pub fn new(tag: u8) -> Self {
        Self {
            tag,
            chunk_id: None,
            slices: Vec::new(),
            remaining: 0,
            done: false,
        }
    }

    /// Feed one slice datagram body (after the tag byte). Returns the
    /// reassembled payload once the final slice lands.
    pub fn receive(&mut self, tag: u8, body: &[u8], transport: &Transport) -> Option<Vec<u8>> {
        if body.len() < 3 {
            return None;
        }
        let (chunk_id, count, index) = (body[0], body[1] as usize, body[2] as usize);

        match self.chunk_id {
            None => {
                self.chunk_id = Some(chunk_id);
                self.slices = vec![None; count];
                self.remaining = count;
            }
            Some(current) if current != chunk_id => return None,
            Some(_) => {}
        }

        if tag != self.tag {
            log::warn!("big slice arrived with mismatched packet tag");
            return None;
        }
        if count != self.slices.len() || index >= count {
            log::warn!("big slice arrived with inconsistent framing");
            return None;
        }

        let mut assembled = None;
        if self.slices[index].is_none() {
            self.remaining -= 1;
            self.slices[index] = Some(body[3..].to_vec());
            if self.remaining == 0 {
                self.done = true;
                let mut payload = Vec::new();
                for slice in &self.slices {
                    if let Some(data) = slice {
                        payload.extend_from_slice(data);
                    }
                }
                assembled = Some(payload);
            }
        }

        self.send_ack(transport);
        assembled
    }

    fn send_ack(&self, transport: &Transport) {
        let Some(chunk_id) = self.chunk_id else {
            return;
        };
        let mut flags = [false; 256];
        for (i, slice) in self.slices.iter().enumerate() {
            flags[i] = slice.is_some();
        }
        let mut body = vec![0u8, chunk_id];
        body.extend_from_slice(&wire::pack_bits(&flags));
        transport.send(&body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_layout() {
        let payload = vec![7u8; SLICE_DATA + 10];
        let sender = ChunkSender::new(3, 9, &payload).unwrap();
        assert_eq!(sender.slices.len(), 2);
        assert_eq!(&sender.slices[0][..4], &[9, 3, 2, 0]);
        assert_eq!(&sender.slices[1][..4], &[9, 3, 2, 1]);
        assert_eq!(sender.slices[1].len(), 4 + 10);
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let payload = vec![0u8; MAX_SLICES * SLICE_DATA + 1];
        assert!(ChunkSender::new(0, 1, &payload).is_err());
    }

    #[test]
    fn ack_retires_slices() {
        let payload = vec![1u8; SLICE_DATA * 3];
        let mut sender = ChunkSender::new(0, 1, &payload).unwrap();

        let mut flags = [false; 256];
        flags[0] = true;
        flags[2] = true;
        sender.handle_ack(&wire::pack_bits(&flags));
        assert_eq!(sender.send_queue.len(), 1);
        assert!(!sender.done);

        flags[1] = true;
        sender.handle_ack(&wire::pack_bits(&flags));
        assert!(sender.done);
    }

    #[test]
    fn empty_payload_still_has_one_slice() {
        let sender = ChunkSender::new(0, 1, &[]).unwrap();
        assert_eq!(sender.slices.len(), 1);
    }
}
