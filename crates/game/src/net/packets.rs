use glam::{DVec2, Vec2};
use serde_json::Value;

use super::wire::{self, Reader, WireError};

/// Delivery class of a packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Best effort, unordered.
    Normal,
    /// At-least-once on the wire, exactly-once and in-order to the app.
    Reliable,
    /// Sliced payload reassembled with selective acks.
    Big,
    /// Handshake payload only, never routed through a connection.
    Initial,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerIntro {
    pub name: String,
    pub colour: [u8; 3],
}

/// One entry of an `UpdateObjects` batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectState {
    pub id: u32,
    pub pos: Vec2,
    pub vel: Vec2,
    pub rot: f32,
    pub rot_vel: f32,
}

/// The ordered packet registry. Variant order is the wire protocol:
/// tags 1..=15 index this list and tag 0 is reserved for acks, so
/// reordering variants is a breaking protocol change.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    InitConnectionClient {
        tick: u32,
        ids: Vec<u32>,
    },
    InitConnectionServer {
        players: Vec<PlayerIntro>,
    },
    Script {
        body: String,
    },
    LevelProps {
        gravity: DVec2,
        spawn: DVec2,
    },
    UpdateClientInput {
        tick: u32,
        actions: Vec<(f32, f32)>,
    },
    PlayerState {
        tick: u32,
        id: u32,
        pos: DVec2,
        vel: DVec2,
        rot: f64,
        rot_vel: f64,
        action: (f32, f32),
    },
    UpdateClientResponse {
        client_tick: u32,
        server_tick: u32,
    },
    NewObject {
        tick: u32,
        id: u32,
        pos: DVec2,
        vel: DVec2,
        rot: f64,
        rot_vel: f64,
        record: Value,
    },
    DeleteObject {
        tick: u32,
        id: u32,
    },
    ObjectProps {
        tick: u32,
        id: u32,
        props: Value,
    },
    UpdateObjects {
        tick: u32,
        objects: Vec<ObjectState>,
    },
    NewConstraint {
        tick: u32,
        id_a: u32,
        id_b: u32,
        descriptor: Value,
    },
    NewPlayer {
        tick: u32,
        id: u32,
        name: String,
        colour: [u8; 3],
    },
    DeletePlayer {
        tick: u32,
        id: u32,
    },
    Disconnect {
        reason: String,
    },
}

impl Packet {
    pub fn tag(&self) -> u8 {
        match self {
            Packet::InitConnectionClient { .. } => 1,
            Packet::InitConnectionServer { .. } => 2,
            Packet::Script { .. } => 3,
            Packet::LevelProps { .. } => 4,
            Packet::UpdateClientInput { .. } => 5,
            Packet::PlayerState { .. } => 6,
            Packet::UpdateClientResponse { .. } => 7,
            Packet::NewObject { .. } => 8,
            Packet::DeleteObject { .. } => 9,
            Packet::ObjectProps { .. } => 10,
            Packet::UpdateObjects { .. } => 11,
            Packet::NewConstraint { .. } => 12,
            Packet::NewPlayer { .. } => 13,
            Packet::DeletePlayer { .. } => 14,
            Packet::Disconnect { .. } => 15,
        }
    }

    pub fn kind(&self) -> PacketKind {
        match Packet::kind_of(self.tag()) {
            Some(kind) => kind,
            None => unreachable!("registry tags are exhaustive"),
        }
    }

    pub fn kind_of(tag: u8) -> Option<PacketKind> {
        Some(match tag {
            1 => PacketKind::Reliable,
            2 => PacketKind::Initial,
            3 => PacketKind::Big,
            4 => PacketKind::Reliable,
            5 => PacketKind::Normal,
            6 => PacketKind::Normal,
            7 => PacketKind::Normal,
            8 => PacketKind::Reliable,
            9 => PacketKind::Reliable,
            10 => PacketKind::Reliable,
            11 => PacketKind::Normal,
            12 => PacketKind::Reliable,
            13 => PacketKind::Reliable,
            14 => PacketKind::Reliable,
            15 => PacketKind::Normal,
            _ => return None,
        })
    }

    /// Tick this packet should be applied at on the client, for packets
    /// whose semantics are tick-anchored. Clock-setting and untimed
    /// packets return `None` and are handled on arrival.
    pub fn group_tick(&self) -> Option<u32> {
        match self {
            Packet::PlayerState { tick, .. }
            | Packet::NewObject { tick, .. }
            | Packet::DeleteObject { tick, .. }
            | Packet::ObjectProps { tick, .. }
            | Packet::UpdateObjects { tick, .. }
            | Packet::NewConstraint { tick, .. }
            | Packet::NewPlayer { tick, .. }
            | Packet::DeletePlayer { tick, .. } => Some(*tick),
            _ => None,
        }
    }

    /// Append the payload encoding (everything after the tag byte).
    pub fn write(&self, buf: &mut Vec<u8>) {
        match self {
            Packet::InitConnectionClient { tick, ids } => {
                buf.extend_from_slice(&tick.to_le_bytes());
                for id in ids {
                    buf.extend_from_slice(&id.to_le_bytes());
                }
            }
            Packet::InitConnectionServer { players } => {
                buf.push(players.len() as u8);
                for player in players {
                    wire::write_name(buf, &player.name);
                    buf.extend_from_slice(&player.colour);
                }
            }
            Packet::Script { body } => {
                buf.extend_from_slice(body.as_bytes());
            }
            Packet::LevelProps { gravity, spawn } => {
                wire::write_dvec2(buf, *gravity);
                wire::write_dvec2(buf, *spawn);
            }
            Packet::UpdateClientInput { tick, actions } => {
                buf.extend_from_slice(&tick.to_le_bytes());
                for (x, y) in actions {
                    buf.extend_from_slice(&x.to_le_bytes());
                    buf.extend_from_slice(&y.to_le_bytes());
                }
            }
            Packet::PlayerState {
                tick,
                id,
                pos,
                vel,
                rot,
                rot_vel,
                action,
            } => {
                buf.extend_from_slice(&tick.to_le_bytes());
                buf.extend_from_slice(&id.to_le_bytes());
                wire::write_dvec2(buf, *pos);
                wire::write_dvec2(buf, *vel);
                buf.extend_from_slice(&rot.to_le_bytes());
                buf.extend_from_slice(&rot_vel.to_le_bytes());
                buf.extend_from_slice(&action.0.to_le_bytes());
                buf.extend_from_slice(&action.1.to_le_bytes());
            }
            Packet::UpdateClientResponse {
                client_tick,
                server_tick,
            } => {
                buf.extend_from_slice(&client_tick.to_le_bytes());
                buf.extend_from_slice(&server_tick.to_le_bytes());
            }
            Packet::NewObject {
                tick,
                id,
                pos,
                vel,
                rot,
                rot_vel,
                record,
            } => {
                buf.extend_from_slice(&tick.to_le_bytes());
                buf.extend_from_slice(&id.to_le_bytes());
                wire::write_dvec2(buf, *pos);
                wire::write_dvec2(buf, *vel);
                buf.extend_from_slice(&rot.to_le_bytes());
                buf.extend_from_slice(&rot_vel.to_le_bytes());
                buf.extend_from_slice(record.to_string().as_bytes());
            }
            Packet::DeleteObject { tick, id } => {
                buf.extend_from_slice(&tick.to_le_bytes());
                buf.extend_from_slice(&id.to_le_bytes());
            }
            Packet::ObjectProps { tick, id, props } => {
                buf.extend_from_slice(&tick.to_le_bytes());
                buf.extend_from_slice(&id.to_le_bytes());
                buf.extend_from_slice(props.to_string().as_bytes());
            }
            Packet::UpdateObjects { tick, objects } => {
                buf.extend_from_slice(&tick.to_le_bytes());
                for obj in objects {
                    buf.extend_from_slice(&obj.id.to_le_bytes());
                    buf.extend_from_slice(&obj.pos.x.to_le_bytes());
                    buf.extend_from_slice(&obj.pos.y.to_le_bytes());
                    buf.extend_from_slice(&obj.vel.x.to_le_bytes());
                    buf.extend_from_slice(&obj.vel.y.to_le_bytes());
                    buf.extend_from_slice(&obj.rot.to_le_bytes());
                    buf.extend_from_slice(&obj.rot_vel.to_le_bytes());
                }
            }
            Packet::NewConstraint {
                tick,
                id_a,
                id_b,
                descriptor,
            } => {
                buf.extend_from_slice(&tick.to_le_bytes());
                buf.extend_from_slice(&id_a.to_le_bytes());
                buf.extend_from_slice(&id_b.to_le_bytes());
                buf.extend_from_slice(descriptor.to_string().as_bytes());
            }
            Packet::NewPlayer {
                tick,
                id,
                name,
                colour,
            } => {
                buf.extend_from_slice(&tick.to_le_bytes());
                buf.extend_from_slice(&id.to_le_bytes());
                wire::write_name(buf, name);
                buf.extend_from_slice(colour);
            }
            Packet::DeletePlayer { tick, id } => {
                buf.extend_from_slice(&tick.to_le_bytes());
                buf.extend_from_slice(&id.to_le_bytes());
            }
            Packet::Disconnect { reason } => {
                buf.extend_from_slice(reason.as_bytes());
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write(&mut buf);
        buf
    }

    /// Decode the payload of the packet type registered under `tag`.
    pub fn read(tag: u8, payload: &[u8]) -> Result<Packet, WireError> {
        let mut cur = Reader::new(payload);
        let packet = match tag {
            1 => {
                let tick = wire::read_u32(&mut cur)?;
                let mut ids = Vec::new();
                while wire::remaining(&cur) >= 4 {
                    ids.push(wire::read_u32(&mut cur)?);
                }
                Packet::InitConnectionClient { tick, ids }
            }
            2 => {
                let count = match payload.first() {
                    Some(&n) => n as usize,
                    None => return Err(WireError::Truncated),
                };
                cur.set_position(1);
                let mut players = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = wire::read_name(&mut cur)?;
                    let colour = wire::read_rgb(&mut cur)?;
                    players.push(PlayerIntro { name, colour });
                }
                Packet::InitConnectionServer { players }
            }
            3 => Packet::Script {
                body: wire::read_utf8(&mut cur)?,
            },
            4 => Packet::LevelProps {
                gravity: wire::read_dvec2(&mut cur)?,
                spawn: wire::read_dvec2(&mut cur)?,
            },
            5 => {
                let tick = wire::read_u32(&mut cur)?;
                let mut actions = Vec::new();
                while wire::remaining(&cur) >= 8 {
                    actions.push((wire::read_f32(&mut cur)?, wire::read_f32(&mut cur)?));
                }
                Packet::UpdateClientInput { tick, actions }
            }
            6 => Packet::PlayerState {
                tick: wire::read_u32(&mut cur)?,
                id: wire::read_u32(&mut cur)?,
                pos: wire::read_dvec2(&mut cur)?,
                vel: wire::read_dvec2(&mut cur)?,
                rot: wire::read_f64(&mut cur)?,
                rot_vel: wire::read_f64(&mut cur)?,
                action: (wire::read_f32(&mut cur)?, wire::read_f32(&mut cur)?),
            },
            7 => Packet::UpdateClientResponse {
                client_tick: wire::read_u32(&mut cur)?,
                server_tick: wire::read_u32(&mut cur)?,
            },
            8 => Packet::NewObject {
                tick: wire::read_u32(&mut cur)?,
                id: wire::read_u32(&mut cur)?,
                pos: wire::read_dvec2(&mut cur)?,
                vel: wire::read_dvec2(&mut cur)?,
                rot: wire::read_f64(&mut cur)?,
                rot_vel: wire::read_f64(&mut cur)?,
                record: wire::read_json(&mut cur)?,
            },
            9 => Packet::DeleteObject {
                tick: wire::read_u32(&mut cur)?,
                id: wire::read_u32(&mut cur)?,
            },
            10 => Packet::ObjectProps {
                tick: wire::read_u32(&mut cur)?,
                id: wire::read_u32(&mut cur)?,
                props: wire::read_json(&mut cur)?,
            },
            11 => {
                let tick = wire::read_u32(&mut cur)?;
                let mut objects = Vec::new();
                while wire::remaining(&cur) >= 28 {
                    objects.push(ObjectState {
                        id: wire::read_u32(&mut cur)?,
                        pos: Vec2::new(wire::read_f32(&mut cur)?, wire::read_f32(&mut cur)?),
                        vel: Vec2::new(wire::read_f32(&mut cur)?, wire::read_f32(&mut cur)?),
                        rot: wire::read_f32(&mut cur)?,
                        rot_vel: wire::read_f32(&mut cur)?,
                    });
                }
                Packet::UpdateObjects { tick, objects }
            }
            12 => Packet::NewConstraint {
                tick: wire::read_u32(&mut cur)?,
                id_a: wire::read_u32(&mut cur)?,
                id_b: wire::read_u32(&mut cur)?,
                descriptor: wire::read_json(&mut cur)?,
            },
            13 => Packet::NewPlayer {
                tick: wire::read_u32(&mut cur)?,
                id: wire::read_u32(&mut cur)?,
                name: wire::read_name(&mut cur)?,
                colour: wire::read_rgb(&mut cur)?,
            },
            14 => Packet::DeletePlayer {
                tick: wire::read_u32(&mut cur)?,
                id: wire::read_u32(&mut cur)?,
            },
            15 => Packet::Disconnect {
                reason: wire::read_utf8(&mut cur)?,
            },
            other => return Err(WireError::UnknownTag(other)),
        };
        Ok(packet)
    }
}
