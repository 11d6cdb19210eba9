use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tumble::net::{Packet, ThreadedConnectionHandler};
use tumble::world::WorldEvent;
use tumble::World;

use crate::sync::ObjectSync;

const TIMEOUT: Duration = Duration::from_secs(3);
const UPDATE_BATCH: usize = 20;

struct Peer {
    player_ids: Vec<u32>,
}

/// The authoritative server: owns the world, applies client inputs at
/// the tick they were issued for, and broadcasts state at
/// priority-driven rates. All networking happens through the threaded
/// handler; this struct only ever touches it under its lock, once per
/// tick plus short reply bursts.
pub struct Server {
    pub world: World,
    handler: ThreadedConnectionHandler,
    syncs: Vec<ObjectSync>,
    /// tick → player id → action staged for that tick.
    actions: HashMap<u32, HashMap<u32, (f32, f32)>>,
    player_ids: HashMap<u32, usize>,
    peers: HashMap<SocketAddr, Peer>,
    pending_constraints: Vec<Packet>,
    next_player_id: u32,
    pub client_script: Option<String>,
    pub paused: bool,
}

impl Server {
    pub fn new(world: World, client_script: Option<String>, port: u16) -> std::io::Result<Self> {
        let handler = ThreadedConnectionHandler::bind(("0.0.0.0", port))?;
        let mut server = Self {
            world,
            handler,
            syncs: Vec::new(),
            actions: HashMap::new(),
            player_ids: HashMap::new(),
            peers: HashMap::new(),
            pending_constraints: Vec::new(),
            next_player_id: 0,
            client_script,
            paused: false,
        };
        server.load_world_syncs();
        Ok(server)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.handler.local_addr()
    }

    fn load_world_syncs(&mut self) {
        self.world.take_events();
        self.syncs = self
            .world
            .object_ids()
            .into_iter()
            .map(ObjectSync::new)
            .collect();
    }

    /// One server tick.
    pub fn update(&mut self) {
        self.handler.update();

        let (inbox, joins, timed_out) = {
            let mut state = self.handler.lock();
            let timed_out: Vec<SocketAddr> = state
                .connections
                .iter()
                .filter(|(_, connection)| connection.last_received.elapsed() > TIMEOUT)
                .map(|(&addr, _)| addr)
                .collect();
            (
                std::mem::take(&mut state.inbox),
                std::mem::take(&mut state.joins),
                timed_out,
            )
        };
        for addr in timed_out {
            self.kick(addr, "Timed out");
        }
        for (addr, payload) in joins {
            self.handle_join(addr, payload);
        }
        for (addr, packet) in inbox {
            self.handle_packet(addr, packet);
        }

        let tick = self.world.tick_u32();
        let staged = self.actions.remove(&tick).unwrap_or_default();
        let mut applied: Vec<u32> = Vec::new();
        for (&id, &action) in &staged {
            if let Some(&slot) = self.player_ids.get(&id) {
                self.world.set_player_action(slot, action);
                applied.push(id);
            }
        }

        if !self.paused {
            self.world.update(1.0);
        }

        self.process_world_events();

        let mut out = Vec::new();
        let mut updating = Vec::new();
        for sync in &mut self.syncs {
            sync.update(&mut self.world, &mut out);
            if sync.priority >= 1.0 {
                if let Some(state) = sync.state(&self.world) {
                    updating.push(state);
                }
                sync.reset(&self.world);
            }
        }
        for packet in &out {
            self.send_all(packet);
        }

        let pending: Vec<Packet> = self.pending_constraints.drain(..).collect();
        for packet in &pending {
            self.send_all(packet);
        }

        let tick = self.world.tick_u32();
        for chunk in updating.chunks(UPDATE_BATCH) {
            self.send_all(&Packet::UpdateObjects {
                tick,
                objects: chunk.to_vec(),
            });
        }

        applied.sort_unstable();
        for id in applied {
            if let Some(packet) = self.player_state_packet(id) {
                self.send_all(&packet);
            }
        }
    }

    fn process_world_events(&mut self) {
        let tick = self.world.tick_u32();
        for event in self.world.take_events() {
            match event {
                WorldEvent::ObjectAdded { id } => self.syncs.push(ObjectSync::new(id)),
                WorldEvent::ObjectRemoved { id } => {
                    self.syncs.retain(|sync| sync.id != id);
                    self.send_all(&Packet::DeleteObject { tick, id });
                }
                WorldEvent::ConstraintAdded {
                    id_a,
                    id_b,
                    descriptor,
                } => self.pending_constraints.push(Packet::NewConstraint {
                    tick,
                    id_a,
                    id_b,
                    descriptor,
                }),
            }
        }
    }

    fn handle_packet(&mut self, addr: SocketAddr, packet: Packet) {
        match packet {
            Packet::UpdateClientInput { tick, actions } => self.handle_input(addr, tick, actions),
            Packet::Disconnect { reason } => {
                if self.peers.contains_key(&addr) {
                    log::info!("player disconnected: {}", reason);
                    self.disconnect(addr);
                }
            }
            other => log::debug!("unexpected packet tag {} from {}", other.tag(), addr),
        }
    }

    fn handle_input(&mut self, addr: SocketAddr, tick: u32, actions: Vec<(f32, f32)>) {
        let Some(peer) = self.peers.get(&addr) else {
            log::warn!("client update from an unregistered peer {}", addr);
            return;
        };
        if !actions
            .iter()
            .all(|(x, y)| x.abs() <= 1.0 && y.abs() <= 1.0)
        {
            log::warn!("{} tried to perform an invalid action", addr);
            return;
        }
        if actions.len() != peer.player_ids.len() {
            log::warn!(
                "action update from {} with the wrong player count: {} != {}",
                addr,
                actions.len(),
                peer.player_ids.len()
            );
            return;
        }

        let staged = self.actions.entry(tick).or_default();
        for (id, action) in peer.player_ids.iter().zip(&actions) {
            staged.insert(*id, *action);
        }

        self.send_to(
            addr,
            &Packet::UpdateClientResponse {
                client_tick: tick,
                server_tick: self.world.tick_u32(),
            },
        );
    }

    fn handle_join(&mut self, addr: SocketAddr, payload: Option<Packet>) {
        let Some(Packet::InitConnectionServer { players }) = payload else {
            log::warn!("connection from {} without an init payload", addr);
            self.handler.disconnect(addr);
            return;
        };
        if players.is_empty() {
            self.handler.disconnect(addr);
            return;
        }

        let tick = self.world.tick_u32();
        let ids: Vec<u32> = (0..players.len() as u32)
            .map(|offset| self.next_player_id + offset)
            .collect();
        self.next_player_id += players.len() as u32;

        // The full world state for the newcomer.
        let mut packets = Vec::new();
        packets.push(Packet::InitConnectionClient {
            tick,
            ids: ids.clone(),
        });
        if let Some(script) = &self.client_script {
            packets.push(Packet::Script {
                body: script.clone(),
            });
        }
        packets.push(Packet::LevelProps {
            gravity: self.world.gravity(),
            spawn: self.world.spawn,
        });
        for sync in &self.syncs {
            sync.creation_packets(&self.world, &mut packets);
        }
        for (id_a, id_b, descriptor) in self.world.wire_constraints() {
            packets.push(Packet::NewConstraint {
                tick,
                id_a,
                id_b,
                descriptor,
            });
        }
        let mut existing: Vec<u32> = self.player_ids.keys().copied().collect();
        existing.sort_unstable();
        for id in existing {
            let Some(&slot) = self.player_ids.get(&id) else {
                continue;
            };
            let (Some(player), Some(meta)) =
                (self.world.player_meta(slot), self.world.meta(slot))
            else {
                continue;
            };
            packets.push(Packet::NewPlayer {
                tick,
                id,
                name: player.name.clone(),
                colour: meta.colour,
            });
        }
        {
            let mut state = self.handler.lock();
            if let Some(connection) = state.connections.get_mut(&addr) {
                for packet in &packets {
                    if let Err(e) = connection.send(packet) {
                        log::warn!("join dump to {} failed: {}", addr, e);
                    }
                }
            }
        }

        let mut names = Vec::new();
        for (id, intro) in ids.iter().zip(&players) {
            let slot = self.world.add_player(&intro.name, intro.colour);
            self.player_ids.insert(*id, slot);
            names.push(intro.name.clone());

            let announce = Packet::NewPlayer {
                tick,
                id: *id,
                name: intro.name.clone(),
                colour: intro.colour,
            };
            let mut state = self.handler.lock();
            for (&other, connection) in state.connections.iter_mut() {
                if other != addr {
                    let _ = connection.send(&announce);
                }
            }
        }

        self.peers.insert(addr, Peer { player_ids: ids });
        log::info!("{} joined", names.join(", "));
    }

    pub fn kick(&mut self, addr: SocketAddr, reason: &str) {
        self.send_to(
            addr,
            &Packet::Disconnect {
                reason: reason.to_string(),
            },
        );
        log::info!("kicking {}: {}", addr, reason);
        self.disconnect(addr);
    }

    fn disconnect(&mut self, addr: SocketAddr) {
        let Some(peer) = self.peers.remove(&addr) else {
            self.handler.disconnect(addr);
            return;
        };
        let tick = self.world.tick_u32();
        let mut names = Vec::new();
        for id in peer.player_ids {
            if let Some(slot) = self.player_ids.remove(&id) {
                if let Some(player) = self.world.player_meta(slot) {
                    names.push(player.name.clone());
                }
                self.world.remove_player(slot);
            }
            self.send_all(&Packet::DeletePlayer { tick, id });
        }
        self.handler.disconnect(addr);
        if !names.is_empty() {
            log::info!("{} left", names.join(", "));
        }
    }

    /// Hot level reload: tear the old world down on every client,
    /// install the new one under the same clock, and re-register the
    /// connected players.
    pub fn set_world(&mut self, mut world: World, client_script: Option<String>) {
        let tick = self.world.tick_u32();
        for id in self.world.object_ids() {
            self.send_all(&Packet::DeleteObject { tick, id });
        }

        world.tick = self.world.tick;

        let old_player_ids = std::mem::take(&mut self.player_ids);
        let mut id_order: Vec<u32> = old_player_ids.keys().copied().collect();
        id_order.sort_unstable();
        for id in id_order {
            let old_slot = old_player_ids[&id];
            let (name, colour) = match (
                self.world.player_meta(old_slot),
                self.world.meta(old_slot),
            ) {
                (Some(player), Some(meta)) => (player.name.clone(), meta.colour),
                _ => continue,
            };
            let slot = world.add_player(&name, colour);
            self.player_ids.insert(id, slot);
        }

        self.world = world;
        self.actions.clear();
        self.pending_constraints.clear();
        self.load_world_syncs();

        self.send_all(&Packet::LevelProps {
            gravity: self.world.gravity(),
            spawn: self.world.spawn,
        });

        // An empty script body retracts a previously pushed script.
        match (&client_script, &self.client_script) {
            (Some(script), _) => self.send_all(&Packet::Script {
                body: script.clone(),
            }),
            (None, Some(_)) => self.send_all(&Packet::Script {
                body: String::new(),
            }),
            (None, None) => {}
        }
        self.client_script = client_script;

        let mut out = Vec::new();
        for sync in &mut self.syncs {
            sync.update(&mut self.world, &mut out);
        }
        for packet in &out {
            self.send_all(packet);
        }
        let tick = self.world.tick_u32();
        for (id_a, id_b, descriptor) in self.world.wire_constraints() {
            self.send_all(&Packet::NewConstraint {
                tick,
                id_a,
                id_b,
                descriptor,
            });
        }
    }

    fn player_state_packet(&self, id: u32) -> Option<Packet> {
        let &slot = self.player_ids.get(&id)?;
        let body = self.world.body(slot)?;
        let player = self.world.player_meta(slot)?;
        Some(Packet::PlayerState {
            tick: self.world.tick_u32(),
            id,
            pos: body.pos,
            vel: body.vel,
            rot: body.rot,
            rot_vel: body.rot_vel,
            action: player.action,
        })
    }

    pub fn send_all(&self, packet: &Packet) {
        self.handler.send_all(packet);
    }

    fn send_to(&self, addr: SocketAddr, packet: &Packet) {
        let mut state = self.handler.lock();
        if let Some(connection) = state.connections.get_mut(&addr) {
            if let Err(e) = connection.send(packet) {
                log::warn!("send to {} failed: {}", addr, e);
            }
        }
    }

    /// One line per connection for the operator's `s` command.
    pub fn status(&self) -> Vec<String> {
        let state = self.handler.lock();
        let mut lines = Vec::new();
        for (addr, peer) in &self.peers {
            let names: Vec<String> = peer
                .player_ids
                .iter()
                .filter_map(|id| {
                    let &slot = self.player_ids.get(id)?;
                    Some(self.world.player_meta(slot)?.name.clone())
                })
                .collect();
            let stats = state
                .connections
                .get(addr)
                .map(|connection| {
                    format!(
                        "ping={:.2}±{:.2}ms loss={:.1}%",
                        connection.rtt * 1000.0,
                        connection.rtt_dev * 1000.0,
                        connection.packet_loss * 100.0
                    )
                })
                .unwrap_or_else(|| "no connection".to_string());
            lines.push(format!("{}: {}", names.join(", "), stats));
        }
        lines
    }

    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    pub fn stop(mut self, reason: &str) {
        self.send_all(&Packet::Disconnect {
            reason: reason.to_string(),
        });
        self.handler.stop();
    }
}
