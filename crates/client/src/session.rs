use std::collections::HashMap;
use std::time::{Duration, Instant};

use glam::DVec2;

use tumble::net::{Connection, Packet, PacketKind};
use tumble::script::validate;
use tumble::World;

use crate::drawer::Drawer;
use crate::input::InputSource;

const TIMEOUT: Duration = Duration::from_secs(3);
const TICK_RATE: f64 = 60.0;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("disconnected by the server: {0}")]
    Disconnected(String),
    #[error("server connection timed out")]
    TimedOut,
}

/// The client's game session: a sim world that tracks what the server
/// is believed to have simulated, a draw world trailing it through the
/// interpolation filter, and the prediction bookkeeping that replays
/// local inputs when the sim world catches up to server packets.
pub struct Session {
    pub sim: World,
    pub drawer: Drawer,
    pub connection: Connection,
    /// sim slot → draw slot, for everything mirrored in both worlds.
    object_map: HashMap<usize, usize>,
    local_sim_slots: Vec<usize>,
    local_draw_slots: Vec<usize>,
    ids: Option<Vec<u32>>,
    player_ids: HashMap<u32, usize>,
    /// tick → send time, for RTT from `UpdateClientResponse`.
    time_map: HashMap<u32, Instant>,
    /// tick → predicted actions for the local players.
    actions: HashMap<u32, Vec<(f32, f32)>>,
    sent_tick: u32,
    last_load: f64,
    disconnect_message: Option<String>,
}

impl Session {
    pub fn new(connection: Connection, players: &[(String, [u8; 3])]) -> Self {
        let mut sim = World::new(false);
        let mut drawer = Drawer::new();
        let mut object_map = HashMap::new();
        let mut local_sim_slots = Vec::new();
        let mut local_draw_slots = Vec::new();

        for (name, colour) in players {
            let sim_slot = sim.add_player(name, *colour);
            let draw_slot = drawer.world.add_player(name, *colour);
            object_map.insert(sim_slot, draw_slot);
            local_sim_slots.push(sim_slot);
            local_draw_slots.push(draw_slot);
        }

        Self {
            sim,
            drawer,
            connection,
            object_map,
            local_sim_slots,
            local_draw_slots,
            ids: None,
            player_ids: HashMap::new(),
            time_map: HashMap::new(),
            actions: HashMap::new(),
            sent_tick: 0,
            last_load: 0.0,
            disconnect_message: None,
        }
    }

    /// One client frame: drain the network, surface fatal conditions,
    /// refresh the draw world, predict and send inputs, advance the
    /// draw clock.
    pub fn update(&mut self, input: &mut dyn InputSource) -> Result<(), SessionError> {
        let packets = self.connection.poll();
        self.process_packets(packets);

        if let Some(reason) = self.disconnect_message.take() {
            return Err(SessionError::Disconnected(reason));
        }
        if self.connection.last_received.elapsed() > TIMEOUT {
            let _ = self.connection.send(&Packet::Disconnect {
                reason: "Timed Out".to_string(),
            });
            return Err(SessionError::TimedOut);
        }

        if self.sim.tick > self.last_load {
            self.drawer.load(&self.sim, &self.object_map);
            self.last_load = self.sim.tick;
        }

        let mut actions = Vec::with_capacity(self.local_draw_slots.len());
        for (index, &draw_slot) in self.local_draw_slots.iter().enumerate() {
            let action = input.action(index);
            self.drawer.world.set_player_action(draw_slot, action);
            actions.push(action);
        }

        let target = self.drawer.world.tick.round().max(0.0) as u32;
        let mut start = self.sent_tick + 1;
        if let Some(&staged_max) = self.actions.keys().max() {
            start = start.max(staged_max);
        }
        for tick in start..=target {
            self.actions.insert(tick, actions.clone());
        }

        if self.ids.is_some() {
            while self.sent_tick < target {
                self.sent_tick += 1;
                self.time_map.insert(self.sent_tick, Instant::now());
                if let Some(list) = self.actions.get(&self.sent_tick) {
                    let _ = self.connection.send(&Packet::UpdateClientInput {
                        tick: self.sent_tick,
                        actions: list.clone(),
                    });
                }
            }
        }

        self.drawer.update();
        Ok(())
    }

    /// Group packets by how far ahead of the sim world they are, then
    /// apply each group after advancing the sim world to its tick.
    /// Untimed packets apply immediately; stale reliable packets are
    /// still informational, stale state packets are dropped later by
    /// their handlers.
    pub fn process_packets(&mut self, packets: Vec<Packet>) {
        let mut groups: Vec<Vec<Packet>> = Vec::new();
        for packet in packets {
            // Untimed packets applied below can move the sim clock
            // (joining does), so the reference tick is re-read here.
            let sim_tick = self.sim.tick_u32();
            match packet.group_tick() {
                None => self.apply(packet),
                // State broadcasts that outrun our own join reference a
                // clock we have not learnt yet.
                Some(_) if self.ids.is_none() && packet.kind() == PacketKind::Normal => {}
                Some(tick) if tick < sim_tick => {
                    if packet.kind() != PacketKind::Normal {
                        self.apply(packet);
                    }
                }
                Some(tick) => {
                    let ahead = (tick - sim_tick) as usize;
                    if groups.len() < ahead + 1 {
                        groups.resize_with(ahead + 1, Vec::new);
                    }
                    groups[ahead].push(packet);
                }
            }
        }

        for (index, group) in groups.into_iter().enumerate() {
            if index != 0 {
                self.advance_sim();
            }
            for packet in group {
                self.apply(packet);
            }
        }
    }

    /// Advance the sim world one tick, replaying the actions predicted
    /// for it.
    fn advance_sim(&mut self) {
        let tick = self.sim.tick_u32();
        if let Some(actions) = self.actions.remove(&tick) {
            for (&slot, &action) in self.local_sim_slots.iter().zip(&actions) {
                self.sim.set_player_action(slot, action);
            }
        }
        self.sim.update(1.0);
    }

    fn catch_up(&mut self, tick: u32) {
        while tick > self.sim.tick_u32() {
            self.advance_sim();
        }
    }

    fn apply(&mut self, packet: Packet) {
        match packet {
            Packet::InitConnectionClient { tick, ids } => {
                self.sim.tick = tick as f64;
                self.drawer.world.tick = tick as f64;
                self.drawer.target_tick = (tick + 5) as f64;
                self.sent_tick = tick;
                for (id, &slot) in ids.iter().zip(&self.local_sim_slots) {
                    self.player_ids.insert(*id, slot);
                }
                self.ids = Some(ids);
            }
            Packet::Script { body } => {
                // Pushed scripts must pass validation before they run.
                if let Some(violation) = validate(&body) {
                    log::error!("rejecting server script: {}", violation);
                    return;
                }
                match self.sim.load_script(&body) {
                    Ok(()) => self.sim.announce_objects_to_script(),
                    Err(e) => log::warn!("server script failed to load: {}", e),
                }
            }
            Packet::LevelProps { gravity, spawn } => {
                self.sim.set_gravity(gravity);
                self.sim.spawn = spawn;
                self.drawer.world.set_gravity(gravity);
                self.drawer.world.spawn = spawn;
            }
            Packet::NewPlayer {
                tick,
                id,
                name,
                colour,
            } => {
                self.catch_up(tick);
                let sim_slot = self.sim.add_player(&name, colour);
                let draw_slot = self.drawer.world.add_player(&name, colour);
                self.player_ids.insert(id, sim_slot);
                self.object_map.insert(sim_slot, draw_slot);
            }
            Packet::DeletePlayer { tick, id } => {
                self.catch_up(tick);
                if let Some(sim_slot) = self.player_ids.remove(&id) {
                    self.sim.remove_player(sim_slot);
                    if let Some(draw_slot) = self.object_map.remove(&sim_slot) {
                        self.drawer.world.remove_player(draw_slot);
                    }
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
                self.catch_up(tick);
                if tick < self.sim.tick_u32() {
                    return;
                }
                let Some(&slot) = self.player_ids.get(&id) else {
                    return;
                };
                if let Some(body) = self.sim.body_mut(slot) {
                    body.pos = pos;
                    body.vel = vel;
                    body.rot = rot;
                    body.rot_vel = rot_vel;
                }
                self.sim.set_player_action(slot, action);
            }
            Packet::UpdateClientResponse {
                client_tick,
                server_tick,
            } => {
                let Some(sent) = self.time_map.remove(&client_tick) else {
                    return;
                };
                let rtt = sent.elapsed().as_secs_f64();
                self.connection.update_rtt(rtt);
                self.drawer.target_tick = 0.25 * (rtt * TICK_RATE + server_tick as f64 + 1.0)
                    + 0.75 * self.drawer.target_tick;
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
                self.catch_up(tick);
                let sim_slot = match self.sim.insert_object(id, &record) {
                    Ok(slot) => slot,
                    Err(e) => {
                        log::warn!("unusable object record for {}: {}", id, e);
                        return;
                    }
                };
                set_kinematics(&mut self.sim, sim_slot, pos, vel, rot, rot_vel);
                match self.drawer.world.insert_object(id, &record) {
                    Ok(draw_slot) => {
                        set_kinematics(&mut self.drawer.world, draw_slot, pos, vel, rot, rot_vel);
                        self.object_map.insert(sim_slot, draw_slot);
                    }
                    Err(e) => log::warn!("unusable object record for {}: {}", id, e),
                }
            }
            Packet::DeleteObject { tick, id } => {
                self.catch_up(tick);
                let sim_slot = self.sim.slot_of(id);
                if !self.sim.remove_object(id) {
                    log::warn!("delete for unknown object {}", id);
                }
                self.drawer.world.remove_object(id);
                if let Some(slot) = sim_slot {
                    self.object_map.remove(&slot);
                }
            }
            Packet::ObjectProps { tick, id, props } => {
                self.catch_up(tick);
                if !self.sim.apply_props(id, &props) {
                    log::warn!("properties received for non-existent object {}", id);
                    return;
                }
                self.drawer.world.apply_props(id, &props);
            }
            Packet::UpdateObjects { tick, objects } => {
                self.catch_up(tick);
                if tick < self.sim.tick_u32() {
                    return;
                }
                for state in objects {
                    let Some(slot) = self.sim.slot_of(state.id) else {
                        return;
                    };
                    set_kinematics(
                        &mut self.sim,
                        slot,
                        DVec2::new(state.pos.x as f64, state.pos.y as f64),
                        DVec2::new(state.vel.x as f64, state.vel.y as f64),
                        state.rot as f64,
                        state.rot_vel as f64,
                    );
                }
            }
            Packet::NewConstraint {
                tick,
                id_a,
                id_b,
                descriptor,
            } => {
                self.catch_up(tick);
                if !self.sim.attach_wire_constraint(id_a, id_b, &descriptor) {
                    log::warn!("tried to add a constraint between non-existent objects");
                    return;
                }
                self.drawer.world.attach_wire_constraint(id_a, id_b, &descriptor);
            }
            Packet::Disconnect { reason } => {
                self.disconnect_message = Some(reason);
            }
            Packet::InitConnectionServer { .. } | Packet::UpdateClientInput { .. } => {
                log::debug!("ignoring a server-bound packet");
            }
        }
    }
}

fn set_kinematics(world: &mut World, slot: usize, pos: DVec2, vel: DVec2, rot: f64, rot_vel: f64) {
    if let Some(body) = world.body_mut(slot) {
        body.pos = pos;
        body.vel = vel;
        body.rot = rot;
        body.rot_vel = rot_vel;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::NullInput;
    use serde_json::json;
    use std::net::UdpSocket;
    use tumble::Transport;

    fn loopback_session() -> Session {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let peer = socket.local_addr().unwrap();
        let connection = Connection::new(Transport::new(socket, Some(peer), [1, 2, 3, 4]));
        Session::new(connection, &[("local".to_string(), [0, 200, 0])])
    }

    fn circle_record() -> serde_json::Value {
        json!({"type": "circle", "radius": 5.0, "pos": [0.0, 0.0], "physics": {"density": 0.5}})
    }

    #[test]
    fn init_packet_sets_the_clocks() {
        let mut session = loopback_session();
        session.process_packets(vec![Packet::InitConnectionClient {
            tick: 90,
            ids: vec![7],
        }]);

        assert_eq!(session.sim.tick_u32(), 90);
        assert_eq!(session.drawer.world.tick, 90.0);
        assert_eq!(session.drawer.target_tick, 95.0);
        assert_eq!(session.sent_tick, 90);
        assert_eq!(session.player_ids.get(&7), Some(&session.local_sim_slots[0]));
    }

    #[test]
    fn future_updates_advance_the_sim_before_applying() {
        let mut session = loopback_session();
        session.process_packets(vec![Packet::InitConnectionClient {
            tick: 97,
            ids: vec![0],
        }]);
        session.process_packets(vec![Packet::NewObject {
            tick: 97,
            id: 5,
            pos: DVec2::ZERO,
            vel: DVec2::ZERO,
            rot: 0.0,
            rot_vel: 0.0,
            record: circle_record(),
        }]);

        session.process_packets(vec![Packet::UpdateObjects {
            tick: 100,
            objects: vec![tumble::net::ObjectState {
                id: 5,
                pos: glam::Vec2::new(10.0, 10.0),
                vel: glam::Vec2::ZERO,
                rot: 0.0,
                rot_vel: 0.0,
            }],
        }]);

        assert_eq!(session.sim.tick_u32(), 100);
        let slot = session.sim.slot_of(5).unwrap();
        let pos = session.sim.body(slot).unwrap().pos;
        assert!((pos - DVec2::new(10.0, 10.0)).length() < 1e-6);
    }

    #[test]
    fn stale_state_packets_are_dropped() {
        let mut session = loopback_session();
        session.process_packets(vec![
            Packet::InitConnectionClient {
                tick: 50,
                ids: vec![0],
            },
            Packet::NewObject {
                tick: 50,
                id: 1,
                pos: DVec2::new(5.0, 5.0),
                vel: DVec2::ZERO,
                rot: 0.0,
                rot_vel: 0.0,
                record: json!({"type": "circle", "radius": 5.0, "pos": [5.0, 5.0]}),
            },
        ]);

        session.process_packets(vec![Packet::UpdateObjects {
            tick: 40,
            objects: vec![tumble::net::ObjectState {
                id: 1,
                pos: glam::Vec2::new(999.0, 999.0),
                vel: glam::Vec2::ZERO,
                rot: 0.0,
                rot_vel: 0.0,
            }],
        }]);

        let slot = session.sim.slot_of(1).unwrap();
        assert!(session.sim.body(slot).unwrap().pos.x < 100.0);
    }

    #[test]
    fn replayed_actions_drive_prediction() {
        let mut session = loopback_session();
        session.process_packets(vec![Packet::InitConnectionClient {
            tick: 10,
            ids: vec![0],
        }]);
        session
            .actions
            .insert(10, vec![(1.0, 0.0)]);
        session.actions.insert(11, vec![(1.0, 0.0)]);

        session.process_packets(vec![Packet::DeleteObject { tick: 12, id: 999 }]);
        assert_eq!(session.sim.tick_u32(), 12);
        let slot = session.local_sim_slots[0];
        assert_eq!(session.sim.player_meta(slot).unwrap().action, (1.0, 0.0));
    }

    #[test]
    fn timeout_raises_a_fatal_disconnect() {
        let mut session = loopback_session();
        session.connection.last_received = Instant::now() - Duration::from_millis(3100);
        let result = session.update(&mut NullInput);
        assert!(matches!(result, Err(SessionError::TimedOut)));
    }

    #[test]
    fn server_disconnect_is_fatal_with_its_reason() {
        let mut session = loopback_session();
        session.process_packets(vec![Packet::Disconnect {
            reason: "server full".to_string(),
        }]);
        let result = session.update(&mut NullInput);
        match result {
            Err(SessionError::Disconnected(reason)) => assert_eq!(reason, "server full"),
            other => panic!("expected a disconnect, got {:?}", other.err()),
        }
    }

    #[test]
    fn rtt_response_filters_the_target_tick() {
        let mut session = loopback_session();
        session.drawer.target_tick = 100.0;
        session.time_map.insert(55, Instant::now());

        session.process_packets(vec![Packet::UpdateClientResponse {
            client_tick: 55,
            server_tick: 103,
        }]);

        // 0.25 * (rtt*60 + 104) + 0.75 * 100, with rtt near zero.
        let target = session.drawer.target_tick;
        assert!(target > 100.0 && target < 102.0);
        assert!(session.time_map.is_empty());
    }

    #[test]
    fn invalid_pushed_scripts_are_rejected() {
        let mut session = loopback_session();
        session.process_packets(vec![Packet::Script {
            body: "os.execute('boom')".to_string(),
        }]);
        assert!(!session.sim.has_script());

        session.process_packets(vec![Packet::Script {
            body: "function tick() end".to_string(),
        }]);
        assert!(session.sim.has_script());
    }

    #[test]
    fn inputs_are_predicted_and_sent_up_to_the_target() {
        let mut session = loopback_session();
        session.process_packets(vec![Packet::InitConnectionClient {
            tick: 20,
            ids: vec![0],
        }]);

        // The first frame establishes the draw clock; from the second
        // frame on, the drawer has moved towards target_tick = 25 and
        // a run of input packets goes out.
        session.update(&mut NullInput).unwrap();
        session.update(&mut NullInput).unwrap();
        assert!(session.sent_tick > 20);
        assert!(!session.actions.is_empty());
        assert!(session.time_map.contains_key(&session.sent_tick));
    }
}
