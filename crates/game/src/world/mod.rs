pub mod object;
pub mod player;

use std::collections::HashMap;

use glam::DVec2;
use serde_json::{Value, json};

use crate::physics::body::rotate;
use crate::physics::{Body, CandidateContact, Constraint, PhysicsWorld};
use crate::script::{MirrorObject, MirrorPlayer, ScriptCommand, ScriptError, ScriptHost, WorldMirror};

pub use object::{
    Animation, CheckpointZone, InitialState, JumpState, ObjectMeta, PlayerMeta, RecordError,
};
pub use player::JumpConstraint;

use object::vec2_value;

/// State changes the owner of the world (server or client session)
/// needs to react to, drained once per tick.
#[derive(Debug, Clone)]
pub enum WorldEvent {
    ObjectAdded { id: u32 },
    ObjectRemoved { id: u32 },
    ConstraintAdded { id_a: u32, id_b: u32, descriptor: Value },
}

/// The simulation world: a body arena with game metadata, stable wire
/// ids, a player list, the tick counter and the optional script host.
///
/// The tick is fractional because the client's draw world advances by
/// interpolation amounts; authoritative and sim worlds only ever step
/// it by whole ticks.
pub struct World {
    pub physics: PhysicsWorld,
    meta: Vec<Option<ObjectMeta>>,
    pub objects: HashMap<u32, usize>,
    pub players: Vec<usize>,
    next_object_id: u32,
    clone_counter: u32,
    pub spawn: DVec2,
    pub tick: f64,
    pub steps: u32,
    pub is_host: bool,
    script: Option<ScriptHost>,
    events: Vec<WorldEvent>,
}

impl World {
    pub fn new(is_host: bool) -> Self {
        Self {
            physics: PhysicsWorld::new(),
            meta: Vec::new(),
            objects: HashMap::new(),
            players: Vec::new(),
            next_object_id: 0,
            clone_counter: 0,
            spawn: DVec2::ZERO,
            tick: 0.0,
            steps: 3,
            is_host,
            script: None,
            events: Vec::new(),
        }
    }

    pub fn tick_u32(&self) -> u32 {
        self.tick.round().max(0.0) as u32
    }

    pub fn gravity(&self) -> DVec2 {
        self.physics.gravity
    }

    pub fn set_gravity(&mut self, gravity: DVec2) {
        self.physics.gravity = gravity;
    }

    fn add_slot(&mut self, body: Body, meta: ObjectMeta) -> usize {
        let slot = self.physics.insert(body);
        if slot >= self.meta.len() {
            self.meta.resize_with(slot + 1, || None);
        }
        self.meta[slot] = Some(meta);
        slot
    }

    pub fn meta(&self, slot: usize) -> Option<&ObjectMeta> {
        self.meta.get(slot)?.as_ref()
    }

    pub fn meta_mut(&mut self, slot: usize) -> Option<&mut ObjectMeta> {
        self.meta.get_mut(slot)?.as_mut()
    }

    pub fn body(&self, slot: usize) -> Option<&Body> {
        self.physics.body(slot)
    }

    pub fn body_mut(&mut self, slot: usize) -> Option<&mut Body> {
        self.physics.body_mut(slot)
    }

    pub fn body_meta_mut(&mut self, slot: usize) -> Option<(&mut Body, &mut ObjectMeta)> {
        let body = self.physics.body_mut(slot)?;
        let meta = self.meta.get_mut(slot)?.as_mut()?;
        Some((body, meta))
    }

    pub fn slot_of(&self, id: u32) -> Option<usize> {
        self.objects.get(&id).copied()
    }

    pub fn wire_id_of(&self, slot: usize) -> Option<u32> {
        self.meta(slot)?.wire_id
    }

    /// Wire ids in ascending order, the iteration order for anything
    /// that must be deterministic or reproducible in logs.
    pub fn object_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.objects.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn create_object(&mut self, record: Value) -> Result<u32, RecordError> {
        let record = object::with_defaults(record);
        let (body, mut meta) = object::from_record(&record)?;
        let id = self.next_object_id;
        self.next_object_id += 1;
        meta.wire_id = Some(id);
        let slot = self.add_slot(body, meta);
        self.objects.insert(id, slot);
        self.events.push(WorldEvent::ObjectAdded { id });
        if let Some(host) = &self.script {
            host.call_add_object(id);
        }
        Ok(id)
    }

    /// Install an object under a server-assigned id (client side).
    pub fn insert_object(&mut self, id: u32, record: &Value) -> Result<usize, RecordError> {
        let record = object::with_defaults(record.clone());
        let (body, mut meta) = object::from_record(&record)?;
        meta.wire_id = Some(id);
        let slot = self.add_slot(body, meta);
        self.objects.insert(id, slot);
        if id >= self.next_object_id {
            self.next_object_id = id + 1;
        }
        if let Some(host) = &self.script {
            host.call_add_object(id);
        }
        Ok(slot)
    }

    pub fn remove_object(&mut self, id: u32) -> bool {
        let Some(slot) = self.objects.remove(&id) else {
            return false;
        };
        if let Some(host) = &self.script {
            host.call_remove_object(id);
        }
        self.physics.remove(slot);
        if let Some(entry) = self.meta.get_mut(slot) {
            *entry = None;
        }
        self.events.push(WorldEvent::ObjectRemoved { id });
        true
    }

    pub fn add_player(&mut self, name: &str, colour: [u8; 3]) -> usize {
        let body = player::player_body(self.spawn);
        let meta = player::player_meta(name, colour, &body);
        let slot = self.add_slot(body, meta);
        self.players.push(slot);
        slot
    }

    pub fn remove_player(&mut self, slot: usize) {
        self.players.retain(|&s| s != slot);
        self.physics.remove(slot);
        if let Some(entry) = self.meta.get_mut(slot) {
            *entry = None;
        }
    }

    pub fn player_meta(&self, slot: usize) -> Option<&PlayerMeta> {
        self.meta(slot)?.player.as_ref()
    }

    pub fn player_meta_mut(&mut self, slot: usize) -> Option<&mut PlayerMeta> {
        self.meta_mut(slot)?.player.as_mut()
    }

    pub fn set_player_action(&mut self, slot: usize, action: (f32, f32)) {
        if let Some(player) = self.player_meta_mut(slot) {
            player.action = action;
        }
    }

    pub fn get_group(&self, name: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .objects
            .iter()
            .filter(|&(_, &slot)| {
                self.meta(slot)
                    .map(|meta| meta.groups.iter().any(|group| group == name))
                    .unwrap_or(false)
            })
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn apply_props(&mut self, id: u32, props: &Value) -> bool {
        let Some(slot) = self.slot_of(id) else {
            return false;
        };
        match self.body_meta_mut(slot) {
            Some((body, meta)) => {
                object::apply_props(body, meta, props);
                true
            }
            None => false,
        }
    }

    pub fn reset_object(&mut self, id: u32) -> bool {
        let Some(slot) = self.slot_of(id) else {
            return false;
        };
        match self.body_meta_mut(slot) {
            Some((body, meta)) => {
                object::reset(body, meta);
                true
            }
            None => false,
        }
    }

    /// Attach a level-file constraint, whose anchors are given as world
    /// positions.
    pub fn attach_level_constraint(&mut self, id_a: u32, id_b: u32, data: &Value) -> bool {
        let (Some(slot_a), Some(slot_b)) = (self.slot_of(id_a), self.slot_of(id_b)) else {
            log::warn!("level constraint references a missing object");
            return false;
        };
        let Some(constraint) = self.constraint_from_level(slot_a, slot_b, data) else {
            log::warn!("level constraint descriptor is malformed");
            return false;
        };
        if let Some(body) = self.physics.body_mut(slot_a) {
            body.constraints.push((slot_b, constraint));
            return true;
        }
        false
    }

    fn constraint_from_level(&self, slot_a: usize, slot_b: usize, data: &Value) -> Option<Constraint> {
        let a = self.physics.body(slot_a)?;
        let b = self.physics.body(slot_b)?;
        match data.get("type")?.as_str()? {
            "pivot" => {
                let point = vec2_value(data.get("pos")?)?;
                Some(Constraint::Pivot {
                    local_a: rotate(point - a.pos, -a.rot),
                    local_b: rotate(point - b.pos, -b.rot),
                })
            }
            "fixed" => {
                let point = vec2_value(data.get("pos")?)?;
                Some(Constraint::Fixed {
                    local_a: rotate(point - a.pos, -a.rot),
                    local_b: rotate(point - b.pos, -b.rot),
                    rest_rot: b.rot - a.rot,
                })
            }
            "slider" => {
                let pair = data.get("pos")?.as_array()?;
                let point_a = vec2_value(pair.first()?)?;
                let point_b = vec2_value(pair.get(1)?)?;
                let d = point_a - point_b;
                let normal = DVec2::new(-d.y, d.x).normalize_or_zero();
                Some(Constraint::Slider {
                    local_a: rotate(point_a - a.pos, -a.rot),
                    local_b: rotate(point_b - b.pos, -b.rot),
                    normal: rotate(normal, -a.rot),
                })
            }
            _ => None,
        }
    }

    /// Attach a constraint received over the wire, whose anchors are
    /// already in body-local coordinates.
    pub fn attach_wire_constraint(&mut self, id_a: u32, id_b: u32, descriptor: &Value) -> bool {
        let (Some(slot_a), Some(slot_b)) = (self.slot_of(id_a), self.slot_of(id_b)) else {
            log::warn!("constraint references a missing object");
            return false;
        };
        let relative_rot = match (self.physics.body(slot_a), self.physics.body(slot_b)) {
            (Some(a), Some(b)) => b.rot - a.rot,
            _ => return false,
        };

        let local_a = descriptor.get("local_a").and_then(vec2_value);
        let local_b = descriptor.get("local_b").and_then(vec2_value);
        let constraint = match descriptor.get("type").and_then(Value::as_str) {
            Some("pivot") => Constraint::Pivot {
                local_a: local_a.unwrap_or(DVec2::ZERO),
                local_b: local_b.unwrap_or(DVec2::ZERO),
            },
            Some("fixed") => Constraint::Fixed {
                local_a: local_a.unwrap_or(DVec2::ZERO),
                local_b: local_b.unwrap_or(DVec2::ZERO),
                rest_rot: descriptor
                    .get("rest_rot")
                    .and_then(Value::as_f64)
                    .unwrap_or(relative_rot),
            },
            Some("slider") => Constraint::Slider {
                local_a: local_a.unwrap_or(DVec2::ZERO),
                local_b: local_b.unwrap_or(DVec2::ZERO),
                normal: descriptor
                    .get("normal")
                    .and_then(vec2_value)
                    .unwrap_or(DVec2::Y),
            },
            _ => {
                log::warn!("unknown constraint type in descriptor");
                return false;
            }
        };

        if let Some(body) = self.physics.body_mut(slot_a) {
            body.constraints.push((slot_b, constraint));
            return true;
        }
        false
    }

    pub fn describe_constraint(constraint: &Constraint) -> Option<Value> {
        match constraint {
            Constraint::Pivot { local_a, local_b } => Some(json!({
                "type": "pivot",
                "local_a": [local_a.x, local_a.y],
                "local_b": [local_b.x, local_b.y],
            })),
            Constraint::Fixed {
                local_a,
                local_b,
                rest_rot,
            } => Some(json!({
                "type": "fixed",
                "local_a": [local_a.x, local_a.y],
                "local_b": [local_b.x, local_b.y],
                "rest_rot": rest_rot,
            })),
            Constraint::Slider {
                local_a,
                local_b,
                normal,
            } => Some(json!({
                "type": "slider",
                "local_a": [local_a.x, local_a.y],
                "local_b": [local_b.x, local_b.y],
                "normal": [normal.x, normal.y],
            })),
            Constraint::Custom(_) => None,
        }
    }

    /// Every describable constraint between synced objects, as
    /// `(id_a, id_b, descriptor)` tuples in id order.
    pub fn wire_constraints(&self) -> Vec<(u32, u32, Value)> {
        let mut out = Vec::new();
        for id_a in self.object_ids() {
            let Some(slot_a) = self.slot_of(id_a) else {
                continue;
            };
            let Some(body) = self.physics.body(slot_a) else {
                continue;
            };
            for (other, constraint) in &body.constraints {
                let Some(id_b) = self.wire_id_of(*other) else {
                    continue;
                };
                if let Some(descriptor) = Self::describe_constraint(constraint) {
                    out.push((id_a, id_b, descriptor));
                }
            }
        }
        out
    }

    /// Deep-copy a set of objects, tagging the clones with an extra
    /// group and remapping the constraints that stay inside the set.
    pub fn copy_objects(&mut self, ids: &[u32], tag: &str) -> Vec<u32> {
        let mut clones = Vec::new();
        for &id in ids {
            let Some(slot) = self.slot_of(id) else {
                continue;
            };
            let (Some(body), Some(meta)) = (self.physics.body(slot), self.meta(slot)) else {
                continue;
            };
            clones.push((slot, body.clone(), meta.clone()));
        }

        let mut slot_map: HashMap<usize, (usize, u32)> = HashMap::new();
        let mut constraint_backlog = Vec::new();
        let mut new_ids = Vec::new();

        for (old_slot, mut body, mut meta) in clones {
            let saved = std::mem::take(&mut body.constraints);
            meta.groups.push(tag.to_string());
            let id = self.next_object_id;
            self.next_object_id += 1;
            meta.wire_id = Some(id);
            let slot = self.add_slot(body, meta);
            self.objects.insert(id, slot);
            slot_map.insert(old_slot, (slot, id));
            constraint_backlog.push((old_slot, saved));
            new_ids.push(id);
            self.events.push(WorldEvent::ObjectAdded { id });
            if let Some(host) = &self.script {
                host.call_add_object(id);
            }
        }

        for (old_slot, saved) in constraint_backlog {
            let Some(&(new_slot, new_id)) = slot_map.get(&old_slot) else {
                continue;
            };
            for (other_old, constraint) in saved {
                let Some(&(other_new, other_id)) = slot_map.get(&other_old) else {
                    continue;
                };
                let descriptor = Self::describe_constraint(&constraint);
                if let Some(body) = self.physics.body_mut(new_slot) {
                    body.constraints.push((other_new, constraint));
                }
                if let Some(descriptor) = descriptor {
                    self.events.push(WorldEvent::ConstraintAdded {
                        id_a: new_id,
                        id_b: other_id,
                        descriptor,
                    });
                }
            }
        }

        new_ids
    }

    pub fn take_events(&mut self) -> Vec<WorldEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn has_script(&self) -> bool {
        self.script.is_some()
    }

    pub fn load_script(&mut self, source: &str) -> Result<(), ScriptError> {
        if source.trim().is_empty() {
            self.script = None;
            return Ok(());
        }
        let host = ScriptHost::new(source, self.is_host)?;
        host.sync(&self.mirror());
        host.call_load();
        self.script = Some(host);
        self.apply_script_commands();
        Ok(())
    }

    /// Replay `add_object` for everything already in the world, used
    /// when a script arrives after the world was populated.
    pub fn announce_objects_to_script(&mut self) {
        if let Some(host) = &self.script {
            for id in self.object_ids() {
                host.call_add_object(id);
            }
        }
        self.apply_script_commands();
    }

    /// Advance the world by `dt` ticks: `ceil(steps · dt)` physics
    /// substeps, then the script tick hook and per-object updates.
    pub fn update(&mut self, dt: f64) {
        let substeps = (self.steps as f64 * dt).ceil() as i64;
        if substeps > 0 {
            let sub_dt = dt / substeps as f64;
            for _ in 0..substeps {
                self.substep(sub_dt);
            }
        }
        self.tick += dt;

        if self.script.is_some() {
            let mirror = self.mirror();
            if let Some(host) = &self.script {
                host.sync(&mirror);
                host.call_tick();
            }
            self.apply_script_commands();
        }

        self.post_update();
    }

    fn substep(&mut self, dt: f64) {
        let contacts = self.physics.begin_step(dt);
        let cancelled = self.run_contact_hooks(&contacts);
        self.physics.finish_step(dt, contacts, &cancelled);
    }

    fn run_contact_hooks(&mut self, contacts: &[CandidateContact]) -> Vec<bool> {
        let mut cancelled = vec![false; contacts.len()];
        for (index, contact) in contacts.iter().enumerate() {
            let Some(point) = contact.manifold.points.first() else {
                continue;
            };
            let normal = contact.manifold.normal;
            // Each side sees the normal pointing towards itself.
            if self.object_collide(
                contact.slot_a,
                contact.slot_b,
                -normal,
                point.local_a,
                point.local_b,
            ) {
                cancelled[index] = true;
            }
            if self.object_collide(
                contact.slot_b,
                contact.slot_a,
                normal,
                point.local_b,
                point.local_a,
            ) {
                cancelled[index] = true;
            }
        }
        cancelled
    }

    fn object_collide(
        &mut self,
        me: usize,
        other: usize,
        normal: DVec2,
        local_me: DVec2,
        local_other: DVec2,
    ) -> bool {
        let mut cancel = false;

        let other_lethal = self.meta(other).map(|m| m.lethal).unwrap_or(false);
        let other_checkpoint = self
            .meta(other)
            .map(|m| m.checkpoint.is_some() && !m.is_player())
            .unwrap_or(false);
        let gravity = self.physics.gravity.normalize_or_zero();

        let mut jump_strength = None;
        if let Some(player) = self.player_meta_mut(me) {
            if other_lethal {
                player.dead = player.dead.max(0);
            }
            if other_checkpoint {
                player.checkpoint = Some(other);
            }
            if gravity != DVec2::ZERO
                && normal.dot(gravity) < -0.7
                && player.jump == JumpState::Pressed
            {
                jump_strength = Some(-(player.action.1 as f64));
                player.jump = JumpState::Constrained;
            }
        }
        if let Some(strength) = jump_strength {
            let jump = JumpConstraint::new(normal, local_me, local_other, strength);
            if let Some(body) = self.physics.body_mut(me) {
                body.constraints.push((other, Constraint::Custom(Box::new(jump))));
            }
            // The jump impulse replaces the contact this step.
            cancel = true;
        }

        let trigger = self.meta(me).and_then(|m| m.trigger.clone());
        if let Some(name) = trigger {
            if let Some(host) = &self.script {
                let self_id = self.meta(me).and_then(|m| m.wire_id);
                let other_id = self.meta(other).and_then(|m| m.wire_id);
                if host.call_trigger(&name, self_id, other_id, normal, local_me, local_other) {
                    cancel = true;
                }
            }
        }

        cancel
    }

    fn post_update(&mut self) {
        let tick = self.tick;
        let slots: Vec<usize> = self.physics.slots().collect();
        for slot in slots {
            let is_player = self.meta(slot).map(|m| m.is_player()).unwrap_or(false);
            if is_player {
                self.update_player(slot);
            } else if let Some((body, meta)) = self.body_meta_mut(slot) {
                if let Some(animation) = meta.animated.clone() {
                    object::animate(body, &meta.initial, &animation, tick);
                }
            }
        }
    }

    fn update_player(&mut self, slot: usize) {
        let Some(dead) = self.player_meta(slot).map(|p| p.dead) else {
            return;
        };
        if dead >= 3 {
            self.respawn(slot);
            return;
        }
        if dead >= 0 {
            if let Some(player) = self.player_meta_mut(slot) {
                player.dead = dead + 1;
            }
            return;
        }

        let gravity = self.physics.gravity;
        if let (Some(scene), Some(body)) = (self.physics.root_bounds(), self.physics.body(slot)) {
            if player::below_kill_plane(scene, gravity, body.pos, body.vel) {
                self.respawn(slot);
                return;
            }
        }

        let action = self
            .player_meta(slot)
            .map(|p| p.action)
            .unwrap_or((0.0, 0.0));
        if let Some(body) = self.physics.body_mut(slot) {
            player::roll_control(body, action);
        }

        let jump = self.player_meta(slot).map(|p| p.jump);
        if jump == Some(JumpState::Constrained) {
            if let Some(body) = self.physics.body_mut(slot) {
                body.constraints.retain(|(_, c)| !c.is_player_jump());
            }
        }
        if let Some(player) = self.player_meta_mut(slot) {
            player.jump = if player.action.1 < -0.1 {
                JumpState::Pressed
            } else {
                JumpState::Idle
            };
        }
    }

    fn respawn(&mut self, slot: usize) {
        let checkpoint = self.player_meta(slot).and_then(|p| p.checkpoint);
        let checkpoint_spawn = checkpoint.and_then(|cp| {
            let body = self.physics.body(cp)?;
            let zone = self.meta(cp)?.checkpoint.as_ref()?;
            Some(body.pos + zone.offset)
        });
        let stale_checkpoint = checkpoint.is_some() && checkpoint_spawn.is_none();
        let target = checkpoint_spawn.unwrap_or(self.spawn);

        if let Some(body) = self.physics.body_mut(slot) {
            body.pos = target + player::spawn_jitter();
            body.vel = DVec2::ZERO;
            body.constraints.retain(|(_, c)| !c.is_player_jump());
        }

        let mut name = String::new();
        if let Some(player) = self.player_meta_mut(slot) {
            player.dead = -1;
            player.jump = JumpState::Idle;
            if stale_checkpoint {
                player.checkpoint = None;
            }
            name = player.name.clone();
        }

        if let Some(host) = &self.script {
            host.call_on_death(&name);
        }
    }

    fn mirror(&self) -> WorldMirror {
        let mut objects = Vec::with_capacity(self.objects.len());
        for id in self.object_ids() {
            let Some(slot) = self.slot_of(id) else {
                continue;
            };
            if let (Some(body), Some(meta)) = (self.physics.body(slot), self.meta(slot)) {
                objects.push(MirrorObject {
                    id,
                    pos: body.pos,
                    vel: body.vel,
                    rot: body.rot,
                    rot_vel: body.rot_vel,
                    colour: meta.colour,
                    lethal: meta.lethal,
                    groups: meta.groups.clone(),
                });
            }
        }

        let players = self
            .players
            .iter()
            .filter_map(|&slot| {
                let body = self.physics.body(slot)?;
                let player = self.player_meta(slot)?;
                Some(MirrorPlayer {
                    name: player.name.clone(),
                    pos: body.pos,
                    vel: body.vel,
                    dead: player.dead >= 0,
                })
            })
            .collect();

        WorldMirror {
            time: self.tick,
            gravity: self.physics.gravity,
            spawn: self.spawn,
            objects,
            players,
        }
    }

    fn apply_script_commands(&mut self) {
        let commands = match &self.script {
            Some(host) => host.drain(),
            None => return,
        };
        for command in commands {
            match command {
                ScriptCommand::CreateObject(record) => {
                    if let Err(e) = self.create_object(record) {
                        log::warn!("script create_object failed: {}", e);
                    }
                }
                ScriptCommand::RemoveObject(id) => {
                    if !self.remove_object(id) {
                        log::warn!("script removed unknown object {}", id);
                    }
                }
                ScriptCommand::ResetObject(id) => {
                    self.reset_object(id);
                }
                ScriptCommand::SetColour(id, colour) => {
                    if let Some(slot) = self.slot_of(id) {
                        if let Some(meta) = self.meta_mut(slot) {
                            meta.colour = colour;
                            meta.dirty_props = true;
                        }
                    }
                }
                ScriptCommand::SetPosition(id, pos) => {
                    if let Some(slot) = self.slot_of(id) {
                        if let Some((body, meta)) = self.body_meta_mut(slot) {
                            body.pos = pos;
                            meta.dirty_state = true;
                        }
                    }
                }
                ScriptCommand::SetVelocity(id, vel) => {
                    if let Some(slot) = self.slot_of(id) {
                        if let Some((body, meta)) = self.body_meta_mut(slot) {
                            body.vel = vel;
                            meta.dirty_state = true;
                        }
                    }
                }
                ScriptCommand::CloneGroup(name) => {
                    let ids = self.get_group(&name);
                    let tag = self.clone_counter.to_string();
                    self.clone_counter += 1;
                    self.copy_objects(&ids, &tag);
                }
            }
        }
    }
}
