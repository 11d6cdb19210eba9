use glam::{DVec2, Vec2};

use tumble::net::{ObjectState, Packet};
use tumble::world::object::props_value;
use tumble::World;

/// Speeds below this are treated as stationary for extrapolation, in
/// which case gravity is left out of the prediction. Both the current
/// and the previous snapshot velocity must qualify.
const STATIONARY_SPEED: f64 = 0.2;

/// Per-object send-priority estimator. Priority grows a little every
/// tick (slower for static bodies), grows with how far a client's
/// dead-reckoning would be off by now, and jumps when the state is
/// explicitly dirtied. Crossing 1.0 queues the object for the next
/// `UpdateObjects` batch.
pub struct ObjectSync {
    pub id: u32,
    pub priority: f64,
    prev_pos: DVec2,
    prev_vel: DVec2,
    elapsed: f64,
    new: bool,
    ever_dirty: bool,
}

impl ObjectSync {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            priority: 0.0,
            prev_pos: DVec2::ZERO,
            prev_vel: DVec2::ZERO,
            elapsed: 0.0,
            new: true,
            ever_dirty: false,
        }
    }

    /// Advance the estimator one server tick, appending any packets
    /// that must go out regardless of priority (creation on the first
    /// tick, property changes whenever they happen).
    pub fn update(&mut self, world: &mut World, out: &mut Vec<Packet>) {
        let Some(slot) = world.slot_of(self.id) else {
            return;
        };
        let Some(body) = world.body(slot) else {
            return;
        };
        let (pos, vel) = (body.pos, body.vel);
        let is_static = body.mass < 0.0 && body.moment < 0.0;

        if self.new {
            self.prev_pos = pos;
            self.prev_vel = vel;
            self.new = false;
            self.creation_packets(world, out);
        } else {
            self.priority += if is_static { 0.02 } else { 0.1 };
            self.elapsed += 1.0;

            let gravity = world.gravity();
            let nearly_static = vel.length_squared() < STATIONARY_SPEED * STATIONARY_SPEED
                && self.prev_vel.length_squared() < STATIONARY_SPEED * STATIONARY_SPEED;
            let (pos_prediction, vel_prediction) = if nearly_static {
                (self.prev_pos + self.prev_vel * self.elapsed, self.prev_vel)
            } else {
                (
                    self.prev_pos
                        + self.prev_vel * self.elapsed
                        + gravity * (self.elapsed * self.elapsed / 2.0),
                    self.prev_vel + gravity * self.elapsed,
                )
            };
            self.priority += ((pos_prediction - pos).length() / 15.0).min(0.3);
            self.priority += ((vel_prediction - vel).length() / 15.0).min(0.3);

            if let Some(meta) = world.meta_mut(slot) {
                if meta.dirty_state {
                    self.priority += 1.0;
                    meta.dirty_state = false;
                }
            }
        }

        let dirty_props = world
            .meta_mut(slot)
            .map(|meta| std::mem::take(&mut meta.dirty_props))
            .unwrap_or(false);
        if dirty_props {
            if let Some(packet) = self.props_packet(world) {
                out.push(packet);
            }
            self.ever_dirty = true;
        }
    }

    /// Packets that reproduce this object on a freshly joined client.
    pub fn creation_packets(&self, world: &World, out: &mut Vec<Packet>) {
        if self.new {
            return;
        }
        let Some(slot) = world.slot_of(self.id) else {
            return;
        };
        let (Some(body), Some(meta)) = (world.body(slot), world.meta(slot)) else {
            return;
        };
        out.push(Packet::NewObject {
            tick: world.tick_u32(),
            id: self.id,
            pos: body.pos,
            vel: body.vel,
            rot: body.rot,
            rot_vel: body.rot_vel,
            record: meta.record.clone().unwrap_or(serde_json::Value::Null),
        });
        if self.ever_dirty {
            if let Some(packet) = self.props_packet(world) {
                out.push(packet);
            }
        }
    }

    pub fn props_packet(&self, world: &World) -> Option<Packet> {
        let slot = world.slot_of(self.id)?;
        let body = world.body(slot)?;
        let meta = world.meta(slot)?;
        Some(Packet::ObjectProps {
            tick: world.tick_u32(),
            id: self.id,
            props: props_value(body, meta),
        })
    }

    pub fn state(&self, world: &World) -> Option<ObjectState> {
        let slot = world.slot_of(self.id)?;
        let body = world.body(slot)?;
        Some(ObjectState {
            id: self.id,
            pos: Vec2::new(body.pos.x as f32, body.pos.y as f32),
            vel: Vec2::new(body.vel.x as f32, body.vel.y as f32),
            rot: body.rot as f32,
            rot_vel: body.rot_vel as f32,
        })
    }

    /// Called after a broadcast: the client now knows this state.
    pub fn reset(&mut self, world: &World) {
        if let Some(body) = world.slot_of(self.id).and_then(|slot| world.body(slot)) {
            self.prev_pos = body.pos;
            self.prev_vel = body.vel;
        }
        self.elapsed = 0.0;
        self.priority = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn world_with_static_object() -> (World, u32) {
        let mut world = World::new(true);
        world.set_gravity(DVec2::new(0.0, 0.3));
        let id = world
            .create_object(json!({
                "type": "polygon",
                "points": [[-50.0, 0.0], [50.0, 0.0], [50.0, 20.0], [-50.0, 20.0]],
            }))
            .unwrap();
        world.take_events();
        (world, id)
    }

    #[test]
    fn static_object_stays_quiet_for_fifty_ticks() {
        let (mut world, id) = world_with_static_object();
        let mut sync = ObjectSync::new(id);
        let mut out = Vec::new();

        // First update emits the creation packets.
        sync.update(&mut world, &mut out);
        assert!(matches!(out[0], Packet::NewObject { .. }));
        out.clear();

        for _ in 0..49 {
            sync.update(&mut world, &mut out);
            assert!(sync.priority < 1.0);
        }
        sync.update(&mut world, &mut out);
        assert!(sync.priority >= 1.0);
        assert!(out.is_empty());
    }

    #[test]
    fn dynamic_objects_reach_the_threshold_faster() {
        let (mut world, _) = world_with_static_object();
        let id = world
            .create_object(json!({
                "type": "circle",
                "radius": 5.0,
                "pos": [0.0, -40.0],
                "physics": {"density": 0.5},
            }))
            .unwrap();
        world.take_events();

        let mut sync = ObjectSync::new(id);
        let mut out = Vec::new();
        sync.update(&mut world, &mut out);

        let mut ticks = 0;
        while sync.priority < 1.0 && ticks < 60 {
            world.update(1.0);
            sync.update(&mut world, &mut out);
            ticks += 1;
        }
        assert!(ticks <= 10, "a falling body should resync within ticks");
    }

    #[test]
    fn dirty_state_forces_a_resend() {
        let (mut world, id) = world_with_static_object();
        let mut sync = ObjectSync::new(id);
        let mut out = Vec::new();
        sync.update(&mut world, &mut out);

        let slot = world.slot_of(id).unwrap();
        world.meta_mut(slot).unwrap().dirty_state = true;
        sync.update(&mut world, &mut out);
        assert!(sync.priority >= 1.0);
    }

    #[test]
    fn property_changes_emit_exactly_one_reliable_packet() {
        let (mut world, id) = world_with_static_object();
        let mut sync = ObjectSync::new(id);
        let mut out = Vec::new();
        sync.update(&mut world, &mut out);
        out.clear();

        let slot = world.slot_of(id).unwrap();
        let meta = world.meta_mut(slot).unwrap();
        meta.colour = [1, 2, 3];
        meta.dirty_props = true;

        sync.update(&mut world, &mut out);
        let props: Vec<_> = out
            .iter()
            .filter(|packet| matches!(packet, Packet::ObjectProps { .. }))
            .collect();
        assert_eq!(props.len(), 1);

        out.clear();
        sync.update(&mut world, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn creation_resends_props_for_ever_dirty_objects() {
        let (mut world, id) = world_with_static_object();
        let mut sync = ObjectSync::new(id);
        let mut out = Vec::new();
        sync.update(&mut world, &mut out);

        let slot = world.slot_of(id).unwrap();
        world.meta_mut(slot).unwrap().dirty_props = true;
        out.clear();
        sync.update(&mut world, &mut out);

        out.clear();
        sync.creation_packets(&world, &mut out);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Packet::NewObject { .. }));
        assert!(matches!(out[1], Packet::ObjectProps { .. }));
    }

    #[test]
    fn reset_clears_priority_and_rebases_prediction() {
        let (mut world, id) = world_with_static_object();
        let mut sync = ObjectSync::new(id);
        let mut out = Vec::new();
        sync.update(&mut world, &mut out);
        for _ in 0..60 {
            sync.update(&mut world, &mut out);
        }
        assert!(sync.priority >= 1.0);

        sync.reset(&world);
        assert_eq!(sync.priority, 0.0);
        sync.update(&mut world, &mut out);
        assert!(sync.priority < 0.1);
    }
}
