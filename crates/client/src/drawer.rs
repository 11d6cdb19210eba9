use std::collections::{HashMap, HashSet};

use tumble::World;

/// The rendering-side world. It trails a moving `target_tick` through
/// a first-order filter, so authoritative corrections blend in over a
/// few frames instead of popping, and it never runs scripts.
pub struct Drawer {
    pub world: World,
    pub target_tick: f64,
}

impl Default for Drawer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drawer {
    pub fn new() -> Self {
        let mut world = World::new(false);
        // Fewer substeps than the sim world: the draw world only has to
        // look right between authoritative refreshes.
        world.steps = 2;
        Self {
            world,
            target_tick: 0.0,
        }
    }

    /// Copy fresh sim state down and reconcile membership. `map` is
    /// sim slot → draw slot. The copy is a snap, not a blend: after a
    /// load the draw world re-advances from the sim's tick to where it
    /// had been, so hot level reloads and authoritative corrections
    /// land as teleports.
    pub fn load(&mut self, sim: &World, map: &HashMap<usize, usize>) {
        let old_tick = self.world.tick;
        self.world.tick = sim.tick;

        let mut keep = HashSet::new();
        for (&sim_slot, &draw_slot) in map {
            keep.insert(draw_slot);
            let Some(src) = sim.body(sim_slot) else {
                continue;
            };
            let (pos, vel, rot, rot_vel) = (src.pos, src.vel, src.rot, src.rot_vel);
            if let Some(dst) = self.world.body_mut(draw_slot) {
                dst.pos = pos;
                dst.vel = vel;
                dst.rot = rot;
                dst.rot_vel = rot_vel;
            }
        }

        let stale: Vec<usize> = self
            .world
            .physics
            .slots()
            .filter(|slot| !keep.contains(slot))
            .collect();
        for slot in stale {
            match self.world.wire_id_of(slot) {
                Some(id) => {
                    self.world.remove_object(id);
                }
                None => self.world.remove_player(slot),
            }
        }

        let dt = (old_tick - sim.tick).max(0.0);
        self.world.update(dt);
    }

    /// Advance one rendered frame. The step size closes 1/15th of the
    /// gap to the target per frame plus a near-unit base rate, so the
    /// draw clock approaches the target without overshooting.
    pub fn update(&mut self) {
        self.target_tick += 1.0;
        let dt = ((self.target_tick - self.world.tick) / 15.0 + 14.0 / 15.0).max(0.0);
        self.world.update(dt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_filter_converges_without_overshoot() {
        let mut drawer = Drawer::new();
        drawer.target_tick = 20.0;

        let mut previous_gap = f64::INFINITY;
        for _ in 0..100 {
            drawer.update();
            let gap = drawer.target_tick - drawer.world.tick;
            assert!(gap > -1.0, "the draw clock must not overshoot");
            assert!(gap <= previous_gap + 1.0);
            previous_gap = gap;
        }
        assert!((drawer.target_tick - drawer.world.tick).abs() < 1.0);
    }

    #[test]
    fn load_copies_kinematics_through_the_slot_map() {
        let mut sim = World::new(false);
        let sim_slot = sim
            .insert_object(
                0,
                &json!({"type": "circle", "radius": 5.0, "pos": [0.0, 0.0]}),
            )
            .unwrap();

        let mut drawer = Drawer::new();
        let draw_slot = drawer
            .world
            .insert_object(
                0,
                &json!({"type": "circle", "radius": 5.0, "pos": [0.0, 0.0]}),
            )
            .unwrap();
        let map = HashMap::from([(sim_slot, draw_slot)]);

        sim.body_mut(sim_slot).unwrap().pos.x = 42.0;
        sim.tick = 7.0;
        drawer.load(&sim, &map);

        assert_eq!(drawer.world.body(draw_slot).unwrap().pos.x, 42.0);
        assert_eq!(drawer.world.tick, 7.0);
    }

    #[test]
    fn load_removes_objects_missing_from_the_sim() {
        let sim = World::new(false);
        let mut drawer = Drawer::new();
        drawer
            .world
            .insert_object(
                3,
                &json!({"type": "circle", "radius": 5.0, "pos": [0.0, 0.0]}),
            )
            .unwrap();

        drawer.load(&sim, &HashMap::new());
        assert!(drawer.world.objects.is_empty());
    }

    #[test]
    fn reload_snaps_draw_world() {
        // A hot level reload rewrites object state under the same tick;
        // the draw world takes the new state verbatim.
        let mut sim = World::new(false);
        let sim_slot = sim
            .insert_object(
                0,
                &json!({"type": "circle", "radius": 5.0, "pos": [0.0, 0.0]}),
            )
            .unwrap();
        sim.tick = 100.0;

        let mut drawer = Drawer::new();
        let draw_slot = drawer
            .world
            .insert_object(
                0,
                &json!({"type": "circle", "radius": 5.0, "pos": [0.0, 0.0]}),
            )
            .unwrap();
        drawer.world.tick = 100.0;
        let map = HashMap::from([(sim_slot, draw_slot)]);

        sim.body_mut(sim_slot).unwrap().pos.x = 500.0;
        drawer.load(&sim, &map);
        assert_eq!(drawer.world.body(draw_slot).unwrap().pos.x, 500.0);
    }
}
