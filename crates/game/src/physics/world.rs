use glam::DVec2;

use super::aabb::{Aabb, AabbTree};
use super::body::Body;
use super::collider::{self, Manifold};
use super::constraint::Constraint;

#[derive(Debug, Clone, Copy)]
pub struct SolverParams {
    pub baumgarte: f64,
    pub iterations: u32,
    pub slop_p: f64,
    pub slop_r: f64,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            baumgarte: 0.1,
            iterations: 10,
            slop_p: 0.3,
            slop_r: 0.01,
        }
    }
}

/// One overlapping collider pair found by the broad/narrow phase.
/// Collide hooks run over these between [`PhysicsWorld::begin_step`]
/// and [`PhysicsWorld::finish_step`], and may cancel individual pairs.
#[derive(Debug, Clone)]
pub struct CandidateContact {
    pub slot_a: usize,
    pub slot_b: usize,
    pub manifold: Manifold,
}

struct ContactPoint {
    ra: DVec2,
    rb: DVec2,
    k_normal: f64,
    k_tangent: f64,
    bias: f64,
    bounce: f64,
    normal_impulse: f64,
    tangent_impulse: f64,
}

struct ContactWork {
    slot_a: usize,
    slot_b: usize,
    normal: DVec2,
    friction: f64,
    points: Vec<ContactPoint>,
}

/// Rigid body arena plus the stepping pipeline. Slots are never
/// reused, so a slot index stays valid (if vacant) for the lifetime of
/// the world.
pub struct PhysicsWorld {
    bodies: Vec<Option<Body>>,
    pub gravity: DVec2,
    pub params: SolverParams,
    tree: AabbTree,
}

impl Default for PhysicsWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicsWorld {
    pub fn new() -> Self {
        Self {
            bodies: Vec::new(),
            gravity: DVec2::ZERO,
            params: SolverParams::default(),
            tree: AabbTree::new(),
        }
    }

    pub fn insert(&mut self, mut body: Body) -> usize {
        let slot = self.bodies.len();
        body.bounds = body.compute_bounds();
        self.tree.insert(slot, body.bounds);
        self.bodies.push(Some(body));
        slot
    }

    pub fn remove(&mut self, slot: usize) -> Option<Body> {
        let body = self.bodies.get_mut(slot)?.take();
        if body.is_some() {
            self.tree.remove(slot);
        }
        body
    }

    pub fn body(&self, slot: usize) -> Option<&Body> {
        self.bodies.get(slot)?.as_ref()
    }

    pub fn body_mut(&mut self, slot: usize) -> Option<&mut Body> {
        self.bodies.get_mut(slot)?.as_mut()
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.body(slot).is_some()
    }

    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.bodies
            .iter()
            .enumerate()
            .filter(|(_, body)| body.is_some())
            .map(|(slot, _)| slot)
    }

    pub fn len(&self) -> usize {
        self.bodies.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bounds of the whole scene, used by the kill plane.
    pub fn root_bounds(&self) -> Option<Aabb> {
        self.tree.root_bounds()
    }

    pub fn pair_mut(&mut self, i: usize, j: usize) -> Option<(&mut Body, &mut Body)> {
        if i == j || i >= self.bodies.len() || j >= self.bodies.len() {
            return None;
        }
        let (lo, hi) = if i < j { (i, j) } else { (j, i) };
        let (left, right) = self.bodies.split_at_mut(hi);
        let first = left[lo].as_mut()?;
        let second = right[0].as_mut()?;
        Some(if i < j { (first, second) } else { (second, first) })
    }

    /// First half of a substep: integrate velocities, refresh the broad
    /// phase and generate candidate contacts for the hook pass.
    pub fn begin_step(&mut self, dt: f64) -> Vec<CandidateContact> {
        for body in self.bodies.iter_mut().flatten() {
            if body.inv_mass > 0.0 {
                body.vel += self.gravity * dt;
            }
        }

        let slots: Vec<usize> = self.slots().collect();
        for &slot in &slots {
            if let Some(body) = self.bodies[slot].as_mut() {
                body.bounds = body.compute_bounds();
                let bounds = body.bounds;
                self.tree.update(slot, bounds);
            }
        }

        let mut contacts = Vec::new();
        for (slot_a, slot_b) in self.tree.pairs() {
            let (Some(a), Some(b)) = (self.body(slot_a), self.body(slot_b)) else {
                continue;
            };
            if a.is_static() && b.is_static() {
                continue;
            }
            if !a.bounds.overlaps(&b.bounds) {
                continue;
            }
            for ca in &a.colliders {
                for cb in &b.colliders {
                    if let Some(manifold) = collider::collide(a, ca, b, cb) {
                        contacts.push(CandidateContact {
                            slot_a,
                            slot_b,
                            manifold,
                        });
                    }
                }
            }
        }
        contacts
    }

    /// Second half of a substep: solve the surviving contacts and all
    /// attached constraints, then integrate positions.
    pub fn finish_step(&mut self, dt: f64, contacts: Vec<CandidateContact>, cancelled: &[bool]) {
        let inv_dt = 1.0 / dt;

        let mut work = self.prepare_contacts(contacts, cancelled, inv_dt);
        let mut constraints = self.take_constraints();

        for _ in 0..self.params.iterations {
            let params = self.params;
            for (owner, other, constraint) in &mut constraints {
                if let Some((a, b)) = self.pair_mut(*owner, *other) {
                    constraint.apply(a, b, &params, inv_dt);
                }
            }
            for contact in &mut work {
                self.solve_contact(contact);
            }
        }

        // Hand the surviving constraints back to their owners in order.
        for (owner, other, constraint) in constraints {
            if let Some(body) = self.body_mut(owner) {
                body.constraints.push((other, constraint));
            }
        }

        for body in self.bodies.iter_mut().flatten() {
            body.pos += body.vel * dt;
            body.rot += body.rot_vel * dt;
        }
    }

    /// Detach every constraint whose endpoints are both alive. Dangling
    /// constraints are dropped with a log line rather than crashing the
    /// step.
    fn take_constraints(&mut self) -> Vec<(usize, usize, Constraint)> {
        let mut out = Vec::new();
        let slots: Vec<usize> = self.slots().collect();
        for slot in slots {
            let taken = match self.bodies[slot].as_mut() {
                Some(body) => std::mem::take(&mut body.constraints),
                None => continue,
            };
            for (other, constraint) in taken {
                if self.contains(other) {
                    out.push((slot, other, constraint));
                } else {
                    log::warn!("dropping constraint to a removed body");
                }
            }
        }
        out
    }

    fn prepare_contacts(
        &self,
        contacts: Vec<CandidateContact>,
        cancelled: &[bool],
        inv_dt: f64,
    ) -> Vec<ContactWork> {
        let mut work = Vec::with_capacity(contacts.len());
        for (index, contact) in contacts.into_iter().enumerate() {
            if cancelled.get(index).copied().unwrap_or(false) {
                continue;
            }
            let (Some(a), Some(b)) = (self.body(contact.slot_a), self.body(contact.slot_b)) else {
                continue;
            };

            let normal = contact.manifold.normal;
            let tangent = DVec2::new(-normal.y, normal.x);
            let restitution = a.restitution.max(b.restitution);
            let friction = (a.friction * b.friction).sqrt();

            let mut points = Vec::with_capacity(contact.manifold.points.len());
            for point in &contact.manifold.points {
                let ra = point.world - a.pos;
                let rb = point.world - b.pos;

                let k = |axis: DVec2| {
                    let ca = ra.perp_dot(axis);
                    let cb = rb.perp_dot(axis);
                    a.inv_mass + b.inv_mass + a.inv_moment * ca * ca + b.inv_moment * cb * cb
                };

                let approach = (b.velocity_at(rb) - a.velocity_at(ra)).dot(normal);
                let bounce = if -approach > self.params.slop_r {
                    -restitution * approach
                } else {
                    0.0
                };
                let bias =
                    -self.params.baumgarte * inv_dt * (point.penetration - self.params.slop_p).max(0.0);

                points.push(ContactPoint {
                    ra,
                    rb,
                    k_normal: k(normal).max(1e-12),
                    k_tangent: k(tangent).max(1e-12),
                    bias,
                    bounce,
                    normal_impulse: 0.0,
                    tangent_impulse: 0.0,
                });
            }

            work.push(ContactWork {
                slot_a: contact.slot_a,
                slot_b: contact.slot_b,
                normal,
                friction,
                points,
            });
        }
        work
    }

    fn solve_contact(&mut self, contact: &mut ContactWork) {
        let Some((a, b)) = self.pair_mut(contact.slot_a, contact.slot_b) else {
            return;
        };
        let normal = contact.normal;
        let tangent = DVec2::new(-normal.y, normal.x);

        for point in &mut contact.points {
            // Normal impulse with accumulated clamping.
            let rel_vel = (b.velocity_at(point.rb) - a.velocity_at(point.ra)).dot(normal);
            let lambda = -(rel_vel + point.bias - point.bounce) / point.k_normal;
            let new_impulse = (point.normal_impulse + lambda).max(0.0);
            let applied = new_impulse - point.normal_impulse;
            point.normal_impulse = new_impulse;
            a.apply_impulse(-normal * applied, point.ra);
            b.apply_impulse(normal * applied, point.rb);

            // Friction clamped by the accumulated normal impulse.
            let rel_tangent = (b.velocity_at(point.rb) - a.velocity_at(point.ra)).dot(tangent);
            let lambda_t = -rel_tangent / point.k_tangent;
            let max_friction = contact.friction * point.normal_impulse;
            let new_tangent =
                (point.tangent_impulse + lambda_t).clamp(-max_friction, max_friction);
            let applied_t = new_tangent - point.tangent_impulse;
            point.tangent_impulse = new_tangent;
            a.apply_impulse(-tangent * applied_t, point.ra);
            b.apply_impulse(tangent * applied_t, point.rb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::collider::{Collider, ConvexPolygon};

    fn step(world: &mut PhysicsWorld, dt: f64) {
        let contacts = world.begin_step(dt);
        let cancelled = vec![false; contacts.len()];
        world.finish_step(dt, contacts, &cancelled);
    }

    fn ball(pos: DVec2, radius: f64, restitution: f64) -> Body {
        let mut body = Body::new(1.0, 1.0, restitution, 0.5);
        body.pos = pos;
        body.colliders.push(Collider::Circle { radius });
        body
    }

    fn static_floor(y: f64) -> Body {
        let mut body = Body::new(-1.0, -1.0, 0.0, 0.5);
        body.pos = DVec2::new(0.0, y);
        body.colliders.push(Collider::Polygon(ConvexPolygon::new(vec![
            DVec2::new(-200.0, -10.0),
            DVec2::new(200.0, -10.0),
            DVec2::new(200.0, 10.0),
            DVec2::new(-200.0, 10.0),
        ])));
        body
    }

    #[test]
    fn gravity_accelerates_dynamic_bodies() {
        let mut world = PhysicsWorld::new();
        world.gravity = DVec2::new(0.0, 0.3);
        let slot = world.insert(ball(DVec2::ZERO, 5.0, 0.0));

        for _ in 0..3 {
            step(&mut world, 1.0 / 3.0);
        }

        let body = world.body(slot).unwrap();
        assert!((body.vel.y - 0.3).abs() < 1e-9);
        assert!(body.pos.y > 0.0);
    }

    #[test]
    fn static_bodies_ignore_gravity() {
        let mut world = PhysicsWorld::new();
        world.gravity = DVec2::new(0.0, 0.3);
        let slot = world.insert(static_floor(50.0));

        step(&mut world, 1.0);
        let body = world.body(slot).unwrap();
        assert_eq!(body.vel, DVec2::ZERO);
        assert_eq!(body.pos, DVec2::new(0.0, 50.0));
    }

    #[test]
    fn a_ball_comes_to_rest_on_the_floor() {
        let mut world = PhysicsWorld::new();
        world.gravity = DVec2::new(0.0, 0.3);
        world.insert(static_floor(50.0));
        let slot = world.insert(ball(DVec2::new(0.0, 0.0), 5.0, 0.0));

        for _ in 0..600 {
            step(&mut world, 1.0 / 3.0);
        }

        let body = world.body(slot).unwrap();
        // Resting on the floor surface at y = 40 minus the radius,
        // within the solver's position slop.
        assert!((body.pos.y - 35.0).abs() < 1.5);
        assert!(body.vel.length() < 0.1);
    }

    #[test]
    fn restitution_bounces() {
        let mut world = PhysicsWorld::new();
        world.insert(static_floor(50.0));
        let slot = world.insert({
            let mut body = ball(DVec2::new(0.0, 34.0), 5.0, 0.9);
            body.vel = DVec2::new(0.0, 3.0);
            body
        });

        for _ in 0..30 {
            step(&mut world, 1.0 / 3.0);
        }

        let body = world.body(slot).unwrap();
        assert!(body.vel.y < -1.0);
    }

    #[test]
    fn slots_are_never_reused() {
        let mut world = PhysicsWorld::new();
        let first = world.insert(ball(DVec2::ZERO, 1.0, 0.0));
        world.remove(first);
        let second = world.insert(ball(DVec2::ZERO, 1.0, 0.0));
        assert_ne!(first, second);
        assert!(world.body(first).is_none());
        assert!(world.body(second).is_some());
    }

    #[test]
    fn hooks_can_cancel_contacts() {
        let mut world = PhysicsWorld::new();
        world.gravity = DVec2::new(0.0, 0.3);
        world.insert(static_floor(10.0));
        let slot = world.insert(ball(DVec2::new(0.0, 0.0), 5.0, 0.0));

        for _ in 0..120 {
            let contacts = world.begin_step(1.0 / 3.0);
            let cancelled = vec![true; contacts.len()];
            world.finish_step(1.0 / 3.0, contacts, &cancelled);
        }

        // With every contact cancelled the ball falls straight through.
        assert!(world.body(slot).unwrap().pos.y > 30.0);
    }
}
