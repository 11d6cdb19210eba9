use glam::{DMat2, DVec2};

use super::aabb::Aabb;
use super::collider::Collider;
use super::constraint::Constraint;

/// Angular velocity cross position, the 2D analogue of ω × r.
pub fn cross_scalar(w: f64, v: DVec2) -> DVec2 {
    DVec2::new(-w * v.y, w * v.x)
}

pub fn rotate(v: DVec2, angle: f64) -> DVec2 {
    DMat2::from_angle(angle) * v
}

/// Rigid body state. A `mass` or `moment` of −1 means infinite, giving
/// an inverse of zero; both fields are kept alongside their inverses
/// because the sentinel value travels over the wire in property
/// packets.
#[derive(Debug, Clone)]
pub struct Body {
    pub pos: DVec2,
    pub vel: DVec2,
    pub rot: f64,
    pub rot_vel: f64,

    pub mass: f64,
    pub moment: f64,
    pub inv_mass: f64,
    pub inv_moment: f64,

    pub restitution: f64,
    pub friction: f64,

    pub colliders: Vec<Collider>,
    /// Constraints anchored on this body; the `usize` is the arena slot
    /// of the partner body.
    pub constraints: Vec<(usize, Constraint)>,

    pub bounds: Aabb,
}

fn invert(value: f64) -> f64 {
    if value < 0.0 { 0.0 } else { 1.0 / value }
}

impl Body {
    pub fn new(mass: f64, moment: f64, restitution: f64, friction: f64) -> Self {
        Self {
            pos: DVec2::ZERO,
            vel: DVec2::ZERO,
            rot: 0.0,
            rot_vel: 0.0,
            mass,
            moment,
            inv_mass: invert(mass),
            inv_moment: invert(moment),
            restitution,
            friction,
            colliders: Vec::new(),
            constraints: Vec::new(),
            bounds: Aabb::point(DVec2::ZERO),
        }
    }

    pub fn set_mass(&mut self, mass: f64) {
        self.mass = mass;
        self.inv_mass = invert(mass);
    }

    pub fn set_moment(&mut self, moment: f64) {
        self.moment = moment;
        self.inv_moment = invert(moment);
    }

    pub fn is_static(&self) -> bool {
        self.inv_mass == 0.0 && self.inv_moment == 0.0
    }

    pub fn local_to_world(&self, p: DVec2) -> DVec2 {
        self.pos + rotate(p, self.rot)
    }

    pub fn local_to_world_vec(&self, v: DVec2) -> DVec2 {
        rotate(v, self.rot)
    }

    pub fn world_to_local(&self, p: DVec2) -> DVec2 {
        rotate(p - self.pos, -self.rot)
    }

    /// Velocity of the material point at world offset `r` from the
    /// centre of mass.
    pub fn velocity_at(&self, r: DVec2) -> DVec2 {
        self.vel + cross_scalar(self.rot_vel, r)
    }

    pub fn apply_impulse(&mut self, impulse: DVec2, r: DVec2) {
        self.vel += impulse * self.inv_mass;
        self.rot_vel += r.perp_dot(impulse) * self.inv_moment;
    }

    pub fn compute_bounds(&self) -> Aabb {
        let mut bounds: Option<Aabb> = None;
        for collider in &self.colliders {
            let collider_bounds = collider.bounds(self.pos, self.rot);
            bounds = Some(match bounds {
                Some(current) => current.union(collider_bounds),
                None => collider_bounds,
            });
        }
        bounds.unwrap_or(Aabb::point(self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_mass_means_infinite() {
        let body = Body::new(-1.0, -1.0, 0.2, 0.5);
        assert_eq!(body.inv_mass, 0.0);
        assert_eq!(body.inv_moment, 0.0);
        assert!(body.is_static());
    }

    #[test]
    fn impulses_respect_inverse_mass() {
        let mut body = Body::new(2.0, 4.0, 0.0, 0.0);
        body.apply_impulse(DVec2::new(4.0, 0.0), DVec2::new(0.0, 1.0));
        assert!((body.vel.x - 2.0).abs() < 1e-12);
        // r × j = (0,1) × (4,0) = -4, scaled by 1/4.
        assert!((body.rot_vel + 1.0).abs() < 1e-12);
    }

    #[test]
    fn local_world_round_trip() {
        let mut body = Body::new(1.0, 1.0, 0.0, 0.0);
        body.pos = DVec2::new(3.0, -2.0);
        body.rot = 0.7;
        let p = DVec2::new(1.5, 2.5);
        let round = body.world_to_local(body.local_to_world(p));
        assert!((round - p).length() < 1e-12);
    }
}
