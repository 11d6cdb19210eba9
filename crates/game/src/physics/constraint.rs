use glam::DVec2;

use super::body::Body;
use super::world::SolverParams;

/// User-supplied constraint run once per solver iteration. The jump
/// impulse in the player module is the in-tree implementor; scripts and
/// game code may add their own.
pub trait CustomConstraint: std::fmt::Debug + Send {
    fn apply(&mut self, a: &mut Body, b: &mut Body);

    fn boxed_clone(&self) -> Box<dyn CustomConstraint>;

    /// Marks the player's one-shot jump impulse so it can be retired
    /// after the step that created it.
    fn is_player_jump(&self) -> bool {
        false
    }
}

impl Clone for Box<dyn CustomConstraint> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

#[derive(Debug, Clone)]
pub enum Constraint {
    /// The two anchor points coincide.
    Pivot { local_a: DVec2, local_b: DVec2 },
    /// Anchors coincide and the relative rotation stays at `rest_rot`.
    Fixed {
        local_a: DVec2,
        local_b: DVec2,
        rest_rot: f64,
    },
    /// Anchor separation is locked along `normal` (in A's local frame);
    /// sliding along the perpendicular is free.
    Slider {
        local_a: DVec2,
        local_b: DVec2,
        normal: DVec2,
    },
    Custom(Box<dyn CustomConstraint>),
}

impl Constraint {
    pub fn is_player_jump(&self) -> bool {
        match self {
            Constraint::Custom(custom) => custom.is_player_jump(),
            _ => false,
        }
    }

    pub fn apply(&mut self, a: &mut Body, b: &mut Body, params: &SolverParams, inv_dt: f64) {
        match self {
            Constraint::Pivot { local_a, local_b } => {
                solve_point(a, b, *local_a, *local_b, params, inv_dt);
            }
            Constraint::Fixed {
                local_a,
                local_b,
                rest_rot,
            } => {
                solve_point(a, b, *local_a, *local_b, params, inv_dt);
                solve_angle(a, b, *rest_rot, params, inv_dt);
            }
            Constraint::Slider {
                local_a,
                local_b,
                normal,
            } => {
                solve_slider(a, b, *local_a, *local_b, *normal, params, inv_dt);
            }
            Constraint::Custom(custom) => custom.apply(a, b),
        }
    }
}

/// Point-to-point velocity constraint with Baumgarte stabilisation,
/// solved as a 2x2 block.
fn solve_point(a: &mut Body, b: &mut Body, local_a: DVec2, local_b: DVec2, params: &SolverParams, inv_dt: f64) {
    let ra = a.local_to_world_vec(local_a);
    let rb = b.local_to_world_vec(local_b);

    let error = (b.pos + rb) - (a.pos + ra);
    let bias = error * (params.baumgarte * inv_dt);
    let rel_vel = b.velocity_at(rb) - a.velocity_at(ra);
    let rhs = -(rel_vel + bias);

    let im = a.inv_mass + b.inv_mass;
    let ia = a.inv_moment;
    let ib = b.inv_moment;
    let k00 = im + ia * ra.y * ra.y + ib * rb.y * rb.y;
    let k01 = -ia * ra.x * ra.y - ib * rb.x * rb.y;
    let k11 = im + ia * ra.x * ra.x + ib * rb.x * rb.x;

    let det = k00 * k11 - k01 * k01;
    if det.abs() < 1e-12 {
        return;
    }
    let impulse = DVec2::new(
        (k11 * rhs.x - k01 * rhs.y) / det,
        (k00 * rhs.y - k01 * rhs.x) / det,
    );

    a.apply_impulse(-impulse, ra);
    b.apply_impulse(impulse, rb);
}

fn solve_angle(a: &mut Body, b: &mut Body, rest_rot: f64, params: &SolverParams, inv_dt: f64) {
    let k = a.inv_moment + b.inv_moment;
    if k < 1e-12 {
        return;
    }
    let error = (b.rot - a.rot) - rest_rot;
    let rel = b.rot_vel - a.rot_vel;
    let impulse = -(rel + params.baumgarte * inv_dt * error) / k;
    a.rot_vel -= impulse * a.inv_moment;
    b.rot_vel += impulse * b.inv_moment;
}

fn solve_slider(
    a: &mut Body,
    b: &mut Body,
    local_a: DVec2,
    local_b: DVec2,
    normal: DVec2,
    params: &SolverParams,
    inv_dt: f64,
) {
    let ra = a.local_to_world_vec(local_a);
    let rb = b.local_to_world_vec(local_b);
    let n = a.local_to_world_vec(normal);

    let error = ((b.pos + rb) - (a.pos + ra)).dot(n);
    let rel_vel = (b.velocity_at(rb) - a.velocity_at(ra)).dot(n);

    let cross_a = ra.perp_dot(n);
    let cross_b = rb.perp_dot(n);
    let k = a.inv_mass + b.inv_mass + a.inv_moment * cross_a * cross_a + b.inv_moment * cross_b * cross_b;
    if k < 1e-12 {
        return;
    }

    let impulse = -(rel_vel + params.baumgarte * inv_dt * error) / k;
    a.apply_impulse(-n * impulse, ra);
    b.apply_impulse(n * impulse, rb);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SolverParams {
        SolverParams::default()
    }

    #[test]
    fn pivot_pulls_anchors_together() {
        let mut a = Body::new(1.0, 1.0, 0.0, 0.0);
        let mut b = Body::new(1.0, 1.0, 0.0, 0.0);
        b.pos = DVec2::new(2.0, 0.0);

        let mut constraint = Constraint::Pivot {
            local_a: DVec2::ZERO,
            local_b: DVec2::ZERO,
        };

        let dt = 1.0 / 3.0;
        for _ in 0..60 {
            for _ in 0..10 {
                constraint.apply(&mut a, &mut b, &params(), 1.0 / dt);
            }
            a.pos += a.vel * dt;
            b.pos += b.vel * dt;
        }

        assert!((b.pos - a.pos).length() < 0.5);
    }

    #[test]
    fn pivot_leaves_static_bodies_alone() {
        let mut a = Body::new(-1.0, -1.0, 0.0, 0.0);
        let mut b = Body::new(-1.0, -1.0, 0.0, 0.0);
        b.pos = DVec2::new(5.0, 0.0);

        let mut constraint = Constraint::Pivot {
            local_a: DVec2::ZERO,
            local_b: DVec2::ZERO,
        };
        constraint.apply(&mut a, &mut b, &params(), 3.0);

        assert_eq!(a.vel, DVec2::ZERO);
        assert_eq!(b.vel, DVec2::ZERO);
    }

    #[test]
    fn slider_permits_tangential_motion() {
        let mut a = Body::new(-1.0, -1.0, 0.0, 0.0);
        let mut b = Body::new(1.0, 1.0, 0.0, 0.0);
        b.vel = DVec2::new(3.0, 0.0);

        // Lock along y, slide along x.
        let mut constraint = Constraint::Slider {
            local_a: DVec2::ZERO,
            local_b: DVec2::ZERO,
            normal: DVec2::Y,
        };
        constraint.apply(&mut a, &mut b, &params(), 3.0);

        assert!((b.vel.x - 3.0).abs() < 1e-9);
        assert!(b.vel.y.abs() < 1e-9);
    }

    #[test]
    fn fixed_locks_relative_rotation() {
        let mut a = Body::new(-1.0, -1.0, 0.0, 0.0);
        let mut b = Body::new(1.0, 1.0, 0.0, 0.0);
        b.rot_vel = 2.0;

        let mut constraint = Constraint::Fixed {
            local_a: DVec2::ZERO,
            local_b: DVec2::ZERO,
            rest_rot: 0.0,
        };
        for _ in 0..10 {
            constraint.apply(&mut a, &mut b, &params(), 3.0);
        }

        assert!(b.rot_vel.abs() < 0.1);
    }
}
