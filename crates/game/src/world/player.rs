use glam::DVec2;

use crate::physics::{Aabb, Body, Collider, CustomConstraint};

use super::object::{
    InitialState, JumpState, ObjectMeta, PlayerMeta, circle_mass_moment,
};

pub const PLAYER_RADIUS: f64 = 15.0;
pub const PLAYER_DENSITY: f64 = 0.5;
const PLAYER_RESTITUTION: f64 = 0.2;
const PLAYER_FRICTION: f64 = 0.8;

/// Respawn scatter so stacked players do not spawn inside each other.
pub fn spawn_jitter() -> DVec2 {
    DVec2::new(
        rand::random::<f64>() - 0.5,
        rand::random::<f64>() - 0.5,
    ) * 2.0
}

fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

pub fn player_body(spawn: DVec2) -> Body {
    let (mass, moment) = circle_mass_moment(PLAYER_RADIUS, PLAYER_DENSITY);
    let mut body = Body::new(mass, moment, PLAYER_RESTITUTION, PLAYER_FRICTION);
    body.colliders.push(Collider::Circle {
        radius: PLAYER_RADIUS,
    });
    body.pos = spawn + spawn_jitter();
    body
}

pub fn player_meta(name: &str, colour: [u8; 3], body: &Body) -> ObjectMeta {
    ObjectMeta {
        colour,
        lethal: false,
        animated: None,
        checkpoint: None,
        groups: Vec::new(),
        trigger: None,
        dirty_state: false,
        dirty_props: false,
        wire_id: None,
        record: None,
        initial: InitialState {
            colour,
            pos: body.pos,
            vel: body.vel,
            rot: body.rot,
            rot_vel: body.rot_vel,
        },
        player: Some(PlayerMeta {
            name: name.to_string(),
            action: (0.0, 0.0),
            dead: -1,
            jump: JumpState::Idle,
            checkpoint: None,
        }),
    }
}

/// The ball is driven by torquing its angular energy rather than its
/// angular velocity, so spin-up feels heavy at speed. Holding the
/// brake (`action.y > 0`) steers the spin towards zero and snaps to a
/// stop when the sign flips.
pub fn roll_control(body: &mut Body, action: (f32, f32)) {
    let delta = 0.01;
    let (stopping, direction) = if action.1 > 0.0 {
        (Some(body.rot_vel), if body.rot_vel > 0.0 { -1.0 } else { 1.0 })
    } else {
        (None, action.0 as f64)
    };

    let roll = direction * delta;
    let energy = body.rot_vel.abs() * body.rot_vel + roll;
    body.rot_vel = energy.abs().sqrt() * sign(energy);

    if let Some(previous) = stopping {
        if sign(body.rot_vel) != sign(previous) {
            body.rot_vel = 0.0;
        }
    }

    if (body.rot_vel + roll).abs() < f64::max(0.7, body.rot_vel.abs()) {
        body.rot_vel += roll;
    }
}

/// True once the player has fallen past everything in the scene along
/// the gravity direction, with half a tick of lookahead.
pub fn below_kill_plane(scene: Aabb, gravity: DVec2, pos: DVec2, vel: DVec2) -> bool {
    if gravity == DVec2::ZERO {
        return false;
    }
    let corners = [
        scene.lower,
        DVec2::new(scene.lower.x, scene.upper.y),
        DVec2::new(scene.upper.x, scene.lower.y),
        scene.upper,
    ];
    let deepest = corners
        .iter()
        .map(|corner| corner.dot(gravity))
        .fold(f64::NEG_INFINITY, f64::max);
    deepest - (pos.dot(gravity) + vel.dot(gravity) * 0.5) < 0.0
}

/// One-shot impulse towards a jump's target take-off speed, applied as
/// a custom constraint so it cooperates with the rest of the solver
/// and is retired on the player's next update.
#[derive(Debug, Clone)]
pub struct JumpConstraint {
    normal: DVec2,
    local_a: DVec2,
    local_b: DVec2,
    target_velocity: f64,
    impulse: f64,
}

impl JumpConstraint {
    pub fn new(normal: DVec2, local_a: DVec2, local_b: DVec2, strength: f64) -> Self {
        Self {
            normal,
            local_a,
            local_b,
            target_velocity: 8.0 * strength,
            impulse: 0.0,
        }
    }
}

impl CustomConstraint for JumpConstraint {
    fn apply(&mut self, a: &mut Body, b: &mut Body) {
        let offset_a = a.local_to_world_vec(self.local_a);
        let offset_b = b.local_to_world_vec(self.local_b);

        // Jacobian over [a.vel, a.rot_vel, b.vel, b.rot_vel], with the
        // player's own spin left free.
        let j = [
            -self.normal.x,
            -self.normal.y,
            self.normal.perp_dot(offset_a),
            self.normal.x,
            self.normal.y,
            -self.normal.perp_dot(offset_b),
        ];
        let m = [
            a.inv_mass,
            a.inv_mass,
            a.inv_moment,
            b.inv_mass,
            b.inv_mass,
            b.inv_moment,
        ];
        let v = [a.vel.x, a.vel.y, 0.0, b.vel.x, b.vel.y, b.rot_vel];

        let jv: f64 = j.iter().zip(&v).map(|(j, v)| j * v).sum();
        let effective_mass: f64 = j.iter().zip(&m).map(|(j, m)| j * j * m).sum();
        if effective_mass < 1e-12 {
            return;
        }

        let bias = self.target_velocity;
        let impulse = -(jv + bias) / effective_mass;
        self.impulse += impulse;

        let dv: Vec<f64> = j.iter().zip(&m).map(|(j, m)| j * m * impulse).collect();
        a.vel += DVec2::new(dv[0], dv[1]);
        a.rot_vel += dv[2];
        b.vel += DVec2::new(dv[3], dv[4]);
        b.rot_vel += dv[5];
    }

    fn boxed_clone(&self) -> Box<dyn CustomConstraint> {
        Box::new(self.clone())
    }

    fn is_player_jump(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roll_accelerates_towards_input() {
        let mut body = player_body(DVec2::ZERO);
        for _ in 0..30 {
            roll_control(&mut body, (1.0, 0.0));
        }
        assert!(body.rot_vel > 0.0);
    }

    #[test]
    fn brake_stops_spin_without_reversing() {
        let mut body = player_body(DVec2::ZERO);
        body.rot_vel = 0.4;
        for _ in 0..200 {
            roll_control(&mut body, (0.0, 1.0));
        }
        // The brake dithers around zero by at most one roll increment.
        assert!(body.rot_vel.abs() <= 0.011);
    }

    #[test]
    fn kill_plane_triggers_below_the_scene() {
        let scene = Aabb::new(DVec2::new(-100.0, -100.0), DVec2::new(100.0, 100.0));
        let gravity = DVec2::new(0.0, 0.3);
        assert!(below_kill_plane(
            scene,
            gravity,
            DVec2::new(0.0, 500.0),
            DVec2::ZERO
        ));
        assert!(!below_kill_plane(
            scene,
            gravity,
            DVec2::new(0.0, 0.0),
            DVec2::ZERO
        ));
    }

    #[test]
    fn jump_constraint_lifts_the_player() {
        let mut player = player_body(DVec2::ZERO);
        let mut floor = Body::new(-1.0, -1.0, 0.0, 0.5);
        floor.pos = DVec2::new(0.0, 20.0);

        // Gravity is +y, so the contact normal on the player points -y.
        let normal = DVec2::new(0.0, -1.0);
        let mut jump = JumpConstraint::new(
            normal,
            DVec2::new(0.0, PLAYER_RADIUS),
            DVec2::new(0.0, -5.0),
            1.0,
        );

        for _ in 0..10 {
            jump.apply(&mut player, &mut floor);
        }
        assert!(player.vel.y < -4.0);
    }
}
