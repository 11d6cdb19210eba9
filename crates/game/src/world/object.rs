use glam::DVec2;
use serde_json::{Value, json};

use crate::physics::{Body, Collider, ConvexPolygon};
use crate::physics::collider::{ensure_winding, polygon_properties, triangulate};

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("object record is missing field `{0}`")]
    Missing(&'static str),
    #[error("object record field `{0}` is malformed")]
    Malformed(&'static str),
    #[error("unknown object type `{0}`")]
    UnknownType(String),
}

/// Triangle-wave positional animation relative to the initial state.
#[derive(Debug, Clone, PartialEq)]
pub struct Animation {
    pub period: f64,
    pub offset: DVec2,
    pub phase: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointZone {
    pub colour: [u8; 3],
    pub offset: DVec2,
}

#[derive(Debug, Clone)]
pub struct InitialState {
    pub colour: [u8; 3],
    pub pos: DVec2,
    pub vel: DVec2,
    pub rot: f64,
    pub rot_vel: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpState {
    Idle,
    /// Jump input held; converted on the next ground contact.
    Pressed,
    /// A jump constraint is attached and retires next update.
    Constrained,
}

#[derive(Debug, Clone)]
pub struct PlayerMeta {
    pub name: String,
    pub action: (f32, f32),
    /// −1 while alive; counts contact-to-respawn frames otherwise.
    pub dead: i32,
    pub jump: JumpState,
    /// Arena slot of the checkpoint object last touched.
    pub checkpoint: Option<usize>,
}

/// Game-level state carried alongside a [`Body`] in the world arena.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub colour: [u8; 3],
    pub lethal: bool,
    pub animated: Option<Animation>,
    pub checkpoint: Option<CheckpointZone>,
    pub groups: Vec<String>,
    pub trigger: Option<String>,
    pub dirty_state: bool,
    pub dirty_props: bool,
    /// Wire id for objects shared over the network; players and local
    /// scenery have none.
    pub wire_id: Option<u32>,
    /// Creation record echoed in `NewObject` packets.
    pub record: Option<Value>,
    pub initial: InitialState,
    pub player: Option<PlayerMeta>,
}

impl ObjectMeta {
    pub fn is_player(&self) -> bool {
        self.player.is_some()
    }
}

fn field_f64(value: &Value, key: &'static str) -> Result<f64, RecordError> {
    value
        .get(key)
        .ok_or(RecordError::Missing(key))?
        .as_f64()
        .ok_or(RecordError::Malformed(key))
}

pub(crate) fn vec2_value(value: &Value) -> Option<DVec2> {
    let list = value.as_array()?;
    if list.len() != 2 {
        return None;
    }
    Some(DVec2::new(list[0].as_f64()?, list[1].as_f64()?))
}

pub fn colour_value(value: &Value) -> Option<[u8; 3]> {
    let list = value.as_array()?;
    if list.len() < 3 {
        return None;
    }
    let channel = |v: &Value| v.as_f64().map(|c| c.clamp(0.0, 255.0) as u8);
    Some([channel(&list[0])?, channel(&list[1])?, channel(&list[2])?])
}

fn groups_value(value: &Value) -> Vec<String> {
    match value.as_array() {
        Some(list) => list
            .iter()
            .map(|entry| match entry {
                Value::String(name) => name.clone(),
                other => other.to_string(),
            })
            .collect(),
        None => Vec::new(),
    }
}

fn animation_value(value: &Value) -> Option<Animation> {
    if value.is_null() {
        return None;
    }
    Some(Animation {
        period: value.get("period")?.as_f64()?,
        offset: DVec2::new(value.get("dx")?.as_f64()?, value.get("dy")?.as_f64()?),
        phase: value.get("dt")?.as_f64()?,
    })
}

fn checkpoint_value(value: &Value) -> Option<CheckpointZone> {
    if value.is_null() {
        return None;
    }
    Some(CheckpointZone {
        colour: colour_value(value.get("colour")?)?,
        offset: DVec2::new(value.get("dx")?.as_f64()?, value.get("dy")?.as_f64()?),
    })
}

pub fn circle_mass_moment(radius: f64, density: f64) -> (f64, f64) {
    let mass = std::f64::consts::PI * radius * radius * density;
    let moment = mass * radius * radius / 2.0;
    (mass, moment)
}

/// Editor defaults for fields a record may omit.
pub fn with_defaults(mut record: Value) -> Value {
    if let Some(map) = record.as_object_mut() {
        let defaults = [
            ("colour", json!([255, 255, 255])),
            ("friction", json!(0.5)),
            ("restitution", json!(0.2)),
            ("lethal", json!(false)),
            ("groups", json!([])),
        ];
        for (key, value) in defaults {
            map.entry(key).or_insert(value);
        }
    }
    record
}

/// Build the body and metadata described by a JSON object record.
pub fn from_record(record: &Value) -> Result<(Body, ObjectMeta), RecordError> {
    let kind = record
        .get("type")
        .and_then(Value::as_str)
        .ok_or(RecordError::Missing("type"))?;
    let density = record
        .get("physics")
        .and_then(|physics| physics.get("density"))
        .and_then(Value::as_f64);

    let (pos, colliders, mass, moment) = match kind {
        "polygon" => {
            let mut points: Vec<DVec2> = record
                .get("points")
                .and_then(Value::as_array)
                .ok_or(RecordError::Missing("points"))?
                .iter()
                .map(vec2_value)
                .collect::<Option<_>>()
                .ok_or(RecordError::Malformed("points"))?;
            if points.len() < 3 {
                return Err(RecordError::Malformed("points"));
            }
            ensure_winding(&mut points);
            let (area, centroid, unit_moment) = polygon_properties(&points);
            for p in &mut points {
                *p -= centroid;
            }
            let (mass, moment) = match density {
                Some(density) => {
                    let mass = area * density;
                    (mass, mass * unit_moment)
                }
                None => (-1.0, -1.0),
            };
            let colliders = triangulate(&points)
                .into_iter()
                .map(Collider::Polygon)
                .collect();
            (centroid, colliders, mass, moment)
        }
        "circle" => {
            let radius = field_f64(record, "radius")?;
            let pos = record
                .get("pos")
                .and_then(vec2_value)
                .ok_or(RecordError::Missing("pos"))?;
            let (mass, moment) = match density {
                Some(density) => circle_mass_moment(radius, density),
                None => (-1.0, -1.0),
            };
            (pos, vec![Collider::Circle { radius }], mass, moment)
        }
        // Text bodies collide as their em-box; glyph outlines belong to
        // the rendering pipeline.
        "text" => {
            let size = field_f64(record, "size")?;
            let pos = record
                .get("pos")
                .and_then(vec2_value)
                .ok_or(RecordError::Missing("pos"))?;
            let half = size / 2.0;
            let (mass, moment) = match density {
                Some(density) => {
                    let mass = size * size * density;
                    (mass, mass * (size * size + size * size) / 12.0)
                }
                None => (-1.0, -1.0),
            };
            let collider = Collider::Polygon(ConvexPolygon::new(vec![
                DVec2::new(-half, -half),
                DVec2::new(half, -half),
                DVec2::new(half, half),
                DVec2::new(-half, half),
            ]));
            (pos, vec![collider], mass, moment)
        }
        other => return Err(RecordError::UnknownType(other.to_string())),
    };

    let restitution = record
        .get("restitution")
        .and_then(Value::as_f64)
        .unwrap_or(0.2);
    let friction = record.get("friction").and_then(Value::as_f64).unwrap_or(0.5);

    let mut body = Body::new(mass, moment, restitution, friction);
    body.pos = pos;
    body.colliders = colliders;

    let colour = record
        .get("colour")
        .and_then(colour_value)
        .unwrap_or([255, 255, 255]);
    let meta = ObjectMeta {
        colour,
        lethal: record
            .get("lethal")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        animated: record.get("animated").and_then(animation_value),
        checkpoint: record.get("checkpoint").and_then(checkpoint_value),
        groups: record.get("groups").map(groups_value).unwrap_or_default(),
        trigger: record
            .get("trigger")
            .and_then(Value::as_str)
            .map(str::to_string),
        dirty_state: false,
        dirty_props: false,
        wire_id: None,
        record: Some(record.clone()),
        initial: InitialState {
            colour,
            pos: body.pos,
            vel: body.vel,
            rot: body.rot,
            rot_vel: body.rot_vel,
        },
        player: None,
    };

    Ok((body, meta))
}

/// Property map broadcast in `ObjectProps` packets.
pub fn props_value(body: &Body, meta: &ObjectMeta) -> Value {
    json!({
        "colour": meta.colour,
        "mass": body.mass,
        "moment": body.moment,
        "animated": meta.animated.as_ref().map(|anim| json!({
            "period": anim.period,
            "dx": anim.offset.x,
            "dy": anim.offset.y,
            "dt": anim.phase,
        })),
        "lethal": meta.lethal,
        "checkpoint": meta.checkpoint.as_ref().map(|zone| json!({
            "colour": zone.colour,
            "dx": zone.offset.x,
            "dy": zone.offset.y,
        })),
        "groups": meta.groups,
        "trigger": meta.trigger,
    })
}

/// Apply a received property map, the inverse of [`props_value`].
pub fn apply_props(body: &mut Body, meta: &mut ObjectMeta, props: &Value) {
    if let Some(colour) = props.get("colour").and_then(colour_value) {
        meta.colour = colour;
    }
    if let Some(mass) = props.get("mass").and_then(Value::as_f64) {
        body.set_mass(mass);
    }
    if let Some(moment) = props.get("moment").and_then(Value::as_f64) {
        body.set_moment(moment);
    }
    if let Some(animated) = props.get("animated") {
        meta.animated = animation_value(animated);
    }
    if let Some(lethal) = props.get("lethal").and_then(Value::as_bool) {
        meta.lethal = lethal;
    }
    if let Some(checkpoint) = props.get("checkpoint") {
        meta.checkpoint = checkpoint_value(checkpoint);
    }
    if let Some(groups) = props.get("groups") {
        meta.groups = groups_value(groups);
    }
    if let Some(trigger) = props.get("trigger") {
        meta.trigger = trigger.as_str().map(str::to_string);
    }
}

/// Advance a triangle-wave animation: the object sweeps from its
/// initial position to `initial + offset` and back once per period.
pub fn animate(body: &mut Body, initial: &InitialState, animation: &Animation, tick: f64) {
    if animation.period <= 0.0 {
        return;
    }
    let fold = |time: f64| {
        let t = 2.0 * ((time + animation.phase).rem_euclid(animation.period)) / animation.period;
        if t > 1.0 { 2.0 - t } else { t }
    };
    let t = fold(tick);
    let dt = fold(tick + 1.0) - t;
    body.pos = initial.pos + animation.offset * t;
    body.vel = animation.offset * dt;
}

/// Restore the creation-time snapshot and flag the state for resync.
pub fn reset(body: &mut Body, meta: &mut ObjectMeta) {
    meta.colour = meta.initial.colour;
    body.pos = meta.initial.pos;
    body.vel = meta.initial.vel;
    body.rot = meta.initial.rot;
    body.rot_vel = meta.initial.rot_vel;
    meta.dirty_state = true;
}
