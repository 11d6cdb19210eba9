use std::path::Path;

use glam::DVec2;
use serde::Deserialize;
use serde_json::Value;

use crate::world::{RecordError, World};

#[derive(Debug, thiserror::Error)]
pub enum LevelError {
    #[error("failed to read level file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse level file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("level constraint references an object not in the objects list")]
    MissingConstraintObject,
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("level script failed to load: {0}")]
    Script(#[from] crate::script::ScriptError),
}

/// On-disk level shape. Constraints reference objects by value: each
/// carries copies of the two object records, matched back to indices in
/// the objects list at load time.
#[derive(Debug, Clone, Deserialize)]
pub struct LevelFile {
    #[serde(default)]
    pub gravity: Option<[f64; 2]>,
    #[serde(default)]
    pub spawn: Option<[f64; 2]>,
    #[serde(default)]
    pub objects: Vec<Value>,
    #[serde(default)]
    pub constraints: Vec<LevelConstraint>,
    #[serde(default, rename = "serverScript")]
    pub server_script: Option<String>,
    #[serde(default, rename = "clientScript")]
    pub client_script: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LevelConstraint {
    #[serde(rename = "type")]
    pub kind: String,
    pub pos: Value,
    pub objects: [Value; 2],
}

pub fn load_level(path: &Path) -> Result<LevelFile, LevelError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Instantiate the authoritative world a level describes.
pub fn build_world(level: &LevelFile) -> Result<World, LevelError> {
    let mut world = World::new(true);
    let gravity = level.gravity.unwrap_or([0.0, 0.3]);
    world.set_gravity(DVec2::new(gravity[0], gravity[1]));
    let spawn = level.spawn.unwrap_or([0.0, 0.0]);
    world.spawn = DVec2::new(spawn[0], spawn[1]);

    let mut ids = Vec::with_capacity(level.objects.len());
    for record in &level.objects {
        ids.push(world.create_object(record.clone())?);
    }

    for constraint in &level.constraints {
        let index_of = |record: &Value| level.objects.iter().position(|other| other == record);
        let (Some(index_a), Some(index_b)) = (
            index_of(&constraint.objects[0]),
            index_of(&constraint.objects[1]),
        ) else {
            return Err(LevelError::MissingConstraintObject);
        };
        let descriptor = serde_json::json!({
            "type": constraint.kind,
            "pos": constraint.pos,
        });
        world.attach_level_constraint(ids[index_a], ids[index_b], &descriptor);
    }

    world.load_script(level.server_script.as_deref().unwrap_or(""))?;

    // World construction is not something the owner needs to replay.
    world.take_events();
    Ok(world)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_level() -> LevelFile {
        let floor = json!({
            "type": "polygon",
            "points": [[-100.0, 40.0], [100.0, 40.0], [100.0, 60.0], [-100.0, 60.0]],
            "colour": [80, 80, 80],
            "friction": 0.5,
            "restitution": 0.2,
            "lethal": false,
            "groups": [],
        });
        let wheel = json!({
            "type": "circle",
            "radius": 8.0,
            "pos": [0.0, 20.0],
            "colour": [200, 50, 50],
            "friction": 0.5,
            "restitution": 0.2,
            "lethal": false,
            "groups": ["wheels"],
            "physics": {"density": 0.5},
        });
        serde_json::from_value(json!({
            "gravity": [0.0, 0.3],
            "spawn": [0.0, 0.0],
            "objects": [floor, wheel],
            "constraints": [{
                "type": "pivot",
                "pos": [0.0, 20.0],
                "objects": [floor, wheel],
            }],
        }))
        .unwrap()
    }

    #[test]
    fn levels_build_into_worlds() {
        let world = build_world(&sample_level()).unwrap();
        assert_eq!(world.objects.len(), 2);
        assert_eq!(world.gravity(), DVec2::new(0.0, 0.3));
        assert_eq!(world.wire_constraints().len(), 1);
        assert_eq!(world.get_group("wheels").len(), 1);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let level: LevelFile = serde_json::from_value(json!({"objects": []})).unwrap();
        let world = build_world(&level).unwrap();
        assert_eq!(world.gravity(), DVec2::new(0.0, 0.3));
        assert_eq!(world.spawn, DVec2::ZERO);
    }

    #[test]
    fn dangling_constraints_are_an_error() {
        let mut level = sample_level();
        level.constraints[0].objects[1] = json!({"type": "circle", "radius": 1.0, "pos": [9.0, 9.0]});
        assert!(matches!(
            build_world(&level),
            Err(LevelError::MissingConstraintObject)
        ));
    }
}
