pub mod validate;

use std::cell::RefCell;
use std::rc::Rc;

use glam::DVec2;
use mlua::{Function, Lua, LuaOptions, LuaSerdeExt, StdLib, Table, Value as LuaValue};
use serde_json::Value;

pub use validate::{Violation, validate};

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script error: {0}")]
    Lua(#[from] mlua::Error),
}

/// Mutations a script queued during a hook. Scripts never touch the
/// world directly; the world drains and applies these after each hook
/// round, which keeps the hook surface re-entrant and the borrow story
/// trivial.
#[derive(Debug, Clone)]
pub enum ScriptCommand {
    CreateObject(Value),
    RemoveObject(u32),
    ResetObject(u32),
    SetColour(u32, [u8; 3]),
    SetPosition(u32, DVec2),
    SetVelocity(u32, DVec2),
    CloneGroup(String),
}

/// Read-only world state pushed into the Lua environment before hooks
/// run.
#[derive(Debug, Clone, Default)]
pub struct WorldMirror {
    pub time: f64,
    pub gravity: DVec2,
    pub spawn: DVec2,
    pub objects: Vec<MirrorObject>,
    pub players: Vec<MirrorPlayer>,
}

#[derive(Debug, Clone)]
pub struct MirrorObject {
    pub id: u32,
    pub pos: DVec2,
    pub vel: DVec2,
    pub rot: f64,
    pub rot_vel: f64,
    pub colour: [u8; 3],
    pub lethal: bool,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MirrorPlayer {
    pub name: String,
    pub pos: DVec2,
    pub vel: DVec2,
    pub dead: bool,
}

/// Base-library escape hatches removed from the sandbox. The stdlib
/// selection below never loads `os`/`io`/`package`/`debug` at all.
const REMOVED_GLOBALS: &[&str] = &[
    "load",
    "loadstring",
    "dofile",
    "loadfile",
    "collectgarbage",
    "rawget",
    "rawset",
    "rawequal",
    "rawlen",
    "getmetatable",
    "setmetatable",
];

const PRELUDE: &str = r#"
function get_group(name)
    local found = {}
    for id, obj in pairs(objects) do
        for _, group in ipairs(obj.groups) do
            if group == name then
                found[#found + 1] = id
                break
            end
        end
    end
    return found
end
"#;

/// Embedded Lua host for one world. The script defines global hook
/// functions (`load`, `tick`, `on_death`, `add_object`,
/// `remove_object`, and any collision triggers); the host provides the
/// world mirror and, on host worlds, the queued mutators.
pub struct ScriptHost {
    lua: Lua,
    queue: Rc<RefCell<Vec<ScriptCommand>>>,
}

impl ScriptHost {
    pub fn new(source: &str, is_host: bool) -> Result<Self, ScriptError> {
        let lua = Lua::new_with(
            StdLib::MATH | StdLib::TABLE | StdLib::STRING,
            LuaOptions::default(),
        )?;
        let queue = Rc::new(RefCell::new(Vec::new()));

        {
            let globals = lua.globals();
            for name in REMOVED_GLOBALS {
                globals.set(*name, LuaValue::Nil)?;
            }
            globals.set("objects", lua.create_table()?)?;
            globals.set("players", lua.create_table()?)?;
            globals.set("world", lua.create_table()?)?;

            if is_host {
                register_mutators(&lua, &queue)?;
            }
        }

        lua.load(PRELUDE).set_name("prelude").exec()?;
        lua.load(source).set_name("script").exec()?;

        Ok(Self { lua, queue })
    }

    pub fn drain(&self) -> Vec<ScriptCommand> {
        std::mem::take(&mut self.queue.borrow_mut())
    }

    /// Refresh the Lua-side view of the world. Errors are logged; a
    /// stale mirror is better than a dead tick loop.
    pub fn sync(&self, mirror: &WorldMirror) {
        if let Err(e) = self.try_sync(mirror) {
            log::warn!("script mirror sync failed: {}", e);
        }
    }

    fn try_sync(&self, mirror: &WorldMirror) -> Result<(), mlua::Error> {
        let world: Table = self.lua.globals().get("world")?;
        world.set("time", mirror.time)?;
        world.set("gravity", self.pair(mirror.gravity)?)?;
        world.set("spawn", self.pair(mirror.spawn)?)?;

        let objects = self.lua.create_table()?;
        for obj in &mirror.objects {
            let entry = self.lua.create_table()?;
            entry.set("pos", self.pair(obj.pos)?)?;
            entry.set("vel", self.pair(obj.vel)?)?;
            entry.set("rot", obj.rot)?;
            entry.set("rot_vel", obj.rot_vel)?;
            entry.set("colour", vec![obj.colour[0], obj.colour[1], obj.colour[2]])?;
            entry.set("lethal", obj.lethal)?;
            entry.set("groups", obj.groups.clone())?;
            objects.set(obj.id, entry)?;
        }
        self.lua.globals().set("objects", objects)?;

        let players = self.lua.create_table()?;
        for (index, player) in mirror.players.iter().enumerate() {
            let entry = self.lua.create_table()?;
            entry.set("name", player.name.clone())?;
            entry.set("pos", self.pair(player.pos)?)?;
            entry.set("vel", self.pair(player.vel)?)?;
            entry.set("dead", player.dead)?;
            players.set(index + 1, entry)?;
        }
        self.lua.globals().set("players", players)?;

        Ok(())
    }

    fn pair(&self, v: DVec2) -> Result<Table, mlua::Error> {
        let table = self.lua.create_table()?;
        table.set("x", v.x)?;
        table.set("y", v.y)?;
        Ok(table)
    }

    fn hook(&self, name: &str) -> Option<Function> {
        self.lua.globals().get::<Option<Function>>(name).ok()?
    }

    pub fn has_hook(&self, name: &str) -> bool {
        self.hook(name).is_some()
    }

    pub fn call_load(&self) {
        if let Some(hook) = self.hook("load") {
            if let Err(e) = hook.call::<()>(()) {
                log::warn!("script load hook failed: {}", e);
            }
        }
    }

    pub fn call_tick(&self) {
        if let Some(hook) = self.hook("tick") {
            if let Err(e) = hook.call::<()>(()) {
                log::warn!("script tick hook failed: {}", e);
            }
        }
    }

    pub fn call_on_death(&self, player: &str) {
        if let Some(hook) = self.hook("on_death") {
            if let Err(e) = hook.call::<()>(player) {
                log::warn!("script on_death hook failed: {}", e);
            }
        }
    }

    pub fn call_add_object(&self, id: u32) {
        if let Some(hook) = self.hook("add_object") {
            if let Err(e) = hook.call::<()>(id) {
                log::warn!("script add_object hook failed: {}", e);
            }
        }
    }

    pub fn call_remove_object(&self, id: u32) {
        if let Some(hook) = self.hook("remove_object") {
            if let Err(e) = hook.call::<()>(id) {
                log::warn!("script remove_object hook failed: {}", e);
            }
        }
    }

    /// Collision trigger. Ids are `nil` for players. A truthy return
    /// cancels the contact.
    pub fn call_trigger(
        &self,
        name: &str,
        self_id: Option<u32>,
        other_id: Option<u32>,
        normal: DVec2,
        local_a: DVec2,
        local_b: DVec2,
    ) -> bool {
        let Some(hook) = self.hook(name) else {
            return false;
        };
        let args = (
            self_id,
            other_id,
            normal.x,
            normal.y,
            local_a.x,
            local_a.y,
            local_b.x,
            local_b.y,
        );
        match hook.call::<LuaValue>(args) {
            Ok(LuaValue::Nil) | Ok(LuaValue::Boolean(false)) => false,
            Ok(_) => true,
            Err(e) => {
                log::warn!("script trigger `{}` failed: {}", name, e);
                false
            }
        }
    }
}

fn register_mutators(lua: &Lua, queue: &Rc<RefCell<Vec<ScriptCommand>>>) -> Result<(), mlua::Error> {
    let globals = lua.globals();

    let q = Rc::clone(queue);
    globals.set(
        "create_object",
        lua.create_function(move |lua, record: Table| {
            let value: Value = lua.from_value(LuaValue::Table(record))?;
            q.borrow_mut().push(ScriptCommand::CreateObject(value));
            Ok(())
        })?,
    )?;

    let q = Rc::clone(queue);
    globals.set(
        "remove_object",
        lua.create_function(move |_, id: u32| {
            q.borrow_mut().push(ScriptCommand::RemoveObject(id));
            Ok(())
        })?,
    )?;

    let q = Rc::clone(queue);
    globals.set(
        "reset_object",
        lua.create_function(move |_, id: u32| {
            q.borrow_mut().push(ScriptCommand::ResetObject(id));
            Ok(())
        })?,
    )?;

    let q = Rc::clone(queue);
    globals.set(
        "set_colour",
        lua.create_function(move |_, (id, r, g, b): (u32, u8, u8, u8)| {
            q.borrow_mut().push(ScriptCommand::SetColour(id, [r, g, b]));
            Ok(())
        })?,
    )?;

    let q = Rc::clone(queue);
    globals.set(
        "set_position",
        lua.create_function(move |_, (id, x, y): (u32, f64, f64)| {
            q.borrow_mut()
                .push(ScriptCommand::SetPosition(id, DVec2::new(x, y)));
            Ok(())
        })?,
    )?;

    let q = Rc::clone(queue);
    globals.set(
        "set_velocity",
        lua.create_function(move |_, (id, x, y): (u32, f64, f64)| {
            q.borrow_mut()
                .push(ScriptCommand::SetVelocity(id, DVec2::new(x, y)));
            Ok(())
        })?,
    )?;

    let q = Rc::clone(queue);
    globals.set(
        "clone_group",
        lua.create_function(move |_, name: String| {
            q.borrow_mut().push(ScriptCommand::CloneGroup(name));
            Ok(())
        })?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hooks_are_detected_and_called() {
        let host = ScriptHost::new(
            "ticks = 0\nfunction tick() ticks = ticks + 1 end",
            false,
        )
        .unwrap();
        assert!(host.has_hook("tick"));
        assert!(!host.has_hook("load"));

        host.call_tick();
        host.call_tick();
        let ticks: u32 = host.lua.globals().get("ticks").unwrap();
        assert_eq!(ticks, 2);
    }

    #[test]
    fn mutators_queue_commands_on_host_worlds() {
        let host = ScriptHost::new(
            "function load() set_colour(3, 255, 0, 0) remove_object(7) end",
            true,
        )
        .unwrap();
        host.call_load();
        let commands = host.drain();
        assert_eq!(commands.len(), 2);
        assert!(matches!(
            commands[0],
            ScriptCommand::SetColour(3, [255, 0, 0])
        ));
        assert!(matches!(commands[1], ScriptCommand::RemoveObject(7)));
    }

    #[test]
    fn mutators_are_absent_on_client_worlds() {
        let result = ScriptHost::new("create_object({})", false);
        // `create_object` is nil on a non-host world, so loading fails.
        assert!(result.is_err());
    }

    #[test]
    fn mirror_is_visible_to_scripts() {
        let host = ScriptHost::new(
            "function tick() first = objects[4].pos.x count = #get_group('doors') end",
            false,
        )
        .unwrap();
        let mirror = WorldMirror {
            time: 9.0,
            objects: vec![MirrorObject {
                id: 4,
                pos: DVec2::new(12.5, 0.0),
                vel: DVec2::ZERO,
                rot: 0.0,
                rot_vel: 0.0,
                colour: [1, 2, 3],
                lethal: false,
                groups: vec!["doors".into()],
            }],
            ..WorldMirror::default()
        };
        host.sync(&mirror);
        host.call_tick();

        let first: f64 = host.lua.globals().get("first").unwrap();
        let count: u32 = host.lua.globals().get("count").unwrap();
        assert_eq!(first, 12.5);
        assert_eq!(count, 1);
    }

    #[test]
    fn trigger_truthiness_cancels_contacts() {
        let host = ScriptHost::new(
            "function pad(self_id, other_id) return other_id == nil end",
            false,
        )
        .unwrap();
        // Players arrive as nil ids.
        assert!(host.call_trigger(
            "pad",
            Some(1),
            None,
            DVec2::Y,
            DVec2::ZERO,
            DVec2::ZERO
        ));
        assert!(!host.call_trigger(
            "pad",
            Some(1),
            Some(2),
            DVec2::Y,
            DVec2::ZERO,
            DVec2::ZERO
        ));
    }

    #[test]
    fn sandbox_removes_escape_hatches() {
        let host = ScriptHost::new("ok = (load == nil) and (setmetatable == nil)", false).unwrap();
        let ok: bool = host.lua.globals().get("ok").unwrap();
        assert!(ok);
    }
}
