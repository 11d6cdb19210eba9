pub mod level;
pub mod net;
pub mod physics;
pub mod script;
pub mod world;

pub use level::{LevelError, LevelFile, build_world, load_level};
pub use net::{
    Connection, ConnectionHandler, HandlerState, MTU, NetError, ObjectState, Packet, PacketKind,
    PlayerIntro, ThreadedConnectionHandler, Transport, WireError, connect,
};
pub use physics::{Aabb, Body, Collider, Constraint, CustomConstraint, PhysicsWorld};
pub use script::{ScriptError, ScriptHost, validate};
pub use world::{JumpState, ObjectMeta, PlayerMeta, World, WorldEvent};
