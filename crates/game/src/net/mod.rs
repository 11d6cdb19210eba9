pub mod chunk;
pub mod connection;
pub mod frame;
pub mod handshake;
pub mod packets;
pub mod seq;
pub mod transport;
pub mod wire;

pub use connection::Connection;
pub use frame::{MTU, PROTOCOL_ID};
pub use handshake::{ConnectionHandler, HandlerState, NetError, ThreadedConnectionHandler, connect};
pub use packets::{ObjectState, Packet, PacketKind, PlayerIntro};
pub use seq::{PacketCache, Seq};
pub use transport::Transport;
pub use wire::WireError;
