//! The `transport` module is responsible for everything that touches the wire:
//! the binary packet codec and the per-connection read/write machinery shared
//! by the broker and the client session.

pub mod connection;
pub mod packet;

pub use connection::{Connection, ConnectionHandle, ConnectionId, FrameReader, Limits};
pub use packet::{Packet, PacketKind};
