//! # tidemq
//!
//! `tidemq` is a minimal publish/subscribe broker over TCP, using a compact
//! binary framing loosely modelled on MQTT. Delivery is best-effort and
//! at-most-once, to currently connected subscribers only; nothing is persisted.
//!
//! ## Core Modules
//!
//! - `transport`: the packet codec and the per-connection read/write/keep-alive tasks.
//! - `broker`: the topic registry and the engine that accepts and serves connections.
//! - `client`: the client session used to publish and subscribe.
//! - `config`: layered configuration (defaults, `config/default.*`, environment).
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;

pub use broker::Broker;
pub use client::Session;
pub use transport::{Packet, PacketKind};
pub use utils::{CodecError, Error, Result};
