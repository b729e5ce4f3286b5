//! The `broker` module holds the server side: the topic registry and the
//! engine that accepts connections and routes their packets.

pub mod engine;
pub mod registry;
pub mod topic;

pub use engine::Broker;
pub use registry::{Registry, SharedRegistry};
