//! The `client` module is the peer side of the protocol: a [`Session`]
//! connects to a broker, publishes, and dispatches subscribed messages to
//! callbacks.

pub mod session;

pub use session::{MessageCallback, Session};

#[cfg(test)]
mod tests;
