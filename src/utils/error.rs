//! The `error` module defines the error types used within `tidemq`.
//!
//! Two layers exist: [`CodecError`] describes why a single frame could not be
//! encoded or decoded, and [`Error`] covers everything a broker or client
//! session operation can fail with.

use std::io;
use std::str::Utf8Error;

use thiserror::Error;

/// Errors raised while encoding or decoding one frame.
///
/// A decode error only ever condemns the frame it was raised for; callers log
/// it and keep the connection open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,

    #[error("unknown packet kind: {0}")]
    UnknownKind(u8),

    #[error("truncated {field}: need {needed} bytes, have {available}")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("topic is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] Utf8Error),

    #[error("{field} is {len} bytes, longer than a u16 length prefix allows")]
    FieldTooLong { field: &'static str, len: usize },
}

/// Main error type for `tidemq`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("could not resolve address {0}")]
    Resolve(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("outbound queue is full, peer is not reading")]
    QueueFull,

    #[error("timed out waiting for {0}")]
    AckTimeout(&'static str),

    #[error("topic name must not be empty")]
    EmptyTopic,
}

pub type Result<T> = std::result::Result<T, Error>;
