//! Error taxonomy shared by the bus, the capture loop and the tracker network

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::bus::EventName;
use crate::session::SessionState;

/// Event bus registration errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("event `{0}` already has a subscriber")]
    DuplicateSubscription(EventName),

    #[error("event bus is closed")]
    Closed,
}

/// A tracker sent something that does not follow the wire protocol
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("empty message")]
    EmptyMessage,

    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),

    #[error("message body truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("expected {expected} message, got {found}")]
    Unexpected {
        expected: &'static str,
        found: &'static str,
    },

    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid tracker identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid track reply: {0}")]
    InvalidReply(String),
}

/// The connection to a tracker broke or stalled
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("no reply within {0:?}")]
    TimedOut(Duration),

    #[error("connection closed")]
    Closed,
}

/// Any failure of a single tracker link
#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        LinkError::Transport(TransportError::Io(err))
    }
}

/// Video decoding failures other than a clean end of stream
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("corrupt frame: {0}")]
    Corrupt(String),

    #[error("cannot seek to frame {0}")]
    Seek(u64),

    #[error("decoder backend: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open {path:?}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("no video loaded")]
    NotLoaded,

    #[error("cannot start decode thread: {0}")]
    Thread(#[source] io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("cannot listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// A line of operator input that is not a command
#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("unknown command `{0}`")]
    Unknown(String),

    #[error("`{command}` expects {expected}")]
    Arguments {
        command: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no frame has been decoded yet")]
    NoFrame,

    #[error("{action} is not allowed while {state}")]
    NotAllowed {
        action: &'static str,
        state: SessionState,
    },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

pub use config::ConfigError;
