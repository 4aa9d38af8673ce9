//! Error taxonomy for the quiz protocol.
//!
//! Errors stay local to the peer-pair exchange that produced them: a failed
//! send to one peer never aborts a sibling exchange or an accept loop.

use crate::message::{ERR_INVALID_PORT, ERR_PLAYER_LIMIT};
use std::io;
use tokio_util::codec::LinesCodecError;

#[derive(Debug, thiserror::Error)]
pub enum GameError {
    /// Connection refused, reset or otherwise gone. The affected exchange
    /// is abandoned; nothing is retried.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// Malformed or unexpected message. The offending connection is closed.
    #[error("malformed or unexpected message: {0}")]
    Protocol(String),

    /// Registration arrived after the roster was already full.
    #[error("player limit reached")]
    Capacity,

    /// Registration carried an unusable listening port.
    #[error("invalid port")]
    Validation,
}

impl GameError {
    /// Maps the directory's textual rejection replies back onto the taxonomy.
    pub fn from_rejection(reply: &str) -> Self {
        match reply {
            ERR_PLAYER_LIMIT => Self::Capacity,
            ERR_INVALID_PORT => Self::Validation,
            other => Self::Protocol(format!("unexpected registration reply: {other}")),
        }
    }
}

impl From<serde_json::Error> for GameError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<LinesCodecError> for GameError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::Io(e) => Self::Transport(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}
