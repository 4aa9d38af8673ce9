//! Module that contains all the different message types sent in the network.
//!
//! Every message is a single line of UTF-8 JSON with a `type` tag. The only
//! exceptions are answer submissions (raw unwrapped text on the open
//! question connection) and the plain-text registration replies below.

use crate::error::GameError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Reply sent by the directory when a registration is accepted.
pub const REGISTERED: &str = "REGISTERED";
/// Rejection sent when the roster already holds the configured player count.
pub const ERR_PLAYER_LIMIT: &str = "ERROR: Player limit reached";
/// Rejection sent when the registration carries an unusable port.
pub const ERR_INVALID_PORT: &str = "ERROR: Invalid port";

/// Listening endpoint of a peer, the sole peer-equality key: two identities
/// name the same peer iff both fields match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub host: String,
    pub port: u16,
}

impl PeerIdentity {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Connectable `host:port` form of the identity.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The finalized list of participants a session agrees on, broadcast
/// verbatim to every peer inside START.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    pub presenter: PeerIdentity,
    pub peers: Vec<PeerIdentity>,
    pub winning_score: u32,
}

impl Roster {
    /// Zero score entry for every roster member, taken when the roster arrives.
    pub fn zero_scores(&self) -> HashMap<PeerIdentity, u32> {
        self.peers.iter().cloned().map(|peer| (peer, 0)).collect()
    }
}

/// Envelope for everything exchanged between processes. `CORRECT_ANSWER`
/// and `WRONG_ANSWER` come in two shapes on the wire (direct grading reply
/// vs. roster broadcast), hence the optional fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "REGISTER")]
    Register { port: u16 },

    #[serde(rename = "START")]
    Start {
        presenter: PeerIdentity,
        peers: Vec<PeerIdentity>,
        winning_score: u32,
    },

    #[serde(rename = "QUESTION")]
    Question { question: String },

    #[serde(rename = "CORRECT_ANSWER")]
    CorrectAnswer {
        #[serde(skip_serializing_if = "Option::is_none")]
        score: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename = "WRONG_ANSWER")]
    WrongAnswer {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        peer: Option<PeerIdentity>,
    },

    #[serde(rename = "BUZZ")]
    Buzz { message: String, peer: PeerIdentity },

    #[serde(rename = "END")]
    End { message: String },
}

impl Message {
    /// Function that returns the message as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String, GameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Function that parses a message from a JSON formatted `String`.
    pub fn from_json_string(token: &str) -> Result<Self, GameError> {
        Ok(serde_json::from_str::<Self>(token)?)
    }
}
