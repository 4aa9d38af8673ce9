//! A turn-based trivia game over plain TCP: a one-time directory service
//! registers a fixed number of peers, elects a presenter at random and
//! broadcasts the roster; from then on the peers play among themselves.
//! Players race to claim the buzzer through best-effort broadcast
//! arbitration, and the presenter grades whatever answer its per-peer
//! connection delivers first.

pub mod buzzer;
pub mod directory;
pub mod error;
pub mod log;
pub mod message;
pub mod peer;
pub mod presenter;
pub mod sync;

pub use buzzer::{BuzzerMachine, BuzzerState};
pub use directory::Directory;
pub use error::GameError;
pub use message::{Message, PeerIdentity, Roster};
pub use peer::{GameEvent, Peer, Role};
pub use presenter::Presenter;

use std::time::Duration;

/// Window a buzzer holder gets to submit an answer before the hold is
/// released with a self-declared timeout.
pub const DEFAULT_BUZZ_WINDOW: Duration = Duration::from_secs(10);
