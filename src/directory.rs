//! The one-time registration and roster-broadcast coordinator.
//!
//! Peers register over a persistent connection; once the configured player
//! count is reached the directory elects a presenter uniformly at random
//! and pushes START over every registration connection, exactly once. The
//! service takes no further part in play.

use crate::error::GameError;
use crate::log;
use crate::message::{Message, PeerIdentity, ERR_INVALID_PORT, ERR_PLAYER_LIMIT, REGISTERED};
use color_print::cformat;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex},
};
use tokio_util::codec::{Framed, LinesCodec};

#[derive(Clone)]
pub struct Directory {
    pub players: usize,
    pub winning_score: u32,
}

struct Registry {
    /// Registered identities paired with the channel into the task owning
    /// that peer's registration connection. Finalization takes the senders
    /// out, so the START push cannot happen twice.
    peers: Vec<(PeerIdentity, Option<mpsc::Sender<Message>>)>,
}

impl Directory {
    pub fn new(players: usize, winning_score: u32) -> Self {
        Self {
            players,
            winning_score,
        }
    }

    pub async fn run(&self, bind_addr: &str) -> Result<(), GameError> {
        let listener = TcpListener::bind(bind_addr).await?;
        log::info(&cformat!("Directory listening on <bold>{bind_addr}</bold>."));
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener, one worker task per
    /// connection. No single connection's failure takes the loop down.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameError> {
        let registry = Arc::new(Mutex::new(Registry { peers: Vec::new() }));

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let directory = self.clone();
                    let registry = Arc::clone(&registry);

                    tokio::spawn(async move {
                        if let Err(e) = directory.handle_registration(stream, addr, registry).await
                        {
                            log::error(&format!("Registration from {addr} failed: {e}"));
                        }
                    });
                }
                Err(e) => log::error(&format!("Failed to accept a connection: {e}")),
            }
        }
    }

    async fn handle_registration(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<Mutex<Registry>>,
    ) -> Result<(), GameError> {
        let mut lines = Framed::new(stream, LinesCodec::new());

        let line = match lines.next().await {
            Some(line) => line?,
            None => return Ok(()), // gave up before registering
        };
        let port = match Message::from_json_string(&line) {
            Ok(Message::Register { port }) => port,
            Ok(other) => {
                return Err(GameError::Protocol(format!(
                    "expected REGISTER, got {other:?}"
                )))
            }
            Err(e) => {
                // A REGISTER whose port is missing or not an integer still
                // gets the explicit rejection instead of a silent close.
                if Self::looks_like_register(&line) {
                    lines.send(ERR_INVALID_PORT.to_string()).await?;
                    return Err(GameError::Validation);
                }
                return Err(e);
            }
        };
        if port == 0 {
            lines.send(ERR_INVALID_PORT.to_string()).await?;
            return Err(GameError::Validation);
        }

        // The source IP observed on the accepted connection is
        // authoritative; only the listening port is taken from the peer.
        let identity = PeerIdentity::new(addr.ip().to_string(), port);
        let (tx, mut rx) = mpsc::channel::<Message>(1);

        let roster_full = {
            let mut registry = registry.lock().await;
            if registry.peers.len() >= self.players {
                drop(registry);
                lines.send(ERR_PLAYER_LIMIT.to_string()).await?;
                return Err(GameError::Capacity);
            }
            registry.peers.push((identity.clone(), Some(tx)));
            registry.peers.len() == self.players
        };

        lines.send(REGISTERED.to_string()).await?;
        log::info(&cformat!("Registered peer <bold>{identity}</bold>."));

        if roster_full {
            self.finalize(&registry).await;
        }

        // Forward whatever finalization pushes (the START) to this peer,
        // then let the registration connection go.
        while let Some(message) = rx.recv().await {
            lines.send(message.to_json_string()?).await?;
        }
        Ok(())
    }

    fn looks_like_register(line: &str) -> bool {
        serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|value| value.get("type").and_then(|t| t.as_str().map(String::from)))
            .as_deref()
            == Some("REGISTER")
    }

    /// One-time roster finalization. Only the task whose registration
    /// filled the roster gets here with senders left to drain, so the
    /// broadcast happens exactly once even under concurrent registrations.
    async fn finalize(&self, registry: &Arc<Mutex<Registry>>) {
        let (roster, senders) = {
            let mut registry = registry.lock().await;
            let roster: Vec<PeerIdentity> = registry
                .peers
                .iter()
                .map(|(identity, _)| identity.clone())
                .collect();
            let senders: Vec<(PeerIdentity, mpsc::Sender<Message>)> = registry
                .peers
                .iter_mut()
                .filter_map(|(identity, tx)| tx.take().map(|tx| (identity.clone(), tx)))
                .collect();
            (roster, senders)
        };

        let presenter = {
            let mut rng = rand::rng();
            roster[rng.random_range(0..roster.len())].clone()
        };
        log::info(&cformat!(
            "Starting the game with <bold>{presenter}</bold> presenting."
        ));

        let start = Message::Start {
            presenter,
            peers: roster,
            winning_score: self.winning_score,
        };
        for (identity, tx) in senders {
            if tx.send(start.clone()).await.is_err() {
                log::error(&format!("Couldn't push the starting roster to {identity}."));
            }
        }
    }
}
