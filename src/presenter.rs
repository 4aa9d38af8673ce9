//! The presenter's question-broadcast and answer-grading loop.
//!
//! For every question the presenter opens one fresh connection per
//! non-presenter roster member and grades whatever arrives on it until the
//! peer answers correctly, the question is resolved elsewhere, or the
//! connection dies. A per-peer failure aborts only that peer's exchange.

use crate::error::GameError;
use crate::log;
use crate::message::{Message, PeerIdentity, Roster};
use crate::peer::notify_roster;
use crate::sync::Flag;
use color_print::cformat;
use futures::{SinkExt, StreamExt};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    net::TcpStream,
    sync::{watch, Mutex},
};
use tokio_util::codec::{Framed, LinesCodec};

#[derive(Clone)]
pub struct Presenter {
    identity: PeerIdentity,
    roster: Roster,
    scores: Arc<Mutex<HashMap<PeerIdentity, u32>>>,
    ended: Flag,
}

impl Presenter {
    /// Builds the presenter side for a resolved roster, with a zero score
    /// entry for every member.
    pub fn new(identity: PeerIdentity, roster: Roster) -> Self {
        let scores = Arc::new(Mutex::new(roster.zero_scores()));
        Self {
            identity,
            roster,
            scores,
            ended: Flag::new(false),
        }
    }

    /// Snapshot of the score map, e.g. for a leaderboard.
    pub async fn scores(&self) -> HashMap<PeerIdentity, u32> {
        self.scores.lock().await.clone()
    }

    pub async fn game_over(&self) -> bool {
        self.ended.read().await
    }

    /// Poses one question to every player and grades the answers. Returns
    /// only after all concurrent per-peer exchanges have completed; once
    /// one player answers correctly the sibling exchanges are closed. Does
    /// nothing after the game has ended.
    pub async fn ask_question(&self, question: &str, correct_answer: &str) {
        if self.ended.read().await {
            return;
        }

        let (done_tx, done_rx) = watch::channel(false);
        let done_tx = Arc::new(done_tx);

        let mut exchanges = Vec::new();
        for peer in self.roster.peers.iter().filter(|p| **p != self.identity) {
            let presenter = self.clone();
            let peer = peer.clone();
            let question = question.to_string();
            let correct_answer = correct_answer.to_string();
            let done_tx = Arc::clone(&done_tx);
            let done_rx = done_rx.clone();

            exchanges.push(tokio::spawn(async move {
                if let Err(e) = presenter
                    .grade_peer(peer.clone(), question, correct_answer, done_tx, done_rx)
                    .await
                {
                    log::error(&cformat!(
                        "The exchange with <bold>{peer}</bold> ended with an error: {e}"
                    ));
                }
            }));
        }

        for exchange in exchanges {
            if exchange.await.is_err() {
                log::error("A grading task failed.");
            }
        }
    }

    /// One peer's question exchange: send QUESTION, then grade raw answer
    /// lines until a correct one or until the question is resolved.
    async fn grade_peer(
        &self,
        peer: PeerIdentity,
        question: String,
        correct_answer: String,
        done: Arc<watch::Sender<bool>>,
        mut done_rx: watch::Receiver<bool>,
    ) -> Result<(), GameError> {
        let stream = TcpStream::connect(peer.addr()).await?;
        let mut lines = Framed::new(stream, LinesCodec::new());
        lines.send(Message::Question { question }.to_json_string()?).await?;

        loop {
            tokio::select! {
                _ = done_rx.changed() => return Ok(()), // resolved elsewhere
                answer = lines.next() => {
                    let answer = match answer {
                        None => return Ok(()), // peer closed the exchange
                        Some(answer) => answer?,
                    };

                    if answer_matches(&answer, &correct_answer) {
                        let score = {
                            let mut scores = self.scores.lock().await;
                            let entry = scores.entry(peer.clone()).or_insert(0);
                            *entry += 1;
                            *entry
                        };
                        lines
                            .send(
                                Message::CorrectAnswer {
                                    score: Some(score),
                                    message: None,
                                }
                                .to_json_string()?,
                            )
                            .await?;
                        notify_roster(
                            &self.roster.peers,
                            &Message::CorrectAnswer {
                                score: None,
                                message: Some(format!(
                                    "Player {} answered correctly!",
                                    peer.port
                                )),
                            },
                        )
                        .await;

                        if score >= self.roster.winning_score {
                            self.end_game(&peer).await;
                        }
                        let _ = done.send(true);
                        return Ok(());
                    }

                    notify_roster(
                        &self.roster.peers,
                        &Message::WrongAnswer {
                            message: Some(format!(
                                "Player {} answered incorrectly!",
                                peer.port
                            )),
                            peer: Some(peer.clone()),
                        },
                    )
                    .await;
                    lines
                        .send(
                            Message::WrongAnswer {
                                message: None,
                                peer: None,
                            }
                            .to_json_string()?,
                        )
                        .await?;
                }
            }
        }
    }

    /// Broadcasts END to the whole roster, once per session: repeated
    /// calls are no-ops, and receivers absorb duplicate END anyway.
    pub async fn end_game(&self, winner: &PeerIdentity) {
        if !self.ended.raise().await {
            return;
        }
        log::info(&cformat!("<bold>{winner}</bold> won the game."));

        let notice = Message::End {
            message: format!("GAME OVER: Player {} wins!", winner.port),
        };
        notify_roster(&self.roster.peers, &notice).await;
    }
}

/// Grading policy: trim surrounding whitespace on both sides, compare
/// case-insensitively.
fn answer_matches(submitted: &str, correct: &str) -> bool {
    submitted.trim().to_lowercase() == correct.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PeerIdentity;

    #[test]
    fn grading_ignores_case_and_surrounding_whitespace() {
        assert!(answer_matches("  ROME ", "rome"));
        assert!(answer_matches("rome", "  Rome  "));
        assert!(answer_matches("rOmE", "RoMe"));
        assert!(!answer_matches("roma", "rome"));
        assert!(!answer_matches("", "rome"));
    }

    #[tokio::test]
    async fn scores_start_at_zero_for_every_roster_member() {
        let a = PeerIdentity::new("10.0.0.1", 5000);
        let b = PeerIdentity::new("10.0.0.2", 5001);
        let roster = Roster {
            presenter: a.clone(),
            peers: vec![a.clone(), b.clone()],
            winning_score: 3,
        };
        let presenter = Presenter::new(a.clone(), roster);
        let scores = presenter.scores().await;
        assert_eq!(scores.get(&a), Some(&0));
        assert_eq!(scores.get(&b), Some(&0));
        assert!(!presenter.game_over().await);
    }
}
