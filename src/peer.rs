//! A quiz peer: listener, role resolution, buzzer driving and the outward
//! event stream.
//!
//! The peer binds any free local port, registers that port with the
//! directory and blocks on the registration connection until START names
//! the roster and the presenter. From then on its listener accepts one
//! worker task per inbound connection: question connections stay open for
//! the answer exchange, notification connections carry a broadcast and
//! close. The core never renders anything; received traffic is handed
//! outward as [`GameEvent`]s on a channel the caller consumes.

use crate::buzzer::{BuzzerMachine, BuzzerState};
use crate::error::GameError;
use crate::log;
use crate::message::{Message, PeerIdentity, Roster, REGISTERED};
use color_print::cformat;
use futures::{SinkExt, StreamExt};
use std::{io, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::codec::{Framed, LinesCodec};

/// Role a peer claims from the roster broadcast: Presenter iff its own
/// identity equals the broadcast presenter identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Presenter,
    Player,
}

/// Typed event handed outward whenever the listener receives protocol
/// traffic. A rendering layer subscribes to these; the core never blocks
/// on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    Question {
        question: String,
    },
    Buzz {
        message: String,
        peer: PeerIdentity,
    },
    CorrectAnswer {
        score: Option<u32>,
        message: Option<String>,
    },
    WrongAnswer {
        message: Option<String>,
        peer: Option<PeerIdentity>,
    },
    End {
        message: String,
    },
}

pub struct Peer {
    shared: Arc<PeerShared>,
    listener: Option<TcpListener>,
    directory: Option<Framed<TcpStream, LinesCodec>>,
}

/// State reachable from the accept loop, the question-exchange tasks and
/// the hold timer at the same time. The buzzer machine sits behind a lock
/// because buzz-attempt evaluation must not race with incoming
/// notifications.
struct PeerShared {
    identity: PeerIdentity,
    buzz_window: Duration,
    events: mpsc::UnboundedSender<GameEvent>,
    machine: Mutex<BuzzerMachine>,
    /// Feed into the currently open question connection, replaced whenever
    /// a new QUESTION arrives and cleared on END.
    answer_feed: Mutex<Option<mpsc::Sender<String>>>,
    hold_timer: Mutex<Option<JoinHandle<()>>>,
    roster: RwLock<Option<Roster>>,
}

impl Peer {
    /// Binds a listener on any free port of `host` and returns the peer
    /// together with the receiving end of its event stream.
    ///
    /// `host` must be the interface the directory will observe as this
    /// peer's source address; the roster records the observed IP, and role
    /// resolution compares the two for exact equality.
    pub async fn bind(
        host: &str,
        buzz_window: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GameEvent>), GameError> {
        let listener = TcpListener::bind((host, 0)).await?;
        let local = listener.local_addr()?;
        let identity = PeerIdentity::new(local.ip().to_string(), local.port());
        log::info(&cformat!("Peer listening on <bold>{identity}</bold>."));

        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PeerShared {
            identity,
            buzz_window,
            events,
            machine: Mutex::new(BuzzerMachine::new()),
            answer_feed: Mutex::new(None),
            hold_timer: Mutex::new(None),
            roster: RwLock::new(None),
        });

        Ok((
            Self {
                shared,
                listener: Some(listener),
                directory: None,
            },
            events_rx,
        ))
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.shared.identity
    }

    pub async fn roster(&self) -> Option<Roster> {
        self.shared.roster.read().await.clone()
    }

    pub async fn buzzer_state(&self) -> BuzzerState {
        self.shared.machine.lock().await.state().clone()
    }

    /// Starts the accept loop: one handler task per inbound connection. A
    /// single connection's error is logged and closes only that
    /// connection; the loop keeps serving.
    pub fn spawn_listener(&mut self) -> Result<JoinHandle<()>, GameError> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| GameError::Protocol("listener already running".to_string()))?;
        let shared = Arc::clone(&self.shared);

        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(shared, stream).await {
                                log::error(&format!("Dropped an inbound connection: {e}"));
                            }
                        });
                    }
                    Err(e) => log::error(&format!("Failed to accept a connection: {e}")),
                }
            }
        }))
    }

    /// Registers this peer's listening port with the directory. The
    /// connection is kept: the directory pushes START over it.
    pub async fn register(&mut self, directory_addr: &str) -> Result<(), GameError> {
        let stream = TcpStream::connect(directory_addr).await?;
        let mut lines = Framed::new(stream, LinesCodec::new());

        lines
            .send(
                Message::Register {
                    port: self.shared.identity.port,
                }
                .to_json_string()?,
            )
            .await?;

        let reply = match lines.next().await {
            Some(line) => line?,
            None => {
                return Err(connection_lost(
                    "the directory closed the registration connection",
                ))
            }
        };
        if reply != REGISTERED {
            return Err(GameError::from_rejection(&reply));
        }

        log::info("Registered with the directory, waiting for the game to start.");
        self.directory = Some(lines);
        Ok(())
    }

    /// Blocks until START arrives on the registration connection, then
    /// stores the roster and resolves this peer's role. Losing the
    /// connection before START ends the session for this peer.
    pub async fn await_start(&mut self) -> Result<Role, GameError> {
        let lines = self
            .directory
            .as_mut()
            .ok_or_else(|| GameError::Protocol("not registered with a directory".to_string()))?;

        while let Some(line) = lines.next().await {
            let line = line?;
            match Message::from_json_string(&line) {
                Ok(Message::Start {
                    presenter,
                    peers,
                    winning_score,
                }) => {
                    let roster = Roster {
                        presenter,
                        peers,
                        winning_score,
                    };
                    let role = if roster.presenter == self.shared.identity {
                        Role::Presenter
                    } else {
                        Role::Player
                    };
                    log::info(&cformat!("Assigned role: <bold>{role:?}</bold>."));

                    *self.shared.roster.write().await = Some(roster);
                    self.directory = None;
                    return Ok(role);
                }
                Ok(_) => log::error("Unexpected message while waiting for the roster."),
                Err(e) => log::error(&format!("{e}")),
            }
        }
        Err(connection_lost(
            "lost the registration connection before the roster arrived",
        ))
    }

    /// Attempts to claim the buzzer. On success the claim is broadcast to
    /// the full roster and the hold timer starts; the hold is released
    /// with a self-declared timeout notice if no grading reply arrives
    /// within the window. Returns false when the buzzer is not claimable
    /// (another recorded holder, no pending question, or this peer already
    /// burned its attempt).
    pub async fn buzz(&self) -> Result<bool, GameError> {
        let roster = match self.shared.roster.read().await.clone() {
            Some(roster) => roster,
            None => return Err(GameError::Protocol("no roster received yet".to_string())),
        };

        let claimed = self.shared.machine.lock().await.try_buzz();
        if !claimed {
            return Ok(false);
        }

        let notice = Message::Buzz {
            message: format!(
                "Player {} buzzed in and has {}s to answer!",
                self.shared.identity.port,
                self.shared.buzz_window.as_secs()
            ),
            peer: self.shared.identity.clone(),
        };
        notify_roster(&roster.peers, &notice).await;

        let shared = Arc::clone(&self.shared);
        let timer = tokio::spawn(async move {
            sleep(shared.buzz_window).await;
            shared.hold_expired().await;
        });
        *self.shared.hold_timer.lock().await = Some(timer);
        Ok(true)
    }

    /// Sends an answer as raw text on the open question connection.
    pub async fn submit_answer(&self, answer: impl Into<String>) -> Result<(), GameError> {
        let feed = self.shared.answer_feed.lock().await.clone();
        match feed {
            Some(tx) => tx
                .send(answer.into())
                .await
                .map_err(|_| GameError::Protocol("the question exchange is closed".to_string())),
            None => Err(GameError::Protocol(
                "no open question to answer".to_string(),
            )),
        }
    }
}

impl PeerShared {
    /// Hold timer fired. If the hold is still live, release it and tell
    /// the roster via a self-declared timeout WRONG_ANSWER.
    async fn hold_expired(&self) {
        // The notice below reaches this peer too, and its handler aborts
        // the hold timer. Detach the handle first so that abort cannot
        // cancel the fan-out still running here.
        self.hold_timer.lock().await.take();

        let released = {
            let mut machine = self.machine.lock().await;
            if *machine.state() == BuzzerState::Holding {
                machine.holder_released(&self.identity, &self.identity);
                true
            } else {
                false
            }
        };
        if !released {
            return;
        }

        log::debug(&cformat!(
            "Buzz hold of <bold>{}</bold> timed out.",
            self.identity
        ));
        let roster = self.roster.read().await.clone();
        if let Some(roster) = roster {
            let notice = Message::WrongAnswer {
                message: Some(format!(
                    "Player {} took too long to answer!",
                    self.identity.port
                )),
                peer: Some(self.identity.clone()),
            };
            notify_roster(&roster.peers, &notice).await;
        }
    }

    async fn abort_hold_timer(&self) {
        if let Some(timer) = self.hold_timer.lock().await.take() {
            timer.abort();
        }
    }

    /// Applies a broadcast notification to the local buzzer view and hands
    /// it outward. Returns false once the connection should close.
    async fn apply_notification(&self, message: Message) -> Result<bool, GameError> {
        match message {
            Message::Buzz { message, peer } => {
                if peer != self.identity {
                    self.machine.lock().await.remote_buzz(peer.clone());
                }
                let _ = self.events.send(GameEvent::Buzz { message, peer });
                Ok(true)
            }
            Message::WrongAnswer { message, peer } => {
                if let Some(offender) = &peer {
                    if *offender == self.identity {
                        self.abort_hold_timer().await;
                    }
                    self.machine
                        .lock()
                        .await
                        .holder_released(offender, &self.identity);
                }
                let _ = self.events.send(GameEvent::WrongAnswer { message, peer });
                Ok(true)
            }
            Message::CorrectAnswer { score, message } => {
                self.abort_hold_timer().await;
                self.machine.lock().await.correct_answer();
                let _ = self.events.send(GameEvent::CorrectAnswer { score, message });
                Ok(true)
            }
            Message::End { message } => {
                self.abort_hold_timer().await;
                self.machine.lock().await.end();
                // Dropping the feed wakes any exchange still parked on it.
                self.answer_feed.lock().await.take();
                let _ = self.events.send(GameEvent::End { message });
                Ok(false)
            }
            Message::Register { .. } | Message::Start { .. } | Message::Question { .. } => Err(
                GameError::Protocol("unexpected message on the peer listener".to_string()),
            ),
        }
    }

    /// Runs the answer exchange over an open question connection: forwards
    /// submitted answers to the presenter and feeds grading replies into
    /// the buzzer machine and the event stream. Ends when the question is
    /// answered correctly, the presenter closes the connection, or a newer
    /// question replaces the feed.
    async fn run_answer_exchange(
        &self,
        question: String,
        lines: &mut Framed<TcpStream, LinesCodec>,
    ) -> Result<(), GameError> {
        self.machine.lock().await.question_received();

        let (tx, mut rx) = mpsc::channel::<String>(1);
        *self.answer_feed.lock().await = Some(tx);
        let _ = self.events.send(GameEvent::Question { question });

        loop {
            tokio::select! {
                submitted = rx.recv() => match submitted {
                    Some(answer) => lines.send(answer).await?,
                    None => return Ok(()),
                },
                reply = lines.next() => match reply {
                    None => return Ok(()),
                    Some(line) => match Message::from_json_string(&line?)? {
                        Message::CorrectAnswer { score, message } => {
                            self.abort_hold_timer().await;
                            self.machine.lock().await.correct_answer();
                            let _ = self.events.send(GameEvent::CorrectAnswer { score, message });
                            return Ok(());
                        }
                        Message::WrongAnswer { message, peer } => {
                            self.abort_hold_timer().await;
                            self.machine
                                .lock()
                                .await
                                .holder_released(&self.identity, &self.identity);
                            let _ = self.events.send(GameEvent::WrongAnswer { message, peer });
                        }
                        other => {
                            return Err(GameError::Protocol(format!(
                                "unexpected grading reply: {other:?}"
                            )))
                        }
                    },
                },
            }
        }
    }
}

async fn handle_connection(shared: Arc<PeerShared>, stream: TcpStream) -> Result<(), GameError> {
    let mut lines = Framed::new(stream, LinesCodec::new());

    while let Some(line) = lines.next().await {
        match Message::from_json_string(&line?)? {
            Message::Question { question } => {
                shared.run_answer_exchange(question, &mut lines).await?;
                break;
            }
            notification => {
                if !shared.apply_notification(notification).await? {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Fans a message out to every roster member, one fresh connection per
/// peer, closed after the single send. A peer that cannot be reached is
/// logged and skipped, never retried.
pub async fn notify_roster(peers: &[PeerIdentity], message: &Message) {
    let line = match message.to_json_string() {
        Ok(line) => line,
        Err(e) => {
            log::error(&format!("Couldn't encode a notification: {e}"));
            return;
        }
    };
    for peer in peers {
        if let Err(e) = send_to_peer(peer, line.clone()).await {
            log::error(&format!("Couldn't notify {peer}: {e}"));
        }
    }
}

async fn send_to_peer(peer: &PeerIdentity, line: String) -> Result<(), GameError> {
    let stream = TcpStream::connect(peer.addr()).await?;
    let mut lines = Framed::new(stream, LinesCodec::new());
    lines.send(line).await?;
    Ok(())
}

fn connection_lost(context: &str) -> GameError {
    GameError::Transport(io::Error::new(
        io::ErrorKind::ConnectionReset,
        context.to_string(),
    ))
}
