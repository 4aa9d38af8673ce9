//! End-to-end scenarios over real localhost connections: one directory
//! task, three peer processes' worth of state in one test binary.

use futures::{SinkExt, StreamExt};
use quiz_buzzer::{
    BuzzerState, Directory, GameError, GameEvent, Message, Peer, PeerIdentity, Presenter, Role,
    DEFAULT_BUZZ_WINDOW,
};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};

async fn spawn_directory(players: usize, winning_score: u32) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let directory = Directory::new(players, winning_score);
        let _ = directory.serve(listener).await;
    });
    addr
}

struct TestPeer {
    peer: Peer,
    events: UnboundedReceiver<GameEvent>,
    role: Role,
}

async fn join_game(directory_addr: &str, buzz_window: Duration) -> TestPeer {
    let (mut peer, events) = Peer::bind("127.0.0.1", buzz_window).await.unwrap();
    peer.spawn_listener().unwrap();
    peer.register(directory_addr).await.unwrap();
    let role = peer.await_start().await.unwrap();
    TestPeer { peer, events, role }
}

async fn recv_until(
    events: &mut UnboundedReceiver<GameEvent>,
    pred: impl Fn(&GameEvent) -> bool,
) -> GameEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

#[tokio::test]
async fn roster_broadcast_is_identical_for_every_peer() {
    let addr = spawn_directory(3, 5).await;
    let (a, b, c) = tokio::join!(
        join_game(&addr, DEFAULT_BUZZ_WINDOW),
        join_game(&addr, DEFAULT_BUZZ_WINDOW),
        join_game(&addr, DEFAULT_BUZZ_WINDOW)
    );
    let peers = [a, b, c];

    let mut rosters = Vec::new();
    for peer in &peers {
        rosters.push(peer.peer.roster().await.unwrap());
    }
    assert_eq!(rosters[0], rosters[1]);
    assert_eq!(rosters[1], rosters[2]);
    assert_eq!(rosters[0].winning_score, 5);
    assert_eq!(rosters[0].peers.len(), 3);
    for peer in &peers {
        assert!(rosters[0].peers.contains(peer.peer.identity()));
    }

    // Exactly one peer resolved itself as the broadcast presenter.
    let presenters = peers
        .iter()
        .filter(|peer| peer.role == Role::Presenter)
        .count();
    assert_eq!(presenters, 1);
}

#[tokio::test]
async fn late_registration_is_rejected_once_the_roster_is_full() {
    let addr = spawn_directory(3, 3).await;
    let (a, b, c) = tokio::join!(
        join_game(&addr, DEFAULT_BUZZ_WINDOW),
        join_game(&addr, DEFAULT_BUZZ_WINDOW),
        join_game(&addr, DEFAULT_BUZZ_WINDOW)
    );

    let (mut late, _events) = Peer::bind("127.0.0.1", DEFAULT_BUZZ_WINDOW).await.unwrap();
    let err = late.register(&addr).await.unwrap_err();
    assert!(matches!(err, GameError::Capacity));

    // The rejected peer never made it into anyone's roster.
    for peer in [&a, &b, &c] {
        let roster = peer.peer.roster().await.unwrap();
        assert!(!roster.peers.contains(late.identity()));
        assert_eq!(roster.peers.len(), 3);
    }
}

#[tokio::test]
async fn zero_port_registration_is_rejected_without_consuming_a_slot() {
    let addr = spawn_directory(2, 3).await;

    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut lines = Framed::new(stream, LinesCodec::new());
    lines
        .send(r#"{"type":"REGISTER","port":0}"#.to_string())
        .await
        .unwrap();
    let reply = lines.next().await.unwrap().unwrap();
    assert_eq!(reply, "ERROR: Invalid port");

    // So does a REGISTER whose port is not an integer at all.
    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut lines = Framed::new(stream, LinesCodec::new());
    lines
        .send(r#"{"type":"REGISTER","port":"not-a-port"}"#.to_string())
        .await
        .unwrap();
    let reply = lines.next().await.unwrap().unwrap();
    assert_eq!(reply, "ERROR: Invalid port");

    // Two valid peers can still fill the roster afterwards.
    let (a, b) = tokio::join!(
        join_game(&addr, DEFAULT_BUZZ_WINDOW),
        join_game(&addr, DEFAULT_BUZZ_WINDOW)
    );
    let roster = a.peer.roster().await.unwrap();
    assert_eq!(roster.peers.len(), 2);
    assert!(roster.peers.contains(b.peer.identity()));
}

#[tokio::test]
async fn three_peer_game_plays_to_the_winning_score() {
    let addr = spawn_directory(3, 2).await;
    let (a, b, c) = tokio::join!(
        join_game(&addr, DEFAULT_BUZZ_WINDOW),
        join_game(&addr, DEFAULT_BUZZ_WINDOW),
        join_game(&addr, DEFAULT_BUZZ_WINDOW)
    );
    let mut peers = vec![a, b, c];

    let slot = peers
        .iter()
        .position(|peer| peer.role == Role::Presenter)
        .unwrap();
    let presenter_peer = peers.remove(slot);
    let roster = presenter_peer.peer.roster().await.unwrap();
    let presenter = Presenter::new(presenter_peer.peer.identity().clone(), roster);
    let mut players = peers;

    // Question 1: the first player claims the buzzer and answers with odd
    // casing and padding.
    let asking = {
        let presenter = presenter.clone();
        tokio::spawn(async move { presenter.ask_question("Capital of Italy?", "Rome").await })
    };
    for player in players.iter_mut() {
        recv_until(&mut player.events, |e| {
            matches!(e, GameEvent::Question { .. })
        })
        .await;
    }
    assert!(players[0].peer.buzz().await.unwrap());
    players[0].peer.submit_answer("  ROME ").await.unwrap();

    let reply = recv_until(&mut players[0].events, |e| {
        matches!(e, GameEvent::CorrectAnswer { score: Some(_), .. })
    })
    .await;
    assert_eq!(
        reply,
        GameEvent::CorrectAnswer {
            score: Some(1),
            message: None
        }
    );
    // The other player sees the informational broadcast.
    recv_until(&mut players[1].events, |e| {
        matches!(e, GameEvent::CorrectAnswer { message: Some(_), .. })
    })
    .await;
    asking.await.unwrap();

    // Question 2: the same player reaches the winning score and the game
    // ends for everyone.
    let asking = {
        let presenter = presenter.clone();
        tokio::spawn(async move { presenter.ask_question("2 + 2?", "4").await })
    };
    recv_until(&mut players[0].events, |e| {
        matches!(e, GameEvent::Question { .. })
    })
    .await;
    assert!(players[0].peer.buzz().await.unwrap());
    players[0].peer.submit_answer("4").await.unwrap();

    for player in players.iter_mut() {
        recv_until(&mut player.events, |e| matches!(e, GameEvent::End { .. })).await;
    }
    asking.await.unwrap();

    let scores = presenter.scores().await;
    assert_eq!(scores.get(players[0].peer.identity()), Some(&2));
    assert_eq!(scores.get(players[1].peer.identity()), Some(&0));
    assert!(presenter.game_over().await);
    for player in &players {
        assert_eq!(player.peer.buzzer_state().await, BuzzerState::Ended);
    }

    // Asking again after the end is a no-op.
    presenter.ask_question("anyone?", "nobody").await;
}

#[tokio::test]
async fn wrong_answers_are_regraded_on_the_same_connection() {
    let addr = spawn_directory(3, 1).await;
    let (a, b, c) = tokio::join!(
        join_game(&addr, DEFAULT_BUZZ_WINDOW),
        join_game(&addr, DEFAULT_BUZZ_WINDOW),
        join_game(&addr, DEFAULT_BUZZ_WINDOW)
    );
    let mut peers = vec![a, b, c];

    let slot = peers
        .iter()
        .position(|peer| peer.role == Role::Presenter)
        .unwrap();
    let presenter_peer = peers.remove(slot);
    let roster = presenter_peer.peer.roster().await.unwrap();
    let presenter = Presenter::new(presenter_peer.peer.identity().clone(), roster);
    let mut players = peers;

    let asking = {
        let presenter = presenter.clone();
        tokio::spawn(async move { presenter.ask_question("Capital of Italy?", "Rome").await })
    };
    for player in players.iter_mut() {
        recv_until(&mut player.events, |e| {
            matches!(e, GameEvent::Question { .. })
        })
        .await;
    }

    let offender = players[0].peer.identity().clone();
    assert!(players[0].peer.buzz().await.unwrap());
    players[0].peer.submit_answer("Milan").await.unwrap();

    // The direct grading reply carries no payload; the offender gets it on
    // the question connection.
    recv_until(&mut players[0].events, |e| {
        matches!(e, GameEvent::WrongAnswer { peer: None, .. })
    })
    .await;
    // The other player sees the named broadcast and is freed.
    let notice = recv_until(&mut players[1].events, |e| {
        matches!(e, GameEvent::WrongAnswer { .. })
    })
    .await;
    assert_eq!(
        notice,
        GameEvent::WrongAnswer {
            message: Some(format!("Player {} answered incorrectly!", offender.port)),
            peer: Some(offender.clone()),
        }
    );

    // The exchange stays open: a second answer on the same connection is
    // graded too.
    players[0].peer.submit_answer("Naples").await.unwrap();
    recv_until(&mut players[0].events, |e| {
        matches!(e, GameEvent::WrongAnswer { peer: None, .. })
    })
    .await;

    // The offender burned its attempt, but the freed player can win.
    assert!(!players[0].peer.buzz().await.unwrap());
    assert!(players[1].peer.buzz().await.unwrap());
    players[1].peer.submit_answer("Rome").await.unwrap();

    for player in players.iter_mut() {
        recv_until(&mut player.events, |e| matches!(e, GameEvent::End { .. })).await;
    }
    asking.await.unwrap();

    let scores = presenter.scores().await;
    assert_eq!(scores.get(&offender), Some(&0));
    assert_eq!(scores.get(players[1].peer.identity()), Some(&1));
}

#[tokio::test]
async fn buzz_hold_times_out_and_frees_the_other_players() {
    let window = Duration::from_millis(500);
    let addr = spawn_directory(3, 1).await;
    let (a, b, c) = tokio::join!(
        join_game(&addr, window),
        join_game(&addr, window),
        join_game(&addr, window)
    );
    let mut peers = vec![a, b, c];

    let slot = peers
        .iter()
        .position(|peer| peer.role == Role::Presenter)
        .unwrap();
    let presenter_peer = peers.remove(slot);
    let roster = presenter_peer.peer.roster().await.unwrap();
    let presenter = Presenter::new(presenter_peer.peer.identity().clone(), roster);
    let mut players = peers;

    let asking = {
        let presenter = presenter.clone();
        tokio::spawn(async move { presenter.ask_question("Answer to everything?", "42").await })
    };
    for player in players.iter_mut() {
        recv_until(&mut player.events, |e| {
            matches!(e, GameEvent::Question { .. })
        })
        .await;
    }

    // The first player buzzes and never answers.
    assert!(players[0].peer.buzz().await.unwrap());
    let holder = players[0].peer.identity().clone();

    // The second player observes the claim and is locked out.
    recv_until(&mut players[1].events, |e| {
        matches!(e, GameEvent::Buzz { .. })
    })
    .await;
    assert!(!players[1].peer.buzz().await.unwrap());

    // The hold expires: everyone gets the self-declared timeout notice.
    let notice = recv_until(&mut players[1].events, |e| {
        matches!(e, GameEvent::WrongAnswer { .. })
    })
    .await;
    assert_eq!(
        notice,
        GameEvent::WrongAnswer {
            message: Some(format!("Player {} took too long to answer!", holder.port)),
            peer: Some(holder.clone()),
        }
    );
    // The holder receives its own notice too; handling that copy must not
    // cut the fan-out short for anyone else.
    recv_until(&mut players[0].events, |e| {
        matches!(e, GameEvent::WrongAnswer { .. })
    })
    .await;

    // The offender burned its attempt; the other player may now claim.
    assert!(!players[0].peer.buzz().await.unwrap());
    assert!(players[1].peer.buzz().await.unwrap());
    players[1].peer.submit_answer("42").await.unwrap();

    for player in players.iter_mut() {
        recv_until(&mut player.events, |e| matches!(e, GameEvent::End { .. })).await;
    }
    asking.await.unwrap();

    let scores = presenter.scores().await;
    assert_eq!(scores.get(players[1].peer.identity()), Some(&1));
}

#[tokio::test]
async fn malformed_json_closes_one_connection_but_not_the_listener() {
    let (mut peer, mut events) = Peer::bind("127.0.0.1", DEFAULT_BUZZ_WINDOW).await.unwrap();
    peer.spawn_listener().unwrap();
    let addr = peer.identity().addr();

    {
        let stream = TcpStream::connect(&addr).await.unwrap();
        let mut lines = Framed::new(stream, LinesCodec::new());
        lines.send("not json at all".to_string()).await.unwrap();
    }

    // A well-formed notification on a fresh connection still gets through.
    let buzzer = PeerIdentity::new("127.0.0.1", 9);
    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut lines = Framed::new(stream, LinesCodec::new());
    lines
        .send(
            Message::Buzz {
                message: "buzz".to_string(),
                peer: buzzer.clone(),
            }
            .to_json_string()
            .unwrap(),
        )
        .await
        .unwrap();

    let event = recv_until(&mut events, |e| matches!(e, GameEvent::Buzz { .. })).await;
    assert_eq!(
        event,
        GameEvent::Buzz {
            message: "buzz".to_string(),
            peer: buzzer,
        }
    );
}
