//! The buzzer arbitration state machine every player runs on its own.
//!
//! There is no central lock. Each process keeps a local view, updated only
//! by received BUZZ/WRONG_ANSWER/CORRECT_ANSWER notifications and local
//! timeouts, so the view is eventually consistent at best. The broadcasts
//! exist to disable buzz attempts; the presenter's grading connection is
//! the actual tie-breaker between near-simultaneous claims.

use crate::message::PeerIdentity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuzzerState {
    /// No question pending.
    Idle,
    /// A question arrived and the buzzer is free.
    QuestionShown,
    /// This process holds the buzzer and owes an answer within the window.
    Holding,
    /// Another peer holds the buzzer.
    LockedOut(PeerIdentity),
    /// Terminal; entered on END and never left.
    Ended,
}

#[derive(Debug)]
pub struct BuzzerMachine {
    state: BuzzerState,
    attempted: bool,
}

impl BuzzerMachine {
    pub fn new() -> Self {
        Self {
            state: BuzzerState::Idle,
            attempted: false,
        }
    }

    pub fn state(&self) -> &BuzzerState {
        &self.state
    }

    pub fn can_buzz(&self) -> bool {
        self.state == BuzzerState::QuestionShown && !self.attempted
    }

    /// A fresh question re-opens the buzzer and resets the one-attempt guard.
    pub fn question_received(&mut self) {
        if self.state == BuzzerState::Ended {
            return;
        }
        self.state = BuzzerState::QuestionShown;
        self.attempted = false;
    }

    /// Local buzz attempt. Succeeds only while the question is shown, the
    /// buzzer is free and this peer has not burned its attempt.
    pub fn try_buzz(&mut self) -> bool {
        if self.can_buzz() {
            self.state = BuzzerState::Holding;
            self.attempted = true;
            true
        } else {
            false
        }
    }

    /// Another peer's BUZZ broadcast: record the holder and lock out. A
    /// broadcast that races with our own hold is ignored; whichever answer
    /// the presenter reads first settles it.
    pub fn remote_buzz(&mut self, holder: PeerIdentity) {
        match self.state {
            BuzzerState::Ended | BuzzerState::Holding => {}
            _ => self.state = BuzzerState::LockedOut(holder),
        }
    }

    /// WRONG_ANSWER naming `offender` releases the buzzer. The offender
    /// itself keeps its attempt burned and cannot re-buzz this question;
    /// everyone else returns to a buzzable state.
    pub fn holder_released(&mut self, offender: &PeerIdentity, own_identity: &PeerIdentity) {
        match &self.state {
            BuzzerState::Holding if offender == own_identity => {
                self.state = BuzzerState::QuestionShown;
            }
            BuzzerState::LockedOut(holder) if holder == offender => {
                self.state = BuzzerState::QuestionShown;
            }
            _ => {}
        }
    }

    /// The question was answered; nothing to buzz for until the next one.
    pub fn correct_answer(&mut self) {
        if self.state == BuzzerState::Ended {
            return;
        }
        self.state = BuzzerState::Idle;
    }

    /// Terminal transition. Duplicate END notifications are absorbed.
    pub fn end(&mut self) {
        self.state = BuzzerState::Ended;
    }
}

impl Default for BuzzerMachine {
    fn default() -> Self {
        Self::new()
    }
}
