use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::state::{Direction, PumpStateMachine, ReturnChoice};
use crate::protocol::Command;

/// Discrete user intent coming from the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    Press(Direction),
    Release,
    Select,
    Reset,
    Stop,
    Extra,
    Decide(ReturnChoice),
}

/// Identifies one hold. A token from a cancelled hold never matches again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HoldToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub interval: Duration,
    pub token: HoldToken,
}

/// A command to write, and the repeat cadence if it starts a hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emission {
    pub command: Command,
    pub cadence: Option<Cadence>,
}

impl Emission {
    fn once(command: Command) -> Self {
        Self { command, cadence: None }
    }
}

#[derive(Debug, Clone, Copy)]
struct Hold {
    direction: Direction,
    token: HoldToken,
    next_due: Instant,
}

/// Turns press/hold/release into command bytes and owns the repeat timer.
#[derive(Debug)]
pub struct CommandDispatcher {
    period: Duration,
    hold: Option<Hold>,
    generation: u64,
}

impl CommandDispatcher {
    pub fn new(period: Duration) -> Self {
        Self { period, hold: None, generation: 0 }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_holding(&self) -> bool {
        self.hold.is_some()
    }

    pub fn active_token(&self) -> Option<HoldToken> {
        self.hold.map(|h| h.token)
    }

    /// Drops the current hold, if any. Returns whether one was active.
    pub fn cancel(&mut self) -> bool {
        match self.hold.take() {
            Some(hold) => {
                log::trace!("Cancelled hold {:?} ({:?})", hold.token, hold.direction);
                true
            }
            None => false,
        }
    }

    /// The repeat timer is cancelled before anything else happens.
    pub fn handle(&mut self, intent: Intent, machine: &mut PumpStateMachine, now: Instant) -> Option<Emission> {
        self.cancel();
        match intent {
            Intent::Press(direction) => {
                let response = machine.press(direction);
                let command = response.command?;
                if !response.repeat {
                    return Some(Emission::once(command));
                }
                self.generation += 1;
                let token = HoldToken(self.generation);
                self.hold = Some(Hold { direction, token, next_due: now + self.period });
                Some(Emission { command, cadence: Some(Cadence { interval: self.period, token }) })
            }
            Intent::Release => machine.release().map(Emission::once),
            Intent::Select => machine.select().map(Emission::once),
            Intent::Reset => Some(Emission::once(Command::Reset)),
            Intent::Stop => Some(Emission::once(Command::Stop)),
            Intent::Extra => machine.extra().map(Emission::once),
            Intent::Decide(choice) => machine.decide(choice).map(Emission::once),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.hold.map(|h| h.next_due)
    }

    /// Emits at most one repeat per call. A late tick does not catch up on
    /// missed periods.
    pub fn tick(&mut self, machine: &mut PumpStateMachine, now: Instant) -> Option<Command> {
        let hold = self.hold.as_mut()?;
        if now < hold.next_due {
            return None;
        }
        hold.next_due += self.period;
        if hold.next_due <= now {
            hold.next_due = now + self.period;
        }
        let direction = hold.direction;
        let command = machine.repeat(direction);
        if command.is_none() {
            // state moved on under the hold
            self.hold = None;
        }
        command
    }
}
