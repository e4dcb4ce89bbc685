use serde::{Deserialize, Serialize};

use crate::protocol::{AckKind, Command, Message, Mode, StatusKind};

/// Operating state of the pump controller as mirrored on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PumpState {
    #[default]
    Homing,
    LoadSetup,
    ModeSelect,
    CaudalSubmenu,
    CaudalPreset,
    CaudalManual,
    TimeSetup,
    ParameterSetup,
    PostExpulsion,
}

impl PumpState {
    /// States where directional input nudges a local value.
    pub fn is_adjustment(self) -> bool {
        matches!(
            self,
            PumpState::LoadSetup
                | PumpState::CaudalPreset
                | PumpState::CaudalManual
                | PumpState::TimeSetup
                | PumpState::ParameterSetup
        )
    }

    /// States from which an incoming PARAM opens parameter setup.
    fn accepts_parameter_setup(self) -> bool {
        matches!(
            self,
            PumpState::ModeSelect
                | PumpState::CaudalSubmenu
                | PumpState::CaudalPreset
                | PumpState::CaudalManual
                | PumpState::TimeSetup
                | PumpState::ParameterSetup
        )
    }

    /// Setup states a dose is started from.
    fn runs_dose(self) -> bool {
        matches!(
            self,
            PumpState::CaudalPreset | PumpState::CaudalManual | PumpState::TimeSetup | PumpState::ParameterSetup
        )
    }

    /// Next state for an acknowledgement, plus whether `self` is a
    /// tabulated source for it. Acks are authoritative either way.
    fn on_ack(self, ack: AckKind) -> (PumpState, bool) {
        use PumpState::*;
        match (self, ack) {
            (Homing, AckKind::ZeroSet) => (LoadSetup, true),
            (LoadSetup, AckKind::LoadComplete) => (ModeSelect, true),
            (ModeSelect, AckKind::CaudalSubmenu) => (CaudalSubmenu, true),
            (from, AckKind::ExpulsionComplete) => (PostExpulsion, from.runs_dose()),
            (_, AckKind::ReturnedToZero) | (_, AckKind::StayingPosition) => (LoadSetup, true),
            (_, AckKind::Reset) => (Homing, true),
            (_, AckKind::ZeroSet) => (LoadSetup, false),
            (_, AckKind::LoadComplete) => (ModeSelect, false),
            (_, AckKind::CaudalSubmenu) => (CaudalSubmenu, false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Positive => 1.0,
            Direction::Negative => -1.0,
        }
    }

    fn command(self) -> Command {
        match self {
            Direction::Positive => Command::Plus,
            Direction::Negative => Command::Minus,
        }
    }

    /// Homing jogs the carriage the opposite way from the button label.
    fn homing_command(self) -> Command {
        match self {
            Direction::Positive => Command::Minus,
            Direction::Negative => Command::Plus,
        }
    }

    fn menu_command(self) -> Command {
        match self {
            Direction::Positive => Command::SelectOne,
            Direction::Negative => Command::SelectTwo,
        }
    }
}

/// Answer to the post-expulsion prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReturnChoice {
    ReturnToZero,
    StayInPlace,
}

impl ReturnChoice {
    pub fn command(self) -> Command {
        match self {
            ReturnChoice::ReturnToZero => Command::SelectOne,
            ReturnChoice::StayInPlace => Command::SelectTwo,
        }
    }
}

pub const VOLUME_INCREMENT_ML: f64 = 0.1;
pub const TIME_INCREMENT_S: f64 = 1.0;
pub const DEFAULT_CAUDAL_STEP: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionParameters {
    /// mL
    pub volume: f64,
    /// µL/min in caudal mode, seconds in time mode
    pub parameter: f64,
    pub step: f64,
    pub mode: Mode,
    pub repetitions: u32,
}

impl Default for SessionParameters {
    fn default() -> Self {
        Self {
            volume: 0.0,
            parameter: 0.0,
            step: DEFAULT_CAUDAL_STEP,
            mode: Mode::Caudal,
            repetitions: 0,
        }
    }
}

impl SessionParameters {
    pub fn set_volume(&mut self, value: f64) {
        self.volume = value.max(0.0);
    }

    pub fn set_parameter(&mut self, value: f64) {
        self.parameter = value.max(0.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub total_volume: f64,
    pub estimate_param: f64,
    pub mode: Mode,
    pub percent: u8,
    pub phase: StatusKind,
}

impl RunProgress {
    /// Expected run length in seconds, when it can be derived.
    pub fn estimated_seconds(&self) -> Option<f64> {
        match self.mode {
            Mode::Time => Some(self.estimate_param),
            Mode::Caudal if self.estimate_param > 0.0 => {
                let ml_per_min = self.estimate_param / 1000.0;
                Some(self.total_volume / ml_per_min * 60.0)
            }
            Mode::Caudal => None,
        }
    }

    /// Volume pushed so far; unknown while the syringe refills.
    pub fn delivered_volume(&self) -> Option<f64> {
        match self.phase {
            StatusKind::Expelling => Some(self.total_volume * f64::from(self.percent) / 100.0),
            StatusKind::Refilling => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: PumpState,
    pub to: PumpState,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RunUpdate {
    Started(RunProgress),
    Updated(RunProgress),
    Finished,
}

/// What a message did to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Applied {
    pub transition: Option<Transition>,
    pub run: Option<RunUpdate>,
    pub parameters_changed: bool,
}

/// Reaction to a directional press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressResponse {
    pub command: Option<Command>,
    /// Whether holding the button should keep re-sending `command`.
    pub repeat: bool,
}

/// Host-side mirror of the controller's menu state.
#[derive(Debug, Clone, Default)]
pub struct PumpStateMachine {
    state: PumpState,
    params: SessionParameters,
    run: Option<RunProgress>,
}

impl PumpStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    pub fn parameters(&self) -> &SessionParameters {
        &self.params
    }

    pub fn run(&self) -> Option<&RunProgress> {
        self.run.as_ref()
    }

    fn enter(&mut self, to: PumpState) -> Option<Transition> {
        let from = self.state;
        self.state = to;
        if to == PumpState::Homing {
            self.params = SessionParameters::default();
            self.run = None;
        }
        (from != to).then_some(Transition { from, to })
    }

    /// Feed one decoded message from the controller.
    pub fn apply(&mut self, message: Message) -> Applied {
        let mut applied = Applied::default();
        match message {
            Message::Volume(v) => {
                self.params.set_volume(v);
                applied.parameters_changed = true;
            }
            Message::Parameter(v) => {
                self.params.set_parameter(v);
                applied.parameters_changed = true;
                if self.state.accepts_parameter_setup() {
                    applied.transition = self.enter(PumpState::ParameterSetup);
                } else {
                    log::debug!("PARAM received in {:?}; value updated without transition", self.state);
                }
            }
            Message::Preset(v) => {
                self.params.set_parameter(v);
                self.params.mode = Mode::Caudal;
                applied.parameters_changed = true;
                applied.transition = self.enter(PumpState::CaudalPreset);
            }
            Message::ManualFlow(v) => {
                self.params.set_parameter(v);
                self.params.mode = Mode::Caudal;
                applied.parameters_changed = true;
                applied.transition = self.enter(PumpState::CaudalManual);
            }
            Message::Duration(v) => {
                self.params.set_parameter(v);
                self.params.mode = Mode::Time;
                applied.parameters_changed = true;
                applied.transition = self.enter(PumpState::TimeSetup);
            }
            Message::Repetitions(v) => {
                self.params.repetitions = v.max(0.0).round() as u32;
                applied.parameters_changed = true;
            }
            Message::Step(v) => {
                self.params.step = v.max(0.0);
                applied.parameters_changed = true;
            }
            Message::Ack(ack) => {
                let (to, tabulated) = self.state.on_ack(ack);
                if !tabulated {
                    log::warn!("ACK {:?} received in {:?}; following controller to {:?}", ack, self.state, to);
                }
                let had_run = self.run.is_some();
                if ack == AckKind::ExpulsionComplete {
                    self.run = None;
                }
                let was_defaults = self.params == SessionParameters::default();
                applied.transition = self.enter(to);
                if had_run && self.run.is_none() {
                    applied.run = Some(RunUpdate::Finished);
                }
                if to == PumpState::Homing && !was_defaults {
                    applied.parameters_changed = true;
                }
            }
            Message::Info { total_volume, estimate_param, mode } => {
                let run = RunProgress {
                    total_volume,
                    estimate_param,
                    mode,
                    percent: 0,
                    phase: StatusKind::Expelling,
                };
                self.run = Some(run);
                applied.run = Some(RunUpdate::Started(run));
            }
            Message::Status(phase) => {
                if let Some(run) = self.run.as_mut() {
                    run.phase = phase;
                    applied.run = Some(RunUpdate::Updated(*run));
                }
            }
            Message::Progress(percent) => {
                if let Some(run) = self.run.as_mut() {
                    run.percent = percent.min(100);
                    applied.run = Some(RunUpdate::Updated(*run));
                }
            }
        }
        applied
    }

    /// Local increment for one directional step in the current state.
    fn increment(&self) -> f64 {
        match self.state {
            PumpState::LoadSetup => VOLUME_INCREMENT_ML,
            PumpState::CaudalManual => self.params.step,
            PumpState::TimeSetup => TIME_INCREMENT_S,
            PumpState::ParameterSetup => match self.params.mode {
                Mode::Caudal => self.params.step,
                Mode::Time => TIME_INCREMENT_S,
            },
            // preset values are stepped by the controller itself
            _ => 0.0,
        }
    }

    fn adjust(&mut self, direction: Direction) -> Command {
        let delta = direction.sign() * self.increment();
        match self.state {
            PumpState::LoadSetup => self.params.set_volume(self.params.volume + delta),
            _ => self.params.set_parameter(self.params.parameter + delta),
        }
        direction.command()
    }

    pub fn press(&mut self, direction: Direction) -> PressResponse {
        match self.state {
            PumpState::Homing => PressResponse { command: Some(direction.homing_command()), repeat: false },
            PumpState::ModeSelect => {
                self.params.mode = match direction {
                    Direction::Positive => Mode::Caudal,
                    Direction::Negative => Mode::Time,
                };
                PressResponse { command: Some(direction.menu_command()), repeat: false }
            }
            PumpState::CaudalSubmenu => PressResponse { command: Some(direction.menu_command()), repeat: false },
            PumpState::PostExpulsion => PressResponse { command: None, repeat: false },
            _ => PressResponse { command: Some(self.adjust(direction)), repeat: true },
        }
    }

    /// One tick of a held button. Only adjustment states repeat.
    pub fn repeat(&mut self, direction: Direction) -> Option<Command> {
        self.state.is_adjustment().then(|| self.adjust(direction))
    }

    pub fn release(&self) -> Option<Command> {
        (self.state == PumpState::Homing).then_some(Command::Stop)
    }

    pub fn select(&self) -> Option<Command> {
        // mode is chosen with the directional buttons, confirm is inert there
        (self.state != PumpState::ModeSelect).then_some(Command::Confirm)
    }

    pub fn extra(&self) -> Option<Command> {
        match self.state {
            PumpState::CaudalPreset => Some(Command::CycleRepetitions),
            PumpState::CaudalManual => Some(Command::ChangeScale),
            _ => None,
        }
    }

    pub fn decide(&self, choice: ReturnChoice) -> Option<Command> {
        if self.state != PumpState::PostExpulsion {
            log::debug!("Return decision {:?} ignored in {:?}", choice, self.state);
            return None;
        }
        Some(choice.command())
    }
}
