pub mod dispatcher;
pub mod state;

pub use dispatcher::{CommandDispatcher, Emission, HoldToken, Intent};
pub use state::{
    Applied, Direction, PressResponse, PumpState, PumpStateMachine, ReturnChoice, RunProgress, RunUpdate,
    SessionParameters, Transition,
};
