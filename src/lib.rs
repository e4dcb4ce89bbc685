pub mod config;
pub mod device;
pub mod protocol;
pub mod pump;
pub mod session;
pub mod transport;

pub use config::LinkConfig;
pub use device::{DeviceError, DeviceManager};
pub use protocol::{Command, Frame, Message};
pub use pump::{Direction, Intent, PumpState, ReturnChoice, SessionParameters};
pub use session::{PumpEvent, PumpHandle, PumpSession, PumpSnapshot};
pub use transport::{ConnectionError, DeviceHandle, TransferError, Transport};
