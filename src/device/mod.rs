pub mod manager;
pub mod models;

pub use manager::{AlwaysGranted, DeviceManager, PermissionOutcome, UsbPermissionBroker};
pub use models::*;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device already connected")]
    AlreadyConnected,

    #[error("Device not connected")]
    NotConnected,

    #[error("Waiting for USB permission on {0}")]
    PermissionPending(String),

    #[error("Connection error: {0}")]
    Connection(#[from] crate::transport::ConnectionError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] crate::transport::TransferError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
