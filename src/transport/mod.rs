pub mod bridge;
pub mod serial;
pub mod usb;

pub use bridge::{BridgeBaud, BridgeChip, BridgeInitializer, ControlTransfer};
pub use serial::SerialTransport;
pub use usb::UsbBulkTransport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// CH340 family vendor id; anything else is driven as USB-CDC.
pub const CH340_VID: u16 = 0x1A86;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Serial,
    Usb,
}

/// Failure to bring a link up. Fatal to the connect attempt.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    #[error("Open failed: {0}")]
    OpenFailed(String),

    #[error("Bridge initialization failed: {0}")]
    BridgeInitFailed(String),

    #[error("Serialport error: {0}")]
    Serialport(#[from] serialport::Error),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

/// A single read or write that failed on an open link.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Transport closed")]
    Closed,

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("USB transfer error: {0}")]
    Usb(rusb::Error),
}

impl TransferError {
    /// True when the link is gone for good and the handle must be dropped.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransferError::Closed | TransferError::Disconnected => true,
            TransferError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::UnexpectedEof
            ),
            TransferError::Usb(e) => matches!(
                e,
                rusb::Error::NoDevice | rusb::Error::NotFound | rusb::Error::Access | rusb::Error::Io
            ),
        }
    }
}

impl From<rusb::Error> for TransferError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::NoDevice => TransferError::Disconnected,
            other => TransferError::Usb(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// Byte pipe to the pump controller.
///
/// Implementations are shared between the reader thread (reads) and the
/// session consumer (writes), so every method takes `&self`.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Returns whatever arrived within `timeout`. An empty vector means the
    /// timeout elapsed with no data and is not an error.
    fn read_chunk(&self, timeout: Duration) -> Result<Vec<u8>>;

    /// Releases the underlying port or interface. Safe to call repeatedly.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Identity of the device behind a handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub identifier: String,
    pub kind: TransportKind,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

/// Sole owner of one open transport. Closing happens once, either
/// explicitly or on drop.
pub struct DeviceHandle {
    transport: Arc<dyn Transport>,
    info: LinkInfo,
    closed: AtomicBool,
}

impl DeviceHandle {
    pub fn new(transport: Arc<dyn Transport>, info: LinkInfo) -> Self {
        Self {
            transport,
            info,
            closed: AtomicBool::new(false),
        }
    }

    pub fn info(&self) -> &LinkInfo {
        &self.info
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransferError::Closed);
        }
        self.transport.write(bytes)
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.transport.is_open()
    }

    /// Returns true only for the call that actually closed the transport.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        log::info!("Closing {:?} link to {}", self.info.kind, self.info.identifier);
        self.transport.close();
        true
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("info", &self.info)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
