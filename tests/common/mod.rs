#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use syringe_link_lib::transport::{LinkInfo, Result, TransferError, Transport, TransportKind};
use syringe_link_lib::{DeviceHandle, LinkConfig};

/// In-memory controller link: tests push inbound chunks and inspect
/// whatever the session wrote.
#[derive(Default)]
pub struct MockTransport {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    written: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
    unplugged: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.inbound.lock().unwrap().push_back(bytes.to_vec());
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn unplug(&self) {
        self.unplugged.store(true, Ordering::SeqCst);
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransferError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out")));
        }
        self.written.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }

    fn read_chunk(&self, timeout: Duration) -> Result<Vec<u8>> {
        if self.unplugged.load(Ordering::SeqCst) {
            return Err(TransferError::Disconnected);
        }
        if let Some(chunk) = self.inbound.lock().unwrap().pop_front() {
            return Ok(chunk);
        }
        std::thread::sleep(timeout);
        Ok(Vec::new())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

pub fn test_config() -> LinkConfig {
    let mut config = LinkConfig::default();
    config.serial.chunk_timeout_ms = 5;
    config
}

pub fn device_handle(transport: Arc<MockTransport>) -> DeviceHandle {
    let info = LinkInfo {
        identifier: "mock0".into(),
        kind: TransportKind::Serial,
        vendor_id: Some(0x1A86),
        product_id: Some(0x7523),
    };
    DeviceHandle::new(transport, info)
}
