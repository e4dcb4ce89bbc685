use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use rusb::{Device, DeviceHandle, GlobalContext};

use super::bridge::{select_interfaces, BridgeChip, BridgeInitializer, BulkEndpoints, EndpointSummary, InterfaceSummary};
use super::{ConnectionError, Result, TransferError, Transport, TransportKind};
use crate::config::UsbSettings;

/// Bridge chips deliver at most one full-speed packet per bulk read.
pub const BULK_CHUNK_SIZE: usize = 64;

/// Stable name for a raw USB device: bus and address.
pub fn usb_identifier(device: &Device<GlobalContext>) -> String {
    format!("usb:{:03}:{:03}", device.bus_number(), device.address())
}

struct ClaimedHandle {
    handle: DeviceHandle<GlobalContext>,
    /// Claimed interfaces in claim order, with whether a kernel driver was
    /// detached from each.
    claims: Vec<(u8, bool)>,
}

impl ClaimedHandle {
    fn claim(handle: DeviceHandle<GlobalContext>, interfaces: &[u8]) -> std::result::Result<Self, ConnectionError> {
        let mut claimed = ClaimedHandle { handle, claims: Vec::with_capacity(interfaces.len()) };
        for &interface in interfaces {
            if let Err(e) = claimed.claim_one(interface) {
                claimed.release();
                return Err(e);
            }
        }
        Ok(claimed)
    }

    fn claim_one(&mut self, interface: u8) -> std::result::Result<(), ConnectionError> {
        let mut detached = false;
        if self.handle.kernel_driver_active(interface).unwrap_or(false) {
            self.handle.detach_kernel_driver(interface).map_err(|e| {
                ConnectionError::BridgeInitFailed(format!("detach kernel driver from interface {}: {}", interface, e))
            })?;
            detached = true;
        }
        if let Err(e) = self.handle.claim_interface(interface) {
            if detached {
                let _ = self.handle.attach_kernel_driver(interface);
            }
            return Err(ConnectionError::BridgeInitFailed(format!("claim interface {}: {}", interface, e)));
        }
        self.claims.push((interface, detached));
        Ok(())
    }

    fn release(self) {
        for &(interface, detached) in self.claims.iter().rev() {
            if let Err(e) = self.handle.release_interface(interface) {
                log::debug!("release_interface({}) failed: {}", interface, e);
            }
            if detached {
                let _ = self.handle.attach_kernel_driver(interface);
            }
        }
    }
}

/// Raw bulk-endpoint link to a USB-serial bridge, for hosts without an OS
/// serial driver. Opening it runs the bridge handshake.
pub struct UsbBulkTransport {
    identifier: String,
    claimed: RwLock<Option<ClaimedHandle>>,
    endpoints: BulkEndpoints,
    initializer: BridgeInitializer,
    write_timeout: Duration,
    open: AtomicBool,
}

impl UsbBulkTransport {
    /// Caller must already hold OS permission for `device`.
    pub fn open(device: &Device<GlobalContext>, settings: &UsbSettings) -> std::result::Result<Self, ConnectionError> {
        let identifier = usb_identifier(device);
        let descriptor = device.device_descriptor()?;
        let chip = BridgeChip::for_vendor(descriptor.vendor_id());

        let handle = device.open().map_err(|e| match e {
            rusb::Error::Access => ConnectionError::PermissionDenied(identifier.clone()),
            rusb::Error::NoDevice | rusb::Error::NotFound => ConnectionError::PortNotFound(identifier.clone()),
            other => ConnectionError::OpenFailed(format!("{}: {}", identifier, other)),
        })?;

        let config = device
            .active_config_descriptor()
            .or_else(|_| device.config_descriptor(0))?;
        let mut interfaces = Vec::new();
        for iface in config.interfaces() {
            for desc in iface.descriptors() {
                interfaces.push(InterfaceSummary {
                    number: desc.interface_number(),
                    class_code: desc.class_code(),
                    endpoints: desc
                        .endpoint_descriptors()
                        .map(|ep| EndpointSummary {
                            address: ep.address(),
                            direction: ep.direction(),
                            transfer_type: ep.transfer_type(),
                            max_packet_size: ep.max_packet_size(),
                        })
                        .collect(),
                });
            }
        }
        let layout = select_interfaces(chip, settings.interface, &interfaces)?;
        let endpoints = layout.endpoints;

        let claimed = ClaimedHandle::claim(handle, &layout.claim_order())?;

        let initializer = BridgeInitializer::new(
            chip,
            settings.baud,
            layout.control,
            Duration::from_millis(settings.control_timeout_ms),
        );
        if let Err(e) = initializer.run(&claimed.handle) {
            claimed.release();
            return Err(e);
        }

        log::info!(
            "Opened USB bridge {} ({:04x}:{:04x}, {:?}) control if {} data if {} bulk in=0x{:02X} out=0x{:02X}",
            identifier,
            descriptor.vendor_id(),
            descriptor.product_id(),
            initializer.chip,
            layout.control,
            layout.data,
            endpoints.bulk_in,
            endpoints.bulk_out
        );

        Ok(Self {
            identifier,
            claimed: RwLock::new(Some(claimed)),
            endpoints,
            initializer,
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
            open: AtomicBool::new(true),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn endpoints(&self) -> BulkEndpoints {
        self.endpoints
    }

    /// Replays the bridge handshake on the open handle.
    pub fn reinitialize(&self) -> std::result::Result<(), ConnectionError> {
        let guard = self
            .claimed
            .read()
            .map_err(|_| ConnectionError::OpenFailed(self.identifier.clone()))?;
        let claimed = guard
            .as_ref()
            .ok_or_else(|| ConnectionError::OpenFailed(format!("{} is closed", self.identifier)))?;
        self.initializer.run(&claimed.handle)
    }
}

impl Transport for UsbBulkTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let guard = self.claimed.read().map_err(|_| TransferError::Closed)?;
        let claimed = guard.as_ref().ok_or(TransferError::Closed)?;
        let mut offset = 0;
        while offset < bytes.len() {
            let n = claimed
                .handle
                .write_bulk(self.endpoints.bulk_out, &bytes[offset..], self.write_timeout)?;
            if n == 0 {
                return Err(TransferError::Usb(rusb::Error::Timeout));
            }
            offset += n;
        }
        Ok(())
    }

    fn read_chunk(&self, timeout: Duration) -> Result<Vec<u8>> {
        let guard = self.claimed.read().map_err(|_| TransferError::Closed)?;
        let claimed = guard.as_ref().ok_or(TransferError::Closed)?;
        let mut buf = [0u8; BULK_CHUNK_SIZE];
        match claimed.handle.read_bulk(self.endpoints.bulk_in, &mut buf, timeout) {
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(rusb::Error::Timeout) | Err(rusb::Error::Interrupted) => Ok(Vec::new()),
            Err(e) => Err(TransferError::from(e)),
        }
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let claimed = match self.claimed.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(claimed) = claimed {
            claimed.release();
        }
        log::info!("Closed USB bridge {}", self.identifier);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for UsbBulkTransport {
    fn drop(&mut self) {
        self.close();
    }
}
