use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serialport::SerialPortInfo;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{ConnectionState, Device, DeviceError, DeviceListing, Result};
use crate::config::LinkConfig;
use crate::session::{PumpHandle, PumpSession, SessionEnd};
use crate::transport::usb::usb_identifier;
use crate::transport::{ConnectionError, DeviceHandle, LinkInfo, SerialTransport, Transport, TransportKind, UsbBulkTransport};

const USB_CLASS_HUB: u8 = 0x09;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Granted,
    /// A system prompt is showing; `DeviceManager::permission_granted`
    /// resumes the connect once the user accepts.
    Pending,
    Denied,
}

/// Platform hook for raw USB access rights (a no-op on desktop hosts).
#[async_trait]
pub trait UsbPermissionBroker: Send + Sync {
    async fn has_permission(&self, listing: &DeviceListing) -> bool;
    async fn request_permission(&self, listing: &DeviceListing) -> PermissionOutcome;
}

/// Broker for hosts where opening the device node is the only check.
pub struct AlwaysGranted;

#[async_trait]
impl UsbPermissionBroker for AlwaysGranted {
    async fn has_permission(&self, _listing: &DeviceListing) -> bool {
        true
    }

    async fn request_permission(&self, _listing: &DeviceListing) -> PermissionOutcome {
        PermissionOutcome::Granted
    }
}

/// A host without a serial stack still lists its raw USB devices.
fn serial_listings(ports: std::result::Result<Vec<SerialPortInfo>, ConnectionError>) -> Vec<DeviceListing> {
    match ports {
        Ok(ports) => ports.iter().map(DeviceListing::from).collect(),
        Err(e) => {
            log::warn!("Serial enumeration unavailable: {}", e);
            Vec::new()
        }
    }
}

struct ActiveSession {
    device_id: Uuid,
    session: PumpSession,
}

/// Device discovery plus the single active pump session.
pub struct DeviceManager {
    config: LinkConfig,
    broker: Arc<dyn UsbPermissionBroker>,
    devices: Arc<RwLock<HashMap<Uuid, Device>>>,
    active: Arc<Mutex<Option<ActiveSession>>>,
}

impl DeviceManager {
    pub fn new(config: LinkConfig) -> Self {
        Self::with_broker(config, Arc::new(AlwaysGranted))
    }

    pub fn with_broker(config: LinkConfig, broker: Arc<dyn UsbPermissionBroker>) -> Self {
        Self {
            config,
            broker,
            devices: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Enumerates serial ports and raw USB devices.
    pub fn list_devices() -> Result<Vec<DeviceListing>> {
        let mut listings = serial_listings(SerialTransport::available_ports());

        match rusb::devices() {
            Ok(devices) => {
                for device in devices.iter() {
                    let Ok(descriptor) = device.device_descriptor() else { continue };
                    if descriptor.class_code() == USB_CLASS_HUB {
                        continue;
                    }
                    listings.push(DeviceListing {
                        identifier: usb_identifier(&device),
                        vendor_id: descriptor.vendor_id(),
                        product_id: descriptor.product_id(),
                        kind: TransportKind::Usb,
                        product: None,
                    });
                }
            }
            Err(e) => log::warn!("USB enumeration unavailable: {}", e),
        }
        Ok(listings)
    }

    /// Refreshes the registry from a fresh enumeration, keeping the
    /// connection state of devices already known.
    pub async fn discover_devices(&self) -> Result<Vec<Device>> {
        let listings = Self::list_devices()?;
        let mut discovered = Vec::with_capacity(listings.len());
        for listing in listings {
            discovered.push(self.register(listing).await);
        }
        log::info!("Discovered {} candidate device(s)", discovered.len());
        Ok(discovered)
    }

    /// Adds or refreshes one registry entry.
    pub async fn register(&self, listing: DeviceListing) -> Device {
        let mut devices = self.devices.write().await;
        if let Some(existing) = devices.values_mut().find(|d| d.listing.identifier == listing.identifier) {
            existing.listing = listing;
            existing.last_seen = chrono::Utc::now();
            return existing.clone();
        }
        let device = Device::new(listing);
        devices.insert(device.id, device.clone());
        device
    }

    pub async fn get_devices(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn device(&self, identifier: &str) -> Option<Device> {
        self.devices
            .read()
            .await
            .values()
            .find(|d| d.listing.identifier == identifier)
            .cloned()
    }

    async fn set_state(&self, id: Uuid, state: ConnectionState) {
        if let Some(device) = self.devices.write().await.get_mut(&id) {
            device.update_connection_state(state);
        }
    }

    async fn lookup(&self, identifier: &str) -> Result<Device> {
        if let Some(device) = self.device(identifier).await {
            return Ok(device);
        }
        self.discover_devices().await?;
        self.device(identifier)
            .await
            .ok_or_else(|| DeviceError::NotFound(identifier.to_string()))
    }

    /// Drops a session whose link died on its own.
    async fn reap_finished(&self, active: &mut Option<ActiveSession>) {
        let finished = active.as_ref().is_some_and(|a| a.session.is_finished());
        if !finished {
            return;
        }
        if let Some(stale) = active.take() {
            let end = stale.session.shutdown().await;
            let state = match end {
                SessionEnd::LinkLost(reason) => ConnectionState::Error(reason),
                _ => ConnectionState::Disconnected,
            };
            log::info!("Cleared finished session for device {}", stale.device_id);
            self.set_state(stale.device_id, state).await;
        }
    }

    /// Opens whichever transport fits the device and starts a session.
    pub async fn connect(&self, identifier: &str) -> Result<PumpHandle> {
        let device = self.lookup(identifier).await?;
        match device.listing.kind {
            TransportKind::Serial => self.connect_serial(device).await,
            TransportKind::Usb => self.connect_usb(device, false).await,
        }
    }

    async fn connect_serial(&self, device: Device) -> Result<PumpHandle> {
        self.config.validate()?;
        let mut active = self.active.lock().await;
        self.reap_finished(&mut active).await;
        if active.is_some() {
            return Err(DeviceError::AlreadyConnected);
        }
        self.set_state(device.id, ConnectionState::Connecting).await;

        let port = device.listing.identifier.clone();
        let settings = self.config.serial.clone();
        let opened = tokio::task::spawn_blocking(move || SerialTransport::open(&port, &settings))
            .await
            .map_err(|e| DeviceError::Worker(e.to_string()))?;
        let transport = match opened {
            Ok(t) => t,
            Err(e) => {
                self.set_state(device.id, ConnectionState::Error(e.to_string())).await;
                return Err(e.into());
            }
        };
        self.start_session(&mut active, &device, Arc::new(transport)).await
    }

    async fn connect_usb(&self, device: Device, permission_known: bool) -> Result<PumpHandle> {
        self.config.validate()?;
        let mut active = self.active.lock().await;
        self.reap_finished(&mut active).await;
        if active.is_some() {
            return Err(DeviceError::AlreadyConnected);
        }

        if !permission_known && !self.broker.has_permission(&device.listing).await {
            match self.broker.request_permission(&device.listing).await {
                PermissionOutcome::Granted => {}
                PermissionOutcome::Pending => {
                    log::info!("Requested USB permission for {}", device.listing.identifier);
                    self.set_state(device.id, ConnectionState::AwaitingPermission).await;
                    return Err(DeviceError::PermissionPending(device.listing.identifier.clone()));
                }
                PermissionOutcome::Denied => {
                    let err = ConnectionError::PermissionDenied(device.listing.identifier.clone());
                    self.set_state(device.id, ConnectionState::Error(err.to_string())).await;
                    return Err(err.into());
                }
            }
        }
        self.set_state(device.id, ConnectionState::Connecting).await;

        let identifier = device.listing.identifier.clone();
        let settings = self.config.usb.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let usb_device = rusb::devices()?
                .iter()
                .find(|d| usb_identifier(d) == identifier)
                .ok_or_else(|| ConnectionError::PortNotFound(identifier.clone()))?;
            UsbBulkTransport::open(&usb_device, &settings)
        })
        .await
        .map_err(|e| DeviceError::Worker(e.to_string()))?;
        let transport = match opened {
            Ok(t) => t,
            Err(e) => {
                self.set_state(device.id, ConnectionState::Error(e.to_string())).await;
                return Err(e.into());
            }
        };
        self.start_session(&mut active, &device, Arc::new(transport)).await
    }

    /// Resumes a USB connect that stopped at the permission prompt.
    pub async fn permission_granted(&self, identifier: &str) -> Result<PumpHandle> {
        let device = self
            .device(identifier)
            .await
            .ok_or_else(|| DeviceError::NotFound(identifier.to_string()))?;
        if device.connection_state != ConnectionState::AwaitingPermission {
            log::warn!("Permission grant for {} arrived without a pending request", identifier);
        }
        self.connect_usb(device, true).await
    }

    /// Starts a session on a transport the caller already opened.
    pub async fn connect_transport(&self, listing: DeviceListing, transport: Arc<dyn Transport>) -> Result<PumpHandle> {
        self.config.validate()?;
        let device = self.register(listing).await;
        let mut active = self.active.lock().await;
        self.reap_finished(&mut active).await;
        if active.is_some() {
            return Err(DeviceError::AlreadyConnected);
        }
        self.start_session(&mut active, &device, transport).await
    }

    async fn start_session(
        &self,
        active: &mut Option<ActiveSession>,
        device: &Device,
        transport: Arc<dyn Transport>,
    ) -> Result<PumpHandle> {
        let info = LinkInfo {
            identifier: device.listing.identifier.clone(),
            kind: transport.kind(),
            vendor_id: Some(device.listing.vendor_id),
            product_id: Some(device.listing.product_id),
        };
        let session = match PumpSession::start(DeviceHandle::new(transport, info), &self.config) {
            Ok(s) => s,
            Err(e) => {
                self.set_state(device.id, ConnectionState::Error(e.to_string())).await;
                return Err(e.into());
            }
        };
        let handle = session.handle();
        *active = Some(ActiveSession { device_id: device.id, session });
        self.set_state(device.id, ConnectionState::Connected).await;
        log::info!("Connected to {}", device.listing.identifier);
        Ok(handle)
    }

    pub async fn disconnect(&self) -> Result<()> {
        let taken = self.active.lock().await.take();
        let Some(active) = taken else {
            return Err(DeviceError::NotConnected);
        };
        let end = active.session.shutdown().await;
        log::info!("Disconnected device {} ({:?})", active.device_id, end);
        self.set_state(active.device_id, ConnectionState::Disconnected).await;
        Ok(())
    }

    /// Handle to the live session, if its link is still up.
    pub async fn connected_handle(&self) -> Option<PumpHandle> {
        let mut active = self.active.lock().await;
        self.reap_finished(&mut active).await;
        active.as_ref().map(|a| a.session.handle())
    }

    pub async fn connected_device(&self) -> Option<Device> {
        let id = {
            let mut active = self.active.lock().await;
            self.reap_finished(&mut active).await;
            active.as_ref().map(|a| a.device_id)?
        };
        self.devices.read().await.get(&id).cloned()
    }
}
