mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{test_config, MockTransport};
use syringe_link_lib::device::{
    ConnectionState, DeviceListing, DeviceManager, PermissionOutcome, UsbPermissionBroker,
};
use syringe_link_lib::transport::{ConnectionError, TransportKind};
use syringe_link_lib::DeviceError;

fn serial_listing(name: &str) -> DeviceListing {
    DeviceListing {
        identifier: name.into(),
        vendor_id: 0x1A86,
        product_id: 0x7523,
        kind: TransportKind::Serial,
        product: None,
    }
}

fn usb_listing() -> DeviceListing {
    DeviceListing {
        identifier: "usb:001:007".into(),
        vendor_id: 0x1A86,
        product_id: 0x7523,
        kind: TransportKind::Usb,
        product: None,
    }
}

struct ScriptedBroker {
    outcome: PermissionOutcome,
    requests: AtomicUsize,
}

#[async_trait]
impl UsbPermissionBroker for ScriptedBroker {
    async fn has_permission(&self, _listing: &DeviceListing) -> bool {
        false
    }

    async fn request_permission(&self, _listing: &DeviceListing) -> PermissionOutcome {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.outcome
    }
}

#[tokio::test]
async fn only_one_session_at_a_time() {
    let manager = DeviceManager::new(test_config());
    let first = MockTransport::new();
    let handle = manager
        .connect_transport(serial_listing("mock0"), first.clone())
        .await
        .unwrap();

    let second = MockTransport::new();
    let err = manager
        .connect_transport(serial_listing("mock1"), second)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::AlreadyConnected));

    let connected = manager.connected_device().await.unwrap();
    assert_eq!(connected.identifier(), "mock0");
    assert_eq!(connected.connection_state, ConnectionState::Connected);

    manager.disconnect().await.unwrap();
    assert!(first.was_closed());
    assert!(handle.is_closed());
    assert!(matches!(manager.disconnect().await, Err(DeviceError::NotConnected)));
    assert_eq!(
        manager.device("mock0").await.unwrap().connection_state,
        ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn dead_session_is_reaped_before_next_connect() {
    let manager = DeviceManager::new(test_config());
    let first = MockTransport::new();
    let handle = manager
        .connect_transport(serial_listing("mock0"), first.clone())
        .await
        .unwrap();
    let mut snapshots = handle.snapshot_receiver();

    first.unplug();
    snapshots.wait_for(|s| !s.connected).await.ok();
    while !handle.is_closed() {
        tokio::task::yield_now().await;
    }

    assert!(manager.connected_handle().await.is_none());
    assert!(matches!(
        manager.device("mock0").await.unwrap().connection_state,
        ConnectionState::Error(_)
    ));
    manager
        .connect_transport(serial_listing("mock1"), MockTransport::new())
        .await
        .unwrap();
    manager.disconnect().await.unwrap();
}

#[tokio::test]
async fn usb_connect_waits_for_permission() {
    let broker = Arc::new(ScriptedBroker { outcome: PermissionOutcome::Pending, requests: AtomicUsize::new(0) });
    let manager = DeviceManager::with_broker(test_config(), broker.clone());
    manager.register(usb_listing()).await;

    let err = manager.connect("usb:001:007").await.unwrap_err();
    assert!(matches!(err, DeviceError::PermissionPending(ref id) if id == "usb:001:007"));
    assert_eq!(broker.requests.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.device("usb:001:007").await.unwrap().connection_state,
        ConnectionState::AwaitingPermission
    );
}

#[tokio::test]
async fn usb_permission_denied_is_a_connection_error() {
    let broker = Arc::new(ScriptedBroker { outcome: PermissionOutcome::Denied, requests: AtomicUsize::new(0) });
    let manager = DeviceManager::with_broker(test_config(), broker);
    manager.register(usb_listing()).await;

    let err = manager.connect("usb:001:007").await.unwrap_err();
    assert!(matches!(err, DeviceError::Connection(ConnectionError::PermissionDenied(_))));
    assert!(matches!(
        manager.device("usb:001:007").await.unwrap().connection_state,
        ConnectionState::Error(_)
    ));
}

#[tokio::test]
async fn grant_for_unknown_device_is_not_found() {
    let manager = DeviceManager::new(test_config());
    assert!(matches!(
        manager.permission_granted("usb:009:009").await,
        Err(DeviceError::NotFound(_))
    ));
}

#[tokio::test]
async fn register_refreshes_existing_entry() {
    let manager = DeviceManager::new(test_config());
    let first = manager.register(serial_listing("COM3")).await;
    let mut updated = serial_listing("COM3");
    updated.product = Some("USB-SERIAL CH340".into());
    let second = manager.register(updated).await;
    assert_eq!(first.id, second.id);
    assert_eq!(manager.get_devices().await.len(), 1);
    assert_eq!(second.listing.product.as_deref(), Some("USB-SERIAL CH340"));
}

#[tokio::test]
async fn invalid_config_fails_connect_without_touching_the_link() {
    let mut config = test_config();
    config.session.message_capacity = 0;
    let manager = DeviceManager::new(config);
    let transport = MockTransport::new();

    let err = manager
        .connect_transport(serial_listing("mock0"), transport.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::Config(_)));
    assert!(manager.connected_device().await.is_none());
    assert!(transport.written().is_empty());

    let mut config = test_config();
    config.serial.settle_delay_ms = 0;
    let manager = DeviceManager::new(config);
    assert!(matches!(
        manager.connect_transport(serial_listing("mock1"), MockTransport::new()).await,
        Err(DeviceError::Config(_))
    ));
}
