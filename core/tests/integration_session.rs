// Integration tests for the BLE session facade
//
// Drives a full session against the loopback radio through the public API
// only, observing outcomes the way an application would: via listeners.

use gattlink_core::gatt::types::{CharacteristicInfo, CharacteristicProperties, ConnectionHandle};
use gattlink_core::{
    ActionTag, BleSession, BondState, CharacteristicRef, ConnectionState, DeviceAddress,
    EventForwarder, GattStatus, Logger, LoopbackTransport, Peripheral, ScanEvent, ScanFailure,
    ScanFilter, ScanForwarder, ServiceInfo, SessionEvent, SessionListener, SessionSettings,
    TransportEvent,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000_180D_0000_1000_8000_0080_5F9B_34FB);
const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x0000_2A37_0000_1000_8000_0080_5F9B_34FB);
const BODY_SENSOR_LOCATION: Uuid = Uuid::from_u128(0x0000_2A38_0000_1000_8000_0080_5F9B_34FB);

fn peer() -> DeviceAddress {
    "C4:7C:8D:6A:00:01".parse().unwrap()
}

fn measurement() -> CharacteristicRef {
    CharacteristicRef::new(HEART_RATE_SERVICE, HEART_RATE_MEASUREMENT)
}

fn location() -> CharacteristicRef {
    CharacteristicRef::new(HEART_RATE_SERVICE, BODY_SENSOR_LOCATION)
}

fn heart_rate_monitor() -> Peripheral {
    Peripheral::new(peer())
        .with_name("HRM")
        .with_rssi(-48)
        .with_service(ServiceInfo {
            uuid: HEART_RATE_SERVICE,
            characteristics: vec![
                CharacteristicInfo {
                    uuid: HEART_RATE_MEASUREMENT,
                    properties: CharacteristicProperties {
                        notify: true,
                        ..Default::default()
                    },
                    descriptors: vec![gattlink_core::gatt::CCCD_UUID],
                },
                CharacteristicInfo {
                    uuid: BODY_SENSOR_LOCATION,
                    properties: CharacteristicProperties {
                        read: true,
                        write: true,
                        ..Default::default()
                    },
                    descriptors: vec![],
                },
            ],
        })
        .with_value(location(), [0x01u8])
}

struct Harness {
    session: BleSession,
    radio: Arc<LoopbackTransport>,
    events: UnboundedReceiver<SessionEvent>,
}

fn harness_with(settings: SessionSettings) -> Harness {
    let radio = Arc::new(LoopbackTransport::new());
    radio.advertise(heart_rate_monitor());
    let (listener, events) = EventForwarder::channel();
    let session = BleSession::builder(radio.clone())
        .adapter(radio.clone())
        .settings(settings)
        .listener(listener)
        .spawn()
        .unwrap();
    radio.attach(session.transport_events());
    Harness {
        session,
        radio,
        events,
    }
}

fn harness() -> Harness {
    harness_with(SessionSettings {
        connect_delay_ms: 0,
        ..Default::default()
    })
}

async fn next_event(events: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("Timed out waiting for session event")
        .expect("Session event channel closed")
}

async fn connected() -> Harness {
    let mut h = harness();
    h.session.connect(peer()).unwrap();
    assert_eq!(next_event(&mut h.events).await, SessionEvent::Connected(peer()));
    h
}

/// Radio primitives that map to queued actions, in call order
fn action_calls(radio: &LoopbackTransport) -> Vec<String> {
    radio
        .calls()
        .into_iter()
        .filter(|c| {
            ["read ", "write ", "read_remote_rssi", "discover_services", "request_mtu"]
                .iter()
                .any(|p| c.starts_with(p))
                && !c.starts_with("write_descriptor")
        })
        .collect()
}

#[tokio::test]
async fn test_full_session_lifecycle() {
    let mut h = connected().await;

    h.session.discover_services().unwrap();
    match next_event(&mut h.events).await {
        SessionEvent::ServicesDiscovered(services) => {
            assert_eq!(services.len(), 1);
            assert_eq!(services[0].characteristic(BODY_SENSOR_LOCATION), Some(location()));
        }
        other => panic!("Unexpected event {:?}", other),
    }

    h.session.change_mtu(247).unwrap();
    assert_eq!(next_event(&mut h.events).await, SessionEvent::MtuChanged(247));

    h.session.read_characteristic(location()).unwrap();
    assert_eq!(
        next_event(&mut h.events).await,
        SessionEvent::CharacteristicRead {
            characteristic: location(),
            value: vec![0x01],
        }
    );

    h.session.write_characteristic(location(), &[0x02]).unwrap();
    assert_eq!(
        next_event(&mut h.events).await,
        SessionEvent::CharacteristicWrite {
            characteristic: location(),
            status: GattStatus::SUCCESS,
        }
    );
    assert_eq!(
        h.radio.peripheral(&peer()).unwrap().value(&location()),
        Some(&[0x02u8][..])
    );

    h.session.read_remote_rssi().unwrap();
    assert_eq!(next_event(&mut h.events).await, SessionEvent::RemoteRssi(-48));

    h.session.disconnect().unwrap();
    assert_eq!(
        next_event(&mut h.events).await,
        SessionEvent::Disconnected {
            address: peer(),
            status: GattStatus::SUCCESS,
        }
    );

    let snapshot = h.session.snapshot().await.unwrap();
    assert_eq!(snapshot.connection_state, ConnectionState::Disconnected);
    assert!(snapshot.peer.is_none());
    assert!(snapshot.queued_actions.is_empty());
    assert_eq!(h.radio.open_handles(), 0);
}

#[tokio::test]
async fn test_notifications_flow_after_enable() {
    let mut h = connected().await;

    h.session
        .set_characteristic_notification(measurement(), true)
        .unwrap();
    match next_event(&mut h.events).await {
        SessionEvent::DescriptorWrite { descriptor, status } => {
            assert_eq!(descriptor.characteristic, measurement());
            assert_eq!(descriptor.descriptor, gattlink_core::gatt::CCCD_UUID);
            assert!(status.is_success());
        }
        other => panic!("Unexpected event {:?}", other),
    }

    assert!(h.radio.notify(&peer(), measurement(), &[0x00, 72]));
    assert_eq!(
        next_event(&mut h.events).await,
        SessionEvent::CharacteristicChanged {
            characteristic: measurement(),
            value: vec![0x00, 72],
        }
    );

    h.session
        .set_characteristic_notification(measurement(), false)
        .unwrap();
    next_event(&mut h.events).await;
    assert!(!h.radio.notify(&peer(), measurement(), &[0x00, 73]));
}

#[tokio::test]
async fn test_fifo_with_bounded_retry() {
    let mut h = connected().await;
    h.radio
        .fail_next(ActionTag::ReadCharacteristic, GattStatus::READ_NOT_PERMITTED, 2);

    h.session.read_characteristic(location()).unwrap();
    h.session.write_characteristic(location(), &[0x05]).unwrap();
    h.session.read_remote_rssi().unwrap();

    assert!(matches!(
        next_event(&mut h.events).await,
        SessionEvent::CharacteristicRead { .. }
    ));
    assert!(matches!(
        next_event(&mut h.events).await,
        SessionEvent::CharacteristicWrite { .. }
    ));
    assert_eq!(next_event(&mut h.events).await, SessionEvent::RemoteRssi(-48));

    let read = format!("read {}", BODY_SENSOR_LOCATION);
    let write = format!("write {} [05]", BODY_SENSOR_LOCATION);
    assert_eq!(
        action_calls(&h.radio),
        vec![read.clone(), read.clone(), read, write, "read_remote_rssi".to_string()]
    );
}

#[tokio::test]
async fn test_exhausted_retries_report_failure_and_move_on() {
    let mut h = connected().await;
    h.radio
        .fail_next(ActionTag::WriteCharacteristic, GattStatus::WRITE_NOT_PERMITTED, 3);

    h.session.write_characteristic(location(), &[0xFF]).unwrap();
    h.session.read_remote_rssi().unwrap();

    assert_eq!(
        next_event(&mut h.events).await,
        SessionEvent::ActionFailed {
            action: ActionTag::WriteCharacteristic,
            status: GattStatus::WRITE_NOT_PERMITTED,
        }
    );
    assert_eq!(next_event(&mut h.events).await, SessionEvent::RemoteRssi(-48));
}

#[tokio::test]
async fn test_failures_can_stay_silent() {
    let mut h = harness_with(SessionSettings {
        connect_delay_ms: 0,
        notify_action_failures: false,
        ..Default::default()
    });
    h.session.connect(peer()).unwrap();
    next_event(&mut h.events).await;

    h.radio.refuse_next(ActionTag::ReadRemoteRssi, 3);
    h.session.read_remote_rssi().unwrap();
    h.session.change_mtu(100).unwrap();

    assert_eq!(next_event(&mut h.events).await, SessionEvent::MtuChanged(100));
}

#[tokio::test]
async fn test_single_flight_while_responses_pending() {
    let mut h = connected().await;
    h.radio.hold();

    h.session.discover_services().unwrap();
    h.session.read_characteristic(location()).unwrap();
    h.session.read_remote_rssi().unwrap();
    h.session.read_remote_rssi().unwrap();

    let snapshot = h.session.snapshot().await.unwrap();
    assert_eq!(
        snapshot.queued_actions,
        vec![
            "discover_services#2".to_string(),
            "read_characteristic#3".to_string(),
            "read_remote_rssi#4".to_string(),
        ]
    );
    assert_eq!(action_calls(&h.radio), vec!["discover_services"]);

    assert_eq!(h.radio.release(), 1);
    assert!(matches!(
        next_event(&mut h.events).await,
        SessionEvent::ServicesDiscovered(_)
    ));
    let calls = action_calls(&h.radio);
    assert_eq!(calls[0], "discover_services");
    assert_eq!(calls[1], format!("read {}", BODY_SENSOR_LOCATION));
}

#[tokio::test]
async fn test_writes_keep_their_own_payload() {
    let mut h = connected().await;
    h.radio.hold();

    h.session.write_characteristic(location(), &[0x0A]).unwrap();
    h.session.write_characteristic(location(), &[0x0B]).unwrap();
    h.session.snapshot().await.unwrap();
    h.radio.release();
    next_event(&mut h.events).await;
    h.radio.release();
    next_event(&mut h.events).await;

    let writes: Vec<String> = action_calls(&h.radio);
    assert_eq!(
        writes,
        vec![
            format!("write {} [0A]", BODY_SENSOR_LOCATION),
            format!("write {} [0B]", BODY_SENSOR_LOCATION),
        ]
    );
}

#[tokio::test]
async fn test_requests_without_connection_are_ignored() {
    let mut h = harness();

    h.session.discover_services().unwrap();
    h.session.read_characteristic(location()).unwrap();
    h.session.read_remote_rssi().unwrap();

    let snapshot = h.session.snapshot().await.unwrap();
    assert!(snapshot.queued_actions.is_empty());
    assert!(action_calls(&h.radio).is_empty());
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn test_link_loss_clears_state() {
    let mut h = connected().await;
    h.radio.hold();
    h.session.discover_services().unwrap();
    h.session.read_remote_rssi().unwrap();
    h.session.snapshot().await.unwrap();

    // Pending completions die with the link
    h.radio.release();
    assert!(h.radio.drop_link(&peer()));
    let mut saw_disconnect = false;
    while !saw_disconnect {
        if let SessionEvent::Disconnected { status, .. } = next_event(&mut h.events).await {
            assert_eq!(status, GattStatus(0x08));
            saw_disconnect = true;
        }
    }

    let snapshot = h.session.snapshot().await.unwrap();
    assert_eq!(snapshot.connection_state, ConnectionState::Disconnected);
    assert!(snapshot.queued_actions.is_empty());
}

#[tokio::test]
async fn test_link_loss_notifies_each_listener_once() {
    let mut h = connected().await;
    let (second, mut second_events) = EventForwarder::channel();
    let (third, mut third_events) = EventForwarder::channel();
    h.session.add_listener(second).unwrap();
    h.session.add_listener(third).unwrap();
    assert_eq!(h.session.snapshot().await.unwrap().listener_count, 3);

    assert!(h.radio.drop_link(&peer()));
    let expected = SessionEvent::Disconnected {
        address: peer(),
        status: GattStatus(0x08),
    };
    for events in [&mut h.events, &mut second_events, &mut third_events] {
        assert_eq!(next_event(events).await, expected);
    }

    // Round-trip through the session so any duplicate would already be queued
    let snapshot = h.session.snapshot().await.unwrap();
    assert_eq!(snapshot.connection_state, ConnectionState::Disconnected);
    assert_eq!(h.radio.open_handles(), 0);
    assert!(h.events.try_recv().is_err());
    assert!(second_events.try_recv().is_err());
    assert!(third_events.try_recv().is_err());
}

#[tokio::test]
async fn test_stale_connection_callback_is_contained() {
    let mut h = connected().await;
    h.radio.hold();
    h.session.read_characteristic(location()).unwrap();
    h.session.snapshot().await.unwrap();

    h.radio.inject(TransportEvent::ConnectionStateChanged {
        handle: ConnectionHandle(4242),
        status: GattStatus::SUCCESS,
        state: ConnectionState::Connected,
    });

    let snapshot = h.session.snapshot().await.unwrap();
    assert_eq!(snapshot.connection_state, ConnectionState::Connected);
    assert_eq!(snapshot.peer, Some(peer()));
    assert!(snapshot.queued_actions.is_empty());
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn test_bonding_round_trip() {
    let mut h = harness();

    h.session.create_bond(peer()).unwrap();
    assert_eq!(
        next_event(&mut h.events).await,
        SessionEvent::BondStateChanged {
            state: BondState::Bonding,
            address: peer(),
        }
    );
    assert_eq!(
        next_event(&mut h.events).await,
        SessionEvent::BondStateChanged {
            state: BondState::Bonded,
            address: peer(),
        }
    );
    assert!(h.session.get_bonded_device(peer()).is_some());

    // Already bonded: answered without pairing again
    h.session.create_bond(peer()).unwrap();
    assert_eq!(
        next_event(&mut h.events).await,
        SessionEvent::BondStateChanged {
            state: BondState::Bonded,
            address: peer(),
        }
    );
    let pairings = h.radio.calls().iter().filter(|c| c.starts_with("create_bond")).count();
    assert_eq!(pairings, 1);

    h.session.remove_bond(&peer().to_string()).unwrap();
    h.session.snapshot().await.unwrap();
    assert!(h.session.get_bonded_device(peer()).is_none());
}

struct Counter {
    name: &'static str,
    seen: Arc<Mutex<Vec<&'static str>>>,
}

impl SessionListener for Counter {
    fn on_read_remote_rssi(&self, _rssi: i16) {
        self.seen.lock().push(self.name);
    }
}

#[tokio::test]
async fn test_fan_out_reaches_every_listener_in_order() {
    let mut h = connected().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let first: Arc<dyn SessionListener> = Arc::new(Counter {
        name: "first",
        seen: seen.clone(),
    });
    let second: Arc<dyn SessionListener> = Arc::new(Counter {
        name: "second",
        seen: seen.clone(),
    });
    h.session.add_listener(first.clone()).unwrap();
    h.session.add_listener(second.clone()).unwrap();

    h.session.read_remote_rssi().unwrap();
    next_event(&mut h.events).await;
    assert_eq!(*seen.lock(), vec!["first", "second"]);

    h.session.remove_listener(first).unwrap();
    h.session.read_remote_rssi().unwrap();
    next_event(&mut h.events).await;
    assert_eq!(*seen.lock(), vec!["first", "second", "second"]);

    assert_eq!(h.session.snapshot().await.unwrap().listener_count, 2);
}

#[tokio::test]
async fn test_scan_delivers_results_and_failures() {
    let h = harness();
    let (scan_listener, mut scan_events) = ScanForwarder::channel();
    h.session.set_scan_listener(Some(scan_listener)).unwrap();

    h.session
        .start_scan_for_service(HEART_RATE_SERVICE, None)
        .unwrap();
    match tokio::time::timeout(Duration::from_secs(2), scan_events.recv()).await {
        Ok(Some(ScanEvent::Result(result))) => {
            assert_eq!(result.address, peer());
            assert_eq!(result.name.as_deref(), Some("HRM"));
        }
        other => panic!("Unexpected scan outcome {:?}", other),
    }
    assert!(h.session.snapshot().await.unwrap().scanning);

    // Live advertisement first, then a batch holding only known devices
    let other: DeviceAddress = "C4:7C:8D:6A:00:02".parse().unwrap();
    h.radio.advertise(Peripheral::new(other).with_service(ServiceInfo {
        uuid: HEART_RATE_SERVICE,
        characteristics: vec![],
    }));
    h.radio.report_batch();
    match scan_events.recv().await {
        Some(ScanEvent::Result(result)) => assert_eq!(result.address, other),
        other => panic!("Unexpected scan outcome {:?}", other),
    }
    h.session.snapshot().await.unwrap();
    assert!(scan_events.try_recv().is_err());

    h.session.stop_scan().unwrap();
    assert!(!h.session.snapshot().await.unwrap().scanning);
    assert!(!h.radio.is_scanning());

    h.radio.fail_scan(2);
    h.session.start_scan(vec![ScanFilter::address(peer())]).unwrap();
    assert_eq!(
        scan_events.recv().await,
        Some(ScanEvent::Failed(ScanFailure::ApplicationRegistrationFailed))
    );
    assert!(!h.session.snapshot().await.unwrap().scanning);
}

#[derive(Default)]
struct TagCapture {
    tags: Mutex<Vec<String>>,
}

impl Logger for TagCapture {
    fn debug(&self, tag: &str, _message: &str) {
        self.tags.lock().push(tag.to_string());
    }
    fn info(&self, tag: &str, _message: &str) {
        self.tags.lock().push(tag.to_string());
    }
    fn warn(&self, tag: &str, _message: &str) {
        self.tags.lock().push(tag.to_string());
    }
    fn error(&self, tag: &str, _message: &str) {
        self.tags.lock().push(tag.to_string());
    }
}

#[tokio::test]
async fn test_log_sink_receives_both_components() {
    let radio = Arc::new(LoopbackTransport::new());
    radio.advertise(heart_rate_monitor());
    let capture = Arc::new(TagCapture::default());
    let (listener, mut events) = EventForwarder::channel();
    let session = BleSession::builder(radio.clone())
        .settings(SessionSettings {
            connect_delay_ms: 0,
            ..Default::default()
        })
        .logger(capture.clone())
        .listener(listener)
        .spawn()
        .unwrap();
    radio.attach(session.transport_events());

    session.connect(peer()).unwrap();
    next_event(&mut events).await;

    let tags = capture.tags.lock();
    assert!(tags.iter().any(|t| t == "BleSession"));
    assert!(tags.iter().any(|t| t == "GattSessionManager"));
}

#[tokio::test(start_paused = true)]
async fn test_stuck_action_cleared_only_by_new_request() {
    let mut h = connected().await;
    h.radio.hold();
    h.session.discover_services().unwrap();

    tokio::time::sleep(Duration::from_secs(90)).await;
    let snapshot = h.session.snapshot().await.unwrap();
    assert_eq!(snapshot.queued_actions.len(), 1);

    h.session.change_mtu(247).unwrap();
    let snapshot = h.session.snapshot().await.unwrap();
    assert!(snapshot.queued_actions.is_empty());

    // The late discovery answer is still relayed but completes nothing
    h.radio.release();
    h.session.change_mtu(185).unwrap();
    loop {
        match next_event(&mut h.events).await {
            SessionEvent::ServicesDiscovered(_) => continue,
            SessionEvent::MtuChanged(mtu) => {
                assert_eq!(mtu, 185);
                break;
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }
}
