//! Subscriber interfaces and fan-out

use crate::gatt::action::ActionTag;
use crate::gatt::manager::SessionEvent;
use crate::gatt::types::{
    BondState, CharacteristicRef, DescriptorRef, DeviceAddress, GattStatus, ServiceInfo,
};
use crate::transport::{ScanFailure, ScanResult};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Session event subscriber
///
/// Every method defaults to a no-op so implementors only override what they
/// care about. Calls are made from the session task, one event at a time.
pub trait SessionListener: Send + Sync {
    fn on_connected(&self, _address: DeviceAddress) {}

    fn on_disconnected(&self, _address: DeviceAddress, _status: GattStatus) {}

    fn on_services_discovered(&self, _services: &[ServiceInfo]) {}

    fn on_characteristic_read(&self, _characteristic: &CharacteristicRef, _value: &[u8]) {}

    fn on_characteristic_write(&self, _characteristic: &CharacteristicRef, _status: GattStatus) {}

    fn on_characteristic_changed(&self, _characteristic: &CharacteristicRef, _value: &[u8]) {}

    fn on_descriptor_write(&self, _descriptor: &DescriptorRef, _status: GattStatus) {}

    fn on_bond_state_changed(&self, _state: BondState, _address: DeviceAddress) {}

    fn on_mtu_changed(&self, _mtu: u16) {}

    fn on_read_remote_rssi(&self, _rssi: i16) {}

    /// An action was dropped after exhausting its retries
    fn on_action_failed(&self, _action: ActionTag, _status: GattStatus) {}
}

/// Receiver of LE scan results
pub trait ScanListener: Send + Sync {
    fn on_scan_result(&self, result: &ScanResult);

    fn on_scan_failed(&self, _failure: ScanFailure) {}
}

/// Call the listener method matching `event`
pub fn deliver(listener: &dyn SessionListener, event: &SessionEvent) {
    match event {
        SessionEvent::Connected(address) => listener.on_connected(*address),
        SessionEvent::Disconnected { address, status } => {
            listener.on_disconnected(*address, *status)
        }
        SessionEvent::ServicesDiscovered(services) => listener.on_services_discovered(services),
        SessionEvent::CharacteristicRead {
            characteristic,
            value,
        } => listener.on_characteristic_read(characteristic, value),
        SessionEvent::CharacteristicWrite {
            characteristic,
            status,
        } => listener.on_characteristic_write(characteristic, *status),
        SessionEvent::CharacteristicChanged {
            characteristic,
            value,
        } => listener.on_characteristic_changed(characteristic, value),
        SessionEvent::DescriptorWrite { descriptor, status } => {
            listener.on_descriptor_write(descriptor, *status)
        }
        SessionEvent::BondStateChanged { state, address } => {
            listener.on_bond_state_changed(*state, *address)
        }
        SessionEvent::MtuChanged(mtu) => listener.on_mtu_changed(*mtu),
        SessionEvent::RemoteRssi(rssi) => listener.on_read_remote_rssi(*rssi),
        SessionEvent::ActionFailed { action, status } => {
            listener.on_action_failed(*action, *status)
        }
    }
}

fn same_listener(a: &Arc<dyn SessionListener>, b: &Arc<dyn SessionListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Registered subscribers in registration order
#[derive(Default)]
pub struct ListenerSet {
    listeners: Vec<Arc<dyn SessionListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; returns false if it was already registered
    pub fn add(&mut self, listener: Arc<dyn SessionListener>) -> bool {
        if self.listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        self.listeners.push(listener);
        true
    }

    /// Unregister a listener; returns false if it was not registered
    pub fn remove(&mut self, listener: &Arc<dyn SessionListener>) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| !same_listener(l, listener));
        self.listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Deliver one event to every listener in registration order
    pub fn dispatch(&self, event: &SessionEvent) {
        for listener in &self.listeners {
            deliver(listener.as_ref(), event);
        }
    }
}

/// Listener that forwards every event into a channel
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventForwarder {
    /// Create a forwarder and the receiving end of its channel
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: SessionEvent) {
        // Receiver gone: nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl SessionListener for EventForwarder {
    fn on_connected(&self, address: DeviceAddress) {
        self.forward(SessionEvent::Connected(address));
    }

    fn on_disconnected(&self, address: DeviceAddress, status: GattStatus) {
        self.forward(SessionEvent::Disconnected { address, status });
    }

    fn on_services_discovered(&self, services: &[ServiceInfo]) {
        self.forward(SessionEvent::ServicesDiscovered(services.to_vec()));
    }

    fn on_characteristic_read(&self, characteristic: &CharacteristicRef, value: &[u8]) {
        self.forward(SessionEvent::CharacteristicRead {
            characteristic: *characteristic,
            value: value.to_vec(),
        });
    }

    fn on_characteristic_write(&self, characteristic: &CharacteristicRef, status: GattStatus) {
        self.forward(SessionEvent::CharacteristicWrite {
            characteristic: *characteristic,
            status,
        });
    }

    fn on_characteristic_changed(&self, characteristic: &CharacteristicRef, value: &[u8]) {
        self.forward(SessionEvent::CharacteristicChanged {
            characteristic: *characteristic,
            value: value.to_vec(),
        });
    }

    fn on_descriptor_write(&self, descriptor: &DescriptorRef, status: GattStatus) {
        self.forward(SessionEvent::DescriptorWrite {
            descriptor: *descriptor,
            status,
        });
    }

    fn on_bond_state_changed(&self, state: BondState, address: DeviceAddress) {
        self.forward(SessionEvent::BondStateChanged { state, address });
    }

    fn on_mtu_changed(&self, mtu: u16) {
        self.forward(SessionEvent::MtuChanged(mtu));
    }

    fn on_read_remote_rssi(&self, rssi: i16) {
        self.forward(SessionEvent::RemoteRssi(rssi));
    }

    fn on_action_failed(&self, action: ActionTag, status: GattStatus) {
        self.forward(SessionEvent::ActionFailed { action, status });
    }
}

/// What a scan listener observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Result(ScanResult),
    Failed(ScanFailure),
}

/// Scan listener that forwards into a channel
pub struct ScanForwarder {
    tx: mpsc::UnboundedSender<ScanEvent>,
}

impl ScanForwarder {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<ScanEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ScanListener for ScanForwarder {
    fn on_scan_result(&self, result: &ScanResult) {
        let _ = self.tx.send(ScanEvent::Result(result.clone()));
    }

    fn on_scan_failed(&self, failure: ScanFailure) {
        let _ = self.tx.send(ScanEvent::Failed(failure));
    }
}
