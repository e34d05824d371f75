//! GATT session manager: one peripheral, one action in flight
//!
//! Owns the connection handle, the action queue and the connection state
//! machine. Requests are turned into queued actions and executed against the
//! transport one at a time; transport events complete the in-flight action,
//! and high-level [`SessionEvent`]s are buffered for the facade to fan out.
//!
//! All methods must be called from the session's single execution context.

use super::action::{Action, ActionKind, ActionQueue, ActionTag, Enqueued, Outcome};
use super::types::{
    BondState, CharacteristicRef, ConnectionHandle, ConnectionPriority, ConnectionState,
    DescriptorRef, DeviceAddress, GattStatus, ServiceInfo, CCCD_UUID, DISABLE_NOTIFICATION_VALUE,
    ENABLE_NOTIFICATION_VALUE,
};
use crate::logging::LogSink;
use crate::settings::SessionSettings;
use crate::transport::{GattTransport, TransportEvent};
use std::sync::Arc;
use std::time::Instant;

/// Log tag for session manager lines
pub const TAG: &str = "GattSessionManager";

/// High-level events produced for subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected(DeviceAddress),
    Disconnected {
        address: DeviceAddress,
        status: GattStatus,
    },
    ServicesDiscovered(Vec<ServiceInfo>),
    CharacteristicRead {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
    CharacteristicWrite {
        characteristic: CharacteristicRef,
        status: GattStatus,
    },
    CharacteristicChanged {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
    DescriptorWrite {
        descriptor: DescriptorRef,
        status: GattStatus,
    },
    BondStateChanged {
        state: BondState,
        address: DeviceAddress,
    },
    MtuChanged(u16),
    RemoteRssi(i16),
    /// An action was dropped without a successful outcome
    ActionFailed {
        action: ActionTag,
        status: GattStatus,
    },
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

pub struct GattSessionManager {
    transport: Arc<dyn GattTransport>,
    queue: ActionQueue,
    handle: Option<ConnectionHandle>,
    device: Option<DeviceAddress>,
    state: ConnectionState,
    /// Set once a pairing action registered for bond broadcasts
    bond_watch: bool,
    notify_action_failures: bool,
    log: LogSink,
    events: Vec<SessionEvent>,
}

impl GattSessionManager {
    pub fn new(
        transport: Arc<dyn GattTransport>,
        settings: &SessionSettings,
        log: LogSink,
    ) -> Self {
        Self {
            transport,
            queue: ActionQueue::new(settings.max_retries, settings.stuck_action_timeout()),
            handle: None,
            device: None,
            state: ConnectionState::Disconnected,
            bond_watch: false,
            notify_action_failures: settings.notify_action_failures,
            log: log.with_tag(TAG),
            events: Vec::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.handle
    }

    pub fn device(&self) -> Option<DeviceAddress> {
        self.device
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    /// Take the events buffered since the last call
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Replace the current connection with a new attempt to `address`
    pub fn connect(&mut self, address: DeviceAddress) {
        if let Some(old) = self.handle.take() {
            self.log.debug(format!("Releasing previous connection {}", old));
            self.transport.close(old);
        }
        self.device = None;
        self.state = ConnectionState::Disconnected;
        self.queue.clear();
        self.enqueue(ActionKind::Connect(address));
    }

    pub fn discover_services(&mut self) {
        if self.require_connection("discover_services") {
            self.enqueue(ActionKind::DiscoverServices);
        }
    }

    pub fn create_bond(&mut self, address: DeviceAddress) {
        if self.transport.bond_state(&address) == BondState::Bonded {
            self.log.debug("Already paired");
            self.events.push(SessionEvent::BondStateChanged {
                state: BondState::Bonded,
                address,
            });
            return;
        }
        self.enqueue(ActionKind::CreateBond(address));
    }

    pub fn change_mtu(&mut self, mtu: u16) {
        if self.require_connection("change_mtu") {
            self.enqueue(ActionKind::ChangeMtu(mtu));
        }
    }

    pub fn write_characteristic(&mut self, characteristic: CharacteristicRef, value: Vec<u8>) {
        if self.require_connection("write_characteristic") {
            self.enqueue(ActionKind::WriteCharacteristic {
                characteristic,
                value,
            });
        }
    }

    pub fn read_characteristic(&mut self, characteristic: CharacteristicRef) {
        if self.require_connection("read_characteristic") {
            self.enqueue(ActionKind::ReadCharacteristic(characteristic));
        }
    }

    pub fn set_characteristic_notification(
        &mut self,
        characteristic: CharacteristicRef,
        enabled: bool,
    ) {
        if self.require_connection("set_characteristic_notification") {
            self.enqueue(ActionKind::SetNotification {
                characteristic,
                enabled,
            });
        }
    }

    /// Queue an RSSI read unless one is already pending
    pub fn read_remote_rssi(&mut self) {
        if !self.require_connection("read_remote_rssi") {
            return;
        }
        if self.queue.contains(ActionTag::ReadRemoteRssi) {
            self.log.debug("readRemoteRssi: already queued");
            return;
        }
        self.enqueue(ActionKind::ReadRemoteRssi);
    }

    /// Abandon pending work and ask the transport to drop the link
    pub fn disconnect(&mut self) {
        self.log.debug("disconnect()");
        self.queue.clear();
        match self.handle {
            Some(handle) => self.transport.disconnect(handle),
            None => self.log.warn("disconnect: no connection handle"),
        }
    }

    /// Drop pending work and the handle without waiting for a callback
    pub fn release(&mut self) {
        self.queue.clear();
        if let Some(handle) = self.handle.take() {
            self.log.debug(format!("Closing {}", handle));
            self.transport.close(handle);
        }
        self.device = None;
        self.state = ConnectionState::Disconnected;
    }

    pub fn refresh_cache(&mut self) -> bool {
        match self.handle {
            Some(handle) => self.refresh_device_cache(handle),
            None => false,
        }
    }

    fn refresh_device_cache(&self, handle: ConnectionHandle) -> bool {
        match self.transport.refresh_cache(handle) {
            Ok(refreshed) => refreshed,
            Err(e) => {
                self.log
                    .error(format!("An exception occurred while refreshing device: {}", e));
                false
            }
        }
    }

    fn require_connection(&self, operation: &str) -> bool {
        if self.handle.is_none() {
            self.log.warn(format!("{}: no connection handle", operation));
            return false;
        }
        true
    }

    // ------------------------------------------------------------------------
    // Queue driving
    // ------------------------------------------------------------------------

    fn enqueue(&mut self, kind: ActionKind) {
        match self.queue.enqueue(kind, now()) {
            Enqueued::DispatchNow(action) => {
                self.log.debug(format!("Execute first action: {}", action.name()));
                self.run(action);
            }
            Enqueued::Waiting => {
                let current = self
                    .queue
                    .in_flight()
                    .map(Action::name)
                    .unwrap_or_default();
                self.log.debug(format!(
                    "Already executing task: {} (queue size {})",
                    current,
                    self.queue.len()
                ));
            }
            Enqueued::WatchdogReset { stuck } => {
                self.log.warn(format!(
                    "Action blocks ({}) resetting queue after {}s wait time",
                    stuck.name(),
                    self.queue_timeout_secs()
                ));
            }
        }
    }

    fn queue_timeout_secs(&self) -> u64 {
        self.queue.stuck_timeout().as_secs()
    }

    /// Execute `action`, moving on immediately while the transport refuses
    fn run(&mut self, action: Action) {
        let mut next = Some(action);
        while let Some(action) = next.take() {
            if self.execute(&action) {
                break;
            }
            self.log
                .error(format!("{} could not be started", action.name()));
            next = self.finish(Outcome::Failure(GattStatus::FAILURE));
        }
    }

    /// Record the in-flight outcome and return what should run next
    fn finish(&mut self, outcome: Outcome) -> Option<Action> {
        let completion = self.queue.complete(outcome, now());

        if let Some(dropped) = completion.dropped {
            let status = dropped.last_status.unwrap_or(GattStatus::FAILURE);
            self.log.warn(format!(
                "Giving up on {} after {} failed attempt(s), last status {}",
                dropped.name(),
                dropped.failures.max(1),
                status
            ));
            if self.notify_action_failures {
                self.events.push(SessionEvent::ActionFailed {
                    action: dropped.tag(),
                    status,
                });
            }
        }

        match &completion.next {
            Some(action) if action.failures > 0 => {
                self.log.debug(format!("Retrying action: {}", action.name()))
            }
            Some(action) => self.log.debug(format!("Execute next action: {}", action.name())),
            None => self.log.debug("Completed all actions!"),
        }
        completion.next
    }

    fn advance(&mut self, outcome: Outcome) {
        if let Some(next) = self.finish(outcome) {
            self.run(next);
        }
    }

    /// Complete the in-flight action if it is the one this response answers
    fn complete_if(&mut self, expected: ActionTag, outcome: Outcome) {
        match self.queue.in_flight().map(Action::tag) {
            Some(tag) if tag == expected => self.advance(outcome),
            Some(tag) => self.log.warn(format!(
                "Unsolicited {} response while {} is in flight",
                expected, tag
            )),
            None => self
                .log
                .debug(format!("Unsolicited {} response with no action in flight", expected)),
        }
    }

    /// Issue the transport request for `action`; false when it was refused
    fn execute(&mut self, action: &Action) -> bool {
        match &action.kind {
            ActionKind::Connect(address) => {
                self.log.debug(format!(
                    "Connecting to device: {} bond state: {:?}",
                    address,
                    self.transport.bond_state(address)
                ));
                self.device = Some(*address);
                self.state = ConnectionState::Connecting;
                self.handle = self.transport.connect(address);
                if self.handle.is_none() {
                    self.state = ConnectionState::Disconnected;
                    return false;
                }
                true
            }
            ActionKind::CreateBond(address) => {
                self.log.debug("Starting pairing");
                self.bond_watch = true;
                self.transport.create_bond(address)
            }
            kind => {
                let Some(handle) = self.handle else {
                    self.log
                        .warn(format!("{}: no connection handle", action.name()));
                    return false;
                };
                self.execute_on(handle, kind)
            }
        }
    }

    fn execute_on(&mut self, handle: ConnectionHandle, kind: &ActionKind) -> bool {
        match kind {
            ActionKind::DiscoverServices => {
                self.log.debug("Discovering services.");
                self.transport.discover_services(handle)
            }
            ActionKind::ChangeMtu(mtu) => {
                self.log.debug(format!("Changing MTU size to: {}", mtu));
                self.transport.request_mtu(handle, *mtu)
            }
            ActionKind::WriteCharacteristic {
                characteristic,
                value,
            } => {
                self.log.debug(format!(
                    "writeCharacteristic({}, {} bytes)",
                    characteristic,
                    value.len()
                ));
                self.transport
                    .write_characteristic(handle, characteristic, value)
            }
            ActionKind::ReadCharacteristic(characteristic) => {
                self.log
                    .debug(format!("readCharacteristic({})", characteristic));
                self.transport.read_characteristic(handle, characteristic)
            }
            ActionKind::SetNotification {
                characteristic,
                enabled,
            } => {
                self.log.debug(format!(
                    "setCharacteristicNotification({}, {})",
                    characteristic, enabled
                ));
                if !self
                    .transport
                    .set_characteristic_notification(handle, characteristic, *enabled)
                {
                    self.log.warn("setCharacteristicNotification rejected locally");
                }
                let value = if *enabled {
                    ENABLE_NOTIFICATION_VALUE
                } else {
                    DISABLE_NOTIFICATION_VALUE
                };
                self.transport
                    .write_descriptor(handle, &characteristic.descriptor(CCCD_UUID), &value)
            }
            ActionKind::ReadRemoteRssi => {
                self.log.debug("readRemoteRssi()");
                self.transport.read_remote_rssi(handle)
            }
            ActionKind::Connect(_) | ActionKind::CreateBond(_) => false,
        }
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionStateChanged {
                handle,
                status,
                state,
            } => self.on_connection_state_change(handle, status, state),
            TransportEvent::ServicesDiscovered {
                handle,
                status,
                services,
            } => {
                if !self.owns(handle, "services discovered") {
                    return;
                }
                let outcome = if status.is_success() {
                    let uuids: Vec<String> = services.iter().map(|s| s.uuid.to_string()).collect();
                    self.log
                        .debug(format!("onServicesDiscovered received: {:?}", uuids));
                    self.events.push(SessionEvent::ServicesDiscovered(services));
                    Outcome::Success
                } else {
                    self.log
                        .warn(format!("onServicesDiscovered received: {}", status));
                    Outcome::Rejected(status)
                };
                self.complete_if(ActionTag::DiscoverServices, outcome);
            }
            TransportEvent::CharacteristicRead {
                handle,
                characteristic,
                value,
                status,
            } => {
                if !self.owns(handle, "characteristic read") {
                    return;
                }
                let outcome = if status.is_success() {
                    self.log
                        .debug(format!("onCharacteristicRead: {}", characteristic));
                    self.events.push(SessionEvent::CharacteristicRead {
                        characteristic,
                        value,
                    });
                    Outcome::Success
                } else {
                    self.log
                        .warn(format!("onCharacteristicRead status: {}", status));
                    Outcome::Failure(status)
                };
                self.complete_if(ActionTag::ReadCharacteristic, outcome);
            }
            TransportEvent::CharacteristicWrite {
                handle,
                characteristic,
                status,
            } => {
                if !self.owns(handle, "characteristic write") {
                    return;
                }
                let outcome = if status.is_success() {
                    self.log.debug("onCharacteristicWrite");
                    self.events.push(SessionEvent::CharacteristicWrite {
                        characteristic,
                        status,
                    });
                    Outcome::Success
                } else {
                    self.log
                        .warn(format!("onCharacteristicWrite status: {}", status));
                    Outcome::Failure(status)
                };
                self.complete_if(ActionTag::WriteCharacteristic, outcome);
            }
            TransportEvent::CharacteristicChanged {
                handle,
                characteristic,
                value,
            } => {
                if !self.owns(handle, "characteristic changed") {
                    return;
                }
                self.log.debug("onCharacteristicChanged");
                self.events.push(SessionEvent::CharacteristicChanged {
                    characteristic,
                    value,
                });
            }
            TransportEvent::DescriptorWrite {
                handle,
                descriptor,
                status,
            } => {
                if !self.owns(handle, "descriptor write") {
                    return;
                }
                let outcome = if status.is_success() {
                    self.log.debug("onDescriptorWrite");
                    self.events
                        .push(SessionEvent::DescriptorWrite { descriptor, status });
                    Outcome::Success
                } else {
                    self.log
                        .warn(format!("onDescriptorWrite status: {}", status));
                    Outcome::Failure(status)
                };
                self.complete_if(ActionTag::SetNotification, outcome);
            }
            TransportEvent::MtuChanged {
                handle,
                mtu,
                status,
            } => {
                if !self.owns(handle, "mtu changed") {
                    return;
                }
                let outcome = if status.is_success() {
                    self.log.debug(format!("MTU size is now: {}", mtu));
                    self.events.push(SessionEvent::MtuChanged(mtu));
                    Outcome::Success
                } else {
                    self.log.error(format!(
                        "MTU size could not be changed, status: {}",
                        status
                    ));
                    Outcome::Rejected(status)
                };
                self.complete_if(ActionTag::ChangeMtu, outcome);
            }
            TransportEvent::RemoteRssiRead {
                handle,
                rssi,
                status,
            } => {
                if !self.owns(handle, "remote rssi") {
                    return;
                }
                let outcome = if status.is_success() {
                    self.log.debug(format!("onReadRemoteRssi: {}", rssi));
                    self.events.push(SessionEvent::RemoteRssi(rssi));
                    Outcome::Success
                } else {
                    self.log.warn(format!("onReadRemoteRssi status: {}", status));
                    Outcome::Failure(status)
                };
                self.complete_if(ActionTag::ReadRemoteRssi, outcome);
            }
            TransportEvent::BondStateChanged { address, state } => {
                if !self.bond_watch {
                    self.log
                        .debug(format!("Ignoring bond broadcast for {}: not watching", address));
                    return;
                }
                self.log.debug(format!("onReceive: Bond state: {:?}", state));
                self.events
                    .push(SessionEvent::BondStateChanged { state, address });
                if state.is_terminal() {
                    self.complete_if(ActionTag::CreateBond, Outcome::Success);
                }
            }
        }
    }

    fn owns(&self, handle: ConnectionHandle, what: &str) -> bool {
        if self.handle == Some(handle) {
            return true;
        }
        self.log
            .warn(format!("Ignoring {} from stale connection {}", what, handle));
        false
    }

    fn on_connection_state_change(
        &mut self,
        handle: ConnectionHandle,
        status: GattStatus,
        state: ConnectionState,
    ) {
        if self.handle != Some(handle) {
            self.log.error(format!(
                "Incorrect connection {}! status: {} newState: {}",
                handle, status, state
            ));
            self.queue.clear();
            self.transport.close(handle);
            return;
        }

        self.log.info(format!(
            "onConnectionStateChange status: {} newState: {}",
            status, state
        ));

        match state {
            ConnectionState::Connected => {
                self.state = ConnectionState::Connected;
                self.transport
                    .request_connection_priority(handle, ConnectionPriority::High);
                self.log.debug("Connected to GATT server!");
                self.complete_if(ActionTag::Connect, Outcome::Success);
                if let Some(address) = self.device {
                    self.events.push(SessionEvent::Connected(address));
                }
            }
            ConnectionState::Disconnected => {
                self.log.debug(format!(
                    "Disconnected from GATT server status = [{}]",
                    status
                ));
                self.refresh_device_cache(handle);
                self.transport.close(handle);
                self.handle = None;
                self.state = ConnectionState::Disconnected;
                self.queue.clear();
                if let Some(address) = self.device.take() {
                    self.events
                        .push(SessionEvent::Disconnected { address, status });
                }
            }
            other => {
                self.log
                    .error(format!("Unknown state: {} status: {}", other, status));
            }
        }
    }
}
