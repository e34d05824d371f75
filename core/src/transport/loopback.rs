//! In-process loopback radio
//!
//! Simulates an adapter plus any number of peripherals. Every request is
//! answered asynchronously through the attached [`TransportEvents`] sink, the
//! same path a real radio driver uses, so the session cannot tell the
//! difference. Failures, refusals and delayed responses can be scripted per
//! operation for tests and demos.

use super::abstraction::{
    AdapterEvent, BluetoothAdapter, GattTransport, ScanFilter, ScanMode, ScanResult,
    TransportError, TransportEvent,
};
use crate::gatt::action::ActionTag;
use crate::gatt::types::{
    BondState, CharacteristicRef, ConnectionHandle, ConnectionPriority, ConnectionState,
    DescriptorRef, DeviceAddress, GattStatus, ServiceInfo, CCCD_UUID, ENABLE_NOTIFICATION_VALUE,
};
use crate::session::TransportEvents;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};

/// Largest MTU a simulated peripheral accepts unless configured otherwise
pub const DEFAULT_PERIPHERAL_MTU: u16 = 517;

/// Status reported when the link is lost (connection timeout)
pub const LINK_LOSS_STATUS: GattStatus = GattStatus(0x08);

/// A simulated remote peripheral
#[derive(Debug, Clone)]
pub struct Peripheral {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: i16,
    pub services: Vec<ServiceInfo>,
    pub bond: BondState,
    pub max_mtu: u16,
    values: HashMap<CharacteristicRef, Vec<u8>>,
}

impl Peripheral {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            name: None,
            rssi: -60,
            services: Vec::new(),
            bond: BondState::None,
            max_mtu: DEFAULT_PERIPHERAL_MTU,
            values: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_service(mut self, service: ServiceInfo) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_value(
        mut self,
        characteristic: CharacteristicRef,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        self.values.insert(characteristic, value.into());
        self
    }

    pub fn with_bond(mut self, bond: BondState) -> Self {
        self.bond = bond;
        self
    }

    pub fn with_max_mtu(mut self, mtu: u16) -> Self {
        self.max_mtu = mtu;
        self
    }

    /// Current value of a characteristic
    pub fn value(&self, characteristic: &CharacteristicRef) -> Option<&[u8]> {
        self.values.get(characteristic).map(Vec::as_slice)
    }

    fn advertised_services(&self) -> Vec<uuid::Uuid> {
        self.services.iter().map(|s| s.uuid).collect()
    }

    fn scan_result(&self) -> ScanResult {
        ScanResult::new(
            self.address,
            self.name.clone(),
            self.rssi,
            self.advertised_services(),
        )
    }
}

/// Scripted behaviour for one operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    /// Answer with this status
    Fail(GattStatus),
    /// Refuse to start the request
    Refuse,
}

#[derive(Debug, Default)]
struct LoopbackState {
    peripherals: HashMap<DeviceAddress, Peripheral>,
    /// Live connection handles and the peripheral each one talks to
    links: HashMap<ConnectionHandle, DeviceAddress>,
    subscriptions: HashSet<(ConnectionHandle, CharacteristicRef)>,
    next_handle: u64,
    scripts: HashMap<ActionTag, VecDeque<Script>>,
    calls: Vec<String>,
    hold: bool,
    held: Vec<TransportEvent>,
    scanning: Option<Vec<ScanFilter>>,
    discovering: bool,
    no_le_scanner: bool,
    scan_failure: Option<i32>,
    rssi_jitter: i16,
}

impl LoopbackState {
    fn script(&mut self, tag: ActionTag) -> Option<Script> {
        self.scripts.get_mut(&tag).and_then(VecDeque::pop_front)
    }

    fn peer(&self, handle: ConnectionHandle) -> Option<&Peripheral> {
        self.links
            .get(&handle)
            .and_then(|address| self.peripherals.get(address))
    }

    fn peer_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Peripheral> {
        let address = *self.links.get(&handle)?;
        self.peripherals.get_mut(&address)
    }
}

/// Loopback radio implementing both transport capabilities
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    sink: Mutex<Option<TransportEvents>>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState {
                next_handle: 1,
                ..Default::default()
            }),
            sink: Mutex::new(None),
        }
    }

    /// Route completions into a session
    pub fn attach(&self, events: TransportEvents) {
        *self.sink.lock() = Some(events);
    }

    /// Make a peripheral known to the radio and report it to an active scan
    pub fn advertise(&self, peripheral: Peripheral) {
        let result = peripheral.scan_result();
        let report = {
            let mut state = self.state.lock();
            state.peripherals.insert(peripheral.address, peripheral);
            state
                .scanning
                .as_ref()
                .is_some_and(|filters| ScanFilter::any_matches(filters, &result))
        };
        if report {
            self.emit_adapter(AdapterEvent::ScanResult(result));
        }
    }

    /// Report every matching peripheral as a single batch
    pub fn report_batch(&self) {
        let batch: Vec<ScanResult> = {
            let state = self.state.lock();
            let Some(filters) = state.scanning.as_ref() else {
                return;
            };
            let mut results: Vec<ScanResult> = state
                .peripherals
                .values()
                .map(Peripheral::scan_result)
                .filter(|r| ScanFilter::any_matches(filters, r))
                .collect();
            results.sort_by_key(|r| r.address);
            results
        };
        self.emit_adapter(AdapterEvent::BatchScanResults(batch));
    }

    /// Answer the next `times` requests of this kind with `status`
    pub fn fail_next(&self, tag: ActionTag, status: GattStatus, times: usize) {
        self.push_script(tag, Script::Fail(status), times);
    }

    /// Refuse to start the next `times` requests of this kind
    pub fn refuse_next(&self, tag: ActionTag, times: usize) {
        self.push_script(tag, Script::Refuse, times);
    }

    fn push_script(&self, tag: ActionTag, script: Script, times: usize) {
        let mut state = self.state.lock();
        let entry = state.scripts.entry(tag).or_default();
        entry.extend(std::iter::repeat(script).take(times));
    }

    /// Make the next LE scan start fail with this code
    pub fn fail_scan(&self, code: i32) {
        self.state.lock().scan_failure = Some(code);
    }

    pub fn set_le_scanner_available(&self, available: bool) {
        self.state.lock().no_le_scanner = !available;
    }

    /// Randomize RSSI readings by up to this many dBm either way
    pub fn set_rssi_jitter(&self, amplitude: i16) {
        self.state.lock().rssi_jitter = amplitude.saturating_abs();
    }

    /// Buffer GATT completions until [`release`](Self::release) is called
    pub fn hold(&self) {
        self.state.lock().hold = true;
    }

    /// Deliver buffered completions and stop buffering
    pub fn release(&self) -> usize {
        let held = {
            let mut state = self.state.lock();
            state.hold = false;
            std::mem::take(&mut state.held)
        };
        let count = held.len();
        for event in held {
            self.deliver(event);
        }
        count
    }

    /// Push a raw event to the session, bypassing the simulation
    pub fn inject(&self, event: TransportEvent) {
        self.send(event);
    }

    /// Peripheral-initiated notification; delivered only when subscribed
    pub fn notify(
        &self,
        address: &DeviceAddress,
        characteristic: CharacteristicRef,
        value: &[u8],
    ) -> bool {
        let handle = {
            let mut state = self.state.lock();
            let handle = state
                .links
                .iter()
                .find(|(_, a)| *a == address)
                .map(|(h, _)| *h);
            let Some(handle) = handle else {
                return false;
            };
            if !state.subscriptions.contains(&(handle, characteristic)) {
                return false;
            }
            if let Some(peer) = state.peer_mut(handle) {
                peer.values.insert(characteristic, value.to_vec());
            }
            handle
        };
        self.emit(TransportEvent::CharacteristicChanged {
            handle,
            characteristic,
            value: value.to_vec(),
        });
        true
    }

    /// Drop the link from the peripheral side
    pub fn drop_link(&self, address: &DeviceAddress) -> bool {
        let handle = {
            let state = self.state.lock();
            state
                .links
                .iter()
                .find(|(_, a)| *a == address)
                .map(|(h, _)| *h)
        };
        match handle {
            Some(handle) => {
                self.emit(TransportEvent::ConnectionStateChanged {
                    handle,
                    status: LINK_LOSS_STATUS,
                    state: ConnectionState::Disconnected,
                });
                true
            }
            None => false,
        }
    }

    /// Snapshot of a known peripheral
    pub fn peripheral(&self, address: &DeviceAddress) -> Option<Peripheral> {
        self.state.lock().peripherals.get(address).cloned()
    }

    /// Every primitive invoked so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Number of handles that have not been closed
    pub fn open_handles(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning.is_some()
    }

    fn record(&self, state: &mut LoopbackState, call: String) {
        tracing::trace!(target: "gattlink::loopback", "{}", call);
        state.calls.push(call);
    }

    /// Queue or deliver a GATT completion
    fn emit(&self, event: TransportEvent) {
        {
            let mut state = self.state.lock();
            if state.hold {
                state.held.push(event);
                return;
            }
        }
        self.deliver(event);
    }

    fn deliver(&self, event: TransportEvent) {
        if let Some(handle) = event_handle(&event) {
            if !self.state.lock().links.contains_key(&handle) {
                tracing::trace!(
                    target: "gattlink::loopback",
                    "Dropping event for closed {}",
                    handle
                );
                return;
            }
        }
        self.send(event);
    }

    fn send(&self, event: TransportEvent) {
        match self.sink.lock().as_ref() {
            Some(sink) => {
                if !sink.gatt(event) {
                    tracing::debug!(target: "gattlink::loopback", "Session gone, event dropped");
                }
            }
            None => {
                tracing::debug!(target: "gattlink::loopback", "No session attached, event dropped")
            }
        }
    }

    fn emit_adapter(&self, event: AdapterEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.adapter(event);
        }
    }

    /// Resolve the scripted behaviour of a request: `None` when refused
    fn begin(&self, state: &mut LoopbackState, tag: ActionTag) -> Option<GattStatus> {
        match state.script(tag) {
            Some(Script::Refuse) => None,
            Some(Script::Fail(status)) => Some(status),
            None => Some(GattStatus::SUCCESS),
        }
    }
}

fn event_handle(event: &TransportEvent) -> Option<ConnectionHandle> {
    match event {
        TransportEvent::ConnectionStateChanged { handle, .. }
        | TransportEvent::ServicesDiscovered { handle, .. }
        | TransportEvent::CharacteristicRead { handle, .. }
        | TransportEvent::CharacteristicWrite { handle, .. }
        | TransportEvent::CharacteristicChanged { handle, .. }
        | TransportEvent::DescriptorWrite { handle, .. }
        | TransportEvent::MtuChanged { handle, .. }
        | TransportEvent::RemoteRssiRead { handle, .. } => Some(*handle),
        TransportEvent::BondStateChanged { .. } => None,
    }
}

impl GattTransport for LoopbackTransport {
    fn connect(&self, address: &DeviceAddress) -> Option<ConnectionHandle> {
        let (handle, status) = {
            let mut state = self.state.lock();
            self.record(&mut state, format!("connect {}", address));
            if !state.peripherals.contains_key(address) {
                return None;
            }
            let status = self.begin(&mut state, ActionTag::Connect)?;
            let handle = ConnectionHandle(state.next_handle);
            state.next_handle += 1;
            state.links.insert(handle, *address);
            (handle, status)
        };

        let connection = if status.is_success() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        self.emit(TransportEvent::ConnectionStateChanged {
            handle,
            status,
            state: connection,
        });
        Some(handle)
    }

    fn disconnect(&self, handle: ConnectionHandle) {
        let live = {
            let mut state = self.state.lock();
            self.record(&mut state, format!("disconnect {}", handle.0));
            state.links.contains_key(&handle)
        };
        if live {
            self.emit(TransportEvent::ConnectionStateChanged {
                handle,
                status: GattStatus::SUCCESS,
                state: ConnectionState::Disconnected,
            });
        }
    }

    fn close(&self, handle: ConnectionHandle) {
        let mut state = self.state.lock();
        self.record(&mut state, format!("close {}", handle.0));
        state.links.remove(&handle);
        state.subscriptions.retain(|(h, _)| *h != handle);
    }

    fn discover_services(&self, handle: ConnectionHandle) -> bool {
        let event = {
            let mut state = self.state.lock();
            self.record(&mut state, "discover_services".to_string());
            let Some(services) = state.peer(handle).map(|p| p.services.clone()) else {
                return false;
            };
            let Some(status) = self.begin(&mut state, ActionTag::DiscoverServices) else {
                return false;
            };
            TransportEvent::ServicesDiscovered {
                handle,
                status,
                services: if status.is_success() { services } else { Vec::new() },
            }
        };
        self.emit(event);
        true
    }

    fn request_mtu(&self, handle: ConnectionHandle, mtu: u16) -> bool {
        let event = {
            let mut state = self.state.lock();
            self.record(&mut state, format!("request_mtu {}", mtu));
            let Some(max_mtu) = state.peer(handle).map(|p| p.max_mtu) else {
                return false;
            };
            let Some(status) = self.begin(&mut state, ActionTag::ChangeMtu) else {
                return false;
            };
            TransportEvent::MtuChanged {
                handle,
                mtu: mtu.min(max_mtu),
                status,
            }
        };
        self.emit(event);
        true
    }

    fn read_characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: &CharacteristicRef,
    ) -> bool {
        let event = {
            let mut state = self.state.lock();
            self.record(&mut state, format!("read {}", characteristic.characteristic));
            let Some(stored) = state
                .peer(handle)
                .map(|p| p.values.get(characteristic).cloned())
            else {
                return false;
            };
            let Some(mut status) = self.begin(&mut state, ActionTag::ReadCharacteristic) else {
                return false;
            };
            if stored.is_none() && status.is_success() {
                status = GattStatus::READ_NOT_PERMITTED;
            }
            TransportEvent::CharacteristicRead {
                handle,
                characteristic: *characteristic,
                value: stored.filter(|_| status.is_success()).unwrap_or_default(),
                status,
            }
        };
        self.emit(event);
        true
    }

    fn write_characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> bool {
        let event = {
            let mut state = self.state.lock();
            self.record(
                &mut state,
                format!("write {} {:02X?}", characteristic.characteristic, value),
            );
            if state.peer(handle).is_none() {
                return false;
            }
            let Some(status) = self.begin(&mut state, ActionTag::WriteCharacteristic) else {
                return false;
            };
            if status.is_success() {
                if let Some(peer) = state.peer_mut(handle) {
                    peer.values.insert(*characteristic, value.to_vec());
                }
            }
            TransportEvent::CharacteristicWrite {
                handle,
                characteristic: *characteristic,
                status,
            }
        };
        self.emit(event);
        true
    }

    fn set_characteristic_notification(
        &self,
        handle: ConnectionHandle,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> bool {
        let mut state = self.state.lock();
        self.record(
            &mut state,
            format!("set_notification {} {}", characteristic.characteristic, enabled),
        );
        state.links.contains_key(&handle)
    }

    fn write_descriptor(
        &self,
        handle: ConnectionHandle,
        descriptor: &DescriptorRef,
        value: &[u8],
    ) -> bool {
        let event = {
            let mut state = self.state.lock();
            self.record(
                &mut state,
                format!("write_descriptor {} {:02X?}", descriptor.descriptor, value),
            );
            if state.peer(handle).is_none() {
                return false;
            }
            let Some(status) = self.begin(&mut state, ActionTag::SetNotification) else {
                return false;
            };
            if status.is_success() && descriptor.descriptor == CCCD_UUID {
                let key = (handle, descriptor.characteristic);
                if value == ENABLE_NOTIFICATION_VALUE {
                    state.subscriptions.insert(key);
                } else {
                    state.subscriptions.remove(&key);
                }
            }
            TransportEvent::DescriptorWrite {
                handle,
                descriptor: *descriptor,
                status,
            }
        };
        self.emit(event);
        true
    }

    fn read_remote_rssi(&self, handle: ConnectionHandle) -> bool {
        let event = {
            let mut state = self.state.lock();
            self.record(&mut state, "read_remote_rssi".to_string());
            let Some(base) = state.peer(handle).map(|p| p.rssi) else {
                return false;
            };
            let Some(status) = self.begin(&mut state, ActionTag::ReadRemoteRssi) else {
                return false;
            };
            let jitter = state.rssi_jitter;
            let rssi = if jitter > 0 {
                base.saturating_add(rand::thread_rng().gen_range(-jitter..=jitter))
            } else {
                base
            };
            TransportEvent::RemoteRssiRead {
                handle,
                rssi,
                status,
            }
        };
        self.emit(event);
        true
    }

    fn request_connection_priority(
        &self,
        handle: ConnectionHandle,
        priority: ConnectionPriority,
    ) -> bool {
        let mut state = self.state.lock();
        self.record(&mut state, format!("connection_priority {:?}", priority));
        state.links.contains_key(&handle)
    }

    fn refresh_cache(&self, handle: ConnectionHandle) -> Result<bool, TransportError> {
        let mut state = self.state.lock();
        self.record(&mut state, "refresh_cache".to_string());
        if state.links.contains_key(&handle) {
            Ok(true)
        } else {
            Err(TransportError::Platform(format!("{} is closed", handle)))
        }
    }

    fn create_bond(&self, address: &DeviceAddress) -> bool {
        let outcome = {
            let mut state = self.state.lock();
            self.record(&mut state, format!("create_bond {}", address));
            if !state.peripherals.contains_key(address) {
                return false;
            }
            let Some(status) = self.begin(&mut state, ActionTag::CreateBond) else {
                return false;
            };
            let outcome = if status.is_success() {
                BondState::Bonded
            } else {
                BondState::None
            };
            if let Some(peer) = state.peripherals.get_mut(address) {
                peer.bond = outcome;
            }
            outcome
        };

        self.emit(TransportEvent::BondStateChanged {
            address: *address,
            state: BondState::Bonding,
        });
        self.emit(TransportEvent::BondStateChanged {
            address: *address,
            state: outcome,
        });
        true
    }

    fn bond_state(&self, address: &DeviceAddress) -> BondState {
        self.state
            .lock()
            .peripherals
            .get(address)
            .map(|p| p.bond)
            .unwrap_or(BondState::None)
    }
}

impl BluetoothAdapter for LoopbackTransport {
    fn start_discovery(&self) -> bool {
        let mut state = self.state.lock();
        self.record(&mut state, "start_discovery".to_string());
        state.discovering = true;
        true
    }

    fn cancel_discovery(&self) -> bool {
        let mut state = self.state.lock();
        self.record(&mut state, "cancel_discovery".to_string());
        std::mem::replace(&mut state.discovering, false)
    }

    fn has_le_scanner(&self) -> bool {
        !self.state.lock().no_le_scanner
    }

    fn start_le_scan(&self, filters: &[ScanFilter], mode: ScanMode) -> bool {
        let (results, failure) = {
            let mut state = self.state.lock();
            self.record(&mut state, format!("start_le_scan {:?}", mode));
            if state.no_le_scanner {
                return false;
            }
            if let Some(code) = state.scan_failure.take() {
                (Vec::new(), Some(code))
            } else {
                state.scanning = Some(filters.to_vec());
                let mut results: Vec<ScanResult> = state
                    .peripherals
                    .values()
                    .map(Peripheral::scan_result)
                    .filter(|r| ScanFilter::any_matches(filters, r))
                    .collect();
                results.sort_by_key(|r| r.address);
                (results, None)
            }
        };

        if let Some(code) = failure {
            self.emit_adapter(AdapterEvent::ScanFailed(code));
            return true;
        }
        for result in results {
            self.emit_adapter(AdapterEvent::ScanResult(result));
        }
        true
    }

    fn stop_le_scan(&self) {
        let mut state = self.state.lock();
        self.record(&mut state, "stop_le_scan".to_string());
        state.scanning = None;
    }

    fn bonded_devices(&self) -> Vec<DeviceAddress> {
        let mut bonded: Vec<DeviceAddress> = self
            .state
            .lock()
            .peripherals
            .values()
            .filter(|p| p.bond == BondState::Bonded)
            .map(|p| p.address)
            .collect();
        bonded.sort();
        bonded
    }

    fn remove_bond(&self, address: &DeviceAddress) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("remove_bond {}", address));
        match state.peripherals.get_mut(address) {
            Some(peer) => {
                peer.bond = BondState::None;
                Ok(())
            }
            None => Err(TransportError::UnknownDevice(*address)),
        }
    }
}
