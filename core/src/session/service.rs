//! BLE session facade
//!
//! [`BleSession`] is a cheap, cloneable handle to a session task. The task
//! owns the GATT session manager, the listener set and the scan session and
//! drains a single inbox that carries caller requests, transport events and
//! adapter events. Everything that touches session state happens on that
//! task, one message at a time.

use super::listener::{ListenerSet, ScanListener, SessionListener};
use super::scanner::ScanSession;
use crate::gatt::manager::GattSessionManager;
use crate::gatt::types::{
    AddressError, BondState, CharacteristicRef, ConnectionState, DeviceAddress,
};
use crate::logging::{LogSink, Logger};
use crate::settings::{SessionSettings, SettingsError};
use crate::transport::{
    AdapterEvent, BluetoothAdapter, GattTransport, ScanFilter, TransportEvent,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Log tag for facade lines
pub const TAG: &str = "BleSession";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session task is not running")]
    SessionClosed,
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddressError),
    #[error("No tokio runtime available to run the session")]
    NoRuntime,
    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),
}

/// A peripheral as seen by the local adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDevice {
    pub address: DeviceAddress,
    pub bond_state: BondState,
}

/// Point-in-time view of the session for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub peer: Option<DeviceAddress>,
    /// Pending action names, in-flight action first
    pub queued_actions: Vec<String>,
    pub scanning: bool,
    pub listener_count: usize,
}

/// Caller requests marshalled onto the session task
#[derive(Debug, Clone)]
pub enum Request {
    Connect(DeviceAddress),
    Disconnect,
    DiscoverServices,
    CreateBond(DeviceAddress),
    RemoveBond(String),
    ChangeMtu(u16),
    ReadCharacteristic(CharacteristicRef),
    WriteCharacteristic {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
    SetNotification {
        characteristic: CharacteristicRef,
        enabled: bool,
    },
    ReadRemoteRssi,
    StartScan(Vec<ScanFilter>),
    StopScan,
}

/// Everything the session task consumes
pub enum SessionMessage {
    Request(Request),
    /// Connect after the configured delay has elapsed
    DelayedConnect(DeviceAddress),
    Transport(TransportEvent),
    Adapter(AdapterEvent),
    AddListener(Arc<dyn SessionListener>),
    RemoveListener(Arc<dyn SessionListener>),
    SetScanListener(Option<Arc<dyn ScanListener>>),
    RefreshCache(oneshot::Sender<bool>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

impl fmt::Debug for SessionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMessage::Request(request) => write!(f, "Request({:?})", request),
            SessionMessage::DelayedConnect(address) => write!(f, "DelayedConnect({})", address),
            SessionMessage::Transport(event) => write!(f, "Transport({:?})", event),
            SessionMessage::Adapter(event) => write!(f, "Adapter({:?})", event),
            SessionMessage::AddListener(_) => write!(f, "AddListener"),
            SessionMessage::RemoveListener(_) => write!(f, "RemoveListener"),
            SessionMessage::SetScanListener(l) => write!(f, "SetScanListener({})", l.is_some()),
            SessionMessage::RefreshCache(_) => write!(f, "RefreshCache"),
            SessionMessage::Snapshot(_) => write!(f, "Snapshot"),
            SessionMessage::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Entry point for radio drivers to report completions to a session
///
/// Holds only a weak reference to the inbox, so a driver keeping this
/// around does not keep the session alive.
#[derive(Clone)]
pub struct TransportEvents {
    inbox: mpsc::WeakUnboundedSender<SessionMessage>,
}

impl TransportEvents {
    pub(crate) fn new(inbox: &mpsc::UnboundedSender<SessionMessage>) -> Self {
        Self {
            inbox: inbox.downgrade(),
        }
    }

    /// Report a GATT completion; false once the session is gone
    pub fn gatt(&self, event: TransportEvent) -> bool {
        self.send(SessionMessage::Transport(event))
    }

    /// Report a scan event; false once the session is gone
    pub fn adapter(&self, event: AdapterEvent) -> bool {
        self.send(SessionMessage::Adapter(event))
    }

    fn send(&self, message: SessionMessage) -> bool {
        match self.inbox.upgrade() {
            Some(inbox) => inbox.send(message).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents").finish_non_exhaustive()
    }
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct SessionBuilder {
    transport: Arc<dyn GattTransport>,
    adapter: Option<Arc<dyn BluetoothAdapter>>,
    settings: SessionSettings,
    logger: Option<Arc<dyn Logger>>,
    listener: Option<Arc<dyn SessionListener>>,
}

impl SessionBuilder {
    /// Adapter used for scanning and bond management
    pub fn adapter(mut self, adapter: Arc<dyn BluetoothAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Host log sink receiving every session log line
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Listener registered before any event is dispatched
    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Start the session task on the current tokio runtime
    pub fn spawn(self) -> Result<BleSession, SessionError> {
        self.settings.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        let log = LogSink::new(TAG, self.logger);
        let (inbox, rx) = mpsc::unbounded_channel();

        let mut listeners = ListenerSet::new();
        if let Some(listener) = self.listener {
            listeners.add(listener);
        }

        let actor = SessionActor {
            manager: GattSessionManager::new(self.transport.clone(), &self.settings, log.clone()),
            listeners,
            scanner: ScanSession::new(
                self.adapter.clone(),
                self.settings.scan.clone(),
                log.clone(),
            ),
            adapter: self.adapter.clone(),
            connect_delay: self.settings.connect_delay(),
            inbox: inbox.downgrade(),
            log: log.clone(),
        };
        runtime.spawn(actor.run(rx));
        log.debug("Session started");

        Ok(BleSession {
            inbox,
            transport: self.transport,
            adapter: self.adapter,
            log,
        })
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Handle to a running BLE session
///
/// Request methods never block and never report radio outcomes; results
/// arrive through the registered listeners. They fail only with
/// [`SessionError::SessionClosed`] once the session task has stopped.
#[derive(Clone)]
pub struct BleSession {
    inbox: mpsc::UnboundedSender<SessionMessage>,
    transport: Arc<dyn GattTransport>,
    adapter: Option<Arc<dyn BluetoothAdapter>>,
    log: LogSink,
}

impl BleSession {
    pub fn builder(transport: Arc<dyn GattTransport>) -> SessionBuilder {
        SessionBuilder {
            transport,
            adapter: None,
            settings: SessionSettings::default(),
            logger: None,
            listener: None,
        }
    }

    /// Sink a radio driver uses to report completions to this session
    pub fn transport_events(&self) -> TransportEvents {
        TransportEvents::new(&self.inbox)
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    fn send(&self, message: SessionMessage) -> Result<(), SessionError> {
        self.inbox
            .send(message)
            .map_err(|_| SessionError::SessionClosed)
    }

    fn request(&self, request: Request) -> Result<(), SessionError> {
        self.send(SessionMessage::Request(request))
    }

    // ------------------------------------------------------------------------
    // Subscription
    // ------------------------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) -> Result<(), SessionError> {
        self.log.debug("Added listener");
        self.send(SessionMessage::AddListener(listener))
    }

    pub fn remove_listener(&self, listener: Arc<dyn SessionListener>) -> Result<(), SessionError> {
        self.log.debug("Removed listener");
        self.send(SessionMessage::RemoveListener(listener))
    }

    /// Replace the single scan listener slot
    pub fn set_scan_listener(
        &self,
        listener: Option<Arc<dyn ScanListener>>) -> Result<(), SessionError> {
        self.send(SessionMessage::SetScanListener(listener))
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    pub fn connect(&self, address: DeviceAddress) -> Result<(), SessionError> {
        self.log
            .debug(format!("connect() called with: device = [{}]", address));
        self.request(Request::Connect(address))
    }

    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.request(Request::Disconnect)
    }

    pub fn discover_services(&self) -> Result<(), SessionError> {
        self.log.debug("discoverServices() called");
        self.request(Request::DiscoverServices)
    }

    pub fn create_bond(&self, address: DeviceAddress) -> Result<(), SessionError> {
        self.log
            .debug(format!("createBond() called with: device = [{}]", address));
        self.request(Request::CreateBond(address))
    }

    /// Remove every bonded device whose address contains `address`
    pub fn remove_bond(&self, address: &str) -> Result<(), SessionError> {
        self.log
            .debug(format!("removeBond() called with: device = [{}]", address));
        self.request(Request::RemoveBond(address.trim().to_ascii_uppercase()))
    }

    pub fn change_mtu(&self, mtu: u16) -> Result<(), SessionError> {
        self.request(Request::ChangeMtu(mtu))
    }

    pub fn read_characteristic(
        &self,
        characteristic: CharacteristicRef) -> Result<(), SessionError> {
        self.log.debug(format!(
            "readCharacteristic() called with: characteristic = [{}]",
            characteristic.characteristic
        ));
        self.request(Request::ReadCharacteristic(characteristic))
    }

    /// Queue a write of a private copy of `value`
    pub fn write_characteristic(
        &self,
        characteristic: CharacteristicRef,
        value: &[u8]) -> Result<(), SessionError> {
        self.log.debug(format!(
            "writeCharacteristic() called with: characteristic = [{}], data = {:02X?}",
            characteristic.characteristic, value
        ));
        self.request(Request::WriteCharacteristic {
            characteristic,
            value: value.to_vec(),
        })
    }

    pub fn set_characteristic_notification(
        &self,
        characteristic: CharacteristicRef,
        enabled: bool,
    ) -> Result<(), SessionError> {
        self.request(Request::SetNotification {
            characteristic,
            enabled,
        })
    }

    pub fn read_remote_rssi(&self) -> Result<(), SessionError> {
        self.log.debug("readRemoteRssi()");
        self.request(Request::ReadRemoteRssi)
    }

    /// Best-effort attribute cache refresh of the current connection
    pub async fn refresh_cache(&self) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionMessage::RefreshCache(reply))?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    pub fn start_scan(&self, filters: Vec<ScanFilter>) -> Result<(), SessionError> {
        self.request(Request::StartScan(filters))
    }

    /// Scan for peripherals advertising `service`, or matching `address`
    pub fn start_scan_for_service(
        &self,
        service: Uuid,
        address: Option<DeviceAddress>) -> Result<(), SessionError> {
        let mut filters = vec![ScanFilter::service(service)];
        if let Some(address) = address {
            filters.push(ScanFilter::address(address));
        }
        self.start_scan(filters)
    }

    pub fn stop_scan(&self) -> Result<(), SessionError> {
        self.request(Request::StopScan)
    }

    // ------------------------------------------------------------------------
    // Adapter queries
    // ------------------------------------------------------------------------

    /// Look up a device among the adapter's bonded devices
    pub fn get_bonded_device(&self, address: DeviceAddress) -> Option<RemoteDevice> {
        self.log
            .debug(format!("getBondedDevice() called with: address = [{}]", address));
        let Some(adapter) = self.adapter.as_ref() else {
            self.log.warn("getBondedDevice: no bluetooth adapter");
            return None;
        };
        adapter
            .bonded_devices()
            .into_iter()
            .find(|bonded| *bonded == address)
            .map(|address| RemoteDevice {
                address,
                bond_state: BondState::Bonded,
            })
    }

    /// Resolve a textual address to a device and its current bond state
    pub fn get_remote_device(&self, address: &str) -> Result<RemoteDevice, SessionError> {
        let address: DeviceAddress = address.parse()?;
        Ok(RemoteDevice {
            address,
            bond_state: self.transport.bond_state(&address),
        })
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionMessage::Snapshot(reply))?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    /// Stop the session task; pending requests ahead of this are still served
    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.send(SessionMessage::Shutdown)
    }
}

impl fmt::Debug for BleSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleSession")
            .field("closed", &self.is_closed())
            .field("has_adapter", &self.adapter.is_some())
            .finish()
    }
}

// ============================================================================
// SESSION TASK
// ============================================================================

struct SessionActor {
    manager: GattSessionManager,
    listeners: ListenerSet,
    scanner: ScanSession,
    adapter: Option<Arc<dyn BluetoothAdapter>>,
    connect_delay: Duration,
    inbox: mpsc::WeakUnboundedSender<SessionMessage>,
    log: LogSink,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMessage>) {
        while let Some(message) = rx.recv().await {
            if !self.handle(message) {
                break;
            }
            self.fan_out();
        }

        if self.scanner.is_scanning() {
            self.scanner.stop();
        }
        self.manager.release();
        self.log.debug("Session stopped");
    }

    /// Process one message; false stops the task
    fn handle(&mut self, message: SessionMessage) -> bool {
        match message {
            SessionMessage::Request(request) => self.handle_request(request),
            SessionMessage::DelayedConnect(address) => self.manager.connect(address),
            SessionMessage::Transport(event) => self.manager.handle_event(event),
            SessionMessage::Adapter(event) => self.scanner.handle_event(event),
            SessionMessage::AddListener(listener) => {
                if !self.listeners.add(listener) {
                    self.log.debug("Listener already registered");
                }
            }
            SessionMessage::RemoveListener(listener) => {
                if !self.listeners.remove(&listener) {
                    self.log.debug("Listener was not registered");
                }
            }
            SessionMessage::SetScanListener(listener) => self.scanner.set_listener(listener),
            SessionMessage::RefreshCache(reply) => {
                let _ = reply.send(self.manager.refresh_cache());
            }
            SessionMessage::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionMessage::Shutdown => return false,
        }
        true
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect(address) => self.connect(address),
            Request::Disconnect => self.manager.disconnect(),
            Request::DiscoverServices => self.manager.discover_services(),
            Request::CreateBond(address) => self.manager.create_bond(address),
            Request::RemoveBond(pattern) => self.remove_bond(&pattern),
            Request::ChangeMtu(mtu) => self.manager.change_mtu(mtu),
            Request::ReadCharacteristic(characteristic) => {
                self.manager.read_characteristic(characteristic)
            }
            Request::WriteCharacteristic {
                characteristic,
                value,
            } => self.manager.write_characteristic(characteristic, value),
            Request::SetNotification {
                characteristic,
                enabled,
            } => self
                .manager
                .set_characteristic_notification(characteristic, enabled),
            Request::ReadRemoteRssi => self.manager.read_remote_rssi(),
            Request::StartScan(filters) => self.scanner.start(&filters),
            Request::StopScan => self.scanner.stop(),
        }
    }

    /// Cancel adapter discovery, then connect after the configured delay
    fn connect(&mut self, address: DeviceAddress) {
        if let Some(adapter) = &self.adapter {
            adapter.cancel_discovery();
        }
        if self.connect_delay.is_zero() {
            self.manager.connect(address);
            return;
        }

        let inbox = self.inbox.clone();
        let delay = self.connect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(SessionMessage::DelayedConnect(address));
            }
        });
    }

    fn remove_bond(&mut self, pattern: &str) {
        let Some(adapter) = &self.adapter else {
            self.log.warn("removeBond: no bluetooth adapter");
            return;
        };
        for bonded in adapter.bonded_devices() {
            if !bonded.to_string().contains(pattern) {
                continue;
            }
            match adapter.remove_bond(&bonded) {
                Ok(()) => self.log.debug(format!("Removed bond with {}", bonded)),
                Err(e) => self.log.error(e.to_string()),
            }
        }
    }

    fn fan_out(&mut self) {
        for event in self.manager.drain_events() {
            self.log.debug(format!("Dispatching {:?}", event));
            self.listeners.dispatch(&event);
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_state: self.manager.connection_state(),
            peer: self.manager.device(),
            queued_actions: self.manager.queue().names(),
            scanning: self.scanner.is_scanning(),
            listener_count: self.listeners.len(),
        }
    }
}
