//! Transport abstraction layer for GattLink
//!
//! The radio stack is an asynchronous, callback-driven collaborator. Requests
//! go out through [`GattTransport`] and [`BluetoothAdapter`] and return
//! immediately; completions come back later as [`TransportEvent`] and
//! [`AdapterEvent`] values delivered to the session's inbox.

use crate::gatt::types::{
    BondState, CharacteristicRef, ConnectionHandle, ConnectionPriority, ConnectionState,
    DescriptorRef, DeviceAddress, GattStatus, ServiceInfo,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by transport primitives that can fail synchronously
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Operation not supported: {0}")]
    Unsupported(String),
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceAddress),
    #[error("Platform error: {0}")]
    Platform(String),
}

// ============================================================================
// SCAN TYPES
// ============================================================================

/// Scan mode requested from the LE scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    LowPower,
    Balanced,
    #[default]
    LowLatency,
}

/// Criteria for an LE scan; a result passes when any filter matches it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanFilter {
    pub service_uuid: Option<Uuid>,
    pub address: Option<DeviceAddress>,
    pub name: Option<String>,
}

impl ScanFilter {
    pub fn service(uuid: Uuid) -> Self {
        Self {
            service_uuid: Some(uuid),
            ..Default::default()
        }
    }

    pub fn address(address: DeviceAddress) -> Self {
        Self {
            address: Some(address),
            ..Default::default()
        }
    }

    /// Whether a result satisfies every criterion set on this filter
    pub fn matches(&self, result: &ScanResult) -> bool {
        self.service_uuid
            .map_or(true, |uuid| result.service_uuids.contains(&uuid))
            && self.address.map_or(true, |address| result.address == address)
            && self
                .name
                .as_ref()
                .map_or(true, |name| result.name.as_deref() == Some(name.as_str()))
    }

    /// OR semantics over a filter list; an empty list accepts everything
    pub fn any_matches(filters: &[ScanFilter], result: &ScanResult) -> bool {
        filters.is_empty() || filters.iter().any(|f| f.matches(result))
    }
}

/// An advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub address: DeviceAddress,
    pub name: Option<String>,
    /// RSSI (Received Signal Strength Indicator) in dBm
    pub rssi: i16,
    pub service_uuids: Vec<Uuid>,
    /// Milliseconds since the Unix epoch when the result was received
    pub timestamp_ms: u64,
}

impl ScanResult {
    pub fn new(
        address: DeviceAddress,
        name: Option<String>,
        rssi: i16,
        service_uuids: Vec<Uuid>,
    ) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        Self {
            address,
            name,
            rssi,
            service_uuids,
            timestamp_ms: now.as_millis() as u64,
        }
    }
}

/// Reason an LE scan could not be started or continued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanFailure {
    AlreadyStarted,
    ApplicationRegistrationFailed,
    InternalError,
    FeatureUnsupported,
    OutOfHardwareResources,
    Other(i32),
}

impl ScanFailure {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ScanFailure::AlreadyStarted,
            2 => ScanFailure::ApplicationRegistrationFailed,
            3 => ScanFailure::InternalError,
            4 => ScanFailure::FeatureUnsupported,
            5 => ScanFailure::OutOfHardwareResources,
            other => ScanFailure::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ScanFailure::AlreadyStarted => 1,
            ScanFailure::ApplicationRegistrationFailed => 2,
            ScanFailure::InternalError => 3,
            ScanFailure::FeatureUnsupported => 4,
            ScanFailure::OutOfHardwareResources => 5,
            ScanFailure::Other(code) => *code,
        }
    }
}

impl fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanFailure::AlreadyStarted => write!(f, "SCAN_FAILED_ALREADY_STARTED"),
            ScanFailure::ApplicationRegistrationFailed => {
                write!(f, "SCAN_FAILED_APPLICATION_REGISTRATION_FAILED")
            }
            ScanFailure::InternalError => write!(f, "SCAN_FAILED_INTERNAL_ERROR"),
            ScanFailure::FeatureUnsupported => write!(f, "SCAN_FAILED_FEATURE_UNSUPPORTED"),
            ScanFailure::OutOfHardwareResources => {
                write!(f, "SCAN_FAILED_OUT_OF_HARDWARE_RESOURCES")
            }
            ScanFailure::Other(code) => write!(f, "{}", code),
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Completions and notifications reported by the GATT transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionStateChanged {
        handle: ConnectionHandle,
        status: GattStatus,
        state: ConnectionState,
    },
    ServicesDiscovered {
        handle: ConnectionHandle,
        status: GattStatus,
        services: Vec<ServiceInfo>,
    },
    CharacteristicRead {
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
        value: Vec<u8>,
        status: GattStatus,
    },
    CharacteristicWrite {
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
        status: GattStatus,
    },
    /// Unsolicited notification/indication from the peripheral
    CharacteristicChanged {
        handle: ConnectionHandle,
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
    DescriptorWrite {
        handle: ConnectionHandle,
        descriptor: DescriptorRef,
        status: GattStatus,
    },
    MtuChanged {
        handle: ConnectionHandle,
        mtu: u16,
        status: GattStatus,
    },
    RemoteRssiRead {
        handle: ConnectionHandle,
        rssi: i16,
        status: GattStatus,
    },
    /// Adapter-wide bond broadcast
    BondStateChanged {
        address: DeviceAddress,
        state: BondState,
    },
}

/// Discovery results reported by the adapter's LE scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    ScanResult(ScanResult),
    BatchScanResults(Vec<ScanResult>),
    ScanFailed(i32),
}

// ============================================================================
// PLATFORM TRAITS
// ============================================================================

/// Per-peripheral GATT client primitives of the radio stack
///
/// Every `bool` return only reports whether the request was accepted for
/// execution. The actual result arrives later as a [`TransportEvent`].
pub trait GattTransport: Send + Sync {
    /// Start connecting; completion arrives as `ConnectionStateChanged`
    fn connect(&self, address: &DeviceAddress) -> Option<ConnectionHandle>;

    /// Request a disconnect; completion arrives as `ConnectionStateChanged`
    fn disconnect(&self, handle: ConnectionHandle);

    /// Release the handle; no further events are reported for it
    fn close(&self, handle: ConnectionHandle);

    fn discover_services(&self, handle: ConnectionHandle) -> bool;

    fn request_mtu(&self, handle: ConnectionHandle, mtu: u16) -> bool;

    fn read_characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: &CharacteristicRef,
    ) -> bool;

    fn write_characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> bool;

    /// Enable or disable local routing of notifications for a characteristic
    fn set_characteristic_notification(
        &self,
        handle: ConnectionHandle,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> bool;

    fn write_descriptor(
        &self,
        handle: ConnectionHandle,
        descriptor: &DescriptorRef,
        value: &[u8],
    ) -> bool;

    fn read_remote_rssi(&self, handle: ConnectionHandle) -> bool;

    fn request_connection_priority(
        &self,
        handle: ConnectionHandle,
        priority: ConnectionPriority,
    ) -> bool;

    /// Best-effort invalidation of the stack's attribute cache
    fn refresh_cache(&self, handle: ConnectionHandle) -> Result<bool, TransportError>;

    /// Start pairing; progress arrives as `BondStateChanged` broadcasts
    fn create_bond(&self, address: &DeviceAddress) -> bool;

    fn bond_state(&self, address: &DeviceAddress) -> BondState;
}

/// Adapter-level discovery and bond enumeration
#[cfg_attr(test, mockall::automock)]
pub trait BluetoothAdapter: Send + Sync {
    /// Classic inquiry; results are not routed through the session
    fn start_discovery(&self) -> bool;

    fn cancel_discovery(&self) -> bool;

    /// Whether an LE scanner is currently available
    fn has_le_scanner(&self) -> bool;

    fn start_le_scan(&self, filters: &[ScanFilter], mode: ScanMode) -> bool;

    fn stop_le_scan(&self);

    fn bonded_devices(&self) -> Vec<DeviceAddress>;

    fn remove_bond(&self, address: &DeviceAddress) -> Result<(), TransportError>;
}
