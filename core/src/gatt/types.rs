//! GATT data model shared by the session manager, the facade and transports
//!
//! Peripheral identities, connection handles, status codes and the
//! service/characteristic topology reported after discovery.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Client Characteristic Configuration Descriptor (0x2902)
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5F9B_34FB);

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value disabling notifications
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Errors for peripheral address parsing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address length: {0}")]
    InvalidLength(usize),
    #[error("Invalid address octet: {0}")]
    InvalidOctet(String),
}

/// Bluetooth device address of a remote peripheral (`AA:BB:CC:DD:EE:FF`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Create an address from raw octets (most significant first)
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(AddressError::InvalidLength(parts.len()));
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(AddressError::InvalidOctet(part.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| AddressError::InvalidOctet(part.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.to_string()
    }
}

/// Opaque handle to one transport-level connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Status code carried by every transport completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    pub const READ_NOT_PERMITTED: GattStatus = GattStatus(0x02);
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(0x03);
    pub const INSUFFICIENT_AUTHENTICATION: GattStatus = GattStatus(0x05);
    pub const CONNECTION_CONGESTED: GattStatus = GattStatus(0x8F);
    pub const FAILURE: GattStatus = GattStatus(0x101);

    /// Whether the status reports success
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state of the single owned peripheral link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reported by some transports while tearing down; not a state we enter
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "STATE_DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "STATE_CONNECTING"),
            ConnectionState::Connected => write!(f, "STATE_CONNECTED"),
            ConnectionState::Disconnecting => write!(f, "STATE_DISCONNECTING"),
        }
    }
}

/// Adapter-global bonding state for a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

impl BondState {
    /// Whether this state ends a pairing attempt
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BondState::Bonding)
    }
}

/// Link priority requested from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPriority {
    Balanced,
    High,
    LowPower,
}

/// Address of a characteristic within the peripheral's topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicRef {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    /// Reference to a descriptor of this characteristic
    pub fn descriptor(&self, descriptor: Uuid) -> DescriptorRef {
        DescriptorRef {
            characteristic: *self,
            descriptor,
        }
    }
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Address of a descriptor within the peripheral's topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorRef {
    pub characteristic: CharacteristicRef,
    pub descriptor: Uuid,
}

/// Characteristic property flags as reported by discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// One characteristic in the discovered topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<Uuid>,
}

/// One primary service in the discovered topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    /// Look up a characteristic reference by UUID
    pub fn characteristic(&self, uuid: Uuid) -> Option<CharacteristicRef> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .map(|c| CharacteristicRef::new(self.uuid, c.uuid))
    }
}
