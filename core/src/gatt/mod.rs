//! GATT client core: data model, action queue and session manager

pub mod action;
pub mod manager;
pub mod types;

pub use action::{Action, ActionId, ActionKind, ActionQueue, ActionTag, Outcome};
pub use manager::{GattSessionManager, SessionEvent};
pub use types::{
    AddressError, BondState, CharacteristicInfo, CharacteristicProperties, CharacteristicRef,
    ConnectionHandle, ConnectionPriority, ConnectionState, DescriptorRef, DeviceAddress,
    GattStatus, ServiceInfo, CCCD_UUID,
};
