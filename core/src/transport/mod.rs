//! Radio transport boundary and the in-process loopback radio

pub mod abstraction;
pub mod loopback;

pub use abstraction::{
    AdapterEvent, BluetoothAdapter, GattTransport, ScanFailure, ScanFilter, ScanMode, ScanResult,
    TransportError, TransportEvent,
};
pub use loopback::{LoopbackTransport, Peripheral};

#[cfg(test)]
pub use abstraction::MockBluetoothAdapter;
