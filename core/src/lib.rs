// GattLink Core — BLE GATT client sessions
//
// One peripheral per session, one radio operation in flight, every outcome
// reported through listeners on a single event loop.

pub mod gatt;
pub mod logging;
pub mod session;
pub mod settings;
pub mod transport;

pub use gatt::{
    ActionTag, BondState, CharacteristicRef, ConnectionState, DescriptorRef, DeviceAddress,
    GattSessionManager, GattStatus, ServiceInfo, SessionEvent,
};
pub use logging::{LogSink, Logger, TracingLogger};
pub use session::{
    BleSession, EventForwarder, RemoteDevice, ScanEvent, ScanForwarder, ScanListener,
    SessionBuilder, SessionError, SessionListener, SessionSnapshot, TransportEvents,
};
pub use settings::{ScanSettings, SessionSettings, SettingsError};
pub use transport::{
    AdapterEvent, BluetoothAdapter, GattTransport, LoopbackTransport, Peripheral, ScanFailure,
    ScanFilter, ScanMode, ScanResult, TransportError, TransportEvent,
};

/// Crate version, as reported by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
