//! Session facade: event loop, listener fan-out and scanning

pub mod listener;
pub mod scanner;
pub mod service;

pub use listener::{
    EventForwarder, ListenerSet, ScanEvent, ScanForwarder, ScanListener, SessionListener,
};
pub use scanner::ScanSession;
pub use service::{
    BleSession, RemoteDevice, Request, SessionBuilder, SessionError, SessionMessage,
    SessionSnapshot, TransportEvents,
};
