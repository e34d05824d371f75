//! LE scan session
//!
//! Owns the scanning flag and the single scan-listener slot. Adapter events
//! arrive through the session inbox and are delivered here.

use super::listener::ScanListener;
use crate::gatt::types::DeviceAddress;
use crate::logging::LogSink;
use crate::settings::ScanSettings;
use crate::transport::{AdapterEvent, BluetoothAdapter, ScanFailure, ScanFilter, ScanResult};
use std::collections::HashSet;
use std::sync::Arc;

pub struct ScanSession {
    adapter: Option<Arc<dyn BluetoothAdapter>>,
    listener: Option<Arc<dyn ScanListener>>,
    settings: ScanSettings,
    scanning: bool,
    seen: HashSet<DeviceAddress>,
    log: LogSink,
}

impl ScanSession {
    pub fn new(
        adapter: Option<Arc<dyn BluetoothAdapter>>,
        settings: ScanSettings,
        log: LogSink,
    ) -> Self {
        Self {
            adapter,
            listener: None,
            settings,
            scanning: false,
            seen: HashSet::new(),
            log,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn set_listener(&mut self, listener: Option<Arc<dyn ScanListener>>) {
        self.log.debug(if listener.is_some() {
            "Added scan listener"
        } else {
            "Cleared scan listener"
        });
        self.listener = listener;
    }

    /// Start discovery and LE scanning; no-op while already scanning
    pub fn start(&mut self, filters: &[ScanFilter]) {
        if self.scanning {
            self.log.warn("startScan: cancel, already scanning");
            return;
        }
        let Some(adapter) = self.adapter.clone() else {
            self.log.warn("startScan: no bluetooth adapter");
            return;
        };

        adapter.start_discovery();
        if !adapter.has_le_scanner() {
            self.log.warn("startScan: LE scanner unavailable");
            return;
        }

        self.scanning = true;
        self.seen.clear();
        self.log
            .debug(format!("startScan() called with: filters = {:?}", filters));
        if !adapter.start_le_scan(filters, self.settings.mode) {
            self.log.error("startScan: LE scan could not be started");
            self.scanning = false;
        }
    }

    /// Stop both discovery mechanisms; safe when not scanning
    pub fn stop(&mut self) {
        self.scanning = false;
        let Some(adapter) = self.adapter.as_ref() else {
            self.log.warn("stopScan: no bluetooth adapter");
            return;
        };
        adapter.cancel_discovery();
        if adapter.has_le_scanner() {
            adapter.stop_le_scan();
        } else {
            self.log.warn("stopScan: LE scanner unavailable");
        }
    }

    pub fn handle_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::ScanResult(result) => self.on_result(result),
            AdapterEvent::BatchScanResults(results) => {
                for result in results {
                    self.log.info(format!("Batch result: {}", result.address));
                    self.on_result(result);
                }
            }
            AdapterEvent::ScanFailed(code) => {
                let failure = ScanFailure::from_code(code);
                self.log.error(format!("Scan failed: {}", failure));
                if failure != ScanFailure::AlreadyStarted {
                    self.scanning = false;
                }
                if let Some(listener) = &self.listener {
                    listener.on_scan_failed(failure);
                }
            }
        }
    }

    fn on_result(&mut self, result: ScanResult) {
        if !self.scanning {
            self.log
                .debug(format!("Ignoring scan result for {}: not scanning", result.address));
            return;
        }
        if self.settings.deduplicate && !self.seen.insert(result.address) {
            return;
        }
        self.log.debug(format!(
            "onScanResult() called with: result = [{}] rssi = {}",
            result.address, result.rssi
        ));
        if let Some(listener) = &self.listener {
            listener.on_scan_result(&result);
        }
    }
}
