//! BLE Scanner Module
//!
//! Tracks the single discovery session used to find the robot by its
//! advertised name.

use crate::domain::error::TransportError;
use crate::domain::models::PeripheralIdentity;
use crate::infrastructure::bluetooth::transport::GattTransport;
use tracing::{debug, info};

/// BLE scan bookkeeping for the target robot
pub struct BleScanner {
    target_name: String,
    active_scan: Option<u64>,
    next_scan_id: u64,
}

impl BleScanner {
    pub fn new(target_name: impl Into<String>) -> Self {
        Self {
            target_name: target_name.into(),
            active_scan: None,
            next_scan_id: 1,
        }
    }

    /// Start scanning and return the id of the new scan session
    pub fn start<T: GattTransport>(&mut self, transport: &mut T) -> Result<u64, TransportError> {
        info!("Starting BLE scan for device name: {}", self.target_name);
        transport.start_scan(Some(&self.target_name))?;

        let scan_id = self.next_scan_id;
        self.next_scan_id += 1;
        self.active_scan = Some(scan_id);
        Ok(scan_id)
    }

    /// Stop scanning if a scan is running
    pub fn stop<T: GattTransport>(&mut self, transport: &mut T) {
        if let Some(scan_id) = self.active_scan.take() {
            info!("Stopping BLE scan {}", scan_id);
            transport.stop_scan();
        }
    }

    /// Handle a scan timeout. Returns true only when it ended the active scan,
    /// so an expiry armed by an older scan never cancels a newer one.
    pub fn expire<T: GattTransport>(&mut self, scan_id: u64, transport: &mut T) -> bool {
        if self.active_scan != Some(scan_id) {
            debug!("Ignoring stale timeout for scan {}", scan_id);
            return false;
        }
        self.stop(transport);
        true
    }

    /// Exact advertised-name match against the configured target
    pub fn matches(&self, peripheral: &PeripheralIdentity) -> bool {
        peripheral.name == self.target_name
    }

    pub fn is_scanning(&self) -> bool {
        self.active_scan.is_some()
    }
}
