//! The simulation engine: a facade over one delegate per slice of the BLE
//! protocol, all sharing the adapter state and the transaction registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::Result;
use crate::api::central_event::{AdapterState, ConnectionState};
use crate::api::peripheral::SimulatedPeripheral;
use crate::api::scan_result::ScanResult;
use crate::api::transfer::TransferCharacteristic;

mod checks;
pub mod delegates;
mod events;
mod payload;
pub mod simulation_manager;
pub mod transaction_monitor;

pub type PeripheralsById = HashMap<String, SimulatedPeripheral>;

pub type AdapterStateListener = Arc<dyn Fn(AdapterState) + Send + Sync>;
pub type ScanResultSink = Arc<dyn Fn(Result<ScanResult>) + Send + Sync>;
pub type ConnectionStatePublisher = Arc<dyn Fn(&str, Result<ConnectionState>) + Send + Sync>;
pub type NotificationPublisher = Arc<dyn Fn(&str, Result<TransferCharacteristic>) + Send + Sync>;

/// Read access to the current adapter power state. Delegates must ask at
/// the point of use and never keep the answer across an await.
pub trait AdapterStateReader: Send + Sync {
    fn adapter_state(&self) -> AdapterState;
}
