//! In-process simulation of a BLE central talking to scripted peripherals.
//!
//! Applications drive a [`SimulationManager`] exactly like they would drive a
//! real BLE client: power the adapter, scan, connect, discover, then read,
//! write and monitor characteristics and descriptors. The peripherals on the
//! other side are [`SimulatedPeripheral`] fixtures.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod api;
mod error;
pub mod simulation;

pub use api::peripheral::SimulatedPeripheral;
pub use error::{BleErrorCode, Error};
pub use simulation::simulation_manager::SimulationManager;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine state is only ever touched in short synchronous sections, so a
/// poisoned lock still holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
