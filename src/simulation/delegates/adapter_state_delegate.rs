use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace};

use crate::api::central::Platform;
use crate::api::central_event::AdapterState;
use crate::error::{BleErrorCode, Error};
use crate::simulation::transaction_monitor::{TransactionGuard, TransactionRegistry};
use crate::simulation::{AdapterStateListener, AdapterStateReader};
use crate::{Result, lock};

/// Owns the simulated radio's power state. Every other delegate reads it
/// through [`AdapterStateReader`].
pub struct AdapterStateDelegate {
    platform: Platform,
    transactions: Arc<dyn TransactionRegistry>,
    state: Mutex<AdapterState>,
    change_delay: Mutex<Option<Duration>>,
    listener: Mutex<Option<AdapterStateListener>>,
}

impl AdapterStateDelegate {
    pub fn new(platform: Platform, transactions: Arc<dyn TransactionRegistry>) -> Self {
        AdapterStateDelegate {
            platform,
            transactions,
            state: Mutex::new(AdapterState::Unknown),
            change_delay: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Replaces the listener and immediately replays the current state to it.
    pub fn set_adapter_state_change_listener(&self, listener: Option<AdapterStateListener>) {
        *lock(&self.listener) = listener.clone();
        if let Some(listener) = listener {
            listener(self.adapter_state());
        }
    }

    /// Forces a state, as a test harness would. This is the only way into
    /// `Unsupported` and `Unauthorized`.
    pub fn set_adapter_state(&self, state: AdapterState) {
        self.on_adapter_state_changed(state);
    }

    pub fn set_adapter_state_change_delay(&self, delay: Option<Duration>) {
        *lock(&self.change_delay) = delay;
    }

    pub async fn enable(&self, transaction_id: &str) -> Result<()> {
        self.change_power(AdapterState::PoweredOn, transaction_id)
            .await
    }

    pub async fn disable(&self, transaction_id: &str) -> Result<()> {
        self.change_power(AdapterState::PoweredOff, transaction_id)
            .await
    }

    async fn change_power(&self, target: AdapterState, transaction_id: &str) -> Result<()> {
        trace!("change_power {:?} transaction={}", target, transaction_id);
        let transaction = TransactionGuard::register(self.transactions.clone(), transaction_id);
        if !self.platform.supports_adapter_toggle() {
            return Err(Error::new(
                BleErrorCode::BluetoothStateChangeFailed,
                format!("{:?} does not let applications change the adapter state", self.platform),
            ));
        }
        match self.adapter_state() {
            AdapterState::Unsupported => {
                return Err(Error::new(
                    BleErrorCode::BluetoothUnsupported,
                    "Bluetooth is not supported on this device",
                ));
            }
            AdapterState::Unauthorized => {
                return Err(Error::new(
                    BleErrorCode::BluetoothUnauthorized,
                    "Application is not authorized to use Bluetooth",
                ));
            }
            current if current == target => {
                return Err(Error::new(
                    BleErrorCode::BluetoothStateChangeFailed,
                    format!("Bluetooth adapter is already {target:?}"),
                ));
            }
            _ => {}
        }

        self.on_adapter_state_changed(AdapterState::Resetting);
        let delay = *lock(&self.change_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        transaction.ensure_not_cancelled()?;
        self.on_adapter_state_changed(target);
        Ok(())
    }

    fn on_adapter_state_changed(&self, state: AdapterState) {
        *lock(&self.state) = state;
        debug!("Adapter state {:?}", state);
        let listener = lock(&self.listener).clone();
        if let Some(listener) = listener {
            listener(state);
        }
    }
}

impl AdapterStateReader for AdapterStateDelegate {
    fn adapter_state(&self) -> AdapterState {
        *lock(&self.state)
    }
}
