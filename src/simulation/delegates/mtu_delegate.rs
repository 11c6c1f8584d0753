use std::sync::Arc;

use log::trace;

use crate::Result;
use crate::api::central::Platform;
use crate::simulation::checks::{
    ensure_adapter_ready, ensure_connected, ensure_known, ensure_mtu_not_negotiated,
    ensure_still_reachable,
};
use crate::simulation::transaction_monitor::{TransactionGuard, TransactionRegistry};
use crate::simulation::{AdapterStateReader, PeripheralsById};

pub struct MtuDelegate {
    platform: Platform,
    adapter: Arc<dyn AdapterStateReader>,
    transactions: Arc<dyn TransactionRegistry>,
}

impl MtuDelegate {
    pub fn new(
        platform: Platform,
        adapter: Arc<dyn AdapterStateReader>,
        transactions: Arc<dyn TransactionRegistry>,
    ) -> Self {
        MtuDelegate {
            platform,
            adapter,
            transactions,
        }
    }

    /// Negotiates a new MTU, clamped to what ATT allows. iOS negotiates on
    /// its own while connecting, so there the current value comes back as is.
    pub async fn request_mtu(
        &self,
        peripherals: &PeripheralsById,
        device_id: &str,
        mtu: u16,
        transaction_id: &str,
    ) -> Result<u16> {
        trace!("request_mtu {} {} transaction={}", device_id, mtu, transaction_id);
        let transaction = TransactionGuard::register(self.transactions.clone(), transaction_id);
        ensure_adapter_ready(self.adapter.adapter_state())?;
        let peripheral = ensure_known(peripherals, device_id)?;
        ensure_connected(peripheral)?;
        transaction.ensure_not_cancelled()?;
        if !self.platform.negotiates_mtu_on_request() {
            return Ok(peripheral.get_mtu());
        }
        ensure_mtu_not_negotiated(peripheral)?;

        let negotiated = peripheral.on_request_mtu(mtu).await;

        ensure_still_reachable(self.adapter.adapter_state(), peripheral)?;
        transaction.ensure_not_cancelled()?;
        Ok(negotiated)
    }
}
