use std::sync::Arc;

use log::trace;

use crate::Result;
use crate::api::transfer::{TransferService, map_to_transfer_service};
use crate::simulation::checks::{
    ensure_adapter_ready, ensure_connected, ensure_known, ensure_still_reachable,
};
use crate::simulation::transaction_monitor::{TransactionGuard, TransactionRegistry};
use crate::simulation::{AdapterStateReader, PeripheralsById};

pub struct DiscoveryDelegate {
    adapter: Arc<dyn AdapterStateReader>,
    transactions: Arc<dyn TransactionRegistry>,
}

impl DiscoveryDelegate {
    pub fn new(adapter: Arc<dyn AdapterStateReader>, transactions: Arc<dyn TransactionRegistry>) -> Self {
        DiscoveryDelegate {
            adapter,
            transactions,
        }
    }

    /// Walks the device's GATT tree. GATT operations on the device are
    /// refused until this has completed once per connection.
    pub async fn discovery(
        &self,
        peripherals: &PeripheralsById,
        device_id: &str,
        transaction_id: &str,
    ) -> Result<Vec<TransferService>> {
        trace!("discovery {} transaction={}", device_id, transaction_id);
        let transaction = TransactionGuard::register(self.transactions.clone(), transaction_id);
        ensure_adapter_ready(self.adapter.adapter_state())?;
        let peripheral = ensure_known(peripherals, device_id)?;
        ensure_connected(peripheral)?;
        transaction.ensure_not_cancelled()?;

        peripheral.on_discovery().await;

        ensure_still_reachable(self.adapter.adapter_state(), peripheral)?;
        transaction.ensure_not_cancelled()?;
        Ok(peripheral
            .services()
            .map(|service| map_to_transfer_service(service, peripheral))
            .collect())
    }
}
