use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{info, trace, warn};
use tokio::sync::mpsc::Sender;
use uuid::Uuid;

use crate::api::central::{ConnectionPriority, ScanFilter, SimulationConfig};
use crate::api::central_event::{AdapterState, CentralEvent, ConnectionState};
use crate::api::characteristic::CharacteristicWriteType;
use crate::api::peripheral::{AttributeId, SimulatedPeripheral};
use crate::api::scan_result::ScanResult;
use crate::api::transfer::{
    TransferCharacteristic, TransferDescriptor, TransferDevice, TransferService,
};
use crate::simulation::delegates::adapter_state_delegate::AdapterStateDelegate;
use crate::simulation::delegates::characteristics_delegate::CharacteristicsDelegate;
use crate::simulation::delegates::connection_delegate::ConnectionDelegate;
use crate::simulation::delegates::descriptors_delegate::DescriptorsDelegate;
use crate::simulation::delegates::discovery_delegate::DiscoveryDelegate;
use crate::simulation::delegates::mtu_delegate::MtuDelegate;
use crate::simulation::delegates::scan_delegate::ScanDelegate;
use crate::simulation::delegates::{CharacteristicTarget, DescriptorTarget};
use crate::simulation::events::EventSink;
use crate::simulation::transaction_monitor::{TransactionMonitor, TransactionRegistry};
use crate::simulation::{AdapterStateListener, AdapterStateReader, PeripheralsById};
use crate::{Result, lock};

/// Every peripheral the engine knows, in registration order.
#[derive(Default)]
struct PeripheralRegistry {
    peripherals: Mutex<Vec<SimulatedPeripheral>>,
}

impl PeripheralRegistry {
    /// Returns false when an existing peripheral with the same id was replaced.
    fn add(&self, peripheral: SimulatedPeripheral) -> bool {
        let mut peripherals = lock(&self.peripherals);
        match peripherals.iter_mut().find(|p| p.id() == peripheral.id()) {
            Some(existing) => {
                *existing = peripheral;
                false
            }
            None => {
                peripherals.push(peripheral);
                true
            }
        }
    }

    fn list(&self) -> Vec<SimulatedPeripheral> {
        lock(&self.peripherals).clone()
    }

    fn by_id(&self) -> PeripheralsById {
        lock(&self.peripherals)
            .iter()
            .map(|p| (p.id().to_string(), p.clone()))
            .collect()
    }
}

/// Entry point of the simulated BLE stack.
///
/// A host drives it the way it would drive a real central: attach a client
/// with [`SimulationManager::create_client`], then scan, connect, discover
/// and talk GATT. Everything asynchronous (adapter changes, scan results,
/// connection changes and notifications) arrives on the client's channel
/// as [`CentralEvent`]s.
pub struct SimulationManager {
    registry: PeripheralRegistry,
    events: Arc<EventSink>,
    transactions: Arc<TransactionMonitor>,
    adapter: Arc<AdapterStateDelegate>,
    scan: ScanDelegate,
    connection: Arc<ConnectionDelegate>,
    discovery: DiscoveryDelegate,
    mtu: MtuDelegate,
    characteristics: Arc<CharacteristicsDelegate>,
    descriptors: DescriptorsDelegate,
}

impl Default for SimulationManager {
    fn default() -> Self {
        SimulationManager::new(SimulationConfig::default())
    }
}

impl SimulationManager {
    pub fn new(config: SimulationConfig) -> Self {
        info!("Creating simulation manager for {:?}", config.platform);
        let events = Arc::new(EventSink::default());
        let transactions = Arc::new(TransactionMonitor::new());
        let registry: Arc<dyn TransactionRegistry> = transactions.clone();

        let adapter = Arc::new(AdapterStateDelegate::new(config.platform, registry.clone()));
        adapter.set_adapter_state_change_delay(config.adapter_state_change_delay);
        let reader: Arc<dyn AdapterStateReader> = adapter.clone();

        let connection_events = events.clone();
        let connection = Arc::new(ConnectionDelegate::new(
            config.platform,
            reader.clone(),
            registry.clone(),
            Arc::new(move |device_id: &str, state: Result<ConnectionState>| {
                connection_events.publish(CentralEvent::ConnectionStateChanged {
                    device_id: device_id.to_string(),
                    state,
                })
            }),
        ));
        let notification_events = events.clone();
        let characteristics = Arc::new(CharacteristicsDelegate::new(
            reader.clone(),
            registry.clone(),
            Arc::new(
                move |transaction_id: &str, characteristic: Result<TransferCharacteristic>| {
                    notification_events.publish(CentralEvent::CharacteristicNotification {
                        transaction_id: transaction_id.to_string(),
                        characteristic,
                    })
                },
            ),
        ));

        adapter.set_adapter_state(config.initial_adapter_state);
        adapter.set_adapter_state_change_listener(Some(adapter_listener(
            events.clone(),
            Arc::downgrade(&characteristics),
            Arc::downgrade(&connection),
        )));

        SimulationManager {
            registry: PeripheralRegistry::default(),
            events,
            transactions,
            scan: ScanDelegate::new(reader.clone()),
            discovery: DiscoveryDelegate::new(reader.clone(), registry.clone()),
            mtu: MtuDelegate::new(config.platform, reader.clone(), registry.clone()),
            descriptors: DescriptorsDelegate::new(reader, registry),
            adapter,
            connection,
            characteristics,
        }
    }

    /// Attaches the channel events are pushed to and replays the adapter
    /// state on it.
    pub fn create_client(&self, sender: Sender<CentralEvent>) {
        trace!("create_client");
        self.events.attach(sender);
        self.events.publish(CentralEvent::StateUpdate {
            state: self.adapter_state(),
        });
    }

    pub fn destroy_client(&self) {
        trace!("destroy_client");
        self.clear_state();
        self.events.detach();
    }

    /// Registers a peripheral. A running scan picks it up immediately.
    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        if !self.registry.add(peripheral.clone()) {
            warn!("Peripheral {} registered twice, replacing it", peripheral.id());
        }
        self.scan.add_peripheral(&peripheral);
    }

    pub fn peripherals(&self) -> Vec<SimulatedPeripheral> {
        self.registry.list()
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.adapter.adapter_state()
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        self.adapter.set_adapter_state(state);
    }

    pub fn set_adapter_state_change_delay(&self, delay: Option<Duration>) {
        self.adapter.set_adapter_state_change_delay(delay);
    }

    pub async fn enable(&self, transaction_id: &str) -> Result<()> {
        self.on_new_transaction(transaction_id);
        self.adapter.enable(transaction_id).await
    }

    pub async fn disable(&self, transaction_id: &str) -> Result<()> {
        self.on_new_transaction(transaction_id);
        self.adapter.disable(transaction_id).await
    }

    pub fn start_scan(&self, filter: ScanFilter) -> Result<()> {
        let events = self.events.clone();
        self.scan.start_scan(
            &self.registry.list(),
            filter,
            Arc::new(move |result: Result<ScanResult>| {
                events.publish(CentralEvent::ScanResult(result))
            }),
        )
    }

    pub fn stop_scan(&self) {
        self.scan.stop_scan();
    }

    pub fn is_scan_in_progress(&self) -> bool {
        self.scan.is_scan_in_progress()
    }

    pub fn get_known_devices(&self, device_ids: &[String]) -> Vec<TransferDevice> {
        self.connection
            .get_known_devices(&self.registry.by_id(), device_ids)
    }

    pub fn get_connected_devices(&self, service_uuids: &[Uuid]) -> Result<Vec<TransferDevice>> {
        self.connection
            .get_connected_devices(&self.registry.list(), service_uuids)
    }

    pub async fn connect(&self, device_id: &str, request_mtu: Option<u16>) -> Result<TransferDevice> {
        self.connection
            .connect(&self.registry.by_id(), device_id, request_mtu)
            .await
    }

    pub fn disconnect(&self, device_id: &str) -> Result<TransferDevice> {
        self.connection
            .disconnect(&self.registry.by_id(), device_id)
    }

    pub fn is_device_connected(&self, device_id: &str) -> Result<bool> {
        self.connection
            .is_device_connected(&self.registry.by_id(), device_id)
    }

    pub fn read_rssi(&self, device_id: &str, transaction_id: &str) -> Result<TransferDevice> {
        self.on_new_transaction(transaction_id);
        self.connection
            .read_rssi(&self.registry.by_id(), device_id, transaction_id)
    }

    pub async fn request_mtu(&self, device_id: &str, mtu: u16, transaction_id: &str) -> Result<u16> {
        self.on_new_transaction(transaction_id);
        self.mtu
            .request_mtu(&self.registry.by_id(), device_id, mtu, transaction_id)
            .await
    }

    pub fn request_connection_priority(
        &self,
        device_id: &str,
        priority: ConnectionPriority,
        transaction_id: &str,
    ) -> Result<TransferDevice> {
        self.on_new_transaction(transaction_id);
        self.connection.request_connection_priority(
            &self.registry.by_id(),
            device_id,
            priority,
            transaction_id,
        )
    }

    pub async fn discovery(&self, device_id: &str, transaction_id: &str) -> Result<Vec<TransferService>> {
        self.on_new_transaction(transaction_id);
        self.discovery
            .discovery(&self.registry.by_id(), device_id, transaction_id)
            .await
    }

    pub async fn read_characteristic(
        &self,
        characteristic_id: AttributeId,
        transaction_id: &str,
    ) -> Result<TransferCharacteristic> {
        self.on_new_transaction(transaction_id);
        let peripherals = self.registry.list();
        let target = CharacteristicTarget::Id {
            peripherals: &peripherals,
            characteristic_id,
        };
        self.characteristics
            .read_characteristic(target, transaction_id)
            .await
    }

    pub async fn read_characteristic_for_service(
        &self,
        service_id: AttributeId,
        characteristic_uuid: Uuid,
        transaction_id: &str,
    ) -> Result<TransferCharacteristic> {
        self.on_new_transaction(transaction_id);
        let peripherals = self.registry.list();
        let target = CharacteristicTarget::InService {
            peripherals: &peripherals,
            service_id,
            characteristic_uuid,
        };
        self.characteristics
            .read_characteristic(target, transaction_id)
            .await
    }

    pub async fn read_characteristic_for_device(
        &self,
        device_id: &str,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        transaction_id: &str,
    ) -> Result<TransferCharacteristic> {
        self.on_new_transaction(transaction_id);
        let peripherals = self.registry.by_id();
        let target = CharacteristicTarget::InDevice {
            peripherals: &peripherals,
            device_id,
            service_uuid,
            characteristic_uuid,
        };
        self.characteristics
            .read_characteristic(target, transaction_id)
            .await
    }

    pub async fn write_characteristic(
        &self,
        characteristic_id: AttributeId,
        value: &str,
        with_response: bool,
        transaction_id: &str,
    ) -> Result<TransferCharacteristic> {
        self.on_new_transaction(transaction_id);
        let peripherals = self.registry.list();
        let target = CharacteristicTarget::Id {
            peripherals: &peripherals,
            characteristic_id,
        };
        self.characteristics
            .write_characteristic(
                target,
                value,
                CharacteristicWriteType::from_with_response(with_response),
                transaction_id,
            )
            .await
    }

    pub async fn write_characteristic_for_service(
        &self,
        service_id: AttributeId,
        characteristic_uuid: Uuid,
        value: &str,
        with_response: bool,
        transaction_id: &str,
    ) -> Result<TransferCharacteristic> {
        self.on_new_transaction(transaction_id);
        let peripherals = self.registry.list();
        let target = CharacteristicTarget::InService {
            peripherals: &peripherals,
            service_id,
            characteristic_uuid,
        };
        self.characteristics
            .write_characteristic(
                target,
                value,
                CharacteristicWriteType::from_with_response(with_response),
                transaction_id,
            )
            .await
    }

    pub async fn write_characteristic_for_device(
        &self,
        device_id: &str,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        value: &str,
        with_response: bool,
        transaction_id: &str,
    ) -> Result<TransferCharacteristic> {
        self.on_new_transaction(transaction_id);
        let peripherals = self.registry.by_id();
        let target = CharacteristicTarget::InDevice {
            peripherals: &peripherals,
            device_id,
            service_uuid,
            characteristic_uuid,
        };
        self.characteristics
            .write_characteristic(
                target,
                value,
                CharacteristicWriteType::from_with_response(with_response),
                transaction_id,
            )
            .await
    }

    /// Notifications arrive as [`CentralEvent::CharacteristicNotification`]
    /// tagged with `transaction_id` until the transaction is cancelled or
    /// reused by another operation. Monitoring again under the same id
    /// replaces the monitor without reporting an error.
    pub fn monitor_characteristic(
        &self,
        characteristic_id: AttributeId,
        transaction_id: &str,
    ) -> Result<()> {
        let peripherals = self.registry.list();
        self.characteristics.monitor_characteristic(
            CharacteristicTarget::Id {
                peripherals: &peripherals,
                characteristic_id,
            },
            transaction_id,
        )
    }

    pub fn monitor_characteristic_for_service(
        &self,
        service_id: AttributeId,
        characteristic_uuid: Uuid,
        transaction_id: &str,
    ) -> Result<()> {
        let peripherals = self.registry.list();
        self.characteristics.monitor_characteristic(
            CharacteristicTarget::InService {
                peripherals: &peripherals,
                service_id,
                characteristic_uuid,
            },
            transaction_id,
        )
    }

    pub fn monitor_characteristic_for_device(
        &self,
        device_id: &str,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        transaction_id: &str,
    ) -> Result<()> {
        let peripherals = self.registry.by_id();
        self.characteristics.monitor_characteristic(
            CharacteristicTarget::InDevice {
                peripherals: &peripherals,
                device_id,
                service_uuid,
                characteristic_uuid,
            },
            transaction_id,
        )
    }

    pub async fn read_descriptor(
        &self,
        descriptor_id: AttributeId,
        transaction_id: &str,
    ) -> Result<TransferDescriptor> {
        self.on_new_transaction(transaction_id);
        let peripherals = self.registry.list();
        let target = DescriptorTarget::Id {
            peripherals: &peripherals,
            descriptor_id,
        };
        self.descriptors.read_descriptor(target, transaction_id).await
    }

    pub async fn read_descriptor_for_characteristic(
        &self,
        characteristic_id: AttributeId,
        descriptor_uuid: Uuid,
        transaction_id: &str,
    ) -> Result<TransferDescriptor> {
        self.on_new_transaction(transaction_id);
        let peripherals = self.registry.list();
        let target = DescriptorTarget::InCharacteristic {
            peripherals: &peripherals,
            characteristic_id,
            descriptor_uuid,
        };
        self.descriptors.read_descriptor(target, transaction_id).await
    }

    pub async fn read_descriptor_for_service(
        &self,
        service_id: AttributeId,
        characteristic_uuid: Uuid,
        descriptor_uuid: Uuid,
        transaction_id: &str,
    ) -> Result<TransferDescriptor> {
        self.on_new_transaction(transaction_id);
        let peripherals = self.registry.list();
        let target = DescriptorTarget::InService {
            peripherals: &peripherals,
            service_id,
            characteristic_uuid,
            descriptor_uuid,
        };
        self.descriptors.read_descriptor(target, transaction_id).await
    }

    pub async fn read_descriptor_for_device(
        &self,
        device_id: &str,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        descriptor_uuid: Uuid,
        transaction_id: &str,
    ) -> Result<TransferDescriptor> {
        self.on_new_transaction(transaction_id);
        let peripherals = self.registry.by_id();
        let target = DescriptorTarget::InDevice {
            peripherals: &peripherals,
            device_id,
            service_uuid,
            characteristic_uuid,
            descriptor_uuid,
        };
        self.descriptors.read_descriptor(target, transaction_id).await
    }

    pub async fn write_descriptor(
        &self,
        descriptor_id: AttributeId,
        value: &str,
        transaction_id: &str,
    ) -> Result<TransferDescriptor> {
        self.on_new_transaction(transaction_id);
        let peripherals = self.registry.list();
        let target = DescriptorTarget::Id {
            peripherals: &peripherals,
            descriptor_id,
        };
        self.descriptors
            .write_descriptor(target, value, transaction_id)
            .await
    }

    pub async fn write_descriptor_for_characteristic(
        &self,
        characteristic_id: AttributeId,
        descriptor_uuid: Uuid,
        value: &str,
        transaction_id: &str,
    ) -> Result<TransferDescriptor> {
        self.on_new_transaction(transaction_id);
        let peripherals = self.registry.list();
        let target = DescriptorTarget::InCharacteristic {
            peripherals: &peripherals,
            characteristic_id,
            descriptor_uuid,
        };
        self.descriptors
            .write_descriptor(target, value, transaction_id)
            .await
    }

    pub async fn write_descriptor_for_service(
        &self,
        service_id: AttributeId,
        characteristic_uuid: Uuid,
        descriptor_uuid: Uuid,
        value: &str,
        transaction_id: &str,
    ) -> Result<TransferDescriptor> {
        self.on_new_transaction(transaction_id);
        let peripherals = self.registry.list();
        let target = DescriptorTarget::InService {
            peripherals: &peripherals,
            service_id,
            characteristic_uuid,
            descriptor_uuid,
        };
        self.descriptors
            .write_descriptor(target, value, transaction_id)
            .await
    }

    pub async fn write_descriptor_for_device(
        &self,
        device_id: &str,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        descriptor_uuid: Uuid,
        value: &str,
        transaction_id: &str,
    ) -> Result<TransferDescriptor> {
        self.on_new_transaction(transaction_id);
        let peripherals = self.registry.by_id();
        let target = DescriptorTarget::InDevice {
            peripherals: &peripherals,
            device_id,
            service_uuid,
            characteristic_uuid,
            descriptor_uuid,
        };
        self.descriptors
            .write_descriptor(target, value, transaction_id)
            .await
    }

    /// Marks every operation running under `transaction_id` cancelled and
    /// ends a monitor owning it.
    pub fn cancel_transaction(&self, transaction_id: &str) {
        trace!("cancel_transaction {}", transaction_id);
        self.transactions.cancel_transaction(transaction_id);
        self.characteristics.on_new_transaction(transaction_id);
    }

    /// Returns the engine to a blank slate: no scan, no links, no monitors
    /// and no transactions. Peripherals and the adapter state are kept.
    pub fn clear_state(&self) {
        info!("Clearing simulation state");
        self.scan.stop_scan();
        for peripheral in self.registry.list() {
            peripheral.on_disconnect(true);
        }
        self.connection.reset();
        self.characteristics.clear_monitors();
        self.transactions.clear_all_transactions();
    }

    fn on_new_transaction(&self, transaction_id: &str) {
        self.characteristics.on_new_transaction(transaction_id);
    }
}

/// Fans adapter changes out to the client and to the delegates that hold
/// long lived resources.
fn adapter_listener(
    events: Arc<EventSink>,
    characteristics: Weak<CharacteristicsDelegate>,
    connection: Weak<ConnectionDelegate>,
) -> AdapterStateListener {
    Arc::new(move |state| {
        if let Some(characteristics) = characteristics.upgrade() {
            characteristics.on_adapter_state_changed(state);
        }
        if let Some(connection) = connection.upgrade() {
            connection.on_adapter_state_changed(state);
        }
        events.publish(CentralEvent::StateUpdate { state });
    })
}
