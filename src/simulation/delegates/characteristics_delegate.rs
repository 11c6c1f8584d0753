use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, trace};

use crate::api::central_event::AdapterState;
use crate::api::characteristic::CharacteristicWriteType;
use crate::api::peripheral::{AttributeId, SimulatedPeripheral, ValueListener, WeakPeripheral};
use crate::api::subscription::Subscription;
use crate::api::transfer::{TransferCharacteristic, map_to_transfer_characteristic};
use crate::error::{BleErrorCode, Error};
use crate::simulation::checks::{
    adapter_lost, characteristic_not_found, device_disconnected, ensure_monitorable,
    ensure_readable, ensure_still_reachable, ensure_writable,
};
use crate::simulation::delegates::CharacteristicTarget;
use crate::simulation::payload::{SizePolicy, check_size, decode, mtu_ceiling, trim};
use crate::simulation::transaction_monitor::{TransactionGuard, TransactionRegistry};
use crate::simulation::{AdapterStateReader, NotificationPublisher};
use crate::{Result, lock};

struct Monitor {
    internal_id: u64,
    subscription: Subscription,
}

type Monitors = Mutex<HashMap<String, Monitor>>;

/// Reads, writes and monitors characteristics.
///
/// Monitors are keyed by transaction id, at most one per id. A monitor is
/// torn down when its id is reused, when a value arrives for a device that
/// is no longer connected, or when the adapter leaves `PoweredOn`.
pub struct CharacteristicsDelegate {
    adapter: Arc<dyn AdapterStateReader>,
    transactions: Arc<dyn TransactionRegistry>,
    publisher: NotificationPublisher,
    monitors: Arc<Monitors>,
}

impl CharacteristicsDelegate {
    pub fn new(
        adapter: Arc<dyn AdapterStateReader>,
        transactions: Arc<dyn TransactionRegistry>,
        publisher: NotificationPublisher,
    ) -> Self {
        CharacteristicsDelegate {
            adapter,
            transactions,
            publisher,
            monitors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn read_characteristic(
        &self,
        target: CharacteristicTarget<'_>,
        transaction_id: &str,
    ) -> Result<TransferCharacteristic> {
        trace!("read_characteristic {:?} transaction={}", target, transaction_id);
        let transaction = TransactionGuard::register(self.transactions.clone(), transaction_id);
        let (peripheral, characteristic_id) = target.resolve(self.adapter.adapter_state())?;
        let characteristic = peripheral
            .characteristic(characteristic_id)
            .ok_or_else(|| characteristic_not_found(characteristic_id))?;
        transaction.ensure_not_cancelled()?;
        ensure_readable(characteristic)?;

        let value = peripheral.read_characteristic(characteristic).await;

        ensure_still_reachable(self.adapter.adapter_state(), &peripheral)?;
        let bytes = decode(&value, BleErrorCode::CharacteristicInvalidDataFormat)?;
        check_size(
            bytes.len(),
            mtu_ceiling(peripheral.get_mtu()),
            BleErrorCode::CharacteristicReadFailed,
            SizePolicy::Strict,
        )?;
        transaction.ensure_not_cancelled()?;
        Ok(map_to_transfer_characteristic(
            characteristic,
            &peripheral,
            Some(value),
            false,
        ))
    }

    /// Writes a Base64 `value`. A successful write reaches every monitor of
    /// the characteristic.
    pub async fn write_characteristic(
        &self,
        target: CharacteristicTarget<'_>,
        value: &str,
        write_type: CharacteristicWriteType,
        transaction_id: &str,
    ) -> Result<TransferCharacteristic> {
        trace!(
            "write_characteristic {:?} {:?} transaction={}",
            target, write_type, transaction_id
        );
        let transaction = TransactionGuard::register(self.transactions.clone(), transaction_id);
        let (peripheral, characteristic_id) = target.resolve(self.adapter.adapter_state())?;
        let characteristic = peripheral
            .characteristic(characteristic_id)
            .ok_or_else(|| characteristic_not_found(characteristic_id))?;
        transaction.ensure_not_cancelled()?;
        ensure_writable(characteristic, write_type)?;
        let bytes = decode(value, BleErrorCode::CharacteristicInvalidDataFormat)?;
        check_size(
            bytes.len(),
            mtu_ceiling(peripheral.get_mtu()),
            BleErrorCode::CharacteristicWriteFailed,
            SizePolicy::Strict,
        )?;

        peripheral
            .write_characteristic(characteristic, value, true)
            .await;

        ensure_still_reachable(self.adapter.adapter_state(), &peripheral)?;
        transaction.ensure_not_cancelled()?;
        Ok(map_to_transfer_characteristic(
            characteristic,
            &peripheral,
            Some(value.to_string()),
            false,
        ))
    }

    /// Installs a monitor whose notifications are published under
    /// `transaction_id`. A monitor already owning that id is replaced
    /// without an error being reported for it.
    pub fn monitor_characteristic(
        &self,
        target: CharacteristicTarget<'_>,
        transaction_id: &str,
    ) -> Result<()> {
        trace!("monitor_characteristic {:?} transaction={}", target, transaction_id);
        let internal_id = self.transactions.register_transaction(transaction_id);
        let prepared = self.prepare_monitor(target, transaction_id, internal_id);
        let (peripheral, characteristic_id) = match prepared {
            Ok(prepared) => prepared,
            Err(error) => {
                self.transactions
                    .clear_transaction(transaction_id, internal_id);
                return Err(error);
            }
        };

        let previous = lock(&self.monitors).remove(transaction_id);
        if let Some(previous) = previous {
            self.dispose(transaction_id, previous);
        }
        let listener = self.notification_listener(
            &peripheral,
            characteristic_id,
            transaction_id,
            internal_id,
        );
        let Some(subscription) = peripheral.monitor_characteristic(characteristic_id, listener, true)
        else {
            self.transactions
                .clear_transaction(transaction_id, internal_id);
            return Err(characteristic_not_found(characteristic_id));
        };
        debug!(
            "Monitoring characteristic {} of {} under {}",
            characteristic_id,
            peripheral.id(),
            transaction_id
        );
        lock(&self.monitors).insert(
            transaction_id.to_string(),
            Monitor {
                internal_id,
                subscription,
            },
        );
        Ok(())
    }

    fn prepare_monitor(
        &self,
        target: CharacteristicTarget<'_>,
        transaction_id: &str,
        internal_id: u64,
    ) -> Result<(SimulatedPeripheral, AttributeId)> {
        let (peripheral, characteristic_id) = target.resolve(self.adapter.adapter_state())?;
        if self
            .transactions
            .is_transaction_cancelled(transaction_id, internal_id)
        {
            return Err(Error::cancelled());
        }
        let characteristic = peripheral
            .characteristic(characteristic_id)
            .ok_or_else(|| characteristic_not_found(characteristic_id))?;
        ensure_monitorable(characteristic)?;
        Ok((peripheral, characteristic_id))
    }

    /// Called before any operation starts under `transaction_id`. A monitor
    /// still owning that id is cancelled and told so.
    pub fn on_new_transaction(&self, transaction_id: &str) {
        let monitor = lock(&self.monitors).remove(transaction_id);
        if let Some(monitor) = monitor {
            debug!("Transaction {} reused, cancelling its monitor", transaction_id);
            self.dispose(transaction_id, monitor);
            (self.publisher)(transaction_id, Err(Error::cancelled()));
        }
    }

    pub fn on_adapter_state_changed(&self, state: AdapterState) {
        if state.is_powered_on() {
            return;
        }
        let monitors: Vec<(String, Monitor)> = lock(&self.monitors).drain().collect();
        for (transaction_id, monitor) in monitors {
            debug!("Adapter {:?}, tearing down monitor {}", state, transaction_id);
            self.dispose(&transaction_id, monitor);
            (self.publisher)(&transaction_id, Err(adapter_lost(state)));
        }
    }

    /// Silently drops every monitor.
    pub fn clear_monitors(&self) {
        let monitors: Vec<(String, Monitor)> = lock(&self.monitors).drain().collect();
        for (transaction_id, monitor) in monitors {
            self.dispose(&transaction_id, monitor);
        }
    }

    pub fn monitor_count(&self) -> usize {
        lock(&self.monitors).len()
    }

    fn dispose(&self, transaction_id: &str, monitor: Monitor) {
        monitor.subscription.dispose();
        self.transactions
            .clear_transaction(transaction_id, monitor.internal_id);
    }

    fn notification_listener(
        &self,
        peripheral: &SimulatedPeripheral,
        characteristic_id: AttributeId,
        transaction_id: &str,
        internal_id: u64,
    ) -> ValueListener {
        let peripheral = peripheral.downgrade();
        let transactions = self.transactions.clone();
        let publisher = self.publisher.clone();
        let monitors = Arc::downgrade(&self.monitors);
        let transaction_id = transaction_id.to_string();
        Arc::new(move |value: &str| {
            let notification = build_notification(
                &peripheral,
                characteristic_id,
                &transaction_id,
                internal_id,
                transactions.as_ref(),
                value,
            );
            if notification.is_err() {
                tear_down(&monitors, transactions.as_ref(), &transaction_id, internal_id);
            }
            publisher(&transaction_id, notification);
        })
    }
}

fn build_notification(
    peripheral: &WeakPeripheral,
    characteristic_id: AttributeId,
    transaction_id: &str,
    internal_id: u64,
    transactions: &dyn TransactionRegistry,
    value: &str,
) -> Result<TransferCharacteristic> {
    let peripheral = peripheral
        .upgrade()
        .ok_or_else(|| Error::from_string("Monitored peripheral no longer exists".to_string()))?;
    if !peripheral.is_connected() {
        return Err(device_disconnected(peripheral.id()));
    }
    if transactions.is_transaction_cancelled(transaction_id, internal_id) {
        return Err(Error::cancelled());
    }
    let characteristic = peripheral
        .characteristic(characteristic_id)
        .ok_or_else(|| characteristic_not_found(characteristic_id))?;
    let bytes = decode(value, BleErrorCode::CharacteristicInvalidDataFormat)?;
    let ceiling = mtu_ceiling(peripheral.get_mtu());
    check_size(
        bytes.len(),
        ceiling,
        BleErrorCode::CharacteristicNotifyChangeFailed,
        SizePolicy::Lenient,
    )?;
    Ok(map_to_transfer_characteristic(
        characteristic,
        &peripheral,
        Some(trim(bytes, ceiling)),
        false,
    ))
}

/// Removes the monitor only if it still belongs to this listener; a
/// replacement under the same id stays untouched.
fn tear_down(
    monitors: &Weak<Monitors>,
    transactions: &dyn TransactionRegistry,
    transaction_id: &str,
    internal_id: u64,
) {
    if let Some(monitors) = monitors.upgrade() {
        let monitor = {
            let mut monitors = lock(&monitors);
            match monitors.get(transaction_id) {
                Some(monitor) if monitor.internal_id == internal_id => {
                    monitors.remove(transaction_id)
                }
                _ => None,
            }
        };
        if let Some(monitor) = monitor {
            monitor.subscription.dispose();
        }
    }
    transactions.clear_transaction(transaction_id, internal_id);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;

    use super::*;
    use crate::api::central::uuid_from_u16;
    use crate::api::peripheral::PeripheralDefinition;
    use crate::simulation::delegates::test_support::{
        CONTROL, FixedAdapter, LOCATION, MEASUREMENT, SERVICE, by_id, heart_rate, ready,
        transactions,
    };
    use crate::simulation::transaction_monitor::TransactionMonitor;

    type Notifications = Arc<Mutex<Vec<(String, Result<TransferCharacteristic>)>>>;

    struct Harness {
        delegate: CharacteristicsDelegate,
        adapter: Arc<FixedAdapter>,
        monitor: Arc<TransactionMonitor>,
        notifications: Notifications,
        peripheral: SimulatedPeripheral,
    }

    impl Harness {
        async fn new() -> Self {
            let adapter = FixedAdapter::powered_on();
            let monitor = transactions();
            let notifications: Notifications = Arc::new(Mutex::new(Vec::new()));
            let sink = notifications.clone();
            let delegate = CharacteristicsDelegate::new(
                adapter.clone(),
                monitor.clone(),
                Arc::new(move |id: &str, result: Result<TransferCharacteristic>| {
                    sink.lock().unwrap().push((id.to_string(), result))
                }),
            );
            let peripheral = heart_rate("a");
            ready(&peripheral).await;
            Harness {
                delegate,
                adapter,
                monitor,
                notifications,
                peripheral,
            }
        }

        fn id_of(&self, uuid: u16) -> AttributeId {
            self.peripheral
                .characteristic_for_service(&uuid_from_u16(SERVICE), &uuid_from_u16(uuid))
                .unwrap()
                .id
        }

        fn push(&self, bytes: &[u8]) {
            self.peripheral
                .update_characteristic(uuid_from_u16(SERVICE), uuid_from_u16(MEASUREMENT), bytes)
                .unwrap();
        }

        fn notifications(&self) -> Vec<(String, Result<TransferCharacteristic>)> {
            self.notifications.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn reads_by_every_kind_of_target() {
        let h = Harness::new().await;
        let peripherals = [h.peripheral.clone()];
        let by_id = by_id(&peripherals);
        let service_id = h.peripheral.service_by_uuid(&uuid_from_u16(SERVICE)).unwrap().id;

        let targets = [
            CharacteristicTarget::Id {
                peripherals: &peripherals,
                characteristic_id: h.id_of(LOCATION),
            },
            CharacteristicTarget::InService {
                peripherals: &peripherals,
                service_id,
                characteristic_uuid: uuid_from_u16(LOCATION),
            },
            CharacteristicTarget::InDevice {
                peripherals: &by_id,
                device_id: "a",
                service_uuid: uuid_from_u16(SERVICE),
                characteristic_uuid: uuid_from_u16(LOCATION),
            },
        ];
        for target in targets {
            let read = h.delegate.read_characteristic(target, "r").await.unwrap();
            assert_eq!(read.value.as_deref(), Some("AQ=="));
            assert_eq!(read.uuid, uuid_from_u16(LOCATION));
        }
        assert_eq!(h.monitor.live_instances("r"), 0);
    }

    #[tokio::test]
    async fn unreadable_characteristic_is_refused() {
        let h = Harness::new().await;
        let peripherals = [h.peripheral.clone()];
        let error = h
            .delegate
            .read_characteristic(
                CharacteristicTarget::Id {
                    peripherals: &peripherals,
                    characteristic_id: h.id_of(CONTROL),
                },
                "r",
            )
            .await
            .unwrap_err();
        assert_eq!(error.code, BleErrorCode::CharacteristicReadFailed);
    }

    #[tokio::test]
    async fn missing_characteristic_and_discovery() {
        let h = Harness::new().await;
        let peripherals = [h.peripheral.clone()];
        let error = h
            .delegate
            .read_characteristic(
                CharacteristicTarget::Id {
                    peripherals: &peripherals,
                    characteristic_id: AttributeId::MAX,
                },
                "r",
            )
            .await
            .unwrap_err();
        assert_eq!(error.code, BleErrorCode::CharacteristicNotFound);

        let undiscovered = heart_rate("b");
        undiscovered.on_connect();
        let by_id = by_id(&[undiscovered]);
        let error = h
            .delegate
            .read_characteristic(
                CharacteristicTarget::InDevice {
                    peripherals: &by_id,
                    device_id: "b",
                    service_uuid: uuid_from_u16(SERVICE),
                    characteristic_uuid: uuid_from_u16(LOCATION),
                },
                "r",
            )
            .await
            .unwrap_err();
        assert_eq!(error.code, BleErrorCode::ServicesNotDiscovered);
    }

    #[tokio::test]
    async fn write_validates_type_and_payload() {
        let h = Harness::new().await;
        let peripherals = [h.peripheral.clone()];
        let target = CharacteristicTarget::Id {
            peripherals: &peripherals,
            characteristic_id: h.id_of(CONTROL),
        };

        let error = h
            .delegate
            .write_characteristic(target, "AQ==", CharacteristicWriteType::WriteWithoutResponse, "w")
            .await
            .unwrap_err();
        assert_eq!(error.code, BleErrorCode::CharacteristicWriteFailed);

        let error = h
            .delegate
            .write_characteristic(target, "AQ=", CharacteristicWriteType::WriteWithResponse, "w")
            .await
            .unwrap_err();
        assert_eq!(error.code, BleErrorCode::CharacteristicInvalidDataFormat);

        let oversized = STANDARD.encode([0u8; 30]);
        let error = h
            .delegate
            .write_characteristic(target, &oversized, CharacteristicWriteType::WriteWithResponse, "w")
            .await
            .unwrap_err();
        assert_eq!(error.code, BleErrorCode::CharacteristicWriteFailed);

        let written = h
            .delegate
            .write_characteristic(target, "AQID", CharacteristicWriteType::WriteWithResponse, "w")
            .await
            .unwrap();
        assert_eq!(written.value.as_deref(), Some("AQID"));
        assert_eq!(h.peripheral.characteristic(h.id_of(CONTROL)).unwrap().value(), "AQID");
    }

    #[tokio::test]
    async fn monitor_publishes_trimmed_values() {
        let h = Harness::new().await;
        let peripherals = [h.peripheral.clone()];
        h.delegate
            .monitor_characteristic(
                CharacteristicTarget::Id {
                    peripherals: &peripherals,
                    characteristic_id: h.id_of(MEASUREMENT),
                },
                "m",
            )
            .unwrap();
        assert!(h.peripheral.characteristic(h.id_of(MEASUREMENT)).unwrap().is_notifying());

        h.push(&[0x00, 0x50]);
        h.push(&[7u8; 40]);

        let notifications = h.notifications();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].1.as_ref().unwrap().value.as_deref(), Some("AFA="));
        let trimmed = notifications[1].1.as_ref().unwrap().value.clone().unwrap();
        assert_eq!(STANDARD.decode(trimmed).unwrap().len(), 20);
        assert_eq!(h.delegate.monitor_count(), 1);
    }

    #[tokio::test]
    async fn monitor_requires_notify_or_indicate() {
        let h = Harness::new().await;
        let peripherals = [h.peripheral.clone()];
        let error = h
            .delegate
            .monitor_characteristic(
                CharacteristicTarget::Id {
                    peripherals: &peripherals,
                    characteristic_id: h.id_of(LOCATION),
                },
                "m",
            )
            .unwrap_err();
        assert_eq!(error.code, BleErrorCode::CharacteristicNotifyChangeFailed);
        assert_eq!(h.monitor.live_instances("m"), 0);
    }

    #[tokio::test]
    async fn reused_transaction_cancels_monitor() {
        let h = Harness::new().await;
        let peripherals = [h.peripheral.clone()];
        h.delegate
            .monitor_characteristic(
                CharacteristicTarget::Id {
                    peripherals: &peripherals,
                    characteristic_id: h.id_of(MEASUREMENT),
                },
                "m",
            )
            .unwrap();

        h.delegate.on_new_transaction("m");
        h.push(&[0x01]);

        let notifications = h.notifications();
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].1.as_ref().unwrap_err().is_cancellation());
        assert_eq!(h.delegate.monitor_count(), 0);
        assert!(!h.peripheral.characteristic(h.id_of(MEASUREMENT)).unwrap().is_notifying());
    }

    #[tokio::test]
    async fn replacing_a_monitor_is_silent() {
        let h = Harness::new().await;
        let peripherals = [h.peripheral.clone()];
        let target = CharacteristicTarget::Id {
            peripherals: &peripherals,
            characteristic_id: h.id_of(MEASUREMENT),
        };
        h.delegate.monitor_characteristic(target, "m").unwrap();
        h.delegate.monitor_characteristic(target, "m").unwrap();
        h.push(&[0x01]);

        let notifications = h.notifications();
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].1.is_ok());
        assert_eq!(h.monitor.live_instances("m"), 1);
    }

    #[tokio::test]
    async fn adapter_loss_tears_monitors_down_once() {
        let h = Harness::new().await;
        let peripherals = [h.peripheral.clone()];
        h.delegate
            .monitor_characteristic(
                CharacteristicTarget::Id {
                    peripherals: &peripherals,
                    characteristic_id: h.id_of(MEASUREMENT),
                },
                "m",
            )
            .unwrap();

        h.adapter.set(AdapterState::PoweredOff);
        h.delegate.on_adapter_state_changed(AdapterState::PoweredOff);
        h.delegate.on_adapter_state_changed(AdapterState::PoweredOff);
        h.push(&[0x01]);

        let notifications = h.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(
            notifications[0].1.as_ref().unwrap_err().code,
            BleErrorCode::BluetoothPoweredOff
        );
        assert_eq!(h.delegate.monitor_count(), 0);
        assert_eq!(h.monitor.live_instances("m"), 0);
    }

    #[tokio::test]
    async fn value_after_disconnect_ends_monitor() {
        let h = Harness::new().await;
        let peripherals = [h.peripheral.clone()];
        h.delegate
            .monitor_characteristic(
                CharacteristicTarget::Id {
                    peripherals: &peripherals,
                    characteristic_id: h.id_of(MEASUREMENT),
                },
                "m",
            )
            .unwrap();

        h.peripheral.on_disconnect(true);
        h.push(&[0x01]);
        h.push(&[0x02]);

        let notifications = h.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(
            notifications[0].1.as_ref().unwrap_err().code,
            BleErrorCode::DeviceDisconnected
        );
        assert_eq!(h.delegate.monitor_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_read_is_reported() {
        let adapter = FixedAdapter::powered_on();
        let delegate = CharacteristicsDelegate::new(
            adapter,
            transactions(),
            Arc::new(|_: &str, _: Result<TransferCharacteristic>| {}),
        );
        let peripheral = SimulatedPeripheral::new(PeripheralDefinition {
            id: "slow".to_string(),
            gatt_delay: Duration::from_millis(100),
            ..heart_rate_definition()
        });
        ready(&peripheral).await;
        let id = peripheral
            .characteristic_for_service(&uuid_from_u16(SERVICE), &uuid_from_u16(LOCATION))
            .unwrap()
            .id;
        let peripherals = [peripheral.clone()];

        let (result, ()) = futures::join!(
            delegate.read_characteristic(
                CharacteristicTarget::Id {
                    peripherals: &peripherals,
                    characteristic_id: id,
                },
                "r",
            ),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                peripheral.on_disconnect(true);
            }
        );

        assert_eq!(result.unwrap_err().code, BleErrorCode::DeviceDisconnected);
    }

    fn heart_rate_definition() -> PeripheralDefinition {
        use crate::api::characteristic::{Characteristic, CharacteristicProperty};
        use crate::api::service::Service;
        PeripheralDefinition {
            services: vec![Service {
                uuid: uuid_from_u16(SERVICE),
                characteristics: vec![Characteristic {
                    uuid: uuid_from_u16(LOCATION),
                    properties: vec![CharacteristicProperty::Read],
                    value: Some(vec![0x01]),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}
