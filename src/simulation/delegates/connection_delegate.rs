use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use uuid::Uuid;

use crate::api::central::{ConnectionPriority, Platform};
use crate::api::central_event::{AdapterState, ConnectionState};
use crate::api::peripheral::{MAX_IOS_MTU, SimulatedPeripheral};
use crate::api::subscription::Subscription;
use crate::api::transfer::{TransferDevice, map_to_transfer_device};
use crate::simulation::checks::{
    connection_failed, ensure_adapter_ready, ensure_connected, ensure_known, ensure_not_connected,
};
use crate::simulation::transaction_monitor::{TransactionGuard, TransactionRegistry};
use crate::simulation::{AdapterStateReader, ConnectionStatePublisher, PeripheralsById};
use crate::{Result, lock};

struct WatchedConnection {
    peripheral: SimulatedPeripheral,
    subscription: Subscription,
}

/// Connection lifecycle of every peripheral.
///
/// A connection attempt suspends while the device decides whether to accept
/// and while the MTU is exchanged. A `disconnect` landing in one of those
/// windows is parked in `pending_disconnections` and turns the attempt into
/// a failure once it resumes.
pub struct ConnectionDelegate {
    platform: Platform,
    adapter: Arc<dyn AdapterStateReader>,
    transactions: Arc<dyn TransactionRegistry>,
    publisher: ConnectionStatePublisher,
    watched: Arc<Mutex<HashMap<String, WatchedConnection>>>,
    pending_disconnections: Mutex<HashMap<String, bool>>,
}

impl ConnectionDelegate {
    pub fn new(
        platform: Platform,
        adapter: Arc<dyn AdapterStateReader>,
        transactions: Arc<dyn TransactionRegistry>,
        publisher: ConnectionStatePublisher,
    ) -> Self {
        ConnectionDelegate {
            platform,
            adapter,
            transactions,
            publisher,
            watched: Arc::new(Mutex::new(HashMap::new())),
            pending_disconnections: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connect(
        &self,
        peripherals: &PeripheralsById,
        device_id: &str,
        request_mtu: Option<u16>,
    ) -> Result<TransferDevice> {
        trace!("connect {} mtu={:?}", device_id, request_mtu);
        ensure_adapter_ready(self.adapter.adapter_state())?;
        let peripheral = ensure_known(peripherals, device_id)?.clone();
        ensure_not_connected(&peripheral)?;

        let result = self.establish(&peripheral, request_mtu).await;
        lock(&self.pending_disconnections).remove(device_id);
        if result.is_err() && peripheral.connection_state() != ConnectionState::Disconnected {
            debug!("Connection to {} failed, dropping the link", device_id);
            peripheral.on_disconnect(true);
        }
        result
    }

    async fn establish(
        &self,
        peripheral: &SimulatedPeripheral,
        request_mtu: Option<u16>,
    ) -> Result<TransferDevice> {
        let device_id = peripheral.id();
        lock(&self.pending_disconnections).insert(device_id.to_string(), false);
        self.watch(peripheral);

        let accepted = peripheral.on_connect_request().await;
        ensure_adapter_ready(self.adapter.adapter_state())?;
        if !accepted || self.is_disconnection_pending(device_id) {
            return Err(connection_failed(device_id));
        }
        peripheral.on_connect();

        match self.platform {
            Platform::Ios => {
                peripheral.on_request_mtu(MAX_IOS_MTU).await;
            }
            Platform::Android => {
                if let Some(mtu) = request_mtu.filter(|mtu| *mtu > 0) {
                    peripheral.on_request_mtu(mtu).await;
                }
            }
        }
        ensure_adapter_ready(self.adapter.adapter_state())?;
        if self.is_disconnection_pending(device_id) || !peripheral.is_connected() {
            return Err(connection_failed(device_id));
        }
        Ok(map_to_transfer_device(peripheral))
    }

    /// Drops the link, or parks the request for an attempt still in flight.
    pub fn disconnect(&self, peripherals: &PeripheralsById, device_id: &str) -> Result<TransferDevice> {
        trace!("disconnect {}", device_id);
        ensure_adapter_ready(self.adapter.adapter_state())?;
        let peripheral = ensure_known(peripherals, device_id)?;
        if peripheral.is_connected() {
            peripheral.on_disconnect(true);
        } else {
            let mut pending = lock(&self.pending_disconnections);
            if let Some(flag) = pending.get_mut(device_id) {
                *flag = true;
            }
        }
        Ok(map_to_transfer_device(peripheral))
    }

    pub fn is_device_connected(&self, peripherals: &PeripheralsById, device_id: &str) -> Result<bool> {
        ensure_adapter_ready(self.adapter.adapter_state())?;
        Ok(ensure_known(peripherals, device_id)?.is_connected())
    }

    pub fn read_rssi(
        &self,
        peripherals: &PeripheralsById,
        device_id: &str,
        transaction_id: &str,
    ) -> Result<TransferDevice> {
        let transaction = TransactionGuard::register(self.transactions.clone(), transaction_id);
        let peripheral = self.connected_device(peripherals, device_id)?;
        transaction.ensure_not_cancelled()?;
        Ok(map_to_transfer_device(peripheral))
    }

    /// Only Android exposes connection priorities; elsewhere the call
    /// validates the device and does nothing else.
    pub fn request_connection_priority(
        &self,
        peripherals: &PeripheralsById,
        device_id: &str,
        priority: ConnectionPriority,
        transaction_id: &str,
    ) -> Result<TransferDevice> {
        let transaction = TransactionGuard::register(self.transactions.clone(), transaction_id);
        let peripheral = self.connected_device(peripherals, device_id)?;
        transaction.ensure_not_cancelled()?;
        if self.platform.supports_connection_priority() {
            debug!("{} connection priority {:?}", device_id, priority);
        }
        Ok(map_to_transfer_device(peripheral))
    }

    /// Devices from `ids` the engine knows about, in the order asked for.
    pub fn get_known_devices(&self, peripherals: &PeripheralsById, ids: &[String]) -> Vec<TransferDevice> {
        ids.iter()
            .filter_map(|id| peripherals.get(id))
            .map(map_to_transfer_device)
            .collect()
    }

    /// Connected devices exposing any of `service_uuids`; all of them when
    /// the list is empty.
    pub fn get_connected_devices(
        &self,
        peripherals: &[SimulatedPeripheral],
        service_uuids: &[Uuid],
    ) -> Result<Vec<TransferDevice>> {
        ensure_adapter_ready(self.adapter.adapter_state())?;
        Ok(peripherals
            .iter()
            .filter(|p| p.is_connected())
            .filter(|p| service_uuids.is_empty() || service_uuids.iter().any(|u| p.has_service(u)))
            .map(map_to_transfer_device)
            .collect())
    }

    /// Losing power drops every link the delegate is watching and fails
    /// every attempt still in flight.
    pub fn on_adapter_state_changed(&self, state: AdapterState) {
        if state.is_powered_on() {
            return;
        }
        {
            let mut pending = lock(&self.pending_disconnections);
            for flag in pending.values_mut() {
                *flag = true;
            }
        }
        let peripherals: Vec<SimulatedPeripheral> = lock(&self.watched)
            .values()
            .map(|watched| watched.peripheral.clone())
            .collect();
        for peripheral in peripherals {
            debug!("Adapter {:?}, disconnecting {}", state, peripheral.id());
            peripheral.on_disconnect(true);
        }
    }

    /// Forgets parked disconnect requests and stops watching every device.
    pub fn reset(&self) {
        lock(&self.pending_disconnections).clear();
        let watched: Vec<WatchedConnection> = lock(&self.watched).drain().map(|(_, w)| w).collect();
        for watched in watched {
            watched.subscription.dispose();
        }
    }

    fn connected_device<'a>(
        &self,
        peripherals: &'a PeripheralsById,
        device_id: &str,
    ) -> Result<&'a SimulatedPeripheral> {
        ensure_adapter_ready(self.adapter.adapter_state())?;
        let peripheral = ensure_known(peripherals, device_id)?;
        ensure_connected(peripheral)?;
        Ok(peripheral)
    }

    fn is_disconnection_pending(&self, device_id: &str) -> bool {
        lock(&self.pending_disconnections)
            .get(device_id)
            .copied()
            .unwrap_or(false)
    }

    /// Forwards the device's state changes until it reaches `Disconnected`.
    fn watch(&self, peripheral: &SimulatedPeripheral) {
        let device_id = peripheral.id().to_string();
        let publisher = self.publisher.clone();
        let watched = Arc::downgrade(&self.watched);
        let listener_device_id = device_id.clone();
        let subscription = peripheral.listen_to_connection_state_changes(move |state| {
            publisher(&listener_device_id, Ok(state));
            if state != ConnectionState::Disconnected {
                return;
            }
            let Some(watched) = watched.upgrade() else {
                return;
            };
            let finished = lock(&watched).remove(&listener_device_id);
            if let Some(finished) = finished {
                finished.subscription.dispose();
            }
        });
        let previous = lock(&self.watched).insert(
            device_id,
            WatchedConnection {
                peripheral: peripheral.clone(),
                subscription,
            },
        );
        if let Some(previous) = previous {
            previous.subscription.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::api::peripheral::{DEFAULT_MTU, PeripheralDefinition, PeripheralHooks};
    use crate::error::BleErrorCode;
    use crate::simulation::delegates::test_support::{FixedAdapter, by_id, heart_rate, transactions};

    type States = Arc<Mutex<Vec<(String, ConnectionState)>>>;

    fn delegate(platform: Platform, adapter: Arc<FixedAdapter>) -> (ConnectionDelegate, States) {
        let states: States = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        let publisher: ConnectionStatePublisher = Arc::new(move |id: &str, state: Result<ConnectionState>| {
            sink.lock().unwrap().push((id.to_string(), state.unwrap()))
        });
        (
            ConnectionDelegate::new(platform, adapter, transactions(), publisher),
            states,
        )
    }

    struct Refuse;

    #[async_trait]
    impl PeripheralHooks for Refuse {
        async fn accept_connection(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn connect_emits_states_and_returns_device() {
        let (delegate, states) = delegate(Platform::Android, FixedAdapter::powered_on());
        let peripherals = by_id(&[heart_rate("a")]);

        let device = delegate.connect(&peripherals, "a", None).await.unwrap();

        assert_eq!(device.id, "a");
        assert_eq!(device.mtu, DEFAULT_MTU);
        assert!(delegate.is_device_connected(&peripherals, "a").unwrap());
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ("a".to_string(), ConnectionState::Connecting),
                ("a".to_string(), ConnectionState::Connected),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_and_duplicate_connections_fail() {
        let (delegate, _) = delegate(Platform::Android, FixedAdapter::powered_on());
        let peripherals = by_id(&[heart_rate("a")]);
        assert_eq!(
            delegate.connect(&peripherals, "X", None).await.unwrap_err().code,
            BleErrorCode::DeviceNotFound
        );
        delegate.connect(&peripherals, "a", None).await.unwrap();
        assert_eq!(
            delegate.connect(&peripherals, "a", None).await.unwrap_err().code,
            BleErrorCode::DeviceAlreadyConnected
        );
    }

    #[tokio::test]
    async fn mtu_follows_platform() {
        let (android, _) = delegate(Platform::Android, FixedAdapter::powered_on());
        let peripherals = by_id(&[heart_rate("a"), heart_rate("b")]);
        assert_eq!(android.connect(&peripherals, "a", Some(100)).await.unwrap().mtu, 100);
        assert_eq!(android.connect(&peripherals, "b", Some(0)).await.unwrap().mtu, DEFAULT_MTU);

        let (ios, _) = delegate(Platform::Ios, FixedAdapter::powered_on());
        let peripherals = by_id(&[heart_rate("c")]);
        assert_eq!(ios.connect(&peripherals, "c", Some(40)).await.unwrap().mtu, MAX_IOS_MTU);
    }

    #[tokio::test]
    async fn refused_connection_ends_disconnected() {
        let (delegate, states) = delegate(Platform::Android, FixedAdapter::powered_on());
        let peripheral = SimulatedPeripheral::new(PeripheralDefinition {
            id: "shy".to_string(),
            hooks: Arc::new(Refuse),
            ..Default::default()
        });
        let peripherals = by_id(&[peripheral.clone()]);

        let error = delegate.connect(&peripherals, "shy", None).await.unwrap_err();

        assert_eq!(error.code, BleErrorCode::DeviceConnectionFailed);
        assert_eq!(peripheral.connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            states.lock().unwrap().last().map(|(_, s)| *s),
            Some(ConnectionState::Disconnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_connect_fails_the_attempt() {
        let (delegate, _) = delegate(Platform::Android, FixedAdapter::powered_on());
        let peripheral = SimulatedPeripheral::new(PeripheralDefinition {
            id: "slow".to_string(),
            connection_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let peripherals = by_id(&[peripheral.clone()]);

        let (connected, disconnected) = futures::join!(delegate.connect(&peripherals, "slow", None), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            delegate.disconnect(&peripherals, "slow")
        });

        assert!(disconnected.is_ok());
        assert_eq!(connected.unwrap_err().code, BleErrorCode::DeviceConnectionFailed);
        assert_eq!(peripheral.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_while_connecting_is_rejected() {
        let (delegate, states) = delegate(Platform::Android, FixedAdapter::powered_on());
        let peripheral = SimulatedPeripheral::new(PeripheralDefinition {
            id: "slow".to_string(),
            connection_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let peripherals = by_id(&[peripheral.clone()]);

        let (first, second) = futures::join!(delegate.connect(&peripherals, "slow", None), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            delegate.connect(&peripherals, "slow", None).await
        });

        assert_eq!(first.unwrap().id, "slow");
        assert_eq!(second.unwrap_err().code, BleErrorCode::DeviceAlreadyConnected);
        assert!(peripheral.is_connected());
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ("slow".to_string(), ConnectionState::Connecting),
                ("slow".to_string(), ConnectionState::Connected),
            ]
        );
    }

    #[tokio::test]
    async fn double_disconnect_is_harmless() {
        let (delegate, states) = delegate(Platform::Android, FixedAdapter::powered_on());
        let peripherals = by_id(&[heart_rate("a")]);
        delegate.connect(&peripherals, "a", None).await.unwrap();

        delegate.disconnect(&peripherals, "a").unwrap();
        delegate.disconnect(&peripherals, "a").unwrap();

        let disconnects = states
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| *s == ConnectionState::Disconnected)
            .count();
        assert_eq!(disconnects, 1);
        assert!(!delegate.is_device_connected(&peripherals, "a").unwrap());
    }

    #[tokio::test]
    async fn power_loss_drops_every_link() {
        let adapter = FixedAdapter::powered_on();
        let (delegate, _) = delegate(Platform::Android, adapter.clone());
        let a = heart_rate("a");
        let b = heart_rate("b");
        let peripherals = by_id(&[a.clone(), b.clone()]);
        delegate.connect(&peripherals, "a", None).await.unwrap();
        delegate.connect(&peripherals, "b", None).await.unwrap();

        adapter.set(AdapterState::PoweredOff);
        delegate.on_adapter_state_changed(AdapterState::PoweredOff);

        assert!(!a.is_connected());
        assert!(!b.is_connected());
    }

    #[tokio::test]
    async fn device_queries() {
        let (delegate, _) = delegate(Platform::Android, FixedAdapter::powered_on());
        let a = heart_rate("a");
        let b = heart_rate("b");
        let peripherals = by_id(&[a.clone(), b.clone()]);
        delegate.connect(&peripherals, "b", None).await.unwrap();

        let known = delegate.get_known_devices(&peripherals, &["b".to_string(), "zz".to_string(), "a".to_string()]);
        assert_eq!(known.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);

        let connected = delegate.get_connected_devices(&[a, b], &[]).unwrap();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].id, "b");

        assert_eq!(
            delegate.read_rssi(&peripherals, "a", "rssi").unwrap_err().code,
            BleErrorCode::DeviceNotConnected
        );
        assert_eq!(delegate.read_rssi(&peripherals, "b", "rssi").unwrap().rssi, -30);
        assert!(
            delegate
                .request_connection_priority(&peripherals, "b", ConnectionPriority::High, "p")
                .is_ok()
        );
    }
}
