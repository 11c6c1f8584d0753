use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use log::{debug, trace};
use uuid::Uuid;

use crate::api::central_event::ConnectionState;
use crate::api::characteristic::{Characteristic, CharacteristicProperty};
use crate::api::descriptor::{AttributePermission, Descriptor};
use crate::api::scan_result::{ScanInfo, ScanResult};
use crate::api::service::Service;
use crate::api::subscription::Subscription;
use crate::error::{BleErrorCode, Error};
use crate::{Result, lock};

pub const DEFAULT_MTU: u16 = 23;
pub const MIN_MTU: u16 = 23;
pub const MAX_MTU: u16 = 512;
/// MTU iOS requests on its own as part of every connection.
pub const MAX_IOS_MTU: u16 = 185;

/// Numeric identifier of a service, characteristic or descriptor. Unique
/// across every peripheral created in the process.
pub type AttributeId = u32;

pub type ValueListener = Arc<dyn Fn(&str) + Send + Sync>;
pub type ConnectionStateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

static NEXT_ATTRIBUTE_ID: AtomicU32 = AtomicU32::new(0);
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(0);

fn next_attribute_id() -> AttributeId {
    NEXT_ATTRIBUTE_ID.fetch_add(1, Ordering::Relaxed)
}

fn next_listener_id() -> u64 {
    NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed)
}

fn encode(value: Option<&Vec<u8>>) -> String {
    value.map(|bytes| STANDARD.encode(bytes)).unwrap_or_default()
}

async fn simulate_delay(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}

/// Decisions a scripted device makes while a central talks to it.
#[async_trait]
pub trait PeripheralHooks: Send + Sync {
    async fn accept_connection(&self) -> bool {
        true
    }

    /// Answer to an MTU exchange. The engine clamps whatever comes back.
    async fn negotiate_mtu(&self, requested: u16) -> u16 {
        requested
    }
}

/// Accepts every connection and agrees to every MTU.
pub struct AcceptAll;

impl PeripheralHooks for AcceptAll {}

pub struct PeripheralDefinition {
    pub id: String,
    pub name: Option<String>,
    pub advertisement_interval: Duration,
    pub scan_info: ScanInfo,
    pub services: Vec<Service>,
    pub connection_delay: Duration,
    pub discovery_delay: Duration,
    pub mtu_negotiation_delay: Duration,
    /// Applied to every characteristic/descriptor read and write.
    pub gatt_delay: Duration,
    pub hooks: Arc<dyn PeripheralHooks>,
}

impl Default for PeripheralDefinition {
    fn default() -> Self {
        PeripheralDefinition {
            id: String::new(),
            name: None,
            advertisement_interval: Duration::from_millis(500),
            scan_info: ScanInfo::default(),
            services: Vec::new(),
            connection_delay: Duration::ZERO,
            discovery_delay: Duration::ZERO,
            mtu_negotiation_delay: Duration::ZERO,
            gatt_delay: Duration::ZERO,
            hooks: Arc::new(AcceptAll),
        }
    }
}

#[derive(Debug)]
pub struct ServiceNode {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub is_advertised: bool,
    pub convenience_name: Option<String>,
    characteristic_ids: Vec<AttributeId>,
    characteristics_by_uuid: HashMap<Uuid, AttributeId>,
}

impl ServiceNode {
    pub fn characteristic_ids(&self) -> &[AttributeId] {
        &self.characteristic_ids
    }
}

struct ValueSubscriber {
    listener: ValueListener,
    set_notifying: bool,
}

struct CharacteristicRuntime {
    value: String,
    subscribers: BTreeMap<u64, ValueSubscriber>,
}

pub struct CharacteristicNode {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub service_id: AttributeId,
    pub service_uuid: Uuid,
    pub properties: Vec<CharacteristicProperty>,
    pub convenience_name: Option<String>,
    descriptor_ids: Vec<AttributeId>,
    descriptors_by_uuid: HashMap<Uuid, AttributeId>,
    runtime: Mutex<CharacteristicRuntime>,
}

impl CharacteristicNode {
    pub fn has(&self, property: CharacteristicProperty) -> bool {
        self.properties.contains(&property)
    }

    pub fn is_readable(&self) -> bool {
        self.has(CharacteristicProperty::Read)
    }

    pub fn is_writable_with_response(&self) -> bool {
        self.has(CharacteristicProperty::Write)
    }

    pub fn is_writable_without_response(&self) -> bool {
        self.has(CharacteristicProperty::WriteWithoutResponse)
    }

    pub fn is_notifiable(&self) -> bool {
        self.has(CharacteristicProperty::Notify)
    }

    pub fn is_indicatable(&self) -> bool {
        self.has(CharacteristicProperty::Indicate)
    }

    pub fn is_notifying(&self) -> bool {
        lock(&self.runtime)
            .subscribers
            .values()
            .any(|subscriber| subscriber.set_notifying)
    }

    pub fn descriptor_ids(&self) -> &[AttributeId] {
        &self.descriptor_ids
    }

    /// Current value, Base64 encoded.
    pub fn value(&self) -> String {
        lock(&self.runtime).value.clone()
    }

    /// Stores `value` and, when `notify` is set, hands it to every monitor.
    pub fn set_value(&self, value: &str, notify: bool) {
        let listeners: Vec<ValueListener> = {
            let mut runtime = lock(&self.runtime);
            runtime.value = value.to_string();
            if !notify {
                return;
            }
            runtime
                .subscribers
                .values()
                .map(|subscriber| subscriber.listener.clone())
                .collect()
        };
        for listener in listeners {
            listener(value);
        }
    }

    fn add_subscriber(&self, subscriber: ValueSubscriber) -> u64 {
        let id = next_listener_id();
        lock(&self.runtime).subscribers.insert(id, subscriber);
        id
    }

    fn remove_subscriber(&self, id: u64) {
        lock(&self.runtime).subscribers.remove(&id);
    }
}

impl fmt::Debug for CharacteristicNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacteristicNode")
            .field("id", &self.id)
            .field("uuid", &self.uuid)
            .field("service_id", &self.service_id)
            .field("properties", &self.properties)
            .finish()
    }
}

#[derive(Debug)]
pub struct DescriptorNode {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub characteristic_id: AttributeId,
    pub characteristic_uuid: Uuid,
    pub service_id: AttributeId,
    pub service_uuid: Uuid,
    pub permissions: Vec<AttributePermission>,
    pub convenience_name: Option<String>,
    value: Mutex<String>,
}

impl DescriptorNode {
    pub fn is_readable(&self) -> bool {
        self.permissions.contains(&AttributePermission::Readable)
    }

    pub fn is_writable(&self) -> bool {
        self.permissions.contains(&AttributePermission::Writeable)
    }

    pub fn value(&self) -> String {
        lock(&self.value).clone()
    }

    pub fn set_value(&self, value: &str) {
        *lock(&self.value) = value.to_string();
    }
}

struct ConnectionRuntime {
    state: ConnectionState,
    discovery_done: bool,
    mtu: u16,
    mtu_negotiated: bool,
    listeners: BTreeMap<u64, ConnectionStateListener>,
}

struct PeripheralInner {
    id: String,
    name: Option<String>,
    advertisement_interval: Duration,
    scan_info: ScanInfo,
    connection_delay: Duration,
    discovery_delay: Duration,
    mtu_negotiation_delay: Duration,
    gatt_delay: Duration,
    hooks: Arc<dyn PeripheralHooks>,
    services: BTreeMap<AttributeId, ServiceNode>,
    services_by_uuid: HashMap<Uuid, AttributeId>,
    characteristics: BTreeMap<AttributeId, CharacteristicNode>,
    descriptors: BTreeMap<AttributeId, DescriptorNode>,
    connection: Mutex<ConnectionRuntime>,
}

/// A scripted device the engine exposes as if it were a real peripheral.
///
/// Cloning is cheap and every clone refers to the same device. The GATT tree
/// is flattened into id-keyed arenas on construction; children refer to their
/// parents by id only.
#[derive(Clone)]
pub struct SimulatedPeripheral {
    inner: Arc<PeripheralInner>,
}

/// Non-owning handle for listeners that live inside the peripheral itself.
#[derive(Clone)]
pub(crate) struct WeakPeripheral {
    inner: Weak<PeripheralInner>,
}

impl WeakPeripheral {
    pub(crate) fn upgrade(&self) -> Option<SimulatedPeripheral> {
        self.inner
            .upgrade()
            .map(|inner| SimulatedPeripheral { inner })
    }
}

impl fmt::Debug for SimulatedPeripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedPeripheral")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("services", &self.inner.services.len())
            .finish()
    }
}

impl SimulatedPeripheral {
    pub fn new(definition: PeripheralDefinition) -> Self {
        let PeripheralDefinition {
            id,
            name,
            advertisement_interval,
            mut scan_info,
            services: service_definitions,
            connection_delay,
            discovery_delay,
            mtu_negotiation_delay,
            gatt_delay,
            hooks,
        } = definition;

        let mut services = BTreeMap::new();
        let mut services_by_uuid = HashMap::new();
        let mut characteristics = BTreeMap::new();
        let mut descriptors = BTreeMap::new();

        for service in service_definitions {
            let service_id = next_attribute_id();
            let mut node = ServiceNode {
                id: service_id,
                uuid: service.uuid,
                is_advertised: service.is_advertised,
                convenience_name: service.convenience_name,
                characteristic_ids: Vec::new(),
                characteristics_by_uuid: HashMap::new(),
            };
            for characteristic in service.characteristics {
                let characteristic_node = build_characteristic(
                    characteristic,
                    service_id,
                    service.uuid,
                    &mut descriptors,
                );
                node.characteristic_ids.push(characteristic_node.id);
                node.characteristics_by_uuid
                    .insert(characteristic_node.uuid, characteristic_node.id);
                characteristics.insert(characteristic_node.id, characteristic_node);
            }
            if service.is_advertised && !scan_info.service_uuids.contains(&service.uuid) {
                scan_info.service_uuids.push(service.uuid);
            }
            services_by_uuid.insert(service.uuid, service_id);
            services.insert(service_id, node);
        }

        SimulatedPeripheral {
            inner: Arc::new(PeripheralInner {
                id,
                name,
                advertisement_interval,
                scan_info,
                connection_delay,
                discovery_delay,
                mtu_negotiation_delay,
                gatt_delay,
                hooks,
                services,
                services_by_uuid,
                characteristics,
                descriptors,
                connection: Mutex::new(ConnectionRuntime {
                    state: ConnectionState::Disconnected,
                    discovery_done: false,
                    mtu: DEFAULT_MTU,
                    mtu_negotiated: false,
                    listeners: BTreeMap::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub(crate) fn downgrade(&self) -> WeakPeripheral {
        WeakPeripheral {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn advertisement_interval(&self) -> Duration {
        self.inner.advertisement_interval
    }

    pub fn scan_info(&self) -> &ScanInfo {
        &self.inner.scan_info
    }

    pub fn get_scan_result(&self) -> ScanResult {
        ScanResult::from_scan_info(self.id(), self.name(), &self.inner.scan_info)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceNode> {
        self.inner.services.values()
    }

    pub fn has_service(&self, uuid: &Uuid) -> bool {
        self.inner.services_by_uuid.contains_key(uuid)
    }

    pub fn service(&self, id: AttributeId) -> Option<&ServiceNode> {
        self.inner.services.get(&id)
    }

    pub fn service_by_uuid(&self, uuid: &Uuid) -> Option<&ServiceNode> {
        self.inner
            .services_by_uuid
            .get(uuid)
            .and_then(|id| self.inner.services.get(id))
    }

    pub fn characteristic(&self, id: AttributeId) -> Option<&CharacteristicNode> {
        self.inner.characteristics.get(&id)
    }

    pub fn characteristic_in_service(
        &self,
        service_id: AttributeId,
        characteristic_uuid: &Uuid,
    ) -> Option<&CharacteristicNode> {
        let service = self.service(service_id)?;
        let id = service.characteristics_by_uuid.get(characteristic_uuid)?;
        self.characteristic(*id)
    }

    pub fn characteristic_for_service(
        &self,
        service_uuid: &Uuid,
        characteristic_uuid: &Uuid,
    ) -> Option<&CharacteristicNode> {
        let service = self.service_by_uuid(service_uuid)?;
        self.characteristic_in_service(service.id, characteristic_uuid)
    }

    pub fn descriptor(&self, id: AttributeId) -> Option<&DescriptorNode> {
        self.inner.descriptors.get(&id)
    }

    pub fn descriptor_for_characteristic(
        &self,
        characteristic_id: AttributeId,
        descriptor_uuid: &Uuid,
    ) -> Option<&DescriptorNode> {
        let characteristic = self.characteristic(characteristic_id)?;
        let id = characteristic.descriptors_by_uuid.get(descriptor_uuid)?;
        self.descriptor(*id)
    }

    pub fn descriptor_for_service(
        &self,
        service_id: AttributeId,
        characteristic_uuid: &Uuid,
        descriptor_uuid: &Uuid,
    ) -> Option<&DescriptorNode> {
        let characteristic = self.characteristic_in_service(service_id, characteristic_uuid)?;
        self.descriptor_for_characteristic(characteristic.id, descriptor_uuid)
    }

    pub fn descriptor_for_device(
        &self,
        service_uuid: &Uuid,
        characteristic_uuid: &Uuid,
        descriptor_uuid: &Uuid,
    ) -> Option<&DescriptorNode> {
        let characteristic = self.characteristic_for_service(service_uuid, characteristic_uuid)?;
        self.descriptor_for_characteristic(characteristic.id, descriptor_uuid)
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.inner.connection).state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn is_discovery_done(&self) -> bool {
        lock(&self.inner.connection).discovery_done
    }

    pub fn get_mtu(&self) -> u16 {
        lock(&self.inner.connection).mtu
    }

    pub fn is_mtu_negotiated(&self) -> bool {
        lock(&self.inner.connection).mtu_negotiated
    }

    pub fn listen_to_connection_state_changes(
        &self,
        listener: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        let id = next_listener_id();
        lock(&self.inner.connection)
            .listeners
            .insert(id, Arc::new(listener));
        let peripheral: Weak<PeripheralInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(peripheral) = peripheral.upgrade() {
                lock(&peripheral.connection).listeners.remove(&id);
            }
        })
    }

    /// Starts a connection attempt and asks the script whether to accept it.
    pub async fn on_connect_request(&self) -> bool {
        trace!("on_connect_request {}", self.id());
        self.transition(ConnectionState::Connecting);
        simulate_delay(self.inner.connection_delay).await;
        self.inner.hooks.accept_connection().await
    }

    pub fn on_connect(&self) {
        trace!("on_connect {}", self.id());
        self.transition(ConnectionState::Connected);
    }

    /// Drops the link. Discovery results and the negotiated MTU go with it.
    pub fn on_disconnect(&self, emit: bool) {
        trace!("on_disconnect {} emit={}", self.id(), emit);
        {
            let mut connection = lock(&self.inner.connection);
            if connection.state == ConnectionState::Disconnected {
                return;
            }
            connection.state = ConnectionState::Disconnected;
            connection.discovery_done = false;
            connection.mtu = DEFAULT_MTU;
            connection.mtu_negotiated = false;
        }
        if emit {
            self.emit(ConnectionState::Disconnecting);
            self.emit(ConnectionState::Disconnected);
        }
    }

    pub async fn on_discovery(&self) {
        trace!("on_discovery {}", self.id());
        simulate_delay(self.inner.discovery_delay).await;
        lock(&self.inner.connection).discovery_done = true;
    }

    pub async fn on_request_mtu(&self, requested: u16) -> u16 {
        trace!("on_request_mtu {} requested={}", self.id(), requested);
        simulate_delay(self.inner.mtu_negotiation_delay).await;
        let negotiated = self
            .inner
            .hooks
            .negotiate_mtu(requested)
            .await
            .clamp(MIN_MTU, MAX_MTU);
        let mut connection = lock(&self.inner.connection);
        connection.mtu = negotiated;
        connection.mtu_negotiated = true;
        debug!("{} negotiated mtu {}", self.id(), negotiated);
        negotiated
    }

    pub async fn read_characteristic(&self, characteristic: &CharacteristicNode) -> String {
        simulate_delay(self.inner.gatt_delay).await;
        characteristic.value()
    }

    pub async fn write_characteristic(
        &self,
        characteristic: &CharacteristicNode,
        value: &str,
        notify: bool,
    ) {
        simulate_delay(self.inner.gatt_delay).await;
        characteristic.set_value(value, notify);
    }

    pub async fn read_descriptor(&self, descriptor: &DescriptorNode) -> String {
        simulate_delay(self.inner.gatt_delay).await;
        descriptor.value()
    }

    pub async fn write_descriptor(&self, descriptor: &DescriptorNode, value: &str) {
        simulate_delay(self.inner.gatt_delay).await;
        descriptor.set_value(value);
    }

    /// Registers `listener` for new values of a characteristic. With
    /// `set_notifying` the characteristic reports notifying while the
    /// subscription lives.
    pub fn monitor_characteristic(
        &self,
        characteristic_id: AttributeId,
        listener: ValueListener,
        set_notifying: bool,
    ) -> Option<Subscription> {
        let characteristic = self.characteristic(characteristic_id)?;
        let id = characteristic.add_subscriber(ValueSubscriber {
            listener,
            set_notifying,
        });
        let peripheral: Weak<PeripheralInner> = Arc::downgrade(&self.inner);
        Some(Subscription::new(move || {
            if let Some(peripheral) = peripheral.upgrade() {
                if let Some(characteristic) = peripheral.characteristics.get(&characteristic_id) {
                    characteristic.remove_subscriber(id);
                }
            }
        }))
    }

    /// Lets a script push a new value, as a device would on a sensor update.
    pub fn update_characteristic(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let characteristic = self
            .characteristic_for_service(&service_uuid, &characteristic_uuid)
            .ok_or_else(|| {
                Error::new(
                    BleErrorCode::CharacteristicNotFound,
                    format!("Characteristic {characteristic_uuid} not found"),
                )
                .with_device(self.id())
                .with_service(service_uuid)
                .with_characteristic(characteristic_uuid)
            })?;
        characteristic.set_value(&STANDARD.encode(value), true);
        Ok(())
    }

    fn transition(&self, state: ConnectionState) {
        lock(&self.inner.connection).state = state;
        self.emit(state);
    }

    fn emit(&self, state: ConnectionState) {
        debug!("{} connection state {:?}", self.id(), state);
        let listeners: Vec<ConnectionStateListener> = lock(&self.inner.connection)
            .listeners
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(state);
        }
    }
}

fn build_characteristic(
    characteristic: Characteristic,
    service_id: AttributeId,
    service_uuid: Uuid,
    descriptors: &mut BTreeMap<AttributeId, DescriptorNode>,
) -> CharacteristicNode {
    let id = next_attribute_id();
    let mut descriptor_ids = Vec::new();
    let mut descriptors_by_uuid = HashMap::new();
    for descriptor in characteristic.descriptors {
        let node = build_descriptor(descriptor, id, characteristic.uuid, service_id, service_uuid);
        descriptor_ids.push(node.id);
        descriptors_by_uuid.insert(node.uuid, node.id);
        descriptors.insert(node.id, node);
    }
    CharacteristicNode {
        id,
        uuid: characteristic.uuid,
        service_id,
        service_uuid,
        properties: characteristic.properties,
        convenience_name: characteristic.convenience_name,
        descriptor_ids,
        descriptors_by_uuid,
        runtime: Mutex::new(CharacteristicRuntime {
            value: encode(characteristic.value.as_ref()),
            subscribers: BTreeMap::new(),
        }),
    }
}

fn build_descriptor(
    descriptor: Descriptor,
    characteristic_id: AttributeId,
    characteristic_uuid: Uuid,
    service_id: AttributeId,
    service_uuid: Uuid,
) -> DescriptorNode {
    DescriptorNode {
        id: next_attribute_id(),
        uuid: descriptor.uuid,
        characteristic_id,
        characteristic_uuid,
        service_id,
        service_uuid,
        permissions: descriptor.permissions,
        convenience_name: descriptor.convenience_name,
        value: Mutex::new(encode(descriptor.value.as_ref())),
    }
}
