//! Plain snapshots handed across the engine boundary.
//!
//! Nothing here owns engine state: every value is copied out of the
//! peripheral at the moment an operation completes.

use uuid::Uuid;

use crate::api::peripheral::{
    AttributeId, CharacteristicNode, DescriptorNode, ServiceNode, SimulatedPeripheral,
};

#[derive(Clone, Debug, PartialEq)]
pub struct TransferDevice {
    pub id: String,
    pub name: Option<String>,
    pub local_name: Option<String>,
    pub rssi: i16,
    pub mtu: u16,
    pub is_connectable: bool,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransferService {
    pub peripheral_id: String,
    pub id: AttributeId,
    pub uuid: Uuid,
    pub characteristics: Vec<TransferCharacteristic>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransferCharacteristic {
    pub peripheral_id: String,
    pub id: AttributeId,
    pub uuid: Uuid,
    pub service_id: AttributeId,
    pub service_uuid: Uuid,
    pub is_readable: bool,
    pub is_writable_with_response: bool,
    pub is_writable_without_response: bool,
    pub is_notifiable: bool,
    pub is_indicatable: bool,
    pub is_notifying: bool,
    /// Base64 encoded value, present only when the operation produced one.
    pub value: Option<String>,
    pub descriptors: Option<Vec<TransferDescriptor>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransferDescriptor {
    pub peripheral_id: String,
    pub id: AttributeId,
    pub uuid: Uuid,
    pub characteristic_id: AttributeId,
    pub characteristic_uuid: Uuid,
    pub service_id: AttributeId,
    pub service_uuid: Uuid,
    pub value: Option<String>,
}

pub fn map_to_transfer_device(peripheral: &SimulatedPeripheral) -> TransferDevice {
    let info = peripheral.scan_info();
    TransferDevice {
        id: peripheral.id().to_string(),
        name: peripheral.name().map(str::to_string),
        local_name: info.local_name.clone(),
        rssi: info.rssi,
        mtu: peripheral.get_mtu(),
        is_connectable: info.is_connectable,
        service_uuids: info.service_uuids.clone(),
        manufacturer_data: info.manufacturer_data.clone(),
    }
}

pub fn map_to_transfer_service(
    service: &ServiceNode,
    peripheral: &SimulatedPeripheral,
) -> TransferService {
    TransferService {
        peripheral_id: peripheral.id().to_string(),
        id: service.id,
        uuid: service.uuid,
        characteristics: service
            .characteristic_ids()
            .iter()
            .filter_map(|id| peripheral.characteristic(*id))
            .map(|characteristic| {
                map_to_transfer_characteristic(characteristic, peripheral, None, true)
            })
            .collect(),
    }
}

pub fn map_to_transfer_characteristic(
    characteristic: &CharacteristicNode,
    peripheral: &SimulatedPeripheral,
    value: Option<String>,
    with_descriptors: bool,
) -> TransferCharacteristic {
    let descriptors = with_descriptors.then(|| {
        characteristic
            .descriptor_ids()
            .iter()
            .filter_map(|id| peripheral.descriptor(*id))
            .map(|descriptor| map_to_transfer_descriptor(descriptor, peripheral.id(), None))
            .collect()
    });
    TransferCharacteristic {
        peripheral_id: peripheral.id().to_string(),
        id: characteristic.id,
        uuid: characteristic.uuid,
        service_id: characteristic.service_id,
        service_uuid: characteristic.service_uuid,
        is_readable: characteristic.is_readable(),
        is_writable_with_response: characteristic.is_writable_with_response(),
        is_writable_without_response: characteristic.is_writable_without_response(),
        is_notifiable: characteristic.is_notifiable(),
        is_indicatable: characteristic.is_indicatable(),
        is_notifying: characteristic.is_notifying(),
        value,
        descriptors,
    }
}

pub fn map_to_transfer_descriptor(
    descriptor: &DescriptorNode,
    peripheral_id: &str,
    value: Option<String>,
) -> TransferDescriptor {
    TransferDescriptor {
        peripheral_id: peripheral_id.to_string(),
        id: descriptor.id,
        uuid: descriptor.uuid,
        characteristic_id: descriptor.characteristic_id,
        characteristic_uuid: descriptor.characteristic_uuid,
        service_id: descriptor.service_id,
        service_uuid: descriptor.service_uuid,
        value,
    }
}
