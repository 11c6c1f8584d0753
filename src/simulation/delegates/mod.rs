//! One delegate per slice of the BLE protocol. Delegates never own the
//! peripherals: the manager hands each call the view it needs.

use uuid::Uuid;

use crate::Result;
use crate::api::central_event::AdapterState;
use crate::api::peripheral::{AttributeId, SimulatedPeripheral};
use crate::simulation::PeripheralsById;
use crate::simulation::checks::{
    characteristic_not_found, descriptor_not_found, ensure_adapter_ready, ensure_known,
    ensure_ready_for_gatt, service_not_found,
};

pub mod adapter_state_delegate;
pub mod characteristics_delegate;
pub mod connection_delegate;
pub mod descriptors_delegate;
pub mod discovery_delegate;
pub mod mtu_delegate;
pub mod scan_delegate;

/// The three ways a caller can name a characteristic.
#[derive(Clone, Copy, Debug)]
pub enum CharacteristicTarget<'a> {
    Id {
        peripherals: &'a [SimulatedPeripheral],
        characteristic_id: AttributeId,
    },
    InService {
        peripherals: &'a [SimulatedPeripheral],
        service_id: AttributeId,
        characteristic_uuid: Uuid,
    },
    InDevice {
        peripherals: &'a PeripheralsById,
        device_id: &'a str,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    },
}

impl CharacteristicTarget<'_> {
    /// Finds the owning peripheral, checks it is ready for GATT traffic, then
    /// finds the characteristic inside it.
    pub(crate) fn resolve(&self, state: AdapterState) -> Result<(SimulatedPeripheral, AttributeId)> {
        ensure_adapter_ready(state)?;
        match *self {
            CharacteristicTarget::Id {
                peripherals,
                characteristic_id,
            } => {
                let peripheral = peripherals
                    .iter()
                    .find(|p| p.characteristic(characteristic_id).is_some())
                    .ok_or_else(|| characteristic_not_found(characteristic_id))?;
                ensure_ready_for_gatt(peripheral)?;
                Ok((peripheral.clone(), characteristic_id))
            }
            CharacteristicTarget::InService {
                peripherals,
                service_id,
                characteristic_uuid,
            } => {
                let peripheral = peripherals
                    .iter()
                    .find(|p| p.service(service_id).is_some())
                    .ok_or_else(|| service_not_found(service_id))?;
                ensure_ready_for_gatt(peripheral)?;
                let characteristic = peripheral
                    .characteristic_in_service(service_id, &characteristic_uuid)
                    .ok_or_else(|| {
                        characteristic_not_found(characteristic_uuid)
                            .with_device(peripheral.id())
                            .with_characteristic(characteristic_uuid)
                    })?;
                Ok((peripheral.clone(), characteristic.id))
            }
            CharacteristicTarget::InDevice {
                peripherals,
                device_id,
                service_uuid,
                characteristic_uuid,
            } => {
                let peripheral = ensure_known(peripherals, device_id)?;
                ensure_ready_for_gatt(peripheral)?;
                let characteristic = peripheral
                    .characteristic_for_service(&service_uuid, &characteristic_uuid)
                    .ok_or_else(|| {
                        characteristic_not_found(characteristic_uuid)
                            .with_device(device_id)
                            .with_service(service_uuid)
                            .with_characteristic(characteristic_uuid)
                    })?;
                Ok((peripheral.clone(), characteristic.id))
            }
        }
    }
}

/// The four ways a caller can name a descriptor.
#[derive(Clone, Copy, Debug)]
pub enum DescriptorTarget<'a> {
    Id {
        peripherals: &'a [SimulatedPeripheral],
        descriptor_id: AttributeId,
    },
    InCharacteristic {
        peripherals: &'a [SimulatedPeripheral],
        characteristic_id: AttributeId,
        descriptor_uuid: Uuid,
    },
    InService {
        peripherals: &'a [SimulatedPeripheral],
        service_id: AttributeId,
        characteristic_uuid: Uuid,
        descriptor_uuid: Uuid,
    },
    InDevice {
        peripherals: &'a PeripheralsById,
        device_id: &'a str,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        descriptor_uuid: Uuid,
    },
}

impl DescriptorTarget<'_> {
    pub(crate) fn resolve(&self, state: AdapterState) -> Result<(SimulatedPeripheral, AttributeId)> {
        ensure_adapter_ready(state)?;
        let (peripheral, descriptor) = match *self {
            DescriptorTarget::Id {
                peripherals,
                descriptor_id,
            } => {
                let peripheral = peripherals
                    .iter()
                    .find(|p| p.descriptor(descriptor_id).is_some())
                    .ok_or_else(|| descriptor_not_found(descriptor_id))?;
                ensure_ready_for_gatt(peripheral)?;
                (peripheral, peripheral.descriptor(descriptor_id))
            }
            DescriptorTarget::InCharacteristic {
                peripherals,
                characteristic_id,
                descriptor_uuid,
            } => {
                let peripheral = peripherals
                    .iter()
                    .find(|p| p.characteristic(characteristic_id).is_some())
                    .ok_or_else(|| characteristic_not_found(characteristic_id))?;
                ensure_ready_for_gatt(peripheral)?;
                (
                    peripheral,
                    peripheral.descriptor_for_characteristic(characteristic_id, &descriptor_uuid),
                )
            }
            DescriptorTarget::InService {
                peripherals,
                service_id,
                characteristic_uuid,
                descriptor_uuid,
            } => {
                let peripheral = peripherals
                    .iter()
                    .find(|p| p.service(service_id).is_some())
                    .ok_or_else(|| service_not_found(service_id))?;
                ensure_ready_for_gatt(peripheral)?;
                (
                    peripheral,
                    peripheral.descriptor_for_service(
                        service_id,
                        &characteristic_uuid,
                        &descriptor_uuid,
                    ),
                )
            }
            DescriptorTarget::InDevice {
                peripherals,
                device_id,
                service_uuid,
                characteristic_uuid,
                descriptor_uuid,
            } => {
                let peripheral = ensure_known(peripherals, device_id)?;
                ensure_ready_for_gatt(peripheral)?;
                (
                    peripheral,
                    peripheral.descriptor_for_device(
                        &service_uuid,
                        &characteristic_uuid,
                        &descriptor_uuid,
                    ),
                )
            }
        };
        let descriptor = descriptor.ok_or_else(|| {
            descriptor_not_found(self.describe()).with_device(peripheral.id())
        })?;
        Ok((peripheral.clone(), descriptor.id))
    }

    fn describe(&self) -> String {
        match *self {
            DescriptorTarget::Id { descriptor_id, .. } => descriptor_id.to_string(),
            DescriptorTarget::InCharacteristic {
                characteristic_id,
                descriptor_uuid,
                ..
            } => format!("{descriptor_uuid} in characteristic {characteristic_id}"),
            DescriptorTarget::InService {
                service_id,
                characteristic_uuid,
                descriptor_uuid,
                ..
            } => format!(
                "{descriptor_uuid} in characteristic {characteristic_uuid} of service {service_id}"
            ),
            DescriptorTarget::InDevice {
                service_uuid,
                characteristic_uuid,
                descriptor_uuid,
                ..
            } => format!(
                "{descriptor_uuid} in characteristic {characteristic_uuid} of service {service_uuid}"
            ),
        }
    }
}
