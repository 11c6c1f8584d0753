//! Precondition predicates shared by the delegates. Each one either lets
//! the operation continue or yields the error a real stack would report.

use crate::Result;
use crate::api::central_event::{AdapterState, ConnectionState};
use crate::api::characteristic::CharacteristicWriteType;
use crate::api::peripheral::{CharacteristicNode, DescriptorNode, SimulatedPeripheral};
use crate::error::{BleErrorCode, Error};
use crate::simulation::PeripheralsById;

pub(crate) fn ensure_bluetooth_supported(state: AdapterState) -> Result<()> {
    if state == AdapterState::Unsupported {
        return Err(Error::new(
            BleErrorCode::BluetoothUnsupported,
            "Bluetooth is not supported on this device",
        ));
    }
    Ok(())
}

pub(crate) fn ensure_bluetooth_on(state: AdapterState) -> Result<()> {
    if !state.is_powered_on() {
        return Err(Error::new(
            BleErrorCode::BluetoothPoweredOff,
            "Bluetooth adapter is not powered on",
        ));
    }
    Ok(())
}

pub(crate) fn ensure_adapter_ready(state: AdapterState) -> Result<()> {
    ensure_bluetooth_supported(state)?;
    ensure_bluetooth_on(state)
}

/// Error handed to long lived operations torn down because the adapter
/// left the powered on state.
pub(crate) fn adapter_lost(state: AdapterState) -> Error {
    match ensure_adapter_ready(state) {
        Err(error) => error,
        Ok(()) => Error::new(BleErrorCode::UnknownError, "Bluetooth adapter state changed"),
    }
}

pub(crate) fn ensure_scan_not_in_progress(in_progress: bool) -> Result<()> {
    if in_progress {
        return Err(Error::new(
            BleErrorCode::ScanStartFailed,
            "Scan is already in progress",
        ));
    }
    Ok(())
}

pub(crate) fn ensure_known<'a>(
    peripherals: &'a PeripheralsById,
    device_id: &str,
) -> Result<&'a SimulatedPeripheral> {
    peripherals.get(device_id).ok_or_else(|| device_not_found(device_id))
}

pub(crate) fn device_not_found(device_id: &str) -> Error {
    Error::new(
        BleErrorCode::DeviceNotFound,
        format!("Peripheral with identifier {device_id} is unknown"),
    )
    .with_device(device_id)
}

/// An attempt still in flight counts as connected.
pub(crate) fn ensure_not_connected(peripheral: &SimulatedPeripheral) -> Result<()> {
    let message = match peripheral.connection_state() {
        ConnectionState::Connected => "is already connected",
        ConnectionState::Connecting => "is already connecting",
        ConnectionState::Disconnecting | ConnectionState::Disconnected => return Ok(()),
    };
    Err(Error::new(
        BleErrorCode::DeviceAlreadyConnected,
        format!("Peripheral with identifier {} {}", peripheral.id(), message),
    )
    .with_device(peripheral.id()))
}

/// Used before an operation starts.
pub(crate) fn ensure_connected(peripheral: &SimulatedPeripheral) -> Result<()> {
    if !peripheral.is_connected() {
        return Err(Error::new(
            BleErrorCode::DeviceNotConnected,
            format!("Peripheral with identifier {} is not connected", peripheral.id()),
        )
        .with_device(peripheral.id()));
    }
    Ok(())
}

/// Used once an operation resumes; the link was up when it started.
pub(crate) fn ensure_still_connected(peripheral: &SimulatedPeripheral) -> Result<()> {
    if !peripheral.is_connected() {
        return Err(device_disconnected(peripheral.id()));
    }
    Ok(())
}

pub(crate) fn device_disconnected(device_id: &str) -> Error {
    Error::new(
        BleErrorCode::DeviceDisconnected,
        format!("Peripheral with identifier {device_id} was disconnected"),
    )
    .with_device(device_id)
}

pub(crate) fn connection_failed(device_id: &str) -> Error {
    Error::new(
        BleErrorCode::DeviceConnectionFailed,
        format!("Connecting to peripheral with identifier {device_id} failed"),
    )
    .with_device(device_id)
}

pub(crate) fn ensure_discovery_done(peripheral: &SimulatedPeripheral) -> Result<()> {
    if !peripheral.is_discovery_done() {
        return Err(Error::new(
            BleErrorCode::ServicesNotDiscovered,
            format!("Services of peripheral {} have not been discovered", peripheral.id()),
        )
        .with_device(peripheral.id()));
    }
    Ok(())
}

/// What a GATT operation needs from the device before it may touch the tree.
pub(crate) fn ensure_ready_for_gatt(peripheral: &SimulatedPeripheral) -> Result<()> {
    ensure_connected(peripheral)?;
    ensure_discovery_done(peripheral)
}

pub(crate) fn ensure_mtu_not_negotiated(peripheral: &SimulatedPeripheral) -> Result<()> {
    if peripheral.is_mtu_negotiated() {
        return Err(Error::new(
            BleErrorCode::DeviceMtuChangeFailed,
            format!("MTU of peripheral {} has already been negotiated", peripheral.id()),
        )
        .with_device(peripheral.id()));
    }
    Ok(())
}

/// What must still hold once a simulated step has completed.
pub(crate) fn ensure_still_reachable(
    state: AdapterState,
    peripheral: &SimulatedPeripheral,
) -> Result<()> {
    ensure_adapter_ready(state)?;
    ensure_still_connected(peripheral)
}

pub(crate) fn service_not_found(service: impl std::fmt::Display) -> Error {
    Error::new(
        BleErrorCode::ServiceNotFound,
        format!("Service {service} not found"),
    )
}

pub(crate) fn characteristic_not_found(characteristic: impl std::fmt::Display) -> Error {
    Error::new(
        BleErrorCode::CharacteristicNotFound,
        format!("Characteristic {characteristic} not found"),
    )
}

pub(crate) fn descriptor_not_found(descriptor: impl std::fmt::Display) -> Error {
    Error::new(
        BleErrorCode::DescriptorNotFound,
        format!("Descriptor {descriptor} not found"),
    )
}

fn characteristic_error(code: BleErrorCode, message: String, characteristic: &CharacteristicNode) -> Error {
    Error::new(code, message)
        .with_service(characteristic.service_uuid)
        .with_characteristic(characteristic.uuid)
}

pub(crate) fn ensure_readable(characteristic: &CharacteristicNode) -> Result<()> {
    if !characteristic.is_readable() {
        return Err(characteristic_error(
            BleErrorCode::CharacteristicReadFailed,
            format!("Characteristic {} is not readable", characteristic.uuid),
            characteristic,
        ));
    }
    Ok(())
}

pub(crate) fn ensure_writable(
    characteristic: &CharacteristicNode,
    write_type: CharacteristicWriteType,
) -> Result<()> {
    if !characteristic.has(write_type.required_property()) {
        return Err(characteristic_error(
            BleErrorCode::CharacteristicWriteFailed,
            format!(
                "Characteristic {} does not support {:?}",
                characteristic.uuid, write_type
            ),
            characteristic,
        ));
    }
    Ok(())
}

pub(crate) fn ensure_monitorable(characteristic: &CharacteristicNode) -> Result<()> {
    if !characteristic.is_notifiable() && !characteristic.is_indicatable() {
        return Err(characteristic_error(
            BleErrorCode::CharacteristicNotifyChangeFailed,
            format!(
                "Characteristic {} is neither notifiable nor indicatable",
                characteristic.uuid
            ),
            characteristic,
        ));
    }
    Ok(())
}

fn descriptor_error(code: BleErrorCode, message: String, descriptor: &DescriptorNode) -> Error {
    Error::new(code, message)
        .with_service(descriptor.service_uuid)
        .with_characteristic(descriptor.characteristic_uuid)
        .with_descriptor(descriptor.uuid)
}

pub(crate) fn ensure_descriptor_readable(descriptor: &DescriptorNode) -> Result<()> {
    if !descriptor.is_readable() {
        return Err(descriptor_error(
            BleErrorCode::DescriptorReadFailed,
            format!("Descriptor {} is not readable", descriptor.uuid),
            descriptor,
        ));
    }
    Ok(())
}

pub(crate) fn ensure_descriptor_writable(descriptor: &DescriptorNode) -> Result<()> {
    if !descriptor.is_writable() {
        return Err(descriptor_error(
            BleErrorCode::DescriptorWriteFailed,
            format!("Descriptor {} is not writable", descriptor.uuid),
            descriptor,
        ));
    }
    Ok(())
}
