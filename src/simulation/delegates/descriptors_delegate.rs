use std::sync::Arc;

use log::trace;

use crate::Result;
use crate::api::transfer::{TransferDescriptor, map_to_transfer_descriptor};
use crate::error::BleErrorCode;
use crate::simulation::checks::{
    descriptor_not_found, ensure_descriptor_readable, ensure_descriptor_writable,
    ensure_still_reachable,
};
use crate::simulation::delegates::DescriptorTarget;
use crate::simulation::payload::{MAX_ATTRIBUTE_LENGTH, SizePolicy, check_size, decode};
use crate::simulation::transaction_monitor::{TransactionGuard, TransactionRegistry};
use crate::simulation::AdapterStateReader;

/// Descriptor reads and writes. Values are bounded by the ATT attribute
/// limit rather than the MTU.
pub struct DescriptorsDelegate {
    adapter: Arc<dyn AdapterStateReader>,
    transactions: Arc<dyn TransactionRegistry>,
}

impl DescriptorsDelegate {
    pub fn new(adapter: Arc<dyn AdapterStateReader>, transactions: Arc<dyn TransactionRegistry>) -> Self {
        DescriptorsDelegate {
            adapter,
            transactions,
        }
    }

    pub async fn read_descriptor(
        &self,
        target: DescriptorTarget<'_>,
        transaction_id: &str,
    ) -> Result<TransferDescriptor> {
        trace!("read_descriptor {:?} transaction={}", target, transaction_id);
        let transaction = TransactionGuard::register(self.transactions.clone(), transaction_id);
        let (peripheral, descriptor_id) = target.resolve(self.adapter.adapter_state())?;
        let descriptor = peripheral
            .descriptor(descriptor_id)
            .ok_or_else(|| descriptor_not_found(descriptor_id))?;
        transaction.ensure_not_cancelled()?;
        ensure_descriptor_readable(descriptor)?;

        let value = peripheral.read_descriptor(descriptor).await;

        ensure_still_reachable(self.adapter.adapter_state(), &peripheral)?;
        let bytes = decode(&value, BleErrorCode::DescriptorInvalidDataFormat)?;
        check_size(
            bytes.len(),
            MAX_ATTRIBUTE_LENGTH,
            BleErrorCode::DescriptorReadFailed,
            SizePolicy::Strict,
        )?;
        transaction.ensure_not_cancelled()?;
        Ok(map_to_transfer_descriptor(
            descriptor,
            peripheral.id(),
            Some(value),
        ))
    }

    pub async fn write_descriptor(
        &self,
        target: DescriptorTarget<'_>,
        value: &str,
        transaction_id: &str,
    ) -> Result<TransferDescriptor> {
        trace!("write_descriptor {:?} transaction={}", target, transaction_id);
        let transaction = TransactionGuard::register(self.transactions.clone(), transaction_id);
        let (peripheral, descriptor_id) = target.resolve(self.adapter.adapter_state())?;
        let descriptor = peripheral
            .descriptor(descriptor_id)
            .ok_or_else(|| descriptor_not_found(descriptor_id))?;
        transaction.ensure_not_cancelled()?;
        ensure_descriptor_writable(descriptor)?;
        let bytes = decode(value, BleErrorCode::DescriptorInvalidDataFormat)?;
        check_size(
            bytes.len(),
            MAX_ATTRIBUTE_LENGTH,
            BleErrorCode::DescriptorWriteFailed,
            SizePolicy::Strict,
        )?;

        peripheral.write_descriptor(descriptor, value).await;

        ensure_still_reachable(self.adapter.adapter_state(), &peripheral)?;
        transaction.ensure_not_cancelled()?;
        Ok(map_to_transfer_descriptor(
            descriptor,
            peripheral.id(),
            Some(value.to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;

    use super::*;
    use crate::api::central::uuid_from_u16;
    use crate::api::central_event::AdapterState;
    use crate::api::peripheral::SimulatedPeripheral;
    use crate::simulation::delegates::test_support::{
        CCCD, DESCRIPTION, FixedAdapter, LOCATION, MEASUREMENT, SERVICE, by_id, heart_rate, ready,
        transactions,
    };

    async fn connected() -> (DescriptorsDelegate, Arc<FixedAdapter>, SimulatedPeripheral) {
        let adapter = FixedAdapter::powered_on();
        let delegate = DescriptorsDelegate::new(adapter.clone(), transactions());
        let peripheral = heart_rate("a");
        ready(&peripheral).await;
        (delegate, adapter, peripheral)
    }

    #[tokio::test]
    async fn reads_by_every_kind_of_target() {
        let (delegate, _, peripheral) = connected().await;
        let peripherals = [peripheral.clone()];
        let by_id = by_id(&peripherals);
        let service_id = peripheral.service_by_uuid(&uuid_from_u16(SERVICE)).unwrap().id;
        let characteristic = peripheral
            .characteristic_in_service(service_id, &uuid_from_u16(LOCATION))
            .unwrap();
        let descriptor = peripheral
            .descriptor_for_characteristic(characteristic.id, &uuid_from_u16(DESCRIPTION))
            .unwrap();

        let targets = [
            DescriptorTarget::Id {
                peripherals: &peripherals,
                descriptor_id: descriptor.id,
            },
            DescriptorTarget::InCharacteristic {
                peripherals: &peripherals,
                characteristic_id: characteristic.id,
                descriptor_uuid: uuid_from_u16(DESCRIPTION),
            },
            DescriptorTarget::InService {
                peripherals: &peripherals,
                service_id,
                characteristic_uuid: uuid_from_u16(LOCATION),
                descriptor_uuid: uuid_from_u16(DESCRIPTION),
            },
            DescriptorTarget::InDevice {
                peripherals: &by_id,
                device_id: "a",
                service_uuid: uuid_from_u16(SERVICE),
                characteristic_uuid: uuid_from_u16(LOCATION),
                descriptor_uuid: uuid_from_u16(DESCRIPTION),
            },
        ];
        for target in targets {
            let read = delegate.read_descriptor(target, "d").await.unwrap();
            assert_eq!(read.value.as_deref(), Some(STANDARD.encode(b"chest").as_str()));
            assert_eq!(read.characteristic_uuid, uuid_from_u16(LOCATION));
        }
    }

    #[tokio::test]
    async fn read_only_descriptor_refuses_writes() {
        let (delegate, _, peripheral) = connected().await;
        let by_id = by_id(&[peripheral]);
        let error = delegate
            .write_descriptor(
                DescriptorTarget::InDevice {
                    peripherals: &by_id,
                    device_id: "a",
                    service_uuid: uuid_from_u16(SERVICE),
                    characteristic_uuid: uuid_from_u16(LOCATION),
                    descriptor_uuid: uuid_from_u16(DESCRIPTION),
                },
                "AQ==",
                "d",
            )
            .await
            .unwrap_err();
        assert_eq!(error.code, BleErrorCode::DescriptorWriteFailed);
    }

    #[tokio::test]
    async fn write_enforces_payload_rules() {
        let (delegate, _, peripheral) = connected().await;
        let by_id = by_id(&[peripheral.clone()]);
        let target = DescriptorTarget::InDevice {
            peripherals: &by_id,
            device_id: "a",
            service_uuid: uuid_from_u16(SERVICE),
            characteristic_uuid: uuid_from_u16(MEASUREMENT),
            descriptor_uuid: uuid_from_u16(CCCD),
        };

        let error = delegate.write_descriptor(target, "AQI", "d").await.unwrap_err();
        assert_eq!(error.code, BleErrorCode::DescriptorInvalidDataFormat);

        let oversized = STANDARD.encode(vec![0u8; 600]);
        let error = delegate.write_descriptor(target, &oversized, "d").await.unwrap_err();
        assert_eq!(error.code, BleErrorCode::DescriptorWriteFailed);

        // Well past the MTU, still within the attribute limit.
        let large = STANDARD.encode(vec![1u8; 300]);
        let written = delegate.write_descriptor(target, &large, "d").await.unwrap();
        assert_eq!(written.value.as_deref(), Some(large.as_str()));
    }

    #[tokio::test]
    async fn oversized_stored_value_fails_to_read() {
        let (delegate, _, peripheral) = connected().await;
        let descriptor = peripheral
            .descriptor_for_device(
                &uuid_from_u16(SERVICE),
                &uuid_from_u16(MEASUREMENT),
                &uuid_from_u16(CCCD),
            )
            .unwrap();
        descriptor.set_value(&STANDARD.encode(vec![0u8; 600]));
        let peripherals = [peripheral.clone()];

        let error = delegate
            .read_descriptor(
                DescriptorTarget::Id {
                    peripherals: &peripherals,
                    descriptor_id: descriptor.id,
                },
                "d",
            )
            .await
            .unwrap_err();
        assert_eq!(error.code, BleErrorCode::DescriptorReadFailed);
    }

    #[tokio::test]
    async fn unknown_descriptor_and_powered_off_adapter() {
        let (delegate, adapter, peripheral) = connected().await;
        let by_id = by_id(&[peripheral]);
        let target = DescriptorTarget::InDevice {
            peripherals: &by_id,
            device_id: "a",
            service_uuid: uuid_from_u16(SERVICE),
            characteristic_uuid: uuid_from_u16(MEASUREMENT),
            descriptor_uuid: uuid_from_u16(DESCRIPTION),
        };
        let error = delegate.read_descriptor(target, "d").await.unwrap_err();
        assert_eq!(error.code, BleErrorCode::DescriptorNotFound);

        adapter.set(AdapterState::PoweredOff);
        let error = delegate.read_descriptor(target, "d").await.unwrap_err();
        assert_eq!(error.code, BleErrorCode::BluetoothPoweredOff);
    }
}
