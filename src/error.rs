use std::fmt;

use thiserror::Error as ThisError;
use uuid::Uuid;

/// Closed set of failure kinds the simulated stack can report.
///
/// Discriminants follow the error codes BLE client libraries expose to
/// application code, so a host can forward them without translation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u16)]
pub enum BleErrorCode {
    UnknownError = 0,
    OperationCancelled = 2,

    BluetoothUnsupported = 100,
    BluetoothUnauthorized = 101,
    BluetoothPoweredOff = 102,
    BluetoothInUnknownState = 103,
    BluetoothResetting = 104,
    BluetoothStateChangeFailed = 105,

    DeviceConnectionFailed = 200,
    DeviceDisconnected = 201,
    DeviceRssiReadFailed = 202,
    DeviceAlreadyConnected = 203,
    DeviceNotFound = 204,
    DeviceNotConnected = 205,
    DeviceMtuChangeFailed = 206,

    ServiceNotFound = 302,
    ServicesNotDiscovered = 303,

    CharacteristicWriteFailed = 401,
    CharacteristicReadFailed = 402,
    CharacteristicNotifyChangeFailed = 403,
    CharacteristicNotFound = 404,
    CharacteristicInvalidDataFormat = 406,

    DescriptorNotFound = 500,
    DescriptorWriteFailed = 501,
    DescriptorReadFailed = 502,
    DescriptorInvalidDataFormat = 503,

    ScanStartFailed = 600,
}

impl BleErrorCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for BleErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// An error reported by the simulation engine.
///
/// Every public operation hands one of these back instead of panicking. The
/// optional identifiers only exist to make failures easier to trace back to
/// the fixture that produced them.
#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
#[error("{code}: {message}")]
pub struct Error {
    pub code: BleErrorCode,
    pub message: String,
    pub device_id: Option<String>,
    pub service_uuid: Option<Uuid>,
    pub characteristic_uuid: Option<Uuid>,
    pub descriptor_uuid: Option<Uuid>,
}

impl Error {
    pub fn new(code: BleErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            message: message.into(),
            device_id: None,
            service_uuid: None,
            characteristic_uuid: None,
            descriptor_uuid: None,
        }
    }

    /// Wraps a message that does not belong to the taxonomy.
    pub fn from_string(message: String) -> Self {
        Error::new(BleErrorCode::UnknownError, message)
    }

    pub fn with_device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }

    pub fn with_service(mut self, service_uuid: Uuid) -> Self {
        self.service_uuid = Some(service_uuid);
        self
    }

    pub fn with_characteristic(mut self, characteristic_uuid: Uuid) -> Self {
        self.characteristic_uuid = Some(characteristic_uuid);
        self
    }

    pub fn with_descriptor(mut self, descriptor_uuid: Uuid) -> Self {
        self.descriptor_uuid = Some(descriptor_uuid);
        self
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == BleErrorCode::OperationCancelled
    }

    pub fn cancelled() -> Self {
        Error::new(BleErrorCode::OperationCancelled, "Operation was cancelled")
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::from_string(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_client_library_values() {
        assert_eq!(BleErrorCode::DeviceNotFound.code(), 204);
        assert_eq!(BleErrorCode::OperationCancelled.code(), 2);
        assert_eq!(BleErrorCode::ScanStartFailed.code(), 600);
    }

    #[test]
    fn foreign_errors_become_unknown_and_keep_message() {
        let decode = base64::DecodeError::InvalidLength;
        let expected = decode.to_string();
        let error: Error = decode.into();
        assert_eq!(error.code, BleErrorCode::UnknownError);
        assert_eq!(error.message, expected);
    }

    #[test]
    fn context_is_attached() {
        let uuid = Uuid::from_u128(0x1234);
        let error = Error::new(BleErrorCode::CharacteristicNotFound, "missing")
            .with_device("dev")
            .with_characteristic(uuid);
        assert_eq!(error.device_id.as_deref(), Some("dev"));
        assert_eq!(error.characteristic_uuid, Some(uuid));
        assert!(error.to_string().contains("missing"));
    }
}
