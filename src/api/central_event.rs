use crate::Result;
use crate::api::scan_result::ScanResult;
use crate::api::transfer::TransferCharacteristic;

/// Events pushed from the engine to whoever drives it.
#[derive(Debug, Clone)]
pub enum CentralEvent {
    StateUpdate {
        state: AdapterState,
    },
    ScanResult(Result<ScanResult>),
    ConnectionStateChanged {
        device_id: String,
        state: Result<ConnectionState>,
    },
    CharacteristicNotification {
        transaction_id: String,
        characteristic: Result<TransferCharacteristic>,
    },
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum AdapterState {
    #[default]
    Unknown = 0,
    Resetting = 1,
    Unsupported = 2,
    Unauthorized = 3,
    PoweredOff = 4,
    PoweredOn = 5,
}

impl AdapterState {
    pub fn is_powered_on(self) -> bool {
        self == AdapterState::PoweredOn
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}
