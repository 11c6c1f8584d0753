use std::time::Duration;

use uuid::Uuid;

use crate::api::central_event::AdapterState;

/// Base UUID every 16-bit Bluetooth SIG assigned number expands into.
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expands a 16-bit short UUID (e.g. `0x180D` for Heart Rate) into a full UUID.
pub fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Host platform whose BLE stack the engine imitates.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Platform {
    #[default]
    Android,
    Ios,
}

impl Platform {
    /// Only Android lets applications toggle the radio themselves.
    pub fn supports_adapter_toggle(self) -> bool {
        self == Platform::Android
    }

    /// Android negotiates MTU on request, iOS negotiates once on connect.
    pub fn negotiates_mtu_on_request(self) -> bool {
        self == Platform::Android
    }

    pub fn supports_connection_priority(self) -> bool {
        self == Platform::Android
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SimulationConfig {
    pub platform: Platform,
    pub initial_adapter_state: AdapterState,
    pub adapter_state_change_delay: Option<Duration>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            platform: Platform::default(),
            initial_adapter_state: AdapterState::PoweredOn,
            adapter_state_change_delay: None,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanFilter {
    pub services: Vec<Uuid>,
    /// Android scan mode, recorded but not simulated.
    pub scan_mode: Option<i32>,
    /// Android callback type, recorded but not simulated.
    pub callback_type: Option<i32>,
}

impl ScanFilter {
    pub fn matches(&self, advertised: &[Uuid]) -> bool {
        self.services.is_empty() || self.services.iter().any(|uuid| advertised.contains(uuid))
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionPriority {
    #[default]
    Balanced = 0,
    High = 1,
    LowPower = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_uuid_expands_into_base_uuid() {
        assert_eq!(
            uuid_from_u16(0x180D).to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = ScanFilter::default();
        assert!(filter.matches(&[]));
        assert!(filter.matches(&[uuid_from_u16(0x180F)]));
    }

    #[test]
    fn filter_needs_an_intersection() {
        let filter = ScanFilter {
            services: vec![uuid_from_u16(0x180D)],
            ..Default::default()
        };
        assert!(filter.matches(&[uuid_from_u16(0x180F), uuid_from_u16(0x180D)]));
        assert!(!filter.matches(&[uuid_from_u16(0x180F)]));
        assert!(!filter.matches(&[]));
    }
}
