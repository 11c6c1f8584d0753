use std::collections::HashMap;

use uuid::Uuid;

/// Advertisement payload a simulated peripheral broadcasts while scanned.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanInfo {
    pub rssi: i16,
    pub tx_power_level: Option<i16>,
    pub local_name: Option<String>,
    pub is_connectable: bool,
    /// Base64 encoded manufacturer specific data.
    pub manufacturer_data: Option<String>,
    /// Base64 encoded service data keyed by service UUID.
    pub service_data: HashMap<Uuid, String>,
    pub service_uuids: Vec<Uuid>,
    pub solicited_service_uuids: Vec<Uuid>,
    pub overflow_service_uuids: Vec<Uuid>,
}

impl Default for ScanInfo {
    fn default() -> Self {
        ScanInfo {
            rssi: -30,
            tx_power_level: None,
            local_name: None,
            is_connectable: true,
            manufacturer_data: None,
            service_data: HashMap::new(),
            service_uuids: Vec::new(),
            solicited_service_uuids: Vec::new(),
            overflow_service_uuids: Vec::new(),
        }
    }
}

/// Snapshot handed to the host every time a peripheral "advertises".
#[derive(Clone, Debug, PartialEq)]
pub struct ScanResult {
    pub id: String,
    pub name: Option<String>,
    pub local_name: Option<String>,
    pub rssi: i16,
    pub tx_power_level: Option<i16>,
    pub is_connectable: bool,
    pub manufacturer_data: Option<String>,
    pub service_data: HashMap<Uuid, String>,
    pub service_uuids: Vec<Uuid>,
    pub solicited_service_uuids: Vec<Uuid>,
    pub overflow_service_uuids: Vec<Uuid>,
}

impl ScanResult {
    pub(crate) fn from_scan_info(id: &str, name: Option<&str>, info: &ScanInfo) -> Self {
        ScanResult {
            id: id.to_string(),
            name: name.map(str::to_string),
            local_name: info.local_name.clone(),
            rssi: info.rssi,
            tx_power_level: info.tx_power_level,
            is_connectable: info.is_connectable,
            manufacturer_data: info.manufacturer_data.clone(),
            service_data: info.service_data.clone(),
            service_uuids: info.service_uuids.clone(),
            solicited_service_uuids: info.solicited_service_uuids.clone(),
            overflow_service_uuids: info.overflow_service_uuids.clone(),
        }
    }
}
