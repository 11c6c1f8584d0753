use std::time::Duration;

use log::LevelFilter;
use rustycore_sim::SimulationManager;
use rustycore_sim::api::central::{ScanFilter, uuid_from_u16};
use rustycore_sim::api::central_event::CentralEvent;
use rustycore_sim::api::peripheral::{PeripheralDefinition, SimulatedPeripheral};
use rustycore_sim::api::scan_result::ScanInfo;
use rustycore_sim::api::service::Service;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    pretty_env_logger::formatted_builder()
        .filter_level(LevelFilter::Info)
        .init();

    let (sender_tx, mut receiver_rx) = mpsc::channel::<CentralEvent>(256);
    let manager = SimulationManager::default();
    manager.create_client(sender_tx);
    for (id, interval) in [("thermometer", 300), ("scale", 700)] {
        manager.add_peripheral(beacon(id, Duration::from_millis(interval)));
    }

    // start scanning for devices
    if let Err(e) = manager.start_scan(ScanFilter::default()) {
        log::error!("Scan failed to start: {}", e);
        return;
    }

    let deadline = tokio::time::sleep(Duration::from_secs(3));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            Some(event) = receiver_rx.recv() => handle_updates(event),
            _ = &mut deadline => break,
        }
    }
    manager.stop_scan();
    log::info!("Scan finished");
}

fn beacon(id: &str, advertisement_interval: Duration) -> SimulatedPeripheral {
    SimulatedPeripheral::new(PeripheralDefinition {
        id: id.to_string(),
        name: Some(id.to_string()),
        advertisement_interval,
        scan_info: ScanInfo {
            local_name: Some(id.to_string()),
            ..Default::default()
        },
        services: vec![Service {
            uuid: uuid_from_u16(0x181A),
            is_advertised: true,
            ..Default::default()
        }],
        ..Default::default()
    })
}

/// Log every update the simulated stack pushes
pub fn handle_updates(update: CentralEvent) {
    match update {
        CentralEvent::StateUpdate { state } => log::info!("Adapter {:?}", state),
        CentralEvent::ScanResult(Ok(result)) => {
            log::info!("Found {} rssi={} services={:?}", result.id, result.rssi, result.service_uuids)
        }
        CentralEvent::ScanResult(Err(e)) => log::warn!("Scan error: {}", e),
        other => log::debug!("{:?}", other),
    }
}
