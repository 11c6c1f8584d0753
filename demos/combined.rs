use std::time::Duration;

use log::LevelFilter;
use rustycore_sim::api::central::uuid_from_u16;
use rustycore_sim::api::central_event::CentralEvent;
use rustycore_sim::api::characteristic::{Characteristic, CharacteristicProperty};
use rustycore_sim::api::peripheral::{PeripheralDefinition, SimulatedPeripheral};
use rustycore_sim::api::service::Service;
use rustycore_sim::{Result, SimulationManager};
use tokio::sync::mpsc;

const HEART_RATE: u16 = 0x180D;
const MEASUREMENT: u16 = 0x2A37;

#[tokio::main]
async fn main() {
    pretty_env_logger::formatted_builder()
        .filter_level(LevelFilter::Info)
        .init();

    let (sender_tx, mut receiver_rx) = mpsc::channel::<CentralEvent>(256);
    tokio::spawn(async move {
        while let Some(event) = receiver_rx.recv().await {
            handle_central_updates(event);
        }
    });

    let peripheral = heart_rate_monitor();
    let manager = SimulationManager::default();
    manager.create_client(sender_tx);
    manager.add_peripheral(peripheral.clone());

    if let Err(e) = run_session(&manager, &peripheral).await {
        log::error!("Session failed: {}", e);
    }
    manager.destroy_client();
}

/// Central side connects and subscribes while the peripheral side pushes
/// measurements, all inside one process.
async fn run_session(manager: &SimulationManager, peripheral: &SimulatedPeripheral) -> Result<()> {
    let device = manager.connect(peripheral.id(), Some(247)).await?;
    log::info!("Connected to {} with mtu {}", device.id, device.mtu);
    let services = manager.discovery(peripheral.id(), "discovery").await?;
    log::info!("Discovered {} services", services.len());

    manager.monitor_characteristic_for_device(
        peripheral.id(),
        uuid_from_u16(HEART_RATE),
        uuid_from_u16(MEASUREMENT),
        "heart-rate",
    )?;
    for bpm in [62u8, 64, 71, 69] {
        peripheral.update_characteristic(uuid_from_u16(HEART_RATE), uuid_from_u16(MEASUREMENT), &[0, bpm])?;
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    manager.cancel_transaction("heart-rate");
    manager.disconnect(peripheral.id())?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

fn heart_rate_monitor() -> SimulatedPeripheral {
    SimulatedPeripheral::new(PeripheralDefinition {
        id: "hrm".to_string(),
        name: Some("Heart Rate Monitor".to_string()),
        connection_delay: Duration::from_millis(100),
        services: vec![Service {
            uuid: uuid_from_u16(HEART_RATE),
            is_advertised: true,
            characteristics: vec![Characteristic {
                uuid: uuid_from_u16(MEASUREMENT),
                properties: vec![CharacteristicProperty::Notify],
                value: Some(vec![0, 60]),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    })
}

/// Listen to all updates and log them
pub fn handle_central_updates(update: CentralEvent) {
    match update {
        CentralEvent::StateUpdate { state } => log::info!("Adapter {:?}", state),
        CentralEvent::ConnectionStateChanged { device_id, state } => {
            log::info!("{} -> {:?}", device_id, state)
        }
        CentralEvent::CharacteristicNotification {
            transaction_id,
            characteristic: Ok(characteristic),
        } => log::info!("[{}] {:?}", transaction_id, characteristic.value),
        CentralEvent::CharacteristicNotification {
            transaction_id,
            characteristic: Err(e),
        } => log::warn!("[{}] {}", transaction_id, e),
        CentralEvent::ScanResult(result) => log::debug!("{:?}", result),
    }
}
