use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, trace};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::api::central::ScanFilter;
use crate::api::peripheral::SimulatedPeripheral;
use crate::simulation::checks::{ensure_adapter_ready, ensure_scan_not_in_progress};
use crate::simulation::{AdapterStateReader, ScanResultSink};
use crate::{Result, lock};

/// Smallest advertisement interval the scan loop honours.
const MIN_ADVERTISEMENT_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Default)]
struct ScanState {
    filter: ScanFilter,
    sink: Option<ScanResultSink>,
    timers: Vec<JoinHandle<()>>,
}

/// Replays each matching peripheral's advertisement at its own interval
/// for as long as a scan is running.
pub struct ScanDelegate {
    adapter: Arc<dyn AdapterStateReader>,
    scan: Arc<Mutex<ScanState>>,
}

impl ScanDelegate {
    pub fn new(adapter: Arc<dyn AdapterStateReader>) -> Self {
        ScanDelegate {
            adapter,
            scan: Arc::new(Mutex::new(ScanState::default())),
        }
    }

    pub fn is_scan_in_progress(&self) -> bool {
        lock(&self.scan).sink.is_some()
    }

    pub fn start_scan(
        &self,
        peripherals: &[SimulatedPeripheral],
        filter: ScanFilter,
        sink: ScanResultSink,
    ) -> Result<()> {
        trace!("start_scan {:?}", filter.services);
        ensure_adapter_ready(self.adapter.adapter_state())?;
        let mut scan = lock(&self.scan);
        ensure_scan_not_in_progress(scan.sink.is_some())?;
        scan.filter = filter;
        scan.sink = Some(sink);
        for peripheral in peripherals {
            self.arm(&mut scan, peripheral);
        }
        debug!("Scan started with {} advertising peripherals", scan.timers.len());
        Ok(())
    }

    /// Makes a peripheral added mid-scan show up without restarting the scan.
    pub fn add_peripheral(&self, peripheral: &SimulatedPeripheral) {
        let mut scan = lock(&self.scan);
        if scan.sink.is_some() {
            self.arm(&mut scan, peripheral);
        }
    }

    pub fn stop_scan(&self) {
        trace!("stop_scan");
        stop(&self.scan);
    }

    fn arm(&self, scan: &mut ScanState, peripheral: &SimulatedPeripheral) {
        if !scan.filter.matches(&peripheral.scan_info().service_uuids) {
            return;
        }
        let timer = tokio::spawn(advertise(
            peripheral.clone(),
            self.adapter.clone(),
            Arc::downgrade(&self.scan),
        ));
        scan.timers.push(timer);
    }
}

impl Drop for ScanDelegate {
    fn drop(&mut self) {
        stop(&self.scan);
    }
}

fn stop(scan: &Mutex<ScanState>) {
    let timers = {
        let mut scan = lock(scan);
        scan.sink = None;
        scan.filter = ScanFilter::default();
        std::mem::take(&mut scan.timers)
    };
    for timer in timers {
        timer.abort();
    }
}

async fn advertise(
    peripheral: SimulatedPeripheral,
    adapter: Arc<dyn AdapterStateReader>,
    scan: Weak<Mutex<ScanState>>,
) {
    let period = peripheral
        .advertisement_interval()
        .max(MIN_ADVERTISEMENT_INTERVAL);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(scan) = scan.upgrade() else {
            return;
        };
        let Some(sink) = lock(&scan).sink.clone() else {
            return;
        };
        if let Err(error) = ensure_adapter_ready(adapter.adapter_state()) {
            debug!("Adapter lost while scanning, stopping scan");
            stop(&scan);
            sink(Err(error));
            return;
        }
        sink(Ok(peripheral.get_scan_result()));
    }
}
