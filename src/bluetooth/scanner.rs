use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, PeripheralId};
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::bluetooth::adapter::select_adapter;
use crate::bluetooth::{RadioEvent, RadioSource};
use crate::distance::INVALID_RSSI;
use crate::error::RadioError;
use crate::sighting::RawEvent;

/// Scanner settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Capacity of the channel between the radio task and the consumer
    pub event_buffer: usize,
    /// Adapter initialization attempts
    pub max_retries: u8,
    /// Delay between adapter initialization attempts
    pub retry_delay: Duration,
    /// Reports weaker than this are dropped at the radio
    pub min_rssi: Option<i16>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            event_buffer: 100,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            min_rssi: None,
        }
    }
}

/// Build the raw event for one advertisement report
///
/// Returns `None` when the reading is below `min_rssi`. A missing RSSI is
/// reported as 0, which the distance model treats as "no reading".
pub fn advertisement_from(
    address: String,
    rssi: Option<i16>,
    local_name: Option<String>,
    min_rssi: Option<i16>,
) -> Option<RawEvent> {
    let signal_strength = rssi.unwrap_or(INVALID_RSSI);
    if let (Some(floor), Some(reading)) = (min_rssi, rssi) {
        if reading < floor {
            return None;
        }
    }
    Some(RawEvent::new(address, signal_strength, local_name))
}

struct ScanTask {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Radio source backed by the platform Bluetooth stack
#[derive(Default)]
pub struct BtleplugRadio {
    adapter: Mutex<Option<Arc<Adapter>>>,
    scan: Mutex<Option<ScanTask>>,
}

impl BtleplugRadio {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_init_adapter(&self, settings: &ScanSettings) -> Result<Arc<Adapter>, RadioError> {
        let mut slot = self.adapter.lock().await;
        if let Some(adapter) = slot.as_ref() {
            return Ok(Arc::clone(adapter));
        }
        let adapter = Arc::new(select_adapter(settings.max_retries, settings.retry_delay).await?);
        *slot = Some(Arc::clone(&adapter));
        Ok(adapter)
    }

    pub async fn is_scanning(&self) -> bool {
        self.scan.lock().await.is_some()
    }
}

#[async_trait]
impl RadioSource for BtleplugRadio {
    async fn start_scan(&self, settings: &ScanSettings) -> Result<Receiver<RadioEvent>, RadioError> {
        let mut scan = self.scan.lock().await;
        if scan.is_some() {
            return Err(RadioError::Platform("Scanning is already in progress".into()));
        }

        let adapter = self.get_or_init_adapter(settings).await?;
        let events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;

        let (event_tx, event_rx) = channel(settings.event_buffer.max(1));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(run_scan(adapter, events, event_tx, cancel_rx, settings.min_rssi));

        *scan = Some(ScanTask {
            cancel: cancel_tx,
            handle,
        });
        info!("Radio scan started");
        Ok(event_rx)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        let task = self.scan.lock().await.take().ok_or(RadioError::NotScanning)?;

        if task.cancel.send(()).is_err() {
            debug!("Scan task already finished before cancel");
        }
        if let Err(e) = task.handle.await {
            warn!("Error waiting for scan task to complete: {}", e);
        }

        info!("Radio scan stopped");
        Ok(())
    }
}

type CentralEvents = std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>;

async fn run_scan(
    adapter: Arc<Adapter>,
    mut events: CentralEvents,
    event_tx: Sender<RadioEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
    min_rssi: Option<i16>,
) {
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                debug!("Scan task cancelled");
                break;
            }
            event = events.next() => match event {
                Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                    let Some(raw) = read_advertisement(&adapter, &id, min_rssi).await else {
                        continue;
                    };
                    if event_tx.send(RadioEvent::Advertisement(raw)).await.is_err() {
                        debug!("Event receiver dropped, ending scan task");
                        break;
                    }
                }
                Some(_) => {}
                None => {
                    error!("Adapter event stream ended unexpectedly");
                    let failure = RadioError::Platform("adapter event stream ended".into());
                    let _ = event_tx.send(RadioEvent::Failure(failure)).await;
                    break;
                }
            }
        }
    }

    if let Err(e) = adapter.stop_scan().await {
        warn!("Failed to stop scan during cleanup: {}", e);
    }
}

async fn read_advertisement(
    adapter: &Adapter,
    id: &PeripheralId,
    min_rssi: Option<i16>,
) -> Option<RawEvent> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(e) => {
            warn!("Error looking up peripheral {:?}: {}", id, e);
            return None;
        }
    };
    match peripheral.properties().await {
        Ok(Some(props)) => {
            advertisement_from(props.address.to_string(), props.rssi, props.local_name, min_rssi)
        }
        Ok(None) => {
            debug!("No properties for peripheral {:?}", id);
            None
        }
        Err(e) => {
            warn!("Error getting peripheral properties: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = ScanSettings::default();
        assert_eq!(settings.event_buffer, 100);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.retry_delay, Duration::from_secs(1));
        assert_eq!(settings.min_rssi, None);
    }

    #[test]
    fn test_missing_rssi_becomes_invalid_reading() {
        let raw = advertisement_from("AA:BB".into(), None, Some("Tag".into()), Some(-80)).unwrap();
        assert_eq!(raw.signal_strength, INVALID_RSSI);
        assert_eq!(raw.raw_name.as_deref(), Some("Tag"));
    }

    #[test]
    fn test_weak_readings_are_filtered() {
        assert!(advertisement_from("AA:BB".into(), Some(-95), None, Some(-80)).is_none());
        assert!(advertisement_from("AA:BB".into(), Some(-80), None, Some(-80)).is_some());
        assert!(advertisement_from("AA:BB".into(), Some(-95), None, None).is_some());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_rejected() {
        let radio = BtleplugRadio::new();
        assert!(!radio.is_scanning().await);
        assert_eq!(radio.stop_scan().await, Err(RadioError::NotScanning));
    }
}
