//! BLE radio access
//!
//! The orchestrator only sees the `RadioSource` trait; `BtleplugRadio` is the
//! platform implementation.

mod adapter;
mod scanner;

use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;

use crate::error::RadioError;
use crate::sighting::RawEvent;

pub use adapter::{list_adapters, select_adapter, AdapterInfo};
pub use scanner::{advertisement_from, BtleplugRadio, ScanSettings};

/// What a radio source delivers while scanning
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// One advertisement report
    Advertisement(RawEvent),
    /// The radio hit an error; fatal ones end the session
    Failure(RadioError),
}

/// A source of advertisement reports
#[async_trait]
pub trait RadioSource: Send + Sync {
    /// Begin scanning; events arrive on the returned channel until `stop_scan`
    async fn start_scan(&self, settings: &ScanSettings) -> Result<Receiver<RadioEvent>, RadioError>;

    /// Stop scanning and release the radio
    async fn stop_scan(&self) -> Result<(), RadioError>;
}
