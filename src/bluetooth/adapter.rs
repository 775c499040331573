use std::fmt;
use std::time::Duration;

use btleplug::api::{Central, Manager as _};
use btleplug::platform::{Adapter, Manager};
use log::{debug, info, warn};
use tokio::time::sleep;

use crate::error::RadioError;

/// Information about a Bluetooth adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Adapter index
    pub index: usize,
    /// Adapter name or identifier
    pub name: String,
    /// Whether this is the adapter a scan would use
    pub is_default: bool,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{}: {}{}",
            self.index,
            self.name,
            if self.is_default { " (default)" } else { "" }
        )
    }
}

/// Enumerate the adapters the platform exposes
pub async fn list_adapters() -> Result<Vec<AdapterInfo>, RadioError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    let mut infos = Vec::with_capacity(adapters.len());
    for (index, adapter) in adapters.iter().enumerate() {
        infos.push(AdapterInfo {
            index,
            name: adapter_name(adapter, index).await,
            is_default: index == 0,
        });
    }
    Ok(infos)
}

/// Pick the first adapter, retrying while the platform is still bringing it up
pub async fn select_adapter(max_retries: u8, retry_delay: Duration) -> Result<Adapter, RadioError> {
    let max_attempts = max_retries.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        debug!("Initializing adapter (attempt {}/{})", attempts, max_attempts);

        match try_select().await {
            Ok(adapter) => {
                info!("Using adapter {}", adapter_name(&adapter, 0).await);
                return Ok(adapter);
            }
            Err(err) if is_retryable(&err) && attempts < max_attempts => {
                warn!(
                    "Adapter initialization failed: {}. Retrying ({}/{})",
                    err, attempts, max_attempts
                );
                sleep(retry_delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn try_select() -> Result<Adapter, RadioError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(RadioError::AdapterNotFound)
}

fn is_retryable(err: &RadioError) -> bool {
    !matches!(err, RadioError::PermissionDenied(_))
}

async fn adapter_name(adapter: &Adapter, index: usize) -> String {
    match adapter.adapter_info().await {
        Ok(info) => info,
        Err(_) => format!("BluetoothAdapter{}", index),
    }
}
