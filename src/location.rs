//! Location fixes attached to sightings

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{channel, Receiver};
use tokio::task::JoinHandle;

use crate::error::LocationError;
use crate::sighting::Location;

/// How often fixes are wanted and how long one stays usable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationRequest {
    pub interval: Duration,
    pub fastest_interval: Duration,
    pub max_fix_age: Duration,
}

impl Default for LocationRequest {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            fastest_interval: Duration::from_secs(5),
            max_fix_age: Duration::from_secs(60),
        }
    }
}

/// A provider of location fixes
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn start_updates(&self, request: &LocationRequest) -> Result<Receiver<Location>, LocationError>;

    async fn stop_updates(&self);
}

/// Latest known fix, with staleness
pub struct LocationTracker {
    latest: RwLock<Option<(Location, Instant)>>,
    max_fix_age: Duration,
    feeder: Mutex<Option<JoinHandle<()>>>,
}

impl LocationTracker {
    pub fn new(max_fix_age: Duration) -> Self {
        Self {
            latest: RwLock::new(None),
            max_fix_age,
            feeder: Mutex::new(None),
        }
    }

    /// The latest fix, unless it is older than `max_fix_age`
    pub fn current(&self) -> Option<Location> {
        let latest = self.latest.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        match *latest {
            Some((location, at)) if at.elapsed() <= self.max_fix_age => Some(location),
            _ => None,
        }
    }

    pub fn update(&self, location: Location) {
        let mut latest = self.latest.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *latest = Some((location, Instant::now()));
    }

    /// Apply fixes from `rx` on a background task until it closes or `stop` is called
    pub fn feed(self: &Arc<Self>, mut rx: Receiver<Location>) {
        let tracker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(location) = rx.recv().await {
                debug!("Location fix {}", location);
                tracker.update(location);
            }
            debug!("Location feed closed");
        });

        let mut feeder = self.feeder.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = feeder.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the feed and forget the last fix
    pub fn stop(&self) {
        let handle = self
            .feeder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        *self.latest.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

/// A source that always reports the same coordinates
pub struct FixedLocation {
    location: Location,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl FixedLocation {
    pub fn new(location: Location) -> Self {
        Self {
            location,
            ticker: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LocationSource for FixedLocation {
    async fn start_updates(&self, request: &LocationRequest) -> Result<Receiver<Location>, LocationError> {
        let (tx, rx) = channel(1);
        let location = self.location;
        let period = request.interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            loop {
                ticks.tick().await;
                if tx.send(location).await.is_err() {
                    break;
                }
            }
        });

        let previous = self
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!("Reporting fixed location {}", location);
        Ok(rx)
    }

    async fn stop_updates(&self) {
        let handle = self
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// A source with no provider behind it
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLocation;

#[async_trait]
impl LocationSource for NoLocation {
    async fn start_updates(&self, _request: &LocationRequest) -> Result<Receiver<Location>, LocationError> {
        Err(LocationError::Unavailable("no location provider configured".into()))
    }

    async fn stop_updates(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_request() {
        let request = LocationRequest::default();
        assert_eq!(request.interval, Duration::from_secs(10));
        assert_eq!(request.fastest_interval, Duration::from_secs(5));
        assert_eq!(request.max_fix_age, Duration::from_secs(60));
    }

    #[test]
    fn test_stale_fix_is_ignored() {
        let tracker = LocationTracker::new(Duration::from_millis(30));
        assert_eq!(tracker.current(), None);

        tracker.update(Location::new(1.0, 2.0));
        assert_eq!(tracker.current(), Some(Location::new(1.0, 2.0)));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(tracker.current(), None);
    }

    #[tokio::test]
    async fn test_fixed_location_feeds_tracker() {
        let source = FixedLocation::new(Location::new(48.85, 2.35));
        let tracker = Arc::new(LocationTracker::new(Duration::from_secs(60)));

        let rx = source.start_updates(&LocationRequest::default()).await.unwrap();
        tracker.feed(rx);

        for _ in 0..50 {
            if tracker.current().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tracker.current(), Some(Location::new(48.85, 2.35)));

        source.stop_updates().await;
        tracker.stop();
        assert_eq!(tracker.current(), None);
    }

    #[tokio::test]
    async fn test_no_location_is_unavailable() {
        let err = NoLocation.start_updates(&LocationRequest::default()).await.unwrap_err();
        assert!(matches!(err, LocationError::Unavailable(_)));
    }
}
