//! Sighting data model
//!
//! A `Sighting` is built once per radio report and never mutated afterwards;
//! the registry replaces entries wholesale and the store appends copies.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Label used when a device name is unknown or may not be resolved
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// A geographic fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.5}, {:.5}", self.latitude, self.longitude)
    }
}

/// An advertisement as delivered by a radio source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Hardware address; may be empty if the platform reported garbage
    pub address: String,
    /// RSSI in dBm, 0 when the radio had no reading
    pub signal_strength: i16,
    /// Advertised name, if the platform exposed one
    pub raw_name: Option<String>,
}

impl RawEvent {
    pub fn new(address: impl Into<String>, signal_strength: i16, raw_name: Option<String>) -> Self {
        Self {
            address: address.into(),
            signal_strength,
            raw_name,
        }
    }
}

/// What the user has allowed this process to do
///
/// Evaluated at session start and at explicit checkpoints only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationState {
    pub scan_allowed: bool,
    pub name_resolution_allowed: bool,
    pub location_allowed: bool,
}

impl AuthorizationState {
    /// Everything granted
    pub fn full() -> Self {
        Self {
            scan_allowed: true,
            name_resolution_allowed: true,
            location_allowed: true,
        }
    }

    /// Scanning only, no names and no location
    pub fn scan_only() -> Self {
        Self {
            scan_allowed: true,
            name_resolution_allowed: false,
            location_allowed: false,
        }
    }
}

impl Default for AuthorizationState {
    fn default() -> Self {
        Self::full()
    }
}

/// One observed beacon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    pub address: String,
    pub display_name: String,
    pub signal_strength: i16,
    pub estimated_distance: Option<f64>,
    pub observed_at: DateTime<Utc>,
    pub location: Option<Location>,
}

impl Sighting {
    pub fn latitude(&self) -> Option<f64> {
        self.location.map(|l| l.latitude)
    }

    pub fn longitude(&self) -> Option<f64> {
        self.location.map(|l| l.longitude)
    }
}

/// Resolve the label shown for a device
pub fn display_name(raw_name: Option<&str>, name_resolution_allowed: bool) -> String {
    match raw_name.map(str::trim) {
        Some(name) if name_resolution_allowed && !name.is_empty() => name.to_string(),
        _ => UNKNOWN_DEVICE_NAME.to_string(),
    }
}

/// Identifier of one scan run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primary key of a stored sighting
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wall clock that never goes backwards
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.observe(Utc::now())
    }

    /// Fold a wall-clock reading into the clock
    pub fn observe(&self, reading: DateTime<Utc>) -> DateTime<Utc> {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = match *last {
            Some(previous) if previous > reading => previous,
            _ => reading,
        };
        *last = Some(next);
        next
    }
}
