//! Error types for blescout
//!
//! Each layer owns a `thiserror` enum; `ScanError` is what the orchestrator
//! surfaces to callers and maps every failure onto one recovery category.

use thiserror::Error;

use crate::orchestrator::ScanState;

/// Errors raised by a radio source
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RadioError {
    /// No usable Bluetooth adapter
    #[error("Failed to find a suitable Bluetooth adapter")]
    AdapterNotFound,

    /// The platform refused access to the radio
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Any other platform failure
    #[error("Bluetooth operation failed: {0}")]
    Platform(String),

    /// Stop requested while no scan is running
    #[error("Scan has not been started")]
    NotScanning,
}

impl RadioError {
    /// Whether this error makes further scanning impossible
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AdapterNotFound | Self::PermissionDenied(_))
    }
}

impl From<btleplug::Error> for RadioError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => {
                Self::PermissionDenied("Bluetooth access was refused".to_string())
            }
            other => Self::Platform(other.to_string()),
        }
    }
}

/// Errors raised by a location source
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Location unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by the sighting store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database version ({found}) is newer than supported schema ({supported})")]
    SchemaTooNew { found: i32, supported: i32 },

    #[error("database worker is not running")]
    WorkerUnavailable,

    #[error("invalid stored value: {0}")]
    Conversion(String),

    #[error("migration failed: {0}")]
    Migration(String),
}

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Recovery category of a scan failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Degrade gracefully and keep scanning
    AuthorizationMissing,
    /// Fatal to the orchestrator
    HardwareUnavailable,
    /// Logged, scanning continues
    Persistence,
    /// Single event dropped
    MalformedEvent,
    /// Operation called in the wrong lifecycle state
    Lifecycle,
}

/// Errors surfaced by the scan orchestrator
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Authorization missing: {0}")]
    AuthorizationMissing(String),

    #[error("Bluetooth hardware unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Cannot {action} while {state:?}")]
    InvalidTransition {
        state: ScanState,
        action: &'static str,
    },

    #[error("Radio error: {0}")]
    Radio(RadioError),
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthorizationMissing(_) => ErrorKind::AuthorizationMissing,
            Self::HardwareUnavailable(_) => ErrorKind::HardwareUnavailable,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::MalformedEvent(_) => ErrorKind::MalformedEvent,
            Self::InvalidTransition { .. } => ErrorKind::Lifecycle,
            Self::Radio(err) if err.is_fatal() => ErrorKind::HardwareUnavailable,
            Self::Radio(_) => ErrorKind::Lifecycle,
        }
    }

    /// Whether the orchestrator stays usable after this error
    ///
    /// Unrecoverable errors leave it `Failed`; everything else leaves it able
    /// to start again.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::HardwareUnavailable)
    }
}

impl From<RadioError> for ScanError {
    fn from(err: RadioError) -> Self {
        match err {
            RadioError::AdapterNotFound => Self::HardwareUnavailable(err.to_string()),
            RadioError::PermissionDenied(reason) => Self::AuthorizationMissing(reason),
            other => Self::Radio(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_error_fatality() {
        assert!(RadioError::AdapterNotFound.is_fatal());
        assert!(RadioError::PermissionDenied("no".into()).is_fatal());
        assert!(!RadioError::Platform("glitch".into()).is_fatal());
        assert!(!RadioError::NotScanning.is_fatal());
    }

    #[test]
    fn test_scan_error_kinds() {
        let err: ScanError = RadioError::AdapterNotFound.into();
        assert_eq!(err.kind(), ErrorKind::HardwareUnavailable);
        assert!(!err.is_recoverable());

        let err = ScanError::MalformedEvent("empty address".into());
        assert_eq!(err.kind(), ErrorKind::MalformedEvent);
        assert!(err.is_recoverable());

        let err: ScanError = RadioError::PermissionDenied("revoked".into()).into();
        assert_eq!(err.kind(), ErrorKind::AuthorizationMissing);
        assert!(err.is_recoverable());

        let err = ScanError::InvalidTransition { state: ScanState::Idle, action: "stop" };
        assert_eq!(err.kind(), ErrorKind::Lifecycle);
        assert_eq!(err.to_string(), "Cannot stop while Idle");
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::SchemaTooNew { found: 7, supported: 2 };
        assert_eq!(
            err.to_string(),
            "database version (7) is newer than supported schema (2)"
        );
    }
}
