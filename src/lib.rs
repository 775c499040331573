// Root module exports
pub mod bluetooth;
pub mod config;
pub mod dedup;
pub mod distance;
pub mod error;
pub mod location;
pub mod logging;
pub mod orchestrator;
pub mod presentation;
pub mod registry;
pub mod sighting;
pub mod store;

// Re-exports for convenience
pub use bluetooth::{BtleplugRadio, RadioEvent, RadioSource, ScanSettings};
pub use config::AppConfig;
pub use dedup::SessionDeduplicator;
pub use distance::{estimate_distance, DistanceModel};
pub use error::{ErrorKind, ScanError, StoreError};
pub use location::{FixedLocation, LocationSource, LocationTracker, NoLocation};
pub use orchestrator::{EventOutcome, ScanOrchestrator, ScanState};
pub use presentation::{DeviceListView, DeviceRow};
pub use registry::{SightingRegistry, SortCriterion, SortDirection};
pub use sighting::{AuthorizationState, Location, RawEvent, SessionId, Sighting};
pub use store::{SightingSink, SightingStore};
