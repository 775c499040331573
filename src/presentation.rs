//! Device list rendering
//!
//! Sort state lives here, not in the registry; the registry only answers
//! `sorted_view` queries.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Local;
use log::info;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};

use crate::registry::{SightingRegistry, SortCriterion, SortDirection};
use crate::sighting::Sighting;

const EMPTY_MESSAGE: &str = "No devices found yet. Start a scan to discover nearby beacons.";

/// One formatted line of the device list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRow {
    pub name: String,
    pub address: String,
    pub signal: String,
    pub distance: String,
    pub last_seen: String,
    pub location: String,
}

impl From<&Sighting> for DeviceRow {
    fn from(sighting: &Sighting) -> Self {
        Self {
            name: sighting.display_name.clone(),
            address: sighting.address.clone(),
            signal: format!("{} dBm", sighting.signal_strength),
            distance: format_distance(sighting.estimated_distance),
            last_seen: sighting
                .observed_at
                .with_timezone(&Local)
                .format("%H:%M:%S")
                .to_string(),
            location: sighting
                .location
                .map(|location| location.to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

pub fn format_distance(distance: Option<f64>) -> String {
    match distance {
        Some(meters) => format!("{:.1}m", meters),
        None => "-".to_string(),
    }
}

/// Sortable view over a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceListView {
    criterion: SortCriterion,
    direction: SortDirection,
}

impl Default for DeviceListView {
    fn default() -> Self {
        Self {
            criterion: SortCriterion::LastSeen,
            direction: SortDirection::Descending,
        }
    }
}

impl DeviceListView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort(&self) -> (SortCriterion, SortDirection) {
        (self.criterion, self.direction)
    }

    /// Select a sort column the way a header click does
    ///
    /// The active column flips direction. A new column starts descending for
    /// signal strength and last seen, ascending otherwise.
    pub fn toggle_sort(&mut self, criterion: SortCriterion) {
        if criterion == self.criterion {
            self.direction = self.direction.reversed();
        } else {
            self.criterion = criterion;
            self.direction = match criterion {
                SortCriterion::SignalStrength | SortCriterion::LastSeen => SortDirection::Descending,
                SortCriterion::Name | SortCriterion::Address | SortCriterion::Distance => {
                    SortDirection::Ascending
                }
            };
        }
    }

    pub fn rows(&self, registry: &SightingRegistry) -> Vec<DeviceRow> {
        registry
            .sorted_view(self.criterion, self.direction)
            .iter()
            .map(DeviceRow::from)
            .collect()
    }

    /// Plain-text table of the current registry contents
    pub fn render(&self, registry: &SightingRegistry) -> String {
        let rows = self.rows(registry);
        if rows.is_empty() {
            return format!("{}\n", EMPTY_MESSAGE);
        }

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} device{} (sorted by {:?}, {:?})",
            rows.len(),
            if rows.len() == 1 { "" } else { "s" },
            self.criterion,
            self.direction
        );
        let _ = writeln!(
            out,
            "{:<24} {:<18} {:>8} {:>8} {:>9}  {}",
            "NAME", "ADDRESS", "RSSI", "DIST", "SEEN", "LOCATION"
        );
        for row in &rows {
            let _ = writeln!(
                out,
                "{:<24} {:<18} {:>8} {:>8} {:>9}  {}",
                truncate(&row.name, 24),
                row.address,
                row.signal,
                row.distance,
                row.last_seen,
                row.location
            );
        }
        out
    }

    /// Sorted snapshots, one now and one after every registry mutation
    pub fn updates(
        &self,
        registry: Arc<SightingRegistry>,
    ) -> impl Stream<Item = Vec<Sighting>> + Send + 'static {
        let (criterion, direction) = self.sort();
        WatchStream::new(registry.subscribe())
            .map(move |_| registry.sorted_view(criterion, direction))
    }

    /// User-initiated reset of the list
    pub fn clear(&self, registry: &SightingRegistry) {
        let removed = registry.len();
        registry.clear();
        info!("Device list cleared ({} devices)", removed);
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
    cut.push('~');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sighting::Location;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn sighting(address: &str, rssi: i16, distance: Option<f64>, secs: i64) -> Sighting {
        Sighting {
            address: address.to_string(),
            display_name: format!("dev-{}", address),
            signal_strength: rssi,
            estimated_distance: distance,
            observed_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            location: None,
        }
    }

    #[test]
    fn test_toggle_sort() {
        let mut view = DeviceListView::new();
        assert_eq!(view.sort(), (SortCriterion::LastSeen, SortDirection::Descending));

        view.toggle_sort(SortCriterion::LastSeen);
        assert_eq!(view.sort(), (SortCriterion::LastSeen, SortDirection::Ascending));

        view.toggle_sort(SortCriterion::Name);
        assert_eq!(view.sort(), (SortCriterion::Name, SortDirection::Ascending));

        view.toggle_sort(SortCriterion::SignalStrength);
        assert_eq!(view.sort(), (SortCriterion::SignalStrength, SortDirection::Descending));

        view.toggle_sort(SortCriterion::Distance);
        assert_eq!(view.sort(), (SortCriterion::Distance, SortDirection::Ascending));
        view.toggle_sort(SortCriterion::Distance);
        assert_eq!(view.sort(), (SortCriterion::Distance, SortDirection::Descending));
    }

    #[test]
    fn test_row_formatting() {
        let mut with_fix = sighting("AA:BB", -61, Some(1.1220), 0);
        with_fix.location = Some(Location::new(48.856613, 2.352222));
        let row = DeviceRow::from(&with_fix);

        assert_eq!(row.distance, "1.1m");
        assert_eq!(row.signal, "-61 dBm");
        assert_eq!(row.location, "48.85661, 2.35222");
        assert_eq!(
            row.last_seen,
            with_fix.observed_at.with_timezone(&Local).format("%H:%M:%S").to_string()
        );

        let row = DeviceRow::from(&sighting("CC:DD", -90, None, 0));
        assert_eq!(row.distance, "-");
        assert_eq!(row.location, "-");
    }

    #[test]
    fn test_rows_follow_sort_state() {
        let registry = SightingRegistry::new();
        registry.upsert(sighting("01", -70, Some(5.0), 1));
        registry.upsert(sighting("02", -40, Some(0.5), 3));
        registry.upsert(sighting("03", -90, None, 2));

        let mut view = DeviceListView::new();
        let order: Vec<_> = view.rows(&registry).into_iter().map(|r| r.address).collect();
        assert_eq!(order, vec!["02", "03", "01"]);

        view.toggle_sort(SortCriterion::Distance);
        let order: Vec<_> = view.rows(&registry).into_iter().map(|r| r.address).collect();
        assert_eq!(order, vec!["02", "01", "03"]);
    }

    #[test]
    fn test_render_empty_and_populated() {
        let registry = SightingRegistry::new();
        let view = DeviceListView::new();
        assert_eq!(view.render(&registry), format!("{}\n", EMPTY_MESSAGE));

        registry.upsert(sighting("AA:BB", -59, Some(1.0), 0));
        let text = view.render(&registry);
        assert!(text.starts_with("1 device (sorted by LastSeen, Descending)"));
        assert!(text.contains("dev-AA:BB"));
        assert!(text.contains("1.0m"));

        view.clear(&registry);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_truncate_long_names() {
        assert_eq!(truncate("short", 8), "short");
        assert_eq!(truncate("a very long name", 8), "a very ~");
    }

    #[tokio::test]
    async fn test_updates_stream_follows_registry() {
        let registry = Arc::new(SightingRegistry::new());
        let view = DeviceListView::new();
        let mut updates = Box::pin(view.updates(Arc::clone(&registry)));

        let first = updates.next().await.unwrap();
        assert!(first.is_empty());

        registry.upsert(sighting("AA:BB", -60, None, 0));
        let second = updates.next().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].address, "AA:BB");
    }
}
