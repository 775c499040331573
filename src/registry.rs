//! Latest sighting per device
//!
//! The registry is an explicitly constructed component shared through `Arc`.
//! Every mutation bumps a change counter published on a `watch` channel so
//! views can re-sort lazily; a view may lag one write behind but always
//! catches up on its next `changed()`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::sighting::Sighting;

/// Column a device list can be sorted by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortCriterion {
    Name,
    Address,
    SignalStrength,
    Distance,
    LastSeen,
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn reversed(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }
}

/// Most recent sighting per address
pub struct SightingRegistry {
    entries: RwLock<HashMap<String, Sighting>>,
    changes: watch::Sender<u64>,
}

impl Default for SightingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SightingRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            entries: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Replace the entry for `sighting.address`
    pub fn upsert(&self, sighting: Sighting) {
        {
            let mut entries = self.write();
            if entries.insert(sighting.address.clone(), sighting).is_none() {
                debug!("Registry now tracks {} devices", entries.len());
            }
        }
        self.changes.send_modify(|version| *version += 1);
    }

    /// Remove every entry
    pub fn clear(&self) {
        let removed = {
            let mut entries = self.write();
            let removed = entries.len();
            entries.clear();
            removed
        };
        debug!("Registry cleared ({} devices removed)", removed);
        self.changes.send_modify(|version| *version += 1);
    }

    /// All current entries, in no particular order
    pub fn snapshot(&self) -> Vec<Sighting> {
        self.read().values().cloned().collect()
    }

    /// All current entries sorted for display; ties are broken by address
    pub fn sorted_view(&self, criterion: SortCriterion, direction: SortDirection) -> Vec<Sighting> {
        let mut sightings = self.snapshot();
        sort_sightings(&mut sightings, criterion, direction);
        sightings
    }

    pub fn get(&self, address: &str) -> Option<Sighting> {
        self.read().get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Receiver of the change counter
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// A sorted, self-refreshing view over this registry
    pub fn view(
        self: &Arc<Self>,
        criterion: SortCriterion,
        direction: SortDirection,
    ) -> RegistryView {
        RegistryView {
            registry: Arc::clone(self),
            changes: self.subscribe(),
            criterion,
            direction,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Sighting>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Sighting>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sort in place by `criterion`, falling back to address order
///
/// Missing distances sort last in either direction.
pub fn sort_sightings(sightings: &mut [Sighting], criterion: SortCriterion, direction: SortDirection) {
    sightings.sort_by(|a, b| {
        let primary = match criterion {
            SortCriterion::Distance => {
                match (a.estimated_distance, b.estimated_distance) {
                    (Some(x), Some(y)) => directed(x.total_cmp(&y), direction),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            }
            SortCriterion::Name => directed(
                a.display_name.to_lowercase().cmp(&b.display_name.to_lowercase()),
                direction,
            ),
            SortCriterion::Address => directed(a.address.cmp(&b.address), direction),
            SortCriterion::SignalStrength => {
                directed(a.signal_strength.cmp(&b.signal_strength), direction)
            }
            SortCriterion::LastSeen => directed(a.observed_at.cmp(&b.observed_at), direction),
        };
        primary.then_with(|| a.address.cmp(&b.address))
    });
}

fn directed(ordering: Ordering, direction: SortDirection) -> Ordering {
    match direction {
        SortDirection::Ascending => ordering,
        SortDirection::Descending => ordering.reverse(),
    }
}

/// Sorted view that knows when the registry changed
pub struct RegistryView {
    registry: Arc<SightingRegistry>,
    changes: watch::Receiver<u64>,
    criterion: SortCriterion,
    direction: SortDirection,
}

impl RegistryView {
    /// Sorted entries as of now
    pub fn current(&mut self) -> Vec<Sighting> {
        let _ = self.changes.borrow_and_update();
        self.registry.sorted_view(self.criterion, self.direction)
    }

    /// Wait for the next mutation and return the re-sorted entries
    ///
    /// Returns `None` once the registry has been dropped.
    pub async fn changed(&mut self) -> Option<Vec<Sighting>> {
        self.changes.changed().await.ok()?;
        Some(self.current())
    }

    /// Change sort parameters; takes effect on the next read
    pub fn set_sort(&mut self, criterion: SortCriterion, direction: SortDirection) {
        self.criterion = criterion;
        self.direction = direction;
    }

    pub fn sort(&self) -> (SortCriterion, SortDirection) {
        (self.criterion, self.direction)
    }

    pub fn has_changed(&self) -> bool {
        self.changes.has_changed().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn sighting(address: &str, name: &str, rssi: i16, distance: Option<f64>, secs: i64) -> Sighting {
        Sighting {
            address: address.to_string(),
            display_name: name.to_string(),
            signal_strength: rssi,
            estimated_distance: distance,
            observed_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs),
            location: None,
        }
    }

    fn addresses(sightings: &[Sighting]) -> Vec<&str> {
        sightings.iter().map(|s| s.address.as_str()).collect()
    }

    #[test]
    fn test_last_write_wins() {
        let registry = SightingRegistry::new();
        registry.upsert(sighting("AA:BB", "a", -50, Some(1.0), 0));
        registry.upsert(sighting("AA:BB", "a", -90, Some(50.0), 1));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].signal_strength, -90);
    }

    #[test]
    fn test_clear_empties_registry() {
        let registry = SightingRegistry::new();
        for i in 0..5 {
            registry.upsert(sighting(&format!("0{}", i), "x", -60, None, i));
        }
        assert_eq!(registry.len(), 5);

        registry.clear();
        assert!(registry.snapshot().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sort_by_signal_strength() {
        let registry = SightingRegistry::new();
        registry.upsert(sighting("01", "x", -70, None, 0));
        registry.upsert(sighting("02", "x", -40, None, 0));
        registry.upsert(sighting("03", "x", -90, None, 0));

        let view = registry.sorted_view(SortCriterion::SignalStrength, SortDirection::Descending);
        assert_eq!(addresses(&view), vec!["02", "01", "03"]);

        let view = registry.sorted_view(SortCriterion::SignalStrength, SortDirection::Ascending);
        assert_eq!(addresses(&view), vec!["03", "01", "02"]);
    }

    #[test]
    fn test_sort_by_name_is_case_insensitive() {
        let registry = SightingRegistry::new();
        registry.upsert(sighting("01", "beta", -70, None, 0));
        registry.upsert(sighting("02", "Alpha", -70, None, 0));
        registry.upsert(sighting("03", "gamma", -70, None, 0));

        let view = registry.sorted_view(SortCriterion::Name, SortDirection::Ascending);
        assert_eq!(addresses(&view), vec!["02", "01", "03"]);
    }

    #[test]
    fn test_missing_distance_sorts_last_both_ways() {
        let registry = SightingRegistry::new();
        registry.upsert(sighting("01", "x", -70, None, 0));
        registry.upsert(sighting("02", "x", -70, Some(3.0), 0));
        registry.upsert(sighting("03", "x", -70, Some(1.0), 0));

        let view = registry.sorted_view(SortCriterion::Distance, SortDirection::Ascending);
        assert_eq!(addresses(&view), vec!["03", "02", "01"]);

        let view = registry.sorted_view(SortCriterion::Distance, SortDirection::Descending);
        assert_eq!(addresses(&view), vec!["02", "03", "01"]);
    }

    #[test]
    fn test_ties_break_on_address() {
        let registry = SightingRegistry::new();
        registry.upsert(sighting("CC", "x", -70, None, 5));
        registry.upsert(sighting("AA", "x", -70, None, 5));
        registry.upsert(sighting("BB", "x", -70, None, 5));

        for direction in [SortDirection::Ascending, SortDirection::Descending] {
            let view = registry.sorted_view(SortCriterion::LastSeen, direction);
            assert_eq!(addresses(&view), vec!["AA", "BB", "CC"]);
        }
    }

    #[tokio::test]
    async fn test_view_sees_mutations() {
        let registry = Arc::new(SightingRegistry::new());
        let mut view = registry.view(SortCriterion::Address, SortDirection::Ascending);
        assert!(view.current().is_empty());

        registry.upsert(sighting("02", "x", -70, None, 0));
        registry.upsert(sighting("01", "x", -70, None, 0));
        assert!(view.has_changed());

        let entries = view.changed().await.unwrap();
        assert_eq!(addresses(&entries), vec!["01", "02"]);

        view.set_sort(SortCriterion::Address, SortDirection::Descending);
        assert_eq!(addresses(&view.current()), vec!["02", "01"]);
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let registry = Arc::new(SightingRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        registry.upsert(sighting(&format!("{}-{}", t, i), "x", -60, None, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 800);
        assert_eq!(*registry.subscribe().borrow(), 800);
    }
}
