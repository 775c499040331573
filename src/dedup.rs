//! Once-per-session admission for persistence

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

/// Remembers which addresses were already logged in the current scan session
#[derive(Debug, Default)]
pub struct SessionDeduplicator {
    seen: Mutex<HashSet<String>>,
}

impl SessionDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` the first time `address` is offered in this session
    pub fn admit(&self, address: &str) -> bool {
        let mut seen = self.lock();
        if seen.contains(address) {
            return false;
        }
        seen.insert(address.to_string())
    }

    /// Forget everything; the next session starts empty
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Addresses admitted so far in this session
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_admits_once_until_reset() {
        let dedup = SessionDeduplicator::new();
        assert!(dedup.admit("AA:BB"));
        assert!(!dedup.admit("AA:BB"));
        assert!(!dedup.admit("AA:BB"));
        assert!(dedup.admit("CC:DD"));
        assert_eq!(dedup.len(), 2);

        dedup.reset();
        assert!(dedup.is_empty());
        assert!(dedup.admit("AA:BB"));
    }

    #[test]
    fn test_racing_admits_yield_a_single_winner() {
        let dedup = Arc::new(SessionDeduplicator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = Arc::clone(&dedup);
                std::thread::spawn(move || dedup.admit("AA:BB"))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
    }
}
