//! In-memory set of queries for which the model is administratively
//! disabled.
//!
//! The set is process-wide but explicitly owned: the store creates one and
//! shares it with sessions. It is never persisted — losing it on restart
//! only means affected queries get re-evaluated by normal policy.

use std::collections::HashSet;

use parking_lot::RwLock;

const INITIAL_CAPACITY: usize = 128;

/// Memory-resident set of deactivated query fingerprints.
#[derive(Debug)]
pub struct DeactivatedQuerySet {
    hashes: RwLock<HashSet<i64>>,
}

impl DeactivatedQuerySet {
    /// Create an empty set. Starts small and grows as needed.
    pub fn new() -> Self {
        Self {
            hashes: RwLock::new(HashSet::with_capacity(INITIAL_CAPACITY)),
        }
    }

    /// Whether the query with the given fingerprint is deactivated.
    pub fn is_deactivated(&self, query_hash: i64) -> bool {
        self.hashes.read().contains(&query_hash)
    }

    /// Add a query fingerprint to the set. Idempotent.
    pub fn add(&self, query_hash: i64) {
        self.hashes.write().insert(query_hash);
    }

    /// Destroy and reinitialize the set.
    ///
    /// Used after out-of-band edits to the query-settings table, since the
    /// cached entries would otherwise be stale.
    pub fn invalidate(&self) {
        *self.hashes.write() = HashSet::with_capacity(INITIAL_CAPACITY);
    }

    /// Number of deactivated queries currently cached.
    pub fn len(&self) -> usize {
        self.hashes.read().len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.hashes.read().is_empty()
    }
}

impl Default for DeactivatedQuerySet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let set = DeactivatedQuerySet::new();
        assert!(!set.is_deactivated(42));

        set.add(42);
        assert!(set.is_deactivated(42));
        assert!(!set.is_deactivated(43));

        // Idempotent.
        set.add(42);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_invalidate_clears_everything() {
        let set = DeactivatedQuerySet::new();
        for hash in 0..200 {
            set.add(hash);
        }
        assert_eq!(set.len(), 200);

        set.invalidate();
        assert!(set.is_empty());
        assert!(!set.is_deactivated(0));
    }
}
