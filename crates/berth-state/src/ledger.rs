//! In-memory view of the cluster topology.
//!
//! A `Ledger` is owned by the coordinator task. Entries are keyed by name
//! (`namespace/name` for namespaced kinds) and iterate in ascending key order,
//! which makes first-fit placement deterministic.

use berth_core::Resource;
use std::collections::BTreeMap;
use tracing::debug;

/// What an upsert did to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The ledger already held this revision or a newer one
    Stale,
}

/// Ledger key of an object: `name` for cluster-scoped kinds, `namespace/name`
/// otherwise. Unnamed objects have no key.
pub fn ledger_key<T: Resource>(object: &T) -> Option<String> {
    let key = object.resource_key().ok()?;
    if key.is_namespaced() {
        Some(format!("{}/{}", key.namespace, key.name))
    } else {
        Some(key.name)
    }
}

/// Ledger key for a storage key of kind `T`
pub fn ledger_key_from_storage<T: Resource>(storage_key: &str) -> String {
    let prefix = T::gvk().storage_prefix();
    storage_key
        .strip_prefix(prefix.as_str())
        .unwrap_or(storage_key)
        .to_string()
}

#[derive(Debug, Clone)]
pub struct Ledger<T> {
    entries: BTreeMap<String, T>,
}

impl<T> Default for Ledger<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: Resource> Ledger<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        self.entries.get_mut(key)
    }

    /// Entries in ascending key order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    /// Cloned snapshot, in ascending key order
    pub fn list(&self) -> Vec<T> {
        self.entries.values().cloned().collect()
    }

    /// Insert or replace an entry.
    ///
    /// An object carrying a store revision only replaces an entry with an
    /// older revision (or none). Objects without a revision always apply.
    pub fn upsert(&mut self, object: T) -> UpsertOutcome {
        let Some(key) = ledger_key(&object) else {
            debug!("Ignoring unnamed {}", T::KIND);
            return UpsertOutcome::Stale;
        };

        match self.entries.get(&key) {
            Some(held) => {
                if let (Some(incoming), Some(current)) = (object.revision(), held.revision()) {
                    if incoming <= current {
                        debug!(
                            "Ignoring stale {} {} at revision {} (holding {})",
                            T::KIND,
                            key,
                            incoming,
                            current
                        );
                        return UpsertOutcome::Stale;
                    }
                }
                self.entries.insert(key, object);
                UpsertOutcome::Updated
            }
            None => {
                self.entries.insert(key, object);
                UpsertOutcome::Inserted
            }
        }
    }

    /// Remove an entry. A removal observed at `revision` leaves alone an
    /// entry written after it.
    pub fn remove(&mut self, key: &str, revision: Option<u64>) -> Option<T> {
        let held = self.entries.get(key)?;

        if let (Some(removed_at), Some(current)) = (revision, held.revision()) {
            if current > removed_at {
                debug!(
                    "Ignoring removal of {} {} at revision {} (holding {})",
                    T::KIND,
                    key,
                    removed_at,
                    current
                );
                return None;
            }
        }

        self.entries.remove(key)
    }

    /// Reconcile with a full listing taken at `revision`.
    ///
    /// Listed objects are upserted. Held entries missing from the listing
    /// are dropped unless they were written after the listing. Entries that
    /// never came from the store (no revision) are kept.
    pub fn resync(&mut self, objects: Vec<T>, revision: u64) -> usize {
        let mut listed = std::collections::BTreeSet::new();
        for object in objects {
            if let Some(key) = ledger_key(&object) {
                listed.insert(key);
                self.upsert(object);
            }
        }

        let before = self.entries.len();
        self.entries.retain(|key, held| {
            listed.contains(key) || held.revision().map_or(true, |current| current > revision)
        });
        let removed = before - self.entries.len();

        debug!(
            "Resynced {} ledger at revision {}: {} entries, {} removed",
            T::KIND,
            revision,
            self.entries.len(),
            removed
        );
        removed
    }
}
