use std::collections::{HashMap, HashSet};

use super::entry::{InternalEntry, MapStateEntry};
use super::key::Key;

/// Set of policy map keys.
pub type Keys = HashSet<Key>;

/// Incremental changes collected over one batch of map state mutations.
///
/// `adds` and `deletes` name the keys whose realized value must change;
/// `old` snapshots the pre-batch value of every key modified or removed
/// (first write per key wins), which is what makes the batch revertible.
#[derive(Debug, Default)]
pub struct ChangeState {
    pub adds: Keys,
    pub deletes: Keys,
    old: HashMap<Key, InternalEntry>,
}

impl ChangeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the batch carries no datapath-visible change.
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.deletes.is_empty()
    }

    /// Record the pre-batch value of `key` unless one is already recorded
    /// or the key was first added during this batch (a fresh key has no
    /// old value to restore). Returns `true` if a value was recorded.
    pub(super) fn insert_old_if_not_exists(&mut self, key: Key, entry: &InternalEntry) -> bool {
        if self.old.contains_key(&key) || self.adds.contains(&key) {
            return false;
        }
        self.old.insert(key, entry.clone());
        true
    }

    pub(super) fn remove_old(&mut self, key: &Key) {
        self.old.remove(key);
    }

    pub(super) fn has_old(&self, key: &Key) -> bool {
        self.old.contains_key(key)
    }

    pub(super) fn iter_old(&self) -> impl Iterator<Item = (&Key, &InternalEntry)> {
        self.old.iter()
    }
}

/// A single operation against the realized map, reported by the reconciler
/// when diff collection is requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapChange {
    /// `true` for a write, `false` for a delete.
    pub add: bool,
    pub key: Key,
    pub value: MapStateEntry,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::entity::{Identity, OwnerId, Protocol};

    fn key() -> Key {
        Key::ingress()
            .with_identity(Identity(10))
            .with_port_proto(Protocol::Tcp, 80)
    }

    fn entry() -> InternalEntry {
        InternalEntry::new(Some(OwnerId(1)), vec![], MapStateEntry::allow(), 0)
    }

    #[test]
    fn first_old_value_wins() {
        let mut changes = ChangeState::new();
        let first = entry();
        let mut second = entry();
        second.entry.is_deny = true;

        assert!(changes.insert_old_if_not_exists(key(), &first));
        assert!(!changes.insert_old_if_not_exists(key(), &second));
        assert_eq!(changes.iter_old().next().unwrap().1, &first);
    }

    #[test]
    fn no_old_value_for_keys_added_this_batch() {
        let mut changes = ChangeState::new();
        changes.adds.insert(key());
        assert!(!changes.insert_old_if_not_exists(key(), &entry()));
        assert!(!changes.has_old(&key()));
    }

    #[test]
    fn empty_batch() {
        let mut changes = ChangeState::new();
        assert!(changes.is_empty());
        changes.adds.insert(key());
        assert!(!changes.is_empty());
    }
}
