use std::collections::{BTreeSet, HashMap};

use crate::common::entity::Identity;

use super::entry::{InternalEntry, MapStateEntry};
use super::key::Key;
use super::trie::LpmTrie;

/// Exported map type: the datapath-visible view of a policy map, as consumed
/// by the reconciler and produced by kernel map dumps.
pub type MapStateMap = HashMap<Key, MapStateEntry>;

/// Identities sharing one direction/protocol/port prefix.
pub type IdSet = BTreeSet<Identity>;

/// Indexed container for policy map keys and entries.
///
/// The trie indexes the direction, protocol, and port of a key but
/// deliberately not its identity. Identities sharing a prefix are stored in
/// the [`IdSet`] attached to the prefix leaf. One rule selecting many
/// identities therefore maps to a single trie leaf instead of exploding the
/// trie with one subtree per identity, which keeps lookup, insertion, and
/// deletion cheap.
#[derive(Debug, Default)]
pub struct MapState {
    pub(super) entries: HashMap<Key, InternalEntry>,
    trie: LpmTrie<IdSet>,
}

impl MapState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The datapath-visible entry for `key`.
    pub fn get(&self, key: &Key) -> Option<&MapStateEntry> {
        self.get_internal(key).map(|e| &e.entry)
    }

    pub(super) fn get_internal(&self, key: &Key) -> Option<&InternalEntry> {
        self.entries.get(key)
    }

    /// Insert or replace `key`. Structurally invalid keys are logged and
    /// skipped, leaving the state untouched.
    pub(super) fn insert(&mut self, key: Key, entry: InternalEntry) {
        if let Err(err) = key.validate() {
            tracing::error!(%key, %err, "refusing to insert invalid policy key");
            return;
        }
        self.upsert(key, entry);
    }

    fn upsert(&mut self, key: Key, entry: InternalEntry) {
        let exists = self.entries.insert(key, entry).is_some();
        if !exists {
            self.trie
                .get_or_insert_with(key.prefix_length(), key.lpm_bits(), IdSet::new)
                .insert(key.identity());
        }
    }

    /// Replace the entry of an existing key without touching the trie. Used
    /// to persist in-place changes such as merges and auth overrides.
    pub(super) fn update_existing(&mut self, key: Key, entry: InternalEntry) {
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = entry;
        }
    }

    /// Remove `key` and its identity from the prefix leaf, dropping the
    /// leaf when its identity set empties.
    pub(super) fn delete(&mut self, key: &Key) {
        if self.entries.remove(key).is_some() {
            let prefix_len = key.prefix_length();
            let bits = key.lpm_bits();
            if let Some(ids) = self.trie.exact_mut(prefix_len, bits) {
                ids.remove(&key.identity());
                if ids.is_empty() {
                    self.trie.remove(prefix_len, bits);
                }
            }
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(&Key, &MapStateEntry)) {
        for (k, e) in &self.entries {
            f(k, &e.entry);
        }
    }

    /// The datapath-visible view of the whole state.
    pub fn to_map(&self) -> MapStateMap {
        self.entries
            .iter()
            .map(|(k, e)| (*k, e.entry.clone()))
            .collect()
    }

    // ── Trie-backed key listings ────────────────────────────────────
    //
    // Each helper materializes the candidate keys up front so callers may
    // delete yielded keys while walking the list; a deleted key is simply
    // absent on the subsequent entry lookup.

    /// Keys broader than or equal to `key`: for every covering prefix leaf,
    /// the wildcard-identity key first (it is broader than every specific
    /// identity), then the key with the same specific identity.
    pub fn broader_or_equal_keys(&self, key: &Key) -> Vec<Key> {
        let mut out = Vec::new();
        for (prefix_len, bits, ids) in self.trie.ancestors(key.prefix_length(), key.lpm_bits()) {
            let base = Key::from_lpm_coords(prefix_len, bits);
            if ids.contains(&Identity::ANY) {
                out.push(base.with_identity(Identity::ANY));
            }
            if !key.identity().is_any() && ids.contains(&key.identity()) {
                out.push(base.with_identity(key.identity()));
            }
        }
        out
    }

    /// Keys narrower than or equal to `key`. A wildcard-identity query
    /// covers every identity at each descendant leaf; a specific identity
    /// covers only itself.
    pub fn narrower_or_equal_keys(&self, key: &Key) -> Vec<Key> {
        let mut out = Vec::new();
        for (prefix_len, bits, ids) in self.trie.descendants(key.prefix_length(), key.lpm_bits()) {
            let base = Key::from_lpm_coords(prefix_len, bits);
            if key.identity().is_any() {
                out.extend(ids.iter().map(|id| base.with_identity(*id)));
            } else if ids.contains(&key.identity()) {
                out.push(base.with_identity(key.identity()));
            }
        }
        out
    }

    /// Keys with `key`'s identity whose port/proto prefix strictly covers
    /// `key`'s, most specific first.
    pub fn covering_keys_with_same_id(&self, key: &Key) -> Vec<Key> {
        let mut out = Vec::new();
        let ancestors = self.trie.ancestors(key.prefix_length(), key.lpm_bits());
        for (prefix_len, bits, ids) in ancestors.into_iter().rev() {
            let base = Key::from_lpm_coords(prefix_len, bits);
            if !base.port_proto_is_equal(key) && ids.contains(&key.identity()) {
                out.push(base.with_identity(key.identity()));
            }
        }
        out
    }

    /// Keys with `key`'s identity whose port/proto prefix is strictly
    /// narrower than `key`'s, least specific first.
    pub fn subset_keys_with_same_id(&self, key: &Key) -> Vec<Key> {
        let mut out = Vec::new();
        for (prefix_len, bits, ids) in self.trie.descendants(key.prefix_length(), key.lpm_bits()) {
            let base = Key::from_lpm_coords(prefix_len, bits);
            if !base.port_proto_is_equal(key) && ids.contains(&key.identity()) {
                out.push(base.with_identity(key.identity()));
            }
        }
        out
    }

    // ── Comparison and diagnostics ──────────────────────────────────

    /// Datapath equality against an exported map.
    pub fn equals(&self, other: &MapStateMap) -> bool {
        if self.len() != other.len() {
            return false;
        }
        self.entries
            .iter()
            .all(|(k, e)| other.get(k).is_some_and(|o| o.datapath_equal(&e.entry)))
    }

    /// Differences between this state ("obtained") and `expected`, with
    /// `- ` lines for missing and `+ ` lines for unexpected entries.
    pub fn diff(&self, expected: &MapStateMap) -> String {
        let mut res = String::from("Missing (-), Unexpected (+):\n");
        let mut expected_keys: Vec<&Key> = expected.keys().collect();
        expected_keys.sort();
        for k in expected_keys {
            let want = &expected[k];
            match self.get(k) {
                Some(got) if got.datapath_equal(want) => {}
                Some(got) => {
                    res.push_str(&format!("- {k}: {want}\n"));
                    res.push_str(&format!("+ {k}: {got}\n"));
                }
                None => res.push_str(&format!("- {k}: {want}\n")),
            }
        }
        let mut obtained_keys: Vec<&Key> = self.entries.keys().collect();
        obtained_keys.sort();
        for k in obtained_keys {
            if !expected.contains_key(k) {
                res.push_str(&format!("+ {k}: {}\n", self.entries[k].entry));
            }
        }
        res
    }

    /// Structural self-check used by tests and fuzzing: the trie and the
    /// entry map must describe exactly the same key set, every entry must
    /// satisfy the key and redirect invariants, and no allow entry may be
    /// shadowed by a covering deny.
    pub fn check_invariants(&self) -> Result<(), String> {
        // Map -> trie: every key's identity is indexed under its prefix.
        for (key, entry) in &self.entries {
            key.validate().map_err(|e| e.to_string())?;

            let ids = self
                .trie
                .exact(key.prefix_length(), key.lpm_bits())
                .ok_or_else(|| format!("{key}: prefix missing from trie"))?;
            if !ids.contains(&key.identity()) {
                return Err(format!("{key}: identity missing from trie leaf"));
            }

            if entry.entry.proxy_port == 0
                && (!entry.entry.listener.is_empty() || entry.priority != 0)
            {
                return Err(format!("{key}: non-redirect entry carries redirect state"));
            }
            if entry.owners.is_orphaned() {
                return Err(format!("{key}: entry has no owners and is not sticky"));
            }

            if !entry.is_deny() {
                for covering in self.broader_or_equal_keys(key) {
                    if covering != *key
                        && self
                            .get_internal(&covering)
                            .is_some_and(InternalEntry::is_deny)
                    {
                        return Err(format!("{key}: allow shadowed by deny {covering}"));
                    }
                }
            }
        }

        // Trie -> map: every indexed identity has a backing entry.
        for (prefix_len, bits, ids) in self.trie.descendants(0, 0) {
            let base = Key::from_lpm_coords(prefix_len, bits);
            if ids.is_empty() {
                return Err(format!("{base}: empty identity set left in trie"));
            }
            for id in ids {
                let key = base.with_identity(*id);
                if !self.entries.contains_key(&key) {
                    return Err(format!("{key}: trie references a missing entry"));
                }
            }
        }
        Ok(())
    }
}
