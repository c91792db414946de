use crate::common::entity::{Identity, OwnerId, RuleId};

use super::changes::ChangeState;
use super::entry::{AuthType, HasAuthType, InternalEntry, MapStateEntry};
use super::key::Key;
use super::mapstate::MapState;

/// Feature bits observed in the compiled rule set. Insertion skips the work
/// for features the policy does not use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyFeatures(u8);

impl PolicyFeatures {
    pub const DENY_RULES: PolicyFeatures = PolicyFeatures(0b0001);
    pub const AUTH_RULES: PolicyFeatures = PolicyFeatures(0b0010);
    pub const REDIRECT_RULES: PolicyFeatures = PolicyFeatures(0b0100);
    /// All features active; used for entries inserted outside rule
    /// compilation, where no feature summary is available.
    pub const ALL: PolicyFeatures = PolicyFeatures(0b0111);

    pub fn contains(self, other: PolicyFeatures) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PolicyFeatures) {
        self.0 |= other.0;
    }
}

/// Rule label attached to the localhost-allow bootstrap entry.
pub const RULE_ALLOW_LOCALHOST_INGRESS: &str = "allow-localhost-ingress";
/// Rule label attached to the ingress allow-all entry.
pub const RULE_ALLOW_ANY_INGRESS: &str = "allow-any-ingress";
/// Rule label attached to the egress allow-all entry.
pub const RULE_ALLOW_ANY_EGRESS: &str = "allow-any-egress";

impl MapState {
    /// Insert a key and entry, giving preference to deny entries.
    ///
    /// The datapath denies by default; deny entries exist to carve more
    /// specific holes out of less specific allows. Because allow entries may
    /// still arrive later (incrementally, e.g. from FQDN-driven identities),
    /// deny entries are added even when nothing is currently covered.
    ///
    /// The datapath resolves precedence between a specific identity and the
    /// wildcard identity on its own; this function only has to maintain deny
    /// precedence among keys with the same identity or against the wildcard:
    ///
    /// 1. If a broader-or-equal key with a deny entry exists, the insertion
    ///    is dropped (unless it is the identical deny key, which merges).
    /// 2. A deny insertion deletes every narrower-or-equal key it covers.
    /// 3. An allow insertion with auth rules active routes through
    ///    [`auth propagation`](Self::auth_preferred_insert).
    ///
    /// A bailed-out or vacuumed key never needs to be reinstated when the
    /// covering key later disappears: covering keys share the identity (or
    /// wildcard it), only specific identities are incrementally removed, and
    /// the selector cache removes all keys of an identity transactionally,
    /// so the covered key's inputs are torn down together with the cover.
    ///
    /// Changes are recorded in `changes` for reconciliation and revert.
    pub fn insert_with_changes(
        &mut self,
        key: Key,
        entry: InternalEntry,
        features: PolicyFeatures,
        changes: &mut ChangeState,
    ) {
        // Bail if covered by a deny key.
        for k in self.broader_or_equal_keys(&key) {
            if let Some(v) = self.get_internal(&k)
                && v.is_deny()
                && !(entry.is_deny() && k == key)
            {
                return;
            }
        }

        if entry.is_deny() {
            // A new deny vacuums every narrower key it covers, except the
            // identical deny key which is merged below.
            for k in self.narrower_or_equal_keys(&key) {
                let Some(v) = self.get_internal(&k) else {
                    continue;
                };
                if !(v.is_deny() && k == key) {
                    self.delete_key_with_changes(&k, None, changes);
                }
            }
        } else if features.contains(PolicyFeatures::AUTH_RULES) {
            // Redundant allow entries are deliberately kept.
            self.auth_preferred_insert(key, entry, changes);
            return;
        }

        self.add_key_with_changes(key, entry, changes);
    }

    /// Add `key`, merging with an existing entry of the same deny polarity.
    /// Records the key in `changes.adds` unless the datapath-visible fields
    /// are unchanged; an add cancels a previous delete of the same key.
    /// Returns `true` if the state changed.
    pub(super) fn add_key_with_changes(
        &mut self,
        key: Key,
        entry: InternalEntry,
        changes: &mut ChangeState,
    ) -> bool {
        let existing = self.get_internal(&key).cloned();
        let exists = existing.is_some();
        let mut datapath_equal = false;

        match existing {
            Some(old_entry) if old_entry.is_deny() == entry.is_deny() => {
                if old_entry == entry {
                    return false;
                }
                changes.insert_old_if_not_exists(key, &old_entry);
                // Compare before merging; the old entry is updated in place.
                datapath_equal = old_entry.entry.datapath_equal(&entry.entry);
                let mut merged = old_entry;
                merged.merge(&entry);
                self.update_existing(key, merged);
            }
            // New key, or a deny overwriting an allow. An allow never
            // overwrites a deny.
            None => self.insert(key, entry),
            Some(_) if entry.is_deny() => self.insert(key, entry),
            Some(_) => return false,
        }

        if !exists || !datapath_equal {
            changes.adds.insert(key);
            // Key add overrides any previous delete of the same key.
            changes.deletes.remove(&key);
        }
        true
    }

    /// Delete `key`, or with a specific `owner` only that owner's
    /// contribution; the key stays while other owners still need it and
    /// sticky entries survive owner-driven deletes entirely. Removing an
    /// owner that is not present is a silent no-op.
    pub fn delete_key_with_changes(
        &mut self,
        key: &Key,
        owner: Option<OwnerId>,
        changes: &mut ChangeState,
    ) {
        let Some(mut entry) = self.get_internal(key).cloned() else {
            return;
        };
        let old_added = changes.insert_old_if_not_exists(*key, &entry);

        if let Some(owner) = owner {
            if entry.owners.contains(owner) {
                let changed = entry.owners.remove(owner);
                if !entry.owners.is_orphaned() {
                    if changed {
                        self.update_existing(*key, entry);
                    }
                    return;
                }
            } else {
                if old_added {
                    changes.remove_old(key);
                }
                return;
            }
        }

        // A delete of a key first added during this batch cancels the add;
        // the key was never externally visible, so no delete is recorded.
        let added_this_batch = changes.adds.remove(key) && !changes.has_old(key);
        if !added_this_batch {
            changes.deletes.insert(*key);
        }
        self.delete(key);
    }

    /// Apply the auth type of covering entries to `entry` (and of `entry`
    /// to covered ones) before adding it.
    ///
    /// Expected to run after deny evaluation: a covering deny would have
    /// dropped the insertion already, so meeting one here is a programmer
    /// error.
    fn auth_preferred_insert(
        &mut self,
        key: Key,
        mut entry: InternalEntry,
        changes: &mut ChangeState,
    ) {
        if entry.entry.has_auth_type == HasAuthType::Default {
            // Adopt the auth type of the most specific covering key with the
            // same identity and an explicit auth type.
            for k in self.covering_keys_with_same_id(&key) {
                let Some(v) = self.get_internal(&k) else {
                    continue;
                };
                if v.is_deny() {
                    debug_assert!(false, "covering deny key should not exist");
                    tracing::error!(covering = %k, %key, "auth propagation met a covering deny key");
                    continue;
                }
                if v.entry.has_auth_type == HasAuthType::Explicit {
                    entry.entry.auth_type = v.entry.auth_type;
                    break;
                }
            }
        } else {
            // Propagate the explicit auth type down to covered keys that
            // still have a defaulted one. A covered deny or explicit entry
            // shields everything below it.
            for k in self.subset_keys_with_same_id(&key) {
                let Some(v) = self.get_internal(&k).cloned() else {
                    continue;
                };
                if v.is_deny() || v.entry.has_auth_type == HasAuthType::Explicit {
                    break;
                }
                self.override_auth_type(&entry, k, v, changes);
            }
        }

        self.add_key_with_changes(key, entry, changes);
    }

    /// Overwrite the auth type of `v` in place, saving the old entry.
    /// The trie is unaffected.
    fn override_auth_type(
        &mut self,
        new_entry: &InternalEntry,
        key: Key,
        mut v: InternalEntry,
        changes: &mut ChangeState,
    ) {
        changes.insert_old_if_not_exists(key, &v);
        v.entry.auth_type = new_entry.entry.auth_type;
        self.update_existing(key, v);
    }

    /// Undo a batch: delete everything it added, then restore every saved
    /// old value (the old map holds the original values of both modified
    /// and deleted entries).
    pub fn revert_changes(&mut self, changes: &ChangeState) {
        for k in &changes.adds {
            self.delete(k);
        }
        let old: Vec<(Key, InternalEntry)> = changes
            .iter_old()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (k, v) in old {
            self.insert(k, v);
        }
    }

    /// Insert the sticky ingress allow for the local host, if configured.
    /// Authentication is never required for local host traffic.
    pub fn determine_allow_localhost_ingress(&mut self, always_allow_localhost: bool) {
        if !always_allow_localhost {
            return;
        }
        let entry = InternalEntry::new(
            None,
            vec![RuleId(RULE_ALLOW_LOCALHOST_INGRESS.to_string())],
            MapStateEntry::allow().with_auth(HasAuthType::Explicit, AuthType::Disabled),
            0,
        );
        let key = Key::ingress().with_identity(Identity::HOST);
        self.insert_with_changes(key, entry, PolicyFeatures::ALL, &mut ChangeState::new());
    }

    /// Insert the all-traffic allow key for each direction where policy is
    /// not enforced. Authentication is explicitly not required.
    pub fn allow_all_identities(&mut self, ingress: bool, egress: bool) {
        if ingress {
            let entry = InternalEntry::new(
                None,
                vec![RuleId(RULE_ALLOW_ANY_INGRESS.to_string())],
                MapStateEntry::allow().with_auth(HasAuthType::Explicit, AuthType::Disabled),
                0,
            );
            self.insert(Key::ingress(), entry);
        }
        if egress {
            let entry = InternalEntry::new(
                None,
                vec![RuleId(RULE_ALLOW_ANY_EGRESS.to_string())],
                MapStateEntry::allow().with_auth(HasAuthType::Explicit, AuthType::Disabled),
                0,
            );
            self.insert(Key::egress(), entry);
        }
    }
}
