use std::collections::HashMap;

use crate::common::entity::{EndpointId, Identity};
use crate::common::error::DomainError;

use super::changes::ChangeState;
use super::engine::PolicyFeatures;
use super::entry::{InternalEntry, UNREALIZED_REDIRECT_PORT};
use super::key::Key;
use super::mapstate::MapState;
use super::proxyid::proxy_id_from_key;

/// Monotonically increasing token identifying a selector-cache state. Used
/// to discriminate incremental changes already reflected in a freshly
/// computed base policy from those that must still be replayed onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Version(pub u64);

#[derive(Debug)]
struct MapChangeRecord {
    add: bool, // false deletes
    key: Key,
    value: InternalEntry,
}

/// Accumulator for identity-driven policy map updates arriving between (and
/// during) full policy recomputations.
///
/// Changes pass through two stages: `accumulate` buffers raw records,
/// `sync` moves the buffer into the synced slot under a version token, and
/// `consume` drains the synced slot into the map state through the
/// precedence engine.
#[derive(Debug, Default)]
pub struct MapChanges {
    first_version: Version,
    changes: Vec<MapChangeRecord>,
    synced: Vec<MapChangeRecord>,
    version: Version,
}

impl MapChanges {
    /// Records synced at or before `first_version` are discarded: they are
    /// already reflected in the base state this queue was created against.
    pub fn new(first_version: Version) -> Self {
        Self {
            first_version,
            version: first_version,
            ..Self::default()
        }
    }

    /// Buffer one value for every `(identity, key)` combination: an add
    /// record per identity in `adds`, a delete record per identity in
    /// `deletes`.
    ///
    /// The caller must not list the same identity in both `adds` and
    /// `deletes` within one call.
    pub fn accumulate(
        &mut self,
        adds: &[Identity],
        deletes: &[Identity],
        keys: &[Key],
        value: &InternalEntry,
    ) {
        for &id in adds {
            for &key in keys {
                self.changes.push(MapChangeRecord {
                    add: true,
                    key: key.with_identity(id),
                    value: value.clone(),
                });
            }
        }
        for &id in deletes {
            for &key in keys {
                self.changes.push(MapChangeRecord {
                    add: false,
                    key: key.with_identity(id),
                    value: value.clone(),
                });
            }
        }
    }

    /// Move the buffered records into the synced slot to be consumed as a
    /// unit. Records predating `first_version` are discarded, they are
    /// already part of the base state.
    pub fn sync(&mut self, version: Version) {
        if !self.changes.is_empty() {
            if version > self.first_version {
                self.synced.append(&mut self.changes);
                self.version = version;
                tracing::debug!(version = version.0, "synced incremental map changes");
            } else {
                tracing::debug!(
                    version = version.0,
                    first_version = self.first_version.0,
                    "discarding already applied map changes"
                );
            }
        }
        self.changes.clear();
    }

    /// Number of records waiting in the synced slot.
    pub fn pending(&self) -> usize {
        self.synced.len()
    }

    /// Drain the synced slot, applying each record to `map_state` through
    /// the precedence engine.
    ///
    /// Add records carrying the unrealized-redirect placeholder port are
    /// resolved against `redirects` (proxy ID to allocated port); a record
    /// that cannot be resolved is skipped with a warning and will be
    /// retried by the next full regeneration. Delete records remove only
    /// the contribution of the originating owner.
    ///
    /// Returns the version the drained records were synced under together
    /// with the datapath-visible changes.
    pub fn consume(
        &mut self,
        map_state: &mut MapState,
        redirects: &HashMap<String, u16>,
        endpoint_id: EndpointId,
        features: PolicyFeatures,
    ) -> (Version, ChangeState) {
        let mut changes = ChangeState::new();

        for record in self.synced.drain(..) {
            if record.add {
                let mut entry = record.value;
                if entry.entry.proxy_port == UNREALIZED_REDIRECT_PORT {
                    match resolve_redirect(&record.key, &entry, redirects, endpoint_id) {
                        Ok(port) => entry.entry.proxy_port = port,
                        Err(err) => {
                            tracing::warn!(
                                key = %record.key,
                                %err,
                                "skipping entry for unrealized redirect"
                            );
                            continue;
                        }
                    }
                }
                map_state.insert_with_changes(record.key, entry, features, &mut changes);
            } else {
                // Delete only the contribution of the record's owner; the
                // key survives while other owners still reference it.
                let owner = record.value.owners.sole_owner();
                map_state.delete_key_with_changes(&record.key, owner, &mut changes);
            }
        }

        (self.version, changes)
    }
}

/// Resolve an unrealized redirect placeholder against the endpoint's
/// realized-redirect table.
fn resolve_redirect(
    key: &Key,
    entry: &InternalEntry,
    redirects: &HashMap<String, u16>,
    endpoint_id: EndpointId,
) -> Result<u16, DomainError> {
    let proxy_id = proxy_id_from_key(endpoint_id, key, &entry.entry.listener);
    redirects
        .get(&proxy_id)
        .copied()
        .ok_or_else(|| DomainError::ProxyUnresolved {
            listener: entry.entry.listener.clone(),
        })
}
