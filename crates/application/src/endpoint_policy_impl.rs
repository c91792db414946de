use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use domain::common::entity::{EndpointId, Identity, OwnerId, RuleId};
use domain::common::error::DomainError;
use domain::policy::changes::{ChangeState, MapChange};
use domain::policy::engine::PolicyFeatures;
use domain::policy::entry::{InternalEntry, MapStateEntry, UNREALIZED_REDIRECT_PORT};
use domain::policy::key::Key;
use domain::policy::mapchanges::{MapChanges, Version};
use domain::policy::mapstate::{MapState, MapStateMap};
use domain::policy::proxyid::{parse_proxy_id, proxy_id_from_key, proxy_stats_key};
use ports::secondary::metrics_port::PolicyMetrics;
use ports::secondary::policy_map_port::PolicyMapPort;
use ports::secondary::proxy_port::ProxyPort;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// One desired policy entry produced by rule compilation.
///
/// Redirect rules arrive with the unrealized placeholder port; the service
/// resolves it through the proxy controller before the entry reaches the
/// kernel map.
#[derive(Debug, Clone)]
pub struct PolicyUpdate {
    pub key: Key,
    pub entry: MapStateEntry,
    /// Listener selection priority; 0 defaults to the proxy port.
    pub priority: u16,
    /// Owning selector; `None` makes the entry sticky.
    pub owner: Option<OwnerId>,
    pub derived_from_rules: Vec<RuleId>,
}

/// State guarded by the endpoint read/write lock.
struct PolicyState {
    desired: MapState,
    map_changes: MapChanges,
    features: PolicyFeatures,
    /// Realized proxy redirects: proxy ID to allocated port.
    redirects: HashMap<String, u16>,
    /// The agent's view of the kernel map contents.
    realized: MapStateMap,
    map: Box<dyn PolicyMapPort>,
    proxy: Box<dyn ProxyPort>,
    version: Version,
}

/// Per-endpoint policy orchestration: full regenerations, incremental
/// identity-driven updates, and reconciliation of the kernel policy map.
///
/// Lock order, to be observed globally: external selector cache, then the
/// build lock, then the state read/write lock, then the stats lock. Taking
/// the selector cache while holding the state lock is forbidden.
pub struct EndpointPolicyService {
    endpoint_id: EndpointId,
    /// Serializes end-to-end regenerations for this endpoint.
    build_lock: Mutex<()>,
    state: RwLock<PolicyState>,
    /// Proxy statistics keyed by proxy stats key. Held briefly, taken last.
    stats: StdMutex<HashMap<String, u64>>,
    metrics: Arc<dyn PolicyMetrics>,
    allow_localhost_ingress: bool,
}

impl EndpointPolicyService {
    pub fn new(
        endpoint_id: EndpointId,
        map: Box<dyn PolicyMapPort>,
        proxy: Box<dyn ProxyPort>,
        metrics: Arc<dyn PolicyMetrics>,
        allow_localhost_ingress: bool,
    ) -> Self {
        Self {
            endpoint_id,
            build_lock: Mutex::new(()),
            state: RwLock::new(PolicyState {
                desired: MapState::new(),
                map_changes: MapChanges::new(Version(0)),
                features: PolicyFeatures::ALL,
                redirects: HashMap::new(),
                realized: MapStateMap::new(),
                map,
                proxy,
                version: Version(0),
            }),
            stats: StdMutex::new(HashMap::new()),
            metrics,
            allow_localhost_ingress,
        }
    }

    // ── Incremental change intake (selector cache contract) ─────────

    /// Buffer identity-driven updates. The caller must not list one
    /// identity in both `adds` and `deletes` of a single call, and must
    /// deliver identity removals transactionally (every key of the removed
    /// identity in one batch).
    pub async fn accumulate_map_changes(
        &self,
        adds: &[Identity],
        deletes: &[Identity],
        keys: &[Key],
        value: &InternalEntry,
    ) {
        let mut state = self.state.write().await;
        state.map_changes.accumulate(adds, deletes, keys, value);
    }

    /// Move buffered changes into the consumable slot under `version`.
    pub async fn sync_map_changes(&self, version: Version) {
        let mut state = self.state.write().await;
        state.map_changes.sync(version);
    }

    // ── Incremental apply ───────────────────────────────────────────

    /// Apply the accumulated incremental changes to the desired state and
    /// push them to the kernel map, entries added before any are deleted.
    ///
    /// Cancellation before the kernel writes reverts the desired-state
    /// mutation and returns [`DomainError::Canceled`].
    pub async fn apply_policy_map_changes(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ChangeState, DomainError> {
        let mut state = self.state.write().await;
        let state = &mut *state;

        let endpoint_id = self.endpoint_id;
        let features = state.features;
        let (version, changes) = state.map_changes.consume(
            &mut state.desired,
            &state.redirects,
            endpoint_id,
            features,
        );

        if cancel.is_cancelled() {
            state.desired.revert_changes(&changes);
            self.metrics.record_revert(self.endpoint_id.0);
            return Err(DomainError::Canceled);
        }
        state.version = state.version.max(version);

        // Add entries before deleting to avoid transient drops.
        let mut errors = 0usize;
        let total = changes.adds.len() + changes.deletes.len();
        for key in &changes.adds {
            let Some(entry) = state.desired.get(key).cloned() else {
                tracing::warn!(%key, "tried adding policy map key not in policy");
                continue;
            };
            if !add_policy_key(state, &*self.metrics, self.endpoint_id, key, &entry) {
                errors += 1;
            }
        }
        for key in &changes.deletes {
            if !delete_policy_key(state, &*self.metrics, self.endpoint_id, key) {
                errors += 1;
            }
        }

        if errors > 0 {
            return Err(DomainError::SyncFailed { errors, total });
        }
        if !changes.is_empty() {
            tracing::debug!(
                endpoint = %self.endpoint_id,
                adds = changes.adds.len(),
                deletes = changes.deletes.len(),
                "applied policy map updates due to identity changes"
            );
        }
        Ok(changes)
    }

    // ── Full regeneration ───────────────────────────────────────────

    /// Replace the desired policy with a freshly compiled one and reconcile
    /// the kernel map against it.
    ///
    /// Redirect ports are allocated (and stale listeners released) before
    /// any kernel map write, so proxy ports referenced by new entries
    /// exist. Incremental changes accepted after the policy snapshot was
    /// taken are replayed onto the new state before the full
    /// reconciliation. Cancellation releases the freshly allocated
    /// listeners and leaves the previous policy in place.
    pub async fn set_desired_policy(
        &self,
        updates: Vec<PolicyUpdate>,
        features: PolicyFeatures,
        version: Version,
        ingress_enforced: bool,
        egress_enforced: bool,
        cancel: &CancellationToken,
    ) -> Result<(usize, Vec<MapChange>), DomainError> {
        let _build = self.build_lock.lock().await;
        let mut state = self.state.write().await;
        let state = &mut *state;

        if cancel.is_cancelled() {
            return Err(DomainError::Canceled);
        }
        if version <= state.version && state.version != Version(0) {
            return Err(DomainError::StaleVersion {
                version: version.0,
                current: state.version.0,
            });
        }

        // Realize redirects first. Listeners whose allocation is still
        // pending keep the placeholder port and are skipped by the sync.
        let mut new_redirects: HashMap<String, u16> = HashMap::new();
        let mut resolved = Vec::with_capacity(updates.len());
        for mut update in updates {
            if update.entry.proxy_port == UNREALIZED_REDIRECT_PORT {
                let proxy_id =
                    proxy_id_from_key(self.endpoint_id, &update.key, &update.entry.listener);
                let port = state
                    .proxy
                    .allocate(&update.entry.listener, update.key.direction().is_ingress())?;
                if port != 0 {
                    state.proxy.ack(&update.entry.listener)?;
                    new_redirects.insert(proxy_id, port);
                    update.entry.proxy_port = port;
                } else {
                    tracing::warn!(
                        listener = %update.entry.listener,
                        key = %update.key,
                        "proxy port allocation pending, deferring redirect entry"
                    );
                }
            }
            resolved.push(update);
        }

        if cancel.is_cancelled() {
            release_listeners(state, &new_redirects);
            self.metrics.record_revert(self.endpoint_id.0);
            return Err(DomainError::Canceled);
        }

        // Compute the new desired state through the precedence engine.
        let mut desired = MapState::new();
        desired.allow_all_identities(!ingress_enforced, !egress_enforced);
        desired.determine_allow_localhost_ingress(self.allow_localhost_ingress);
        let mut changes = ChangeState::new();
        for update in resolved {
            let entry = InternalEntry::new(
                update.owner,
                update.derived_from_rules,
                update.entry,
                update.priority,
            );
            desired.insert_with_changes(update.key, entry, features, &mut changes);
        }

        // Release listeners no longer referenced by any redirect.
        let stale: Vec<String> = state
            .redirects
            .keys()
            .filter(|id| !new_redirects.contains_key(*id))
            .cloned()
            .collect();
        for proxy_id in stale {
            if let Ok(parsed) = parse_proxy_id(&proxy_id) {
                state.proxy.release(&parsed.listener)?;
            }
            state.redirects.remove(&proxy_id);
        }

        state.desired = desired;
        state.features = features;
        state.redirects.extend(new_redirects);
        state.version = version;

        // Replay incremental changes that arrived after the snapshot this
        // policy was computed from, then reconcile in full. Replaying a
        // change the snapshot already contains is harmless, insertion is
        // idempotent.
        state.map_changes.sync(version);
        let endpoint_id = self.endpoint_id;
        let (consumed_version, _) = state.map_changes.consume(
            &mut state.desired,
            &state.redirects,
            endpoint_id,
            features,
        );
        state.version = state.version.max(consumed_version);

        if cancel.is_cancelled() {
            self.metrics.record_revert(self.endpoint_id.0);
            return Err(DomainError::Canceled);
        }

        let realized = state.realized.clone();
        let result = sync_with(state, &*self.metrics, self.endpoint_id, realized, false);

        self.update_proxy_stats(state);
        self.metrics
            .set_desired_entries(self.endpoint_id.0, state.desired.len() as u64);
        result
    }

    // ── Reconciliation ──────────────────────────────────────────────

    /// Reconcile the kernel map against the desired state using the
    /// agent's realized view, without dumping the kernel map.
    pub async fn sync_full(&self) -> Result<(usize, Vec<MapChange>), DomainError> {
        let mut state = self.state.write().await;
        let state = &mut *state;
        let realized = state.realized.clone();
        sync_with(state, &*self.metrics, self.endpoint_id, realized, true)
    }

    /// Periodic full reconciliation against a fresh dump of the kernel map,
    /// catching divergence from kernel issues or outside interference.
    ///
    /// A failed dump closes and reopens the map handle and retries once.
    /// Discrepancies are logged and counted; the desired state is restored
    /// as authoritative. Skipped without error when a regeneration holds
    /// the state lock.
    pub async fn sync_with_dump(&self) -> Result<usize, DomainError> {
        let Ok(mut state) = self.state.try_write() else {
            // Mid-regeneration; skip this round.
            return Ok(0);
        };
        let state = &mut *state;

        let mut dumped = MapStateMap::new();
        if let Err(err) = state
            .map
            .dump(&mut |key, value| {
                dumped.insert(Key::from_wire(&key), MapStateEntry::from_wire(&value));
            })
        {
            tracing::error!(
                endpoint = %self.endpoint_id,
                %err,
                "unable to dump policy map, reopening handle"
            );
            state.map.reopen()?;
            dumped.clear();
            state.map.dump(&mut |key, value| {
                dumped.insert(Key::from_wire(&key), MapStateEntry::from_wire(&value));
            })?;
        }

        let (diff_count, diffs) =
            sync_with(state, &*self.metrics, self.endpoint_id, dumped, true)?;
        if diff_count > 0 {
            tracing::warn!(
                endpoint = %self.endpoint_id,
                count = diff_count,
                "policy map sync fixed discrepancies"
            );
            tracing::debug!(?diffs, "reconciled policy map differences");
            self.metrics
                .record_sync_discrepancies(self.endpoint_id.0, diff_count as u64);
        }
        Ok(diff_count)
    }

    // ── Status surfaces ─────────────────────────────────────────────

    /// Datapath-visible view of the desired policy.
    pub async fn dump(&self) -> MapStateMap {
        self.state.read().await.desired.to_map()
    }

    /// Diagnostic diff of the desired policy against `expected`.
    pub async fn diff(&self, expected: &MapStateMap) -> String {
        self.state.read().await.desired.diff(expected)
    }

    /// The agent's view of the kernel map contents.
    pub async fn realized(&self) -> MapStateMap {
        self.state.read().await.realized.clone()
    }

    /// Per-redirect statistics counters.
    pub fn proxy_stats(&self) -> HashMap<String, u64> {
        self.stats.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    fn update_proxy_stats(&self, state: &PolicyState) {
        let mut counts: HashMap<String, u64> = HashMap::new();
        state.desired.for_each(|key, entry| {
            if entry.is_redirect() && entry.proxy_port != UNREALIZED_REDIRECT_PORT {
                let stats_key = proxy_stats_key(
                    key.direction().is_ingress(),
                    domain::common::entity::Protocol::from_u8(key.protocol()).as_str(),
                    key.dest_port(),
                    entry.proxy_port,
                );
                *counts.entry(stats_key).or_default() += 1;
            }
        });
        *self.stats.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = counts;
    }
}

// Free functions operating on the locked state; `&mut PolicyState` proves
// the endpoint write lock is held.

/// Release the listeners behind freshly allocated redirects after a
/// canceled regeneration.
fn release_listeners(state: &mut PolicyState, redirects: &HashMap<String, u16>) {
    for proxy_id in redirects.keys() {
        let Ok(parsed) = parse_proxy_id(proxy_id) else {
            continue;
        };
        if let Err(err) = state.proxy.release(&parsed.listener) {
            tracing::warn!(%proxy_id, %err, "failed to release listener during revert");
        }
    }
}

fn add_policy_key(
    state: &mut PolicyState,
    metrics: &dyn PolicyMetrics,
    endpoint_id: EndpointId,
    key: &Key,
    entry: &MapStateEntry,
) -> bool {
    if let Err(err) = state.map.upsert(&key.to_wire(), &entry.to_wire()) {
        tracing::error!(%key, %err, "failed to add policy map key");
        metrics.record_map_sync_error(endpoint_id.0);
        return false;
    }
    state.realized.insert(*key, entry.clone());
    update_pressure(state, metrics, endpoint_id);
    true
}

fn delete_policy_key(
    state: &mut PolicyState,
    metrics: &dyn PolicyMetrics,
    endpoint_id: EndpointId,
    key: &Key,
) -> bool {
    // Absent keys are tolerated by the port; see PolicyMapPort::delete.
    if let Err(err) = state.map.delete(&key.to_wire()) {
        tracing::error!(%key, %err, "failed to delete policy map key");
        metrics.record_map_sync_error(endpoint_id.0);
        return false;
    }
    state.realized.remove(key);
    update_pressure(state, metrics, endpoint_id);
    true
}

fn update_pressure(state: &PolicyState, metrics: &dyn PolicyMetrics, endpoint_id: EndpointId) {
    let max = state.map.max_entries().max(1);
    metrics.set_map_pressure(endpoint_id.0, state.realized.len() as f64 / f64::from(max));
}

/// Reconcile the kernel map against the desired state, starting from the
/// `realized` view: write every desired entry whose realized value differs
/// or is missing, then delete every realized entry absent from the desired
/// state. All writes strictly precede all deletes so that an in-place value
/// change never opens a window in which a formerly allowed flow drops.
///
/// Entries still carrying the unrealized redirect placeholder are not
/// written; they are retried by the next regeneration.
fn sync_with(
    state: &mut PolicyState,
    metrics: &dyn PolicyMetrics,
    endpoint_id: EndpointId,
    realized: MapStateMap,
    with_diffs: bool,
) -> Result<(usize, Vec<MapChange>), DomainError> {
    let mut realized = realized;
    let mut errors = 0usize;
    let mut diff_count = 0usize;
    let mut diffs = Vec::new();

    let mut to_add: Vec<(Key, MapStateEntry)> = Vec::new();
    state.desired.for_each(|key, entry| {
        if entry.proxy_port == UNREALIZED_REDIRECT_PORT {
            tracing::warn!(%key, "desired entry has unrealized redirect, not written");
            return;
        }
        if !realized.get(key).is_some_and(|old| old.datapath_equal(entry)) {
            to_add.push((*key, entry.clone()));
        }
    });
    for (key, entry) in to_add {
        realized.insert(key, entry.clone());
        if !add_policy_key(state, metrics, endpoint_id, &key, &entry) {
            errors += 1;
        }
        diff_count += 1;
        if with_diffs {
            diffs.push(MapChange {
                add: true,
                key,
                value: entry,
            });
        }
    }

    let to_delete: Vec<Key> = realized
        .keys()
        .filter(|k| state.desired.get(k).is_none())
        .copied()
        .collect();
    for key in to_delete {
        let value = realized.remove(&key).unwrap_or_default();
        if !delete_policy_key(state, metrics, endpoint_id, &key) {
            errors += 1;
        }
        diff_count += 1;
        if with_diffs {
            diffs.push(MapChange {
                add: false,
                key,
                value,
            });
        }
    }

    state.realized = realized;
    if errors > 0 {
        return Err(DomainError::SyncFailed {
            errors,
            total: diff_count,
        });
    }
    Ok((diff_count, diffs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::common::entity::Protocol;
    use domain::policy::entry::{AuthType, HasAuthType};
    use ports::test_utils::{FakePolicyMap, FakeProxy, NoopMetrics, SharedPolicyMap};

    fn tcp_key(identity: u32, port: u16) -> Key {
        Key::ingress()
            .with_identity(Identity(identity))
            .with_port_proto(Protocol::Tcp, port)
    }

    fn allow_update(key: Key, owner: u64) -> PolicyUpdate {
        PolicyUpdate {
            key,
            entry: MapStateEntry::allow(),
            priority: 0,
            owner: Some(OwnerId(owner)),
            derived_from_rules: vec![RuleId("rule-1".into())],
        }
    }

    fn service() -> EndpointPolicyService {
        EndpointPolicyService::new(
            EndpointId(7),
            Box::new(FakePolicyMap::new()),
            Box::new(FakeProxy::new()),
            Arc::new(NoopMetrics),
            false,
        )
    }

    #[tokio::test]
    async fn full_regeneration_writes_desired_entries() {
        let svc = service();
        let cancel = CancellationToken::new();
        let (diffs, _) = svc
            .set_desired_policy(
                vec![
                    allow_update(tcp_key(10, 80), 1),
                    allow_update(tcp_key(20, 443), 1),
                ],
                PolicyFeatures::ALL,
                Version(1),
                true,
                true,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(diffs, 2);

        let realized = svc.realized().await;
        assert_eq!(realized.len(), 2);
        assert!(realized.contains_key(&tcp_key(10, 80)));
    }

    #[tokio::test]
    async fn unenforced_directions_allow_all() {
        let svc = service();
        let cancel = CancellationToken::new();
        svc.set_desired_policy(vec![], PolicyFeatures::ALL, Version(1), false, true, &cancel)
            .await
            .unwrap();
        let desired = svc.dump().await;
        assert!(desired.contains_key(&Key::ingress()));
        assert!(!desired.contains_key(&Key::egress()));
    }

    #[tokio::test]
    async fn localhost_bootstrap_entry_is_inserted() {
        let svc = EndpointPolicyService::new(
            EndpointId(7),
            Box::new(FakePolicyMap::new()),
            Box::new(FakeProxy::new()),
            Arc::new(NoopMetrics),
            true,
        );
        let cancel = CancellationToken::new();
        svc.set_desired_policy(vec![], PolicyFeatures::ALL, Version(1), true, true, &cancel)
            .await
            .unwrap();
        let desired = svc.dump().await;
        let host = desired
            .get(&Key::ingress().with_identity(Identity::HOST))
            .unwrap();
        assert!(!host.is_deny);
        assert_eq!(host.has_auth_type, HasAuthType::Explicit);
        assert_eq!(host.auth_type, AuthType::Disabled);
    }

    #[tokio::test]
    async fn redirect_updates_resolve_through_proxy() {
        let svc = service();
        let cancel = CancellationToken::new();
        let update = PolicyUpdate {
            key: tcp_key(10, 80),
            entry: MapStateEntry::allow().with_redirect(UNREALIZED_REDIRECT_PORT, "envoy"),
            priority: 0,
            owner: Some(OwnerId(1)),
            derived_from_rules: vec![],
        };
        svc.set_desired_policy(
            vec![update],
            PolicyFeatures::ALL,
            Version(1),
            true,
            true,
            &cancel,
        )
        .await
        .unwrap();

        let desired = svc.dump().await;
        let entry = desired.get(&tcp_key(10, 80)).unwrap();
        assert_eq!(entry.proxy_port, 10000); // first FakeProxy port
        assert_eq!(svc.realized().await[&tcp_key(10, 80)].proxy_port, 10000);

        let stats = svc.proxy_stats();
        assert_eq!(stats.get("ingress:TCP:80:10000"), Some(&1));
    }

    #[tokio::test]
    async fn pending_redirect_is_deferred_not_written() {
        let mut proxy = FakeProxy::new();
        proxy.pending.insert("slow".to_string());
        let svc = EndpointPolicyService::new(
            EndpointId(7),
            Box::new(FakePolicyMap::new()),
            Box::new(proxy),
            Arc::new(NoopMetrics),
            false,
        );
        let cancel = CancellationToken::new();
        let update = PolicyUpdate {
            key: tcp_key(10, 80),
            entry: MapStateEntry::allow().with_redirect(UNREALIZED_REDIRECT_PORT, "slow"),
            priority: 0,
            owner: Some(OwnerId(1)),
            derived_from_rules: vec![],
        };
        svc.set_desired_policy(
            vec![update],
            PolicyFeatures::ALL,
            Version(1),
            true,
            true,
            &cancel,
        )
        .await
        .unwrap();

        // Desired keeps the placeholder; the kernel map never sees it.
        let desired = svc.dump().await;
        assert_eq!(
            desired[&tcp_key(10, 80)].proxy_port,
            UNREALIZED_REDIRECT_PORT
        );
        assert!(svc.realized().await.is_empty());
    }

    #[tokio::test]
    async fn incremental_apply_add_cancels_delete() {
        // Batch: add K1, add K2, delete K1; only K2 becomes visible.
        let svc = service();
        let cancel = CancellationToken::new();
        let k1 = tcp_key(10, 80);
        let k2 = tcp_key(10, 443);
        let value = InternalEntry::new(Some(OwnerId(1)), vec![], MapStateEntry::allow(), 0);

        svc.accumulate_map_changes(&[Identity(10)], &[], &[k1, k2], &value)
            .await;
        svc.accumulate_map_changes(&[], &[Identity(10)], &[k1], &value)
            .await;
        svc.sync_map_changes(Version(1)).await;

        let changes = svc.apply_policy_map_changes(&cancel).await.unwrap();
        assert_eq!(changes.adds.len(), 1);
        assert!(changes.adds.contains(&k2));
        assert!(changes.deletes.is_empty());

        let realized = svc.realized().await;
        assert_eq!(realized.len(), 1);
        assert!(realized.contains_key(&k2));
    }

    #[tokio::test]
    async fn cancellation_reverts_incremental_batch() {
        let svc = service();
        let value = InternalEntry::new(Some(OwnerId(1)), vec![], MapStateEntry::allow(), 0);
        svc.accumulate_map_changes(&[Identity(10)], &[], &[tcp_key(10, 80)], &value)
            .await;
        svc.sync_map_changes(Version(1)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = svc.apply_policy_map_changes(&cancel).await.unwrap_err();
        assert!(err.is_canceled());

        // Nothing reached the desired state or the kernel.
        assert!(svc.dump().await.is_empty());
        assert!(svc.realized().await.is_empty());
    }

    #[tokio::test]
    async fn transactional_identity_removal() {
        // Identity 42 contributed three keys; removing it drops all three.
        let svc = service();
        let cancel = CancellationToken::new();
        let keys = [tcp_key(42, 80), tcp_key(42, 443), tcp_key(42, 8080)];
        let value = InternalEntry::new(Some(OwnerId(1)), vec![], MapStateEntry::allow(), 0);
        let bare: Vec<Key> = keys
            .iter()
            .map(|k| k.with_identity(Identity::ANY))
            .collect();

        svc.accumulate_map_changes(&[Identity(42)], &[], &bare, &value)
            .await;
        svc.sync_map_changes(Version(1)).await;
        svc.apply_policy_map_changes(&cancel).await.unwrap();
        assert_eq!(svc.realized().await.len(), 3);

        svc.accumulate_map_changes(&[], &[Identity(42)], &bare, &value)
            .await;
        svc.sync_map_changes(Version(2)).await;
        let changes = svc.apply_policy_map_changes(&cancel).await.unwrap();
        assert_eq!(changes.deletes.len(), 3);
        assert!(svc.realized().await.is_empty());
    }

    #[tokio::test]
    async fn sync_with_dump_restores_tampered_map() {
        let svc = service();
        let cancel = CancellationToken::new();
        svc.set_desired_policy(
            vec![allow_update(tcp_key(10, 80), 1)],
            PolicyFeatures::ALL,
            Version(1),
            true,
            true,
            &cancel,
        )
        .await
        .unwrap();

        // Tamper: empty the kernel map behind the agent's back.
        {
            let mut state = svc.state.write().await;
            let state = &mut *state;
            let keys: Vec<_> = state.realized.keys().copied().collect();
            for k in keys {
                state.map.delete(&k.to_wire()).unwrap();
            }
        }

        let fixed = svc.sync_with_dump().await.unwrap();
        assert_eq!(fixed, 1);
        assert_eq!(svc.realized().await.len(), 1);

        // A second pass finds nothing to fix.
        assert_eq!(svc.sync_with_dump().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dump_failure_reopens_once() {
        let mut map = FakePolicyMap::new();
        map.fail_dumps = 1;
        let svc = EndpointPolicyService::new(
            EndpointId(7),
            Box::new(map),
            Box::new(FakeProxy::new()),
            Arc::new(NoopMetrics),
            false,
        );
        assert_eq!(svc.sync_with_dump().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn persistent_dump_failure_surfaces() {
        let mut map = FakePolicyMap::new();
        map.fail_dumps = 2;
        let svc = EndpointPolicyService::new(
            EndpointId(7),
            Box::new(map),
            Box::new(FakeProxy::new()),
            Arc::new(NoopMetrics),
            false,
        );
        assert!(svc.sync_with_dump().await.is_err());
    }

    #[tokio::test]
    async fn diff_reports_divergence() {
        let svc = service();
        let cancel = CancellationToken::new();
        svc.set_desired_policy(
            vec![allow_update(tcp_key(10, 80), 1)],
            PolicyFeatures::ALL,
            Version(1),
            true,
            true,
            &cancel,
        )
        .await
        .unwrap();

        let mut expected = MapStateMap::new();
        expected.insert(tcp_key(20, 443), MapStateEntry::deny());
        let diff = svc.diff(&expected).await;
        assert!(diff.contains("- ingress:20/TCP:443/16"));
        assert!(diff.contains("+ ingress:10/TCP:80/16"));
    }

    #[tokio::test]
    async fn stale_listeners_are_released() {
        let svc = service();
        let cancel = CancellationToken::new();
        let redirect_update = PolicyUpdate {
            key: tcp_key(10, 80),
            entry: MapStateEntry::allow().with_redirect(UNREALIZED_REDIRECT_PORT, "envoy"),
            priority: 0,
            owner: Some(OwnerId(1)),
            derived_from_rules: vec![],
        };
        svc.set_desired_policy(
            vec![redirect_update],
            PolicyFeatures::ALL,
            Version(1),
            true,
            true,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(svc.proxy_stats().len(), 1);

        // New policy without the redirect: the listener is released.
        svc.set_desired_policy(
            vec![allow_update(tcp_key(10, 80), 1)],
            PolicyFeatures::ALL,
            Version(2),
            true,
            true,
            &cancel,
        )
        .await
        .unwrap();
        assert!(svc.proxy_stats().is_empty());
        let state = svc.state.read().await;
        assert!(state.redirects.is_empty());
    }

    #[tokio::test]
    async fn deny_precedence_end_to_end() {
        // Allow for one identity, then a policy with a broad deny: the
        // narrow allow never reaches the kernel map.
        let svc = service();
        let cancel = CancellationToken::new();
        let deny_update = PolicyUpdate {
            key: Key::ingress().with_port_proto(Protocol::Tcp, 0),
            entry: MapStateEntry::deny(),
            priority: 0,
            owner: Some(OwnerId(2)),
            derived_from_rules: vec![],
        };
        svc.set_desired_policy(
            vec![allow_update(tcp_key(10, 80), 1), deny_update],
            PolicyFeatures::ALL,
            Version(1),
            true,
            true,
            &cancel,
        )
        .await
        .unwrap();

        let realized = svc.realized().await;
        assert_eq!(realized.len(), 1);
        let entry = &realized[&Key::ingress().with_port_proto(Protocol::Tcp, 0)];
        assert!(entry.is_deny);
    }

    #[tokio::test]
    async fn writes_strictly_precede_deletes() {
        // In-place policy change: K_old is replaced by K_new. The write of
        // K_new must land before the delete of K_old.
        let shared = SharedPolicyMap::new();
        let svc = EndpointPolicyService::new(
            EndpointId(7),
            Box::new(shared.clone()),
            Box::new(FakeProxy::new()),
            Arc::new(NoopMetrics),
            false,
        );
        let cancel = CancellationToken::new();
        svc.set_desired_policy(
            vec![allow_update(tcp_key(10, 80), 1)],
            PolicyFeatures::ALL,
            Version(1),
            true,
            true,
            &cancel,
        )
        .await
        .unwrap();

        svc.set_desired_policy(
            vec![allow_update(tcp_key(20, 443), 1)],
            PolicyFeatures::ALL,
            Version(2),
            true,
            true,
            &cancel,
        )
        .await
        .unwrap();

        let map = shared.lock();
        let first_delete = map.first_delete_index().unwrap();
        let last_upsert = map.last_upsert_index().unwrap();
        assert!(last_upsert < first_delete, "add must precede delete");
        assert_eq!(map.entries.len(), 1);
        assert!(map.entries.contains_key(&tcp_key(20, 443).to_wire()));
    }

    #[tokio::test]
    async fn sync_full_converges_and_reports_diffs() {
        let svc = service();
        let cancel = CancellationToken::new();
        svc.set_desired_policy(
            vec![allow_update(tcp_key(10, 80), 1)],
            PolicyFeatures::ALL,
            Version(1),
            true,
            true,
            &cancel,
        )
        .await
        .unwrap();

        // Already converged: nothing to do.
        let (diffs, changes) = svc.sync_full().await.unwrap();
        assert_eq!(diffs, 0);
        assert!(changes.is_empty());

        // Forget the realized view; a full sync rewrites every entry.
        svc.state.write().await.realized.clear();
        let (diffs, changes) = svc.sync_full().await.unwrap();
        assert_eq!(diffs, 1);
        assert!(changes[0].add);
        assert_eq!(changes[0].key, tcp_key(10, 80));
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let svc = service();
        let cancel = CancellationToken::new();
        svc.set_desired_policy(vec![], PolicyFeatures::ALL, Version(5), true, true, &cancel)
            .await
            .unwrap();
        let err = svc
            .set_desired_policy(vec![], PolicyFeatures::ALL, Version(5), true, true, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::StaleVersion { .. }));
    }
}
