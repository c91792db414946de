use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::endpoint_policy_impl::EndpointPolicyService;

/// Spawn the periodic policy map reconciliation task for one endpoint.
///
/// Every `interval` the task re-reads the kernel map and converges it back
/// to the desired state; rounds that coincide with a regeneration are
/// skipped by the service. The task exits when `cancel` fires.
pub fn spawn_sync_controller(
    service: Arc<EndpointPolicyService>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a freshly started
        // endpoint is not reconciled before its first policy computation.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match service.sync_with_dump().await {
                        Ok(0) => {}
                        Ok(diffs) => {
                            tracing::debug!(diffs, "periodic policy map reconciliation");
                        }
                        Err(err) if err.is_canceled() => break,
                        Err(err) => {
                            tracing::warn!(%err, "periodic policy map reconciliation failed");
                        }
                    }
                }
            }
        }
    })
}
