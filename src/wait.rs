//! Bounded waiting.
//!
//! Every wait in this operator polls on a fixed period until a condition is
//! observed or a timeout elapses; expiry surfaces as an error instead of a
//! leaked waiter. The `(timeout, period)` pair is always explicit.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;
use tracing::debug;

use crate::labels;
use crate::selector::Selector;
use crate::store::ResourceStore;

#[derive(Error, Debug)]
pub enum WaitError {
    #[error("timed out after {waited:?} waiting for {what}")]
    TimedOut { what: String, waited: Duration },
}

pub type WaitResult<T> = std::result::Result<T, WaitError>;

/// Timeout/period pair for one wait loop.
#[derive(Debug, Clone, Copy)]
pub struct WaitParams {
    pub timeout: Duration,
    pub period: Duration,
}

impl WaitParams {
    pub fn from_secs(timeout_secs: u64, period_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            period: Duration::from_secs(period_secs),
        }
    }
}

/// Poll `probe` every `params.period` until it returns true or
/// `params.timeout` elapses. The first probe lands one period in, and the
/// loop never blocks past the timeout.
pub async fn poll_until<F, Fut>(what: &str, params: WaitParams, mut probe: F) -> WaitResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let mut ticker = tokio::time::interval(params.period);
    // a tokio interval's first tick completes immediately; consume it
    ticker.tick().await;

    let timeout = tokio::time::sleep(params.timeout);
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            _ = &mut timeout => {
                return Err(WaitError::TimedOut {
                    what: what.to_string(),
                    waited: params.timeout,
                });
            }
            _ = ticker.tick() => {
                if probe().await {
                    return Ok(());
                }
                debug!(what, "still waiting");
            }
        }
    }
}

/// Wait until a deployment reports all its desired replicas ready.
pub async fn deployment_ready(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
    params: WaitParams,
) -> WaitResult<()> {
    poll_until(&format!("deployment {} to become ready", name), params, move || async move {
        match store.get_deployment(namespace, name).await {
            Ok(deployment) => {
                let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
                let ready = deployment
                    .status
                    .as_ref()
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or(0);
                desired > 0 && ready == desired
            }
            Err(e) => {
                // transient read errors keep the loop going; only the
                // timeout ends it
                debug!(error = %e, deployment = name, "readiness probe failed");
                false
            }
        }
    })
    .await
}

/// Wait until both a deployment and its same-named service are gone.
pub async fn deployment_and_service_gone(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
    params: WaitParams,
) -> WaitResult<()> {
    poll_until(&format!("deployment {} to be deleted", name), params, move || async move {
        let deployment_gone = matches!(
            store.get_deployment(namespace, name).await,
            Err(ref e) if e.is_not_found()
        );
        let service_gone = matches!(
            store.get_service(namespace, name).await,
            Err(ref e) if e.is_not_found()
        );
        deployment_gone && service_gone
    })
    .await
}

/// Wait until the named pod no longer exists.
pub async fn pod_gone(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
    params: WaitParams,
) -> WaitResult<()> {
    poll_until(&format!("pod {} to disappear", name), params, move || async move {
        matches!(store.get_pod(namespace, name).await, Err(ref e) if e.is_not_found())
    })
    .await
}

/// Wait until exactly one primary pod exists for the cluster and return it.
///
/// During a failover the outgoing pod can overlap with a freshly scheduled
/// one; both briefly carry the primary service label. Zero pods is a hard
/// failure, more than one means keep waiting for the terminating pod to go.
pub async fn single_primary_pod(
    store: &dyn ResourceStore,
    namespace: &str,
    cluster: &str,
    params: WaitParams,
) -> WaitResult<Option<Pod>> {
    let selector = Selector::new()
        .eq(labels::SERVICE_NAME, cluster)
        .ne(labels::BACKREST_RESTORE, "true")
        .ne(labels::BACKREST_JOB, "true");

    let mut ticker = tokio::time::interval(params.period);
    ticker.tick().await;

    let timeout = tokio::time::sleep(params.timeout);
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            _ = &mut timeout => {
                return Err(WaitError::TimedOut {
                    what: format!("a single primary pod of cluster {}", cluster),
                    waited: params.timeout,
                });
            }
            _ = ticker.tick() => {
                match store.list_pods(namespace, &selector).await {
                    Ok(pods) if pods.len() == 1 => {
                        return Ok(pods.into_iter().next());
                    }
                    Ok(pods) if pods.is_empty() => {
                        return Ok(None);
                    }
                    Ok(pods) => {
                        debug!(cluster, count = pods.len(), "waiting for terminating primary pod");
                    }
                    Err(e) => {
                        debug!(error = %e, cluster, "primary pod query failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn condition_met_returns_ok() {
        let params = WaitParams {
            timeout: Duration::from_millis(200),
            period: Duration::from_millis(10),
        };
        let polls = Arc::new(AtomicU32::new(0));
        let polls_in_probe = polls.clone();

        let result = poll_until("test condition", params, move || {
            let polls = polls_in_probe.clone();
            async move { polls.fetch_add(1, Ordering::SeqCst) >= 2 }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_ready_times_out_after_bounded_polls() {
        let params = WaitParams {
            timeout: Duration::from_millis(100),
            period: Duration::from_millis(10),
        };
        let polls = Arc::new(AtomicU32::new(0));
        let polls_in_probe = polls.clone();

        let result = poll_until("a condition that never holds", params, move || {
            let polls = polls_in_probe.clone();
            async move {
                polls.fetch_add(1, Ordering::SeqCst);
                false
            }
        })
        .await;

        match result {
            Err(WaitError::TimedOut { what, .. }) => {
                assert!(what.contains("never holds"));
            }
            Ok(()) => panic!("expected timeout"),
        }

        // roughly timeout / period polls, never unbounded
        let observed = polls.load(Ordering::SeqCst);
        assert!((5..=12).contains(&observed), "polls={}", observed);
    }
}
