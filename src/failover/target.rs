//! Failover target selection.
//!
//! Given a cluster's replica deployments, find the most caught-up ready
//! standby. The ranking itself is pure; the async wrapper assembles the
//! candidate set from the store and the replication probe.

use tracing::{debug, warn};

use super::replication::{ReplicationInfo, ReplicationStatusProvider};
use super::{FailoverError, FailoverResult, database_container_ready};
use crate::labels;
use crate::selector::Selector;
use crate::store::ResourceStore;

/// Rank probed candidates and pick the promotion target.
///
/// The winner is the candidate with the maximum receive location; the first
/// seen wins ties. When a preferred node is configured and more than one
/// candidate is tied at the maximum, the first tied candidate on that node
/// wins instead. The preference never overrides a strictly higher location.
pub fn rank_candidates<'a>(
    candidates: &'a [ReplicationInfo],
    preferred_node: Option<&str>,
) -> Option<&'a ReplicationInfo> {
    let best = candidates.iter().map(|c| c.receive_location).max()?;

    let tied: Vec<&ReplicationInfo> = candidates
        .iter()
        .filter(|c| c.receive_location == best)
        .collect();

    if tied.len() > 1 {
        if let Some(node) = preferred_node {
            if let Some(preferred) = tied.iter().find(|c| c.node_name == node) {
                return Some(preferred);
            }
        }
    }

    tied.into_iter().next()
}

/// Resolve the best failover target for a cluster.
///
/// Replica deployments are those labeled with the cluster but not carrying
/// its primary service label. Candidates are replicas whose `database`
/// container is ready; replicas that fail the replication probe are skipped
/// with a warning. No ready candidate at all is an explicit error: the
/// caller must abort without touching the primary.
pub async fn best_failover_target(
    store: &dyn ResourceStore,
    provider: &dyn ReplicationStatusProvider,
    namespace: &str,
    cluster: &str,
    preferred_node: Option<&str>,
) -> FailoverResult<ReplicationInfo> {
    let selector = Selector::new()
        .eq(labels::PG_CLUSTER, cluster)
        .ne(labels::SERVICE_NAME, cluster);
    let deployments = store.list_deployments(namespace, &selector).await?;
    debug!(cluster, count = deployments.len(), "replica deployments found");

    if deployments.is_empty() {
        return Err(FailoverError::NoTarget(
            cluster.to_string(),
            "no replica deployments".to_string(),
        ));
    }

    let mut candidates = Vec::new();
    for deployment in &deployments {
        let name = match deployment.metadata.name.as_deref() {
            Some(name) => name,
            None => continue,
        };

        if !replica_pod_ready(store, namespace, name).await {
            debug!(deployment = name, "replica not ready, skipping");
            continue;
        }

        match provider.replication_info(namespace, name).await {
            Ok(info) => {
                debug!(
                    deployment = name,
                    receive = info.receive_location,
                    replay = info.replay_location,
                    "candidate probed"
                );
                candidates.push(info);
            }
            Err(e) => {
                warn!(deployment = name, error = %e, "replication probe failed, skipping");
            }
        }
    }

    rank_candidates(&candidates, preferred_node)
        .cloned()
        .ok_or_else(|| {
            FailoverError::NoTarget(
                cluster.to_string(),
                "no ready replica to promote".to_string(),
            )
        })
}

async fn replica_pod_ready(store: &dyn ResourceStore, namespace: &str, deployment: &str) -> bool {
    let selector = Selector::new().eq(labels::REPLICA_NAME, deployment);
    match store.list_pods(namespace, &selector).await {
        Ok(pods) => pods.first().map(database_container_ready).unwrap_or(false),
        Err(e) => {
            warn!(deployment, error = %e, "could not list replica pods");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(deployment: &str, node: &str, receive: u64) -> ReplicationInfo {
        ReplicationInfo {
            receive_location: receive,
            replay_location: receive,
            node_name: node.to_string(),
            deployment_name: deployment.to_string(),
        }
    }

    #[test]
    fn picks_max_receive_location() {
        let candidates = vec![
            candidate("a", "node1", 100),
            candidate("b", "node2", 150),
            candidate("c", "node3", 120),
        ];
        let best = rank_candidates(&candidates, None).unwrap();
        assert_eq!(best.deployment_name, "b");
    }

    #[test]
    fn first_seen_wins_ties_without_preference() {
        let candidates = vec![
            candidate("a", "node1", 100),
            candidate("b", "node2", 150),
            candidate("c", "node3", 150),
        ];
        let best = rank_candidates(&candidates, None).unwrap();
        assert_eq!(best.deployment_name, "b");
    }

    #[test]
    fn preferred_node_breaks_ties_only() {
        let candidates = vec![
            candidate("a", "node1", 100),
            candidate("b", "node2", 150),
            candidate("c", "preferred", 150),
        ];

        let best = rank_candidates(&candidates, Some("preferred")).unwrap();
        assert_eq!(best.deployment_name, "c");
    }

    #[test]
    fn preference_never_overrides_higher_location() {
        let candidates = vec![
            candidate("r-nodea", "nodeA", 200),
            candidate("r-nodeb", "nodeB", 250),
        ];

        // no tie: the strictly higher receive location wins even though the
        // lower one sits on the preferred node
        let best = rank_candidates(&candidates, Some("nodeA")).unwrap();
        assert_eq!(best.deployment_name, "r-nodeb");
    }

    #[test]
    fn preferred_node_absent_from_tie_falls_back_to_first() {
        let candidates = vec![
            candidate("b", "node2", 150),
            candidate("c", "node3", 150),
        ];
        let best = rank_candidates(&candidates, Some("elsewhere")).unwrap();
        assert_eq!(best.deployment_name, "b");
    }

    #[test]
    fn empty_candidates_yield_none() {
        assert!(rank_candidates(&[], None).is_none());
    }
}
