//! Replication position probing.
//!
//! Ranking failover candidates needs each standby's current WAL receive and
//! replay positions. [`ReplicationStatusProvider`] is the seam:
//! [`ExecReplicationStatus`] queries the live instance through the exec
//! transport, and [`CannedReplicationStatus`] returns fixed positions for
//! tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{DATABASE_CONTAINER, FailoverError, FailoverResult};
use crate::exec::PodExec;
use crate::labels;
use crate::selector::Selector;
use crate::store::ResourceStore;

/// Transient snapshot of a standby's replication state. Computed during
/// target selection, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationInfo {
    /// WAL receive position as a byte offset from the WAL origin.
    pub receive_location: u64,
    /// WAL replay position as a byte offset from the WAL origin.
    pub replay_location: u64,
    /// Node the standby's pod is scheduled on.
    pub node_name: String,
    /// Deployment backing the standby.
    pub deployment_name: String,
}

#[async_trait]
pub trait ReplicationStatusProvider: Send + Sync {
    /// Probe the replication state of the standby behind `deployment_name`.
    async fn replication_info(
        &self,
        namespace: &str,
        deployment_name: &str,
    ) -> FailoverResult<ReplicationInfo>;
}

/// Queries `server_version_num` first because the WAL position functions
/// were renamed in PostgreSQL 10.
const VERSION_QUERY: &str = "SELECT current_setting('server_version_num')";

const REPLICATION_QUERY_V10: &str = "SELECT pg_wal_lsn_diff(pg_last_wal_receive_lsn(), '0/0')::bigint, pg_wal_lsn_diff(pg_last_wal_replay_lsn(), '0/0')::bigint";

const REPLICATION_QUERY_V9: &str = "SELECT pg_xlog_location_diff(pg_last_xlog_receive_location(), '0/0')::bigint, pg_xlog_location_diff(pg_last_xlog_replay_location(), '0/0')::bigint";

/// Probes a live instance by running `psql` inside its `database` container.
pub struct ExecReplicationStatus {
    store: Arc<dyn ResourceStore>,
    exec: Arc<dyn PodExec>,
}

impl ExecReplicationStatus {
    pub fn new(store: Arc<dyn ResourceStore>, exec: Arc<dyn PodExec>) -> Self {
        Self { store, exec }
    }

    async fn run_query(
        &self,
        namespace: &str,
        pod: &str,
        query: &str,
    ) -> FailoverResult<String> {
        let command = vec![
            "psql".to_string(),
            "-qtA".to_string(),
            "-c".to_string(),
            query.to_string(),
        ];
        let output = self
            .exec
            .exec(namespace, pod, DATABASE_CONTAINER, &command)
            .await?;
        Ok(output.stdout.trim().to_string())
    }
}

#[async_trait]
impl ReplicationStatusProvider for ExecReplicationStatus {
    async fn replication_info(
        &self,
        namespace: &str,
        deployment_name: &str,
    ) -> FailoverResult<ReplicationInfo> {
        let probe_err = |message: String| FailoverError::Probe {
            deployment: deployment_name.to_string(),
            message,
        };

        let pods = self
            .store
            .list_pods(
                namespace,
                &Selector::new().eq(labels::REPLICA_NAME, deployment_name),
            )
            .await?;
        let pod = match pods.as_slice() {
            [pod] => pod,
            other => {
                return Err(probe_err(format!(
                    "expected one pod for deployment, found {}",
                    other.len()
                )));
            }
        };
        let pod_name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| probe_err("pod has no name".to_string()))?;
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();

        let version_raw = self.run_query(namespace, &pod_name, VERSION_QUERY).await?;
        let version: u64 = version_raw
            .parse()
            .map_err(|_| probe_err(format!("unparseable server version {:?}", version_raw)))?;

        let query = if version < 100_000 {
            REPLICATION_QUERY_V9
        } else {
            REPLICATION_QUERY_V10
        };

        let raw = self.run_query(namespace, &pod_name, query).await?;
        let (receive, replay) = parse_locations(&raw)
            .ok_or_else(|| probe_err(format!("unparseable replication positions {:?}", raw)))?;

        debug!(
            deployment = deployment_name,
            receive, replay, node = %node_name, "probed replication positions"
        );

        Ok(ReplicationInfo {
            receive_location: receive,
            replay_location: replay,
            node_name,
            deployment_name: deployment_name.to_string(),
        })
    }
}

/// Parse `psql -qtA` two-column output, `receive|replay`.
fn parse_locations(raw: &str) -> Option<(u64, u64)> {
    let mut fields = raw.trim().split('|');
    let receive = fields.next()?.trim().parse().ok()?;
    let replay = fields.next()?.trim().parse().ok()?;
    Some((receive, replay))
}

/// Returns canned positions keyed by deployment name; unknown deployments
/// fail the probe, mirroring an unreachable instance.
#[derive(Default)]
pub struct CannedReplicationStatus {
    infos: HashMap<String, ReplicationInfo>,
}

impl CannedReplicationStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, info: ReplicationInfo) -> Self {
        self.infos.insert(info.deployment_name.clone(), info);
        self
    }
}

#[async_trait]
impl ReplicationStatusProvider for CannedReplicationStatus {
    async fn replication_info(
        &self,
        _namespace: &str,
        deployment_name: &str,
    ) -> FailoverResult<ReplicationInfo> {
        self.infos
            .get(deployment_name)
            .cloned()
            .ok_or_else(|| FailoverError::Probe {
                deployment: deployment_name.to_string(),
                message: "no canned replication info".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_column_output() {
        assert_eq!(parse_locations("150|140"), Some((150, 140)));
        assert_eq!(parse_locations(" 150 | 140 \n"), Some((150, 140)));
        assert_eq!(parse_locations("garbage"), None);
        assert_eq!(parse_locations("150"), None);
    }
}
