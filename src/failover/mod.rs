//! Failure detection and failover.
//!
//! The pieces, leaf first: [`replication`] probes standby replication
//! positions, [`target`] ranks them, [`promotion`] promotes the winner,
//! [`executor`] sequences a full primary replacement, and [`detector`]
//! watches primary health and decides when to set it all in motion.

pub mod detector;
pub mod executor;
pub mod promotion;
pub mod replication;
pub mod strategy;
pub mod target;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::crd::task::{self as task_crd, PgTask};
use crate::crd::{PgCluster, PgReplica, PgReplicaSpec, PgReplicaStatus, TaskState};
use crate::exec::ExecError;
use crate::labels;
use crate::selector::Selector;
use crate::store::{ResourceStore, StoreError};
use crate::task;
use crate::wait::WaitError;

pub use detector::FailoverDetector;
pub use executor::RelabelFailover;
pub use promotion::{PatroniPromotion, PromotionService};
pub use replication::{
    CannedReplicationStatus, ExecReplicationStatus, ReplicationInfo, ReplicationStatusProvider,
};
pub use strategy::{FailoverStrategy, StrategyRegistry};

/// Name of the PostgreSQL container in every database pod.
pub const DATABASE_CONTAINER: &str = "database";

#[derive(Error, Debug)]
pub enum FailoverError {
    /// No ready replica to promote. The executor must not touch the primary
    /// when it sees this.
    #[error("no failover target for cluster {0}: {1}")]
    NoTarget(String, String),

    #[error("replication probe failed for {deployment}: {message}")]
    Probe { deployment: String, message: String },

    #[error("unknown failover strategy {0:?}")]
    UnknownStrategy(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Wait(#[from] WaitError),
}

pub type FailoverResult<T> = std::result::Result<T, FailoverError>;

/// Whether the pod's `database` container reports Ready.
pub(crate) fn database_container_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .any(|c| c.name == DATABASE_CONTAINER && c.ready)
        })
        .unwrap_or(false)
}

/// Whether the pod has a `database` container declared at all.
pub(crate) fn has_database_container(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .map(|s| s.containers.iter().any(|c| c.name == DATABASE_CONTAINER))
        .unwrap_or(false)
}

pub(crate) fn pod_label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

/// Handles a received failover task: resolves the cluster, runs the selected
/// strategy, and does the post-failover bookkeeping.
pub struct FailoverHandler {
    store: Arc<dyn ResourceStore>,
    strategies: StrategyRegistry,
    config: OperatorConfig,
}

impl FailoverHandler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        strategies: StrategyRegistry,
        config: OperatorConfig,
    ) -> Self {
        Self {
            store,
            strategies,
            config,
        }
    }

    pub async fn run(&self, namespace: &str, task: &PgTask) -> FailoverResult<()> {
        let task_name = task.name_any();
        let cluster_name = task
            .spec
            .parameters
            .get(task_crd::params::CLUSTER_NAME)
            .cloned()
            .ok_or_else(|| {
                FailoverError::Validation(format!("task {} has no cluster parameter", task_name))
            })?;

        let cluster = self.store.get_cluster(namespace, &cluster_name).await?;

        // marker so a redelivered task is visibly mid-flight
        if let Err(e) = task::stamp_parameter(
            self.store.as_ref(),
            namespace,
            &task_name,
            task_crd::params::FAILOVER_STARTED,
        )
        .await
        {
            warn!(task = %task_name, error = %e, "could not set failover-started marker");
        }

        // replica count before the failover consumes one
        let replicas_before = self
            .store
            .list_replicas(
                namespace,
                &Selector::new().eq(labels::PG_CLUSTER, &cluster_name),
            )
            .await?
            .len();
        debug!(cluster = %cluster_name, replicas = replicas_before, "replica count before failover");

        let strategy = self.strategies.strategy_for(&cluster.spec.strategy)?;
        strategy.failover(namespace, &cluster, task).await?;

        // the promoted instance is a primary now; drop its replica record
        if let Some(target) = task
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(labels::TARGET))
        {
            match self.store.delete_replica(namespace, target).await {
                Ok(()) => debug!(replica = %target, "removed replica record for promoted target"),
                Err(e) if e.is_not_found() => {
                    debug!(replica = %target, "no replica record for promoted target")
                }
                Err(e) => return Err(e.into()),
            }
        }

        let replaced = self.maybe_replace_replica(namespace, &cluster, task).await?;

        // the failover consumed the last replica; without a replacement the
        // replica service selects nothing
        if !replaced && replicas_before == 1 {
            let service = format!("{}-replica", cluster_name);
            info!(cluster = %cluster_name, service = %service, "removing orphaned replica service");
            match self.store.delete_service(namespace, &service).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(service = %service, error = %e, "could not delete replica service"),
            }
        }

        Ok(())
    }

    /// Decide whether to provision a replacement replica. Per-event user
    /// choice wins over the global default; neither set means no replacement.
    async fn maybe_replace_replica(
        &self,
        namespace: &str,
        cluster: &PgCluster,
        task: &PgTask,
    ) -> FailoverResult<bool> {
        let user_selection = task
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(labels::AUTOFAIL_REPLACE_REPLICA))
            .map(String::as_str);

        let replace = match user_selection {
            Some("true") => {
                debug!("replacing replica per event label");
                true
            }
            Some("false") => {
                debug!("not replacing replica per event label");
                false
            }
            _ => {
                if self.config.autofail_replace_replica {
                    debug!("replacing replica per global policy");
                    true
                } else {
                    debug!("not replacing replica");
                    false
                }
            }
        };

        if replace {
            self.replace_replica(namespace, cluster).await?;
        }
        Ok(replace)
    }

    async fn replace_replica(&self, namespace: &str, cluster: &PgCluster) -> FailoverResult<()> {
        let cluster_name = cluster.spec.cluster_name.clone();
        let unique_name = format!("{}-{}", cluster_name, random_suffix(4));

        let mut user_labels = cluster.spec.user_labels.clone();
        user_labels.insert(labels::PG_CLUSTER.to_string(), cluster_name.clone());

        let mut replica = PgReplica::new(
            &unique_name,
            PgReplicaSpec {
                name: unique_name.clone(),
                cluster_name: cluster_name.clone(),
                replica_storage: cluster.spec.replica_storage.clone(),
                user_labels,
            },
        );
        replica.metadata.labels = Some(BTreeMap::from([
            (labels::NAME.to_string(), unique_name.clone()),
            (labels::PG_CLUSTER.to_string(), cluster_name.clone()),
        ]));
        replica.status = Some(PgReplicaStatus {
            state: TaskState::Created,
            message: "Created, not processed yet".to_string(),
        });

        info!(cluster = %cluster_name, replica = %unique_name, "creating replacement replica");
        self.store.create_replica(namespace, &replica).await?;
        Ok(())
    }
}

/// Short lowercase suffix for generated resource names.
pub(crate) fn random_suffix(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_suffix_is_lowercase_alphanumeric() {
        let s = random_suffix(4);
        assert_eq!(s.len(), 4);
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn database_container_readiness() {
        use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};

        let mut pod = Pod::default();
        assert!(!database_container_ready(&pod));

        pod.status = Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: DATABASE_CONTAINER.to_string(),
                ready: true,
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(database_container_ready(&pod));

        pod.status = Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "sidecar".to_string(),
                ready: true,
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(!database_container_ready(&pod));
    }
}
