//! Primary health watching and failover debounce.
//!
//! Readiness observations for autofail-enabled clusters are folded into a
//! per-cluster event-log task. A NotReady observation starts one debounce
//! per cluster: sleep the configured interval, re-check the recorded state,
//! and only if the cluster is still NotReady resolve a promotion target and
//! create the failover task. Clusters debounce independently and
//! concurrently.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::replication::ReplicationStatusProvider;
use super::target::best_failover_target;
use super::{FailoverResult, database_container_ready, pod_label};
use crate::config::OperatorConfig;
use crate::crd::task::{self as task_crd, TaskType, autofail_task_name, failover_task_name};
use crate::labels;
use crate::selector::Selector;
use crate::store::ResourceStore;
use crate::task::{build_task, create_task_if_absent};

/// Event markers recorded in the autofail task.
pub const EVENT_READY: &str = "Ready";
pub const EVENT_NOT_READY: &str = "NotReady";

#[derive(Clone)]
pub struct FailoverDetector {
    store: Arc<dyn ResourceStore>,
    replication: Arc<dyn ReplicationStatusProvider>,
    config: OperatorConfig,
}

impl FailoverDetector {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        replication: Arc<dyn ReplicationStatusProvider>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            store,
            replication,
            config,
        }
    }

    /// Seed detection state for a namespace at process start.
    ///
    /// Every pod labeled for autofail contributes its current `database`
    /// readiness; clusters already NotReady go straight into a debounce.
    pub async fn initialize(&self, namespace: &str) -> FailoverResult<()> {
        let pods = self
            .store
            .list_pods(namespace, &Selector::new().has(labels::AUTOFAIL))
            .await?;
        info!(namespace, count = pods.len(), "autofail pods found at startup");

        for pod in &pods {
            let cluster = match pod_label(pod, labels::PG_CLUSTER) {
                Some(cluster) => cluster.to_string(),
                None => continue,
            };
            let has_database_status = pod
                .status
                .as_ref()
                .and_then(|s| s.container_statuses.as_ref())
                .map(|statuses| statuses.iter().any(|c| c.name == super::DATABASE_CONTAINER))
                .unwrap_or(false);
            if !has_database_status {
                continue;
            }

            if database_container_ready(pod) {
                self.record_event(namespace, &cluster, EVENT_READY).await;
            } else {
                self.record_event(namespace, &cluster, EVENT_NOT_READY).await;
                self.spawn_debounce(namespace, &cluster);
            }
        }
        Ok(())
    }

    /// Feed one readiness observation for a cluster's primary.
    ///
    /// A cluster is registered the first time it is observed Ready; after
    /// that every transition is recorded, and a NotReady observation starts
    /// a debounce.
    pub async fn observe(&self, namespace: &str, cluster: &str, ready: bool) {
        debug!(namespace, cluster, ready, "primary readiness observed");

        let registered = self
            .store
            .get_task(namespace, &autofail_task_name(cluster))
            .await
            .is_ok();

        if registered {
            let event = if ready { EVENT_READY } else { EVENT_NOT_READY };
            self.record_event(namespace, cluster, event).await;
            if !ready {
                self.spawn_debounce(namespace, cluster);
            }
        } else if ready {
            // only register a cluster once it has been Ready at least once,
            // so a cluster that never came up does not trigger failovers
            info!(cluster, "registering cluster for failure detection");
            self.record_event(namespace, cluster, EVENT_READY).await;
        }
    }

    /// One independent debounce-and-trigger sequence for one cluster.
    fn spawn_debounce(&self, namespace: &str, cluster: &str) {
        let detector = self.clone();
        let namespace = namespace.to_string();
        let cluster = cluster.to_string();
        info!(cluster = %cluster, sleep_secs = self.config.autofail_sleep_seconds, "starting failover debounce");
        tokio::spawn(async move {
            detector.debounce(&namespace, &cluster).await;
        });
    }

    async fn debounce(&self, namespace: &str, cluster: &str) {
        tokio::time::sleep(Duration::from_secs(self.config.autofail_sleep_seconds)).await;

        let (status, event_log) = self.recorded_events(namespace, cluster).await;
        if event_log.is_empty() {
            debug!(cluster, "no recorded events for debounce, exiting");
            return;
        }

        // re-validate after the sleep: only a cluster still NotReady is
        // failed over, a recovery during the debounce cancels it
        if status != EVENT_NOT_READY {
            info!(cluster, status = %status, "primary recovered during debounce, not failing over");
            return;
        }

        info!(cluster, "debounce expired and primary still NotReady, triggering failover");
        if let Err(e) = self.trigger_failover(namespace, cluster).await {
            error!(cluster, error = %e, "could not trigger failover");
            return;
        }

        // clear the event log so the same outage is not re-processed
        self.clear(namespace, cluster).await;
    }

    /// Resolve a promotion target and create the failover task.
    async fn trigger_failover(&self, namespace: &str, cluster: &str) -> FailoverResult<()> {
        let target = best_failover_target(
            self.store.as_ref(),
            self.replication.as_ref(),
            namespace,
            cluster,
            self.config.preferred_failover_node.as_deref(),
        )
        .await?;

        let task_name = failover_task_name(cluster);

        // a leftover task from an earlier failover would block the new one
        match self.store.delete_task(namespace, &task_name).await {
            Ok(()) => debug!(task = %task_name, "removed stale failover task"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let task = build_task(
            &task_name,
            TaskType::Failover,
            BTreeMap::from([
                (labels::TARGET.to_string(), target.deployment_name.clone()),
                (labels::PG_CLUSTER.to_string(), cluster.to_string()),
            ]),
            BTreeMap::from([(
                task_crd::params::CLUSTER_NAME.to_string(),
                cluster.to_string(),
            )]),
        );

        create_task_if_absent(self.store.as_ref(), namespace, task).await?;
        info!(cluster, target = %target.deployment_name, "failover task created");
        Ok(())
    }

    /// Fold an observation into the cluster's event-log task.
    async fn record_event(&self, namespace: &str, cluster: &str, event: &str) {
        let mut task = build_task(
            &autofail_task_name(cluster),
            TaskType::AutoFailover,
            BTreeMap::from([
                (labels::AUTOFAIL.to_string(), "true".to_string()),
                (labels::PG_CLUSTER.to_string(), cluster.to_string()),
            ]),
            BTreeMap::from([(Utc::now().to_rfc3339(), event.to_string())]),
        );
        task.spec.status = event.to_string();

        if let Err(e) = create_task_if_absent(self.store.as_ref(), namespace, task).await {
            warn!(cluster, error = %e, "could not record autofail event");
        }
    }

    /// Latest recorded status plus the full event log for a cluster.
    async fn recorded_events(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> (String, BTreeMap<String, String>) {
        match self
            .store
            .get_task(namespace, &autofail_task_name(cluster))
            .await
        {
            Ok(task) => (task.spec.status, task.spec.parameters),
            Err(_) => (String::new(), BTreeMap::new()),
        }
    }

    async fn clear(&self, namespace: &str, cluster: &str) {
        match self
            .store
            .delete_task(namespace, &autofail_task_name(cluster))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(cluster, error = %e, "could not clear autofail event log"),
        }
    }
}
