//! The relabel failover strategy.
//!
//! Switchover here is label surgery: the primary Service keeps selecting
//! `service-name=<cluster>`, so promoting a replica means deleting the old
//! primary deployment, promoting the target instance, and moving that label
//! onto the target's pod and deployment. No Service object is recreated.
//!
//! Every step is appended to the failover task's status message. There is no
//! compensating rollback: the first error aborts the sequence and the audit
//! trail is what tells the operator how far it got.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::strategy::FailoverStrategy;
use super::{FailoverError, FailoverResult, has_database_container, pod_label};
use crate::config::OperatorConfig;
use crate::crd::{PgCluster, PgTask};
use crate::events::{self, Event, EventHeader, EventPublisher};
use crate::failover::promotion::PromotionService;
use crate::labels;
use crate::selector::Selector;
use crate::store::ResourceStore;
use crate::task;
use crate::wait;

pub struct RelabelFailover {
    store: Arc<dyn ResourceStore>,
    promotion: Arc<dyn PromotionService>,
    events: Arc<dyn EventPublisher>,
    config: OperatorConfig,
}

impl RelabelFailover {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        promotion: Arc<dyn PromotionService>,
        events: Arc<dyn EventPublisher>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            store,
            promotion,
            events,
            config,
        }
    }

    /// Delete the current primary deployment and wait for its pod to
    /// disappear. The pod must be gone before promotion so the old primary
    /// cannot briefly take writes behind the service.
    async fn delete_primary(&self, namespace: &str, cluster: &str) -> FailoverResult<()> {
        let pod = wait::single_primary_pod(
            self.store.as_ref(),
            namespace,
            cluster,
            self.config.primary_isolate_wait,
        )
        .await?
        .ok_or_else(|| {
            FailoverError::Validation(format!("no primary pod found for cluster {}", cluster))
        })?;

        let pod_name = pod.name_any();
        let deployment = pod_label(&pod, labels::DEPLOYMENT_NAME)
            .unwrap_or(cluster)
            .to_string();

        events::publish(
            self.events.as_ref(),
            Event::PrimaryDeleted {
                header: EventHeader::new(namespace),
                cluster: cluster.to_string(),
                deployment: deployment.clone(),
            },
        )
        .await;

        debug!(deployment = %deployment, "deleting primary deployment");
        self.store.delete_deployment(namespace, &deployment).await?;

        wait::pod_gone(
            self.store.as_ref(),
            namespace,
            &pod_name,
            self.config.primary_delete_wait,
        )
        .await?;
        debug!(pod = %pod_name, "old primary pod gone, safe to proceed");
        Ok(())
    }
}

#[async_trait]
impl FailoverStrategy for RelabelFailover {
    async fn failover(
        &self,
        namespace: &str,
        cluster: &PgCluster,
        task: &PgTask,
    ) -> FailoverResult<String> {
        let cluster_name = cluster.spec.cluster_name.clone();
        let task_name = task.name_any();
        let store = self.store.as_ref();

        let target = task
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(labels::TARGET))
            .cloned()
            .ok_or_else(|| {
                FailoverError::Validation(format!("task {} has no target label", task_name))
            })?;

        info!(cluster = %cluster_name, target = %target, "failover started");

        // resolve the target pod up front; nothing is touched if it is gone
        let target_pods = store
            .list_pods(namespace, &Selector::new().eq(labels::REPLICA_NAME, &target))
            .await?;
        let pod = match target_pods.as_slice() {
            [pod] => pod.clone(),
            other => {
                return Err(FailoverError::Validation(format!(
                    "could not determine which pod to failover to: {} pods for {}",
                    other.len(),
                    target
                )));
            }
        };
        if !has_database_container(&pod) {
            return Err(FailoverError::Validation(format!(
                "pod {} has no database container",
                pod.name_any()
            )));
        }
        let pod_name = pod.name_any();
        debug!(pod = %pod_name, "pod selected to failover to");

        // delete the primary deployment if one exists; after a prior partial
        // failover (or an operator deleting it by hand) there is nothing to
        // remove and deletion is skipped
        let primary_selector = Selector::new()
            .eq(labels::PG_CLUSTER, &cluster_name)
            .eq(labels::SERVICE_NAME, &cluster_name);
        let primaries = store.list_deployments(namespace, &primary_selector).await?;
        if primaries.is_empty() {
            debug!(cluster = %cluster_name, "primary deployment not found, skipping removal");
        } else {
            self.delete_primary(namespace, &cluster_name).await?;
        }
        task::record_audit(
            store,
            namespace,
            &task_name,
            &format!("deleted primary deployment {}", cluster_name),
        )
        .await;

        self.promotion.promote(namespace, &pod_name).await?;

        events::publish(
            self.events.as_ref(),
            Event::FailoverPerformed {
                header: EventHeader::new(namespace),
                cluster: cluster_name.clone(),
                target: target.clone(),
            },
        )
        .await;

        task::record_audit(
            store,
            namespace,
            &task_name,
            &format!("promoting pod {} target {}", pod_name, target),
        )
        .await;

        // move the primary service selector label; this is the switchover
        let refreshed = store.get_pod(namespace, &pod_name).await?;
        store
            .add_pod_label(namespace, &pod_name, labels::SERVICE_NAME, &cluster_name)
            .await?;

        let target_deployment = pod_label(&refreshed, labels::DEPLOYMENT_NAME)
            .unwrap_or(target.as_str())
            .to_string();
        store
            .add_deployment_label(
                namespace,
                &target_deployment,
                labels::SERVICE_NAME,
                &cluster_name,
            )
            .await?;

        task::record_audit(
            store,
            namespace,
            &task_name,
            &format!(
                "updating label deployment...pod {} was the failover target...failover completed",
                pod_name
            ),
        )
        .await;

        // track the new primary on the cluster record
        let patch = BTreeMap::from([(
            labels::CURRENT_PRIMARY.to_string(),
            target_deployment.clone(),
        )]);
        if let Err(e) = store
            .patch_cluster_labels(namespace, &cluster_name, patch)
            .await
        {
            warn!(cluster = %cluster_name, error = %e, "could not patch current-primary label");
            return Err(e.into());
        }

        info!(cluster = %cluster_name, new_primary = %target_deployment, "failover completed");
        Ok(target_deployment)
    }
}
