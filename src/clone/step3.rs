//! Clone step 3: tear down the temporary repository and create the target
//! cluster.

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::{debug, info};

use super::{CloneError, CloneIdentifiers, CloneResult, CloneWorkflow, render};
use crate::crd::task::{PgTask, params, workflow_phases};
use crate::crd::{ClusterState, PgCluster, PgClusterSpec, PgClusterStatus};
use crate::events::{self, Event, EventHeader};
use crate::labels;
use crate::selector::Selector;
use crate::wait;

impl CloneWorkflow {
    pub(crate) async fn step3(
        &self,
        namespace: &str,
        task: &PgTask,
        ids: &CloneIdentifiers,
    ) -> CloneResult<()> {
        debug!(
            namespace,
            source = %ids.source_cluster,
            target = %ids.target_cluster,
            workflow = %ids.workflow_id,
            "clone step 3 called"
        );

        let source = self
            .store
            .get_cluster(namespace, &ids.source_cluster)
            .await
            .map_err(|e| CloneError::SourceClusterMissing(e.to_string()))?;

        // the temporary repository served its purpose; the new cluster will
        // bring up its own. delete errors are tolerated here, the wait below
        // is the arbiter
        let repo_name = render::backrest_repo_deployment_name(&ids.target_cluster);
        if let Err(e) = self.store.delete_deployment(namespace, &repo_name).await {
            debug!(deployment = %repo_name, error = %e, "repo deployment delete");
        }
        if let Err(e) = self.store.delete_service(namespace, &repo_name).await {
            debug!(service = %repo_name, error = %e, "repo service delete");
        }

        wait::deployment_and_service_gone(
            self.store.as_ref(),
            namespace,
            &repo_name,
            self.config.repo_delete_wait,
        )
        .await
        .map_err(|e| {
            CloneError::Validation(format!("Could not remove temporary pgbackrest repo: {}", e))
        })?;

        self.clone_cluster_secrets(namespace, ids).await?;

        self.update_workflow(namespace, &ids.workflow_id, workflow_phases::CLUSTER_CREATE)
            .await;

        let target = build_target_cluster(&source, task, ids);
        self.store.create_cluster(namespace, &target).await?;
        info!(target = %ids.target_cluster, "clone step 3: created cluster");

        events::publish(
            self.events.as_ref(),
            Event::CloneCompleted {
                header: EventHeader::new(namespace),
                source_cluster: ids.source_cluster.clone(),
                target_cluster: ids.target_cluster.clone(),
                workflow_id: ids.workflow_id.clone(),
            },
        )
        .await;

        self.mark_complete(namespace, task).await;
        Ok(())
    }

    /// Copy the source's cluster-scoped secrets to target-derived names.
    /// The pgBackRest repository secret is excluded: the target initialized
    /// a fresh repository in step 2.
    async fn clone_cluster_secrets(
        &self,
        namespace: &str,
        ids: &CloneIdentifiers,
    ) -> CloneResult<()> {
        let selector = Selector::new()
            .eq(labels::PG_CLUSTER, &ids.source_cluster)
            .ne(labels::BACKREST_REPO, "true");
        let secrets = self.store.list_secrets(namespace, &selector).await?;

        for secret in secrets {
            let source_name = secret.name_any();
            let target_name =
                source_name.replacen(&ids.source_cluster, &ids.target_cluster, 1);

            let mut copied = secret.clone();
            copied.metadata = Default::default();
            copied.metadata.name = Some(target_name.clone());
            copied.metadata.labels = Some(BTreeMap::from([(
                labels::PG_CLUSTER.to_string(),
                ids.target_cluster.clone(),
            )]));

            match self.store.create_secret(namespace, &copied).await {
                Ok(()) => debug!(secret = %target_name, "cloned secret"),
                Err(e) if e.is_already_exists() => {
                    debug!(secret = %target_name, "secret already cloned")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Template the target cluster from the source, with the clone's deliberate
/// overrides applied.
fn build_target_cluster(source: &PgCluster, task: &PgTask, ids: &CloneIdentifiers) -> PgCluster {
    let target_name = ids.target_cluster.clone();
    let spec = &source.spec;

    let mut user_labels = BTreeMap::from([
        // opinionated: a freshly cloned cluster gets failure detection and
        // a backup repository whether or not the source had them
        (labels::AUTOFAIL.to_string(), "true".to_string()),
        (labels::BACKREST.to_string(), "true".to_string()),
    ]);
    if let Some(storage_type) = spec.user_labels.get(labels::BACKREST_STORAGE_TYPE) {
        user_labels.insert(labels::BACKREST_STORAGE_TYPE.to_string(), storage_type.clone());
    }
    if task.spec.parameters.get(params::ENABLE_METRICS).map(String::as_str) == Some("true") {
        user_labels.insert(labels::EXPORTER.to_string(), "true".to_string());
    }

    let mut primary_storage = spec.primary_storage.clone();
    let mut replica_storage = spec.replica_storage.clone();
    let mut backrest_storage = spec.backrest_storage.clone();
    if let Some(size) = task.spec.parameters.get(params::PVC_SIZE) {
        if !size.is_empty() {
            primary_storage.size = size.clone();
            replica_storage.size = size.clone();
        }
    }
    if let Some(size) = task.spec.parameters.get(params::BACKREST_PVC_SIZE) {
        if !size.is_empty() {
            backrest_storage.size = size.clone();
        }
    }

    let mut cluster = PgCluster::new(
        &target_name,
        PgClusterSpec {
            cluster_name: target_name.clone(),
            ccp_image: spec.ccp_image.clone(),
            ccp_image_tag: spec.ccp_image_tag.clone(),
            port: spec.port.clone(),
            // no replicas at clone time; scale-up comes later
            replicas: "0".to_string(),
            strategy: spec.strategy.clone(),
            primary_storage,
            replica_storage,
            backrest_storage,
            wal_storage: spec.wal_storage.clone(),
            tablespace_mounts: spec.tablespace_mounts.clone(),
            backrest_s3_bucket: spec.backrest_s3_bucket.clone(),
            backrest_s3_endpoint: spec.backrest_s3_endpoint.clone(),
            backrest_s3_region: spec.backrest_s3_region.clone(),
            // fresh secret names; the secrets themselves were cloned to
            // these names in this step
            root_secret_name: format!("{}-postgres-secret", target_name),
            primary_secret_name: format!("{}-primaryuser-secret", target_name),
            user_secret_name: format!("{}-{}-secret", target_name, spec.user),
            user: spec.user.clone(),
            database: spec.database.clone(),
            user_labels,
        },
    );

    cluster.metadata.labels = Some(BTreeMap::from([
        (labels::NAME.to_string(), target_name.clone()),
        (labels::AUTOFAIL.to_string(), "true".to_string()),
        (labels::BACKREST.to_string(), "true".to_string()),
        (labels::WORKFLOW_ID.to_string(), ids.workflow_id.clone()),
    ]));
    cluster.metadata.annotations = Some(BTreeMap::from([(
        labels::annotations::CURRENT_PRIMARY.to_string(),
        target_name,
    )]));
    cluster.status = Some(PgClusterStatus {
        state: ClusterState::Created,
        message: "Created, not processed yet".to_string(),
    });

    cluster
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::StorageSpec;
    use crate::crd::task::{PgTaskSpec, TaskType};

    fn source_cluster() -> PgCluster {
        PgCluster::new(
            "pg1",
            PgClusterSpec {
                cluster_name: "pg1".to_string(),
                ccp_image: "postgres-ha".to_string(),
                ccp_image_tag: "16.3".to_string(),
                port: "5432".to_string(),
                replicas: "2".to_string(),
                strategy: "1".to_string(),
                primary_storage: StorageSpec {
                    size: "10Gi".to_string(),
                    ..Default::default()
                },
                replica_storage: StorageSpec {
                    size: "10Gi".to_string(),
                    ..Default::default()
                },
                backrest_storage: StorageSpec {
                    size: "20Gi".to_string(),
                    ..Default::default()
                },
                wal_storage: StorageSpec::default(),
                tablespace_mounts: BTreeMap::new(),
                backrest_s3_bucket: String::new(),
                backrest_s3_endpoint: String::new(),
                backrest_s3_region: String::new(),
                root_secret_name: "pg1-postgres-secret".to_string(),
                primary_secret_name: "pg1-primaryuser-secret".to_string(),
                user_secret_name: "pg1-appuser-secret".to_string(),
                user: "appuser".to_string(),
                database: "appdb".to_string(),
                user_labels: BTreeMap::new(),
            },
        )
    }

    fn clone_task(overrides: &[(&str, &str)]) -> PgTask {
        let mut parameters = BTreeMap::from([
            ("sourceClusterName".to_string(), "pg1".to_string()),
            ("targetClusterName".to_string(), "copy1".to_string()),
            ("workflowid".to_string(), "wf-1".to_string()),
        ]);
        for (k, v) in overrides {
            parameters.insert(k.to_string(), v.to_string());
        }
        PgTask::new(
            "copy1-clone-step3",
            PgTaskSpec {
                name: "copy1-clone-step3".to_string(),
                task_type: TaskType::CloneStep3,
                status: String::new(),
                parameters,
            },
        )
    }

    fn ids() -> CloneIdentifiers {
        CloneIdentifiers {
            source_cluster: "pg1".to_string(),
            target_cluster: "copy1".to_string(),
            workflow_id: "wf-1".to_string(),
        }
    }

    #[test]
    fn target_cluster_carries_clone_overrides() {
        let target = build_target_cluster(&source_cluster(), &clone_task(&[]), &ids());

        assert_eq!(target.spec.cluster_name, "copy1");
        assert_eq!(target.spec.replicas, "0");
        assert_eq!(target.spec.root_secret_name, "copy1-postgres-secret");
        assert_eq!(target.spec.user_secret_name, "copy1-appuser-secret");
        assert!(target.user_label_enabled(labels::AUTOFAIL));
        assert!(target.user_label_enabled(labels::BACKREST));
        // source sizes carried through without overrides
        assert_eq!(target.spec.primary_storage.size, "10Gi");
        assert_eq!(target.spec.backrest_storage.size, "20Gi");
    }

    #[test]
    fn pvc_size_overrides_apply_to_data_and_repo() {
        let task = clone_task(&[("pvcSize", "50Gi"), ("backrestPVCSize", "100Gi")]);
        let target = build_target_cluster(&source_cluster(), &task, &ids());

        assert_eq!(target.spec.primary_storage.size, "50Gi");
        assert_eq!(target.spec.replica_storage.size, "50Gi");
        assert_eq!(target.spec.backrest_storage.size, "100Gi");
    }

    #[test]
    fn metrics_toggle_from_request_parameters() {
        let task = clone_task(&[("enableMetrics", "true")]);
        let target = build_target_cluster(&source_cluster(), &task, &ids());
        assert!(target.user_label_enabled(labels::EXPORTER));

        let target = build_target_cluster(&source_cluster(), &clone_task(&[]), &ids());
        assert!(!target.user_label_enabled(labels::EXPORTER));
    }
}
