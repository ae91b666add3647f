//! Clone step 1: provision the target's volumes and launch the repository
//! sync job.

use tracing::{debug, info};

use super::{
    CloneIdentifiers, CloneResult, CloneWorkflow, render, validate_storage_types,
};
use crate::crd::task::{PgTask, params, workflow_phases};
use crate::events::{self, Event, EventHeader};
use crate::failover::random_suffix;

impl CloneWorkflow {
    pub(crate) async fn step1(
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
            "clone step 1 called"
        );

        events::publish(
            self.events.as_ref(),
            Event::CloneStarted {
                header: EventHeader::new(namespace),
                source_cluster: ids.source_cluster.clone(),
                target_cluster: ids.target_cluster.clone(),
                workflow_id: ids.workflow_id.clone(),
            },
        )
        .await;

        self.update_workflow(namespace, &ids.workflow_id, workflow_phases::CREATE_PVC)
            .await;

        let source = self
            .store
            .get_cluster(namespace, &ids.source_cluster)
            .await
            .map_err(|e| super::CloneError::SourceClusterMissing(e.to_string()))?;

        let requested_storage = task
            .spec
            .parameters
            .get(params::BACKREST_STORAGE_TYPE)
            .map(String::as_str)
            .unwrap_or("");
        validate_storage_types(requested_storage, source.backrest_storage_type())?;

        // the target name must be free; overwriting a live cluster would be
        // destructive
        if self
            .store
            .get_cluster(namespace, &ids.target_cluster)
            .await
            .is_ok()
        {
            return Err(super::CloneError::TargetExists(ids.target_cluster.clone()));
        }

        let volumes = self
            .create_clone_pvcs(namespace, task, &source, &ids.target_cluster)
            .await?;
        debug!(
            repo = %volumes.backrest_pvc,
            data = %volumes.data_pvc,
            "clone step 1: created pvcs"
        );

        self.update_workflow(namespace, &ids.workflow_id, workflow_phases::SYNC_REPO)
            .await;

        // S3 env only when the source repository actually uses S3
        let s3 = if source.backrest_storage_type().contains("s3") {
            let creds = self.s3_credentials(namespace, &ids.source_cluster).await?;
            Some(render::S3Env {
                storage_source: requested_storage.to_string(),
                bucket: source.spec.backrest_s3_bucket.clone(),
                endpoint: source.spec.backrest_s3_endpoint.clone(),
                region: source.spec.backrest_s3_region.clone(),
                key: creds.key,
                key_secret: creds.key_secret,
                local_and_s3: is_local_and_s3(source.backrest_storage_type()),
            })
        } else {
            None
        };

        let get_param = |key: &str| {
            task.spec
                .parameters
                .get(key)
                .map(String::as_str)
                .unwrap_or("")
                .to_string()
        };

        let job = render::repo_sync_job(&render::RepoSyncJobFields {
            job_name: format!(
                "pgo-backrest-repo-sync-{}-{}",
                ids.target_cluster,
                random_suffix(4)
            ),
            source_cluster: &ids.source_cluster,
            target_cluster: &ids.target_cluster,
            workflow_id: &ids.workflow_id,
            images: &self.config.images,
            supplemental_groups: volumes.supplemental_groups.clone(),
            s3,
            pvc_size: &get_param(params::PVC_SIZE),
            backrest_pvc_size: &get_param(params::BACKREST_PVC_SIZE),
            enable_metrics: &get_param(params::ENABLE_METRICS),
        });

        self.store.create_job(namespace, &job).await?;
        info!(
            job = job.metadata.name.as_deref().unwrap_or_default(),
            "clone step 1: created pgbackrest repo sync job"
        );

        self.mark_complete(namespace, task).await;
        Ok(())
    }
}

/// Whether the repository keeps both a local and an S3 copy.
pub(crate) fn is_local_and_s3(storage_type: &str) -> bool {
    storage_type.contains("local") && storage_type.contains("s3")
}
