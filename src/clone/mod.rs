//! Cloning a cluster from its pgBackRest repository.
//!
//! A clone runs as three tasks. Step 1 provisions the target's volumes and
//! launches a repository sync job; step 2 stands up a temporary repository
//! and launches a delta restore job; step 3 tears the temporary repository
//! down and creates the target cluster. A step advances to the next when the
//! job it launched succeeds, observed by the job controller, which creates
//! the next step's task.
//!
//! Every step is guarded by the completed-status sentinel, so redelivering a
//! finished task is a no-op. A failing step publishes a failure event and
//! leaves its task incomplete for external redrive; nothing retries here.

pub mod render;
mod step1;
mod step2;
mod step3;
mod volumes;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::OperatorConfig;
use crate::crd::task::{self as task_crd, PgTask, TaskType, clone_task_name};
use crate::events::{self, Event, EventHeader, EventPublisher};
use crate::exec::{ExecError, PodExec};
use crate::labels;
use crate::selector::Selector;
use crate::store::{ResourceStore, StoreError};
use crate::task::{build_task, complete_task, create_task_if_absent, stamp_parameter};
use crate::wait::WaitError;

#[derive(Error, Debug)]
pub enum CloneError {
    #[error("Could not find source cluster: {0}")]
    SourceClusterMissing(String),

    #[error("Not cloning the cluster: {0} already exists")]
    TargetExists(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Wait(#[from] WaitError),
}

pub type CloneResult<T> = std::result::Result<T, CloneError>;

/// Identifiers every clone task carries in its parameters.
#[derive(Debug, Clone)]
pub(crate) struct CloneIdentifiers {
    pub source_cluster: String,
    pub target_cluster: String,
    pub workflow_id: String,
}

/// S3 credentials pulled from a cluster's pgBackRest repository secret.
#[derive(Debug, Clone, Default)]
pub(crate) struct S3Credentials {
    pub key: String,
    pub key_secret: String,
    pub ca: String,
}

pub struct CloneWorkflow {
    pub(crate) store: Arc<dyn ResourceStore>,
    pub(crate) events: Arc<dyn EventPublisher>,
    pub(crate) exec: Arc<dyn PodExec>,
    pub(crate) config: OperatorConfig,
}

impl CloneWorkflow {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        events: Arc<dyn EventPublisher>,
        exec: Arc<dyn PodExec>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            store,
            events,
            exec,
            config,
        }
    }

    /// Entry point for a received clone task.
    pub async fn run(&self, namespace: &str, task: &PgTask) {
        // idempotence guard: a completed task is never re-processed
        if task.is_completed() {
            warn!(task = %task.name_any(), "task has already completed");
            return;
        }

        let ids = match self.identifiers(task) {
            Ok(ids) => ids,
            Err(e) => {
                error!(task = %task.name_any(), error = %e, "clone task missing identifiers");
                return;
            }
        };

        let result = match task.spec.task_type {
            TaskType::CloneStep1 => self.step1(namespace, task, &ids).await,
            TaskType::CloneStep2 => self.step2(namespace, task, &ids).await,
            TaskType::CloneStep3 => self.step3(namespace, task, &ids).await,
            other => {
                debug!(task_type = %other, "not a clone task");
                return;
            }
        };

        if let Err(e) = result {
            error!(task = %task.name_any(), error = %e, "clone step failed");
            self.publish_failure(namespace, &ids, &e.to_string()).await;
        }
    }

    /// Advance the workflow when a clone-step job finishes.
    ///
    /// A succeeded step-1 job begets the step-2 task; a succeeded step-2 job
    /// begets the step-3 task. Identifiers come back out of the job's
    /// annotations. Jobs already being deleted are ignored.
    pub async fn advance_on_job(&self, namespace: &str, job: &Job) {
        let job_labels = job.metadata.labels.clone().unwrap_or_default();

        let (phase, next_type) = if job_labels.get(labels::CLONE_STEP_1).map(String::as_str)
            == Some("true")
        {
            (task_crd::workflow_phases::RESTORE_BACKUP, TaskType::CloneStep2)
        } else if job_labels.get(labels::CLONE_STEP_2).map(String::as_str) == Some("true") {
            (task_crd::workflow_phases::CLUSTER_CREATE, TaskType::CloneStep3)
        } else {
            return;
        };

        // a propagated delete re-delivers the job with finalizers set
        if job
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty())
        {
            debug!(job = %job.name_any(), "job deletion in progress, skipping");
            return;
        }

        let succeeded = job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0);
        debug!(job = %job.name_any(), succeeded, "clone step job observed");
        if succeeded < 1 {
            return;
        }

        let annotations = job.metadata.annotations.clone().unwrap_or_default();
        let (source, target) = match (
            annotations.get(labels::annotations::CLONE_SOURCE_CLUSTER_NAME),
            annotations.get(labels::annotations::CLONE_TARGET_CLUSTER_NAME),
        ) {
            (Some(source), Some(target)) => (source.clone(), target.clone()),
            _ => {
                warn!(job = %job.name_any(), "clone job missing cluster annotations");
                return;
            }
        };
        let workflow_id = job_labels
            .get(labels::WORKFLOW_ID)
            .cloned()
            .unwrap_or_default();

        let ids = CloneIdentifiers {
            source_cluster: source,
            target_cluster: target,
            workflow_id,
        };

        info!(
            job = %job.name_any(),
            next = %next_type,
            "clone step job succeeded, advancing workflow"
        );
        self.update_workflow(namespace, &ids.workflow_id, phase).await;

        let mut parameters = BTreeMap::from([
            (
                task_crd::params::SOURCE_CLUSTER_NAME.to_string(),
                ids.source_cluster.clone(),
            ),
            (
                task_crd::params::TARGET_CLUSTER_NAME.to_string(),
                ids.target_cluster.clone(),
            ),
            (
                task_crd::params::WORKFLOW_ID.to_string(),
                ids.workflow_id.clone(),
            ),
        ]);
        // carry the requested overrides forward for step 3
        for key in [
            labels::annotations::CLONE_PVC_SIZE,
            labels::annotations::CLONE_BACKREST_PVC_SIZE,
            labels::annotations::CLONE_ENABLE_METRICS,
        ] {
            if let Some(value) = annotations.get(key) {
                let param = match key {
                    labels::annotations::CLONE_PVC_SIZE => task_crd::params::PVC_SIZE,
                    labels::annotations::CLONE_BACKREST_PVC_SIZE => {
                        task_crd::params::BACKREST_PVC_SIZE
                    }
                    _ => task_crd::params::ENABLE_METRICS,
                };
                parameters.insert(param.to_string(), value.clone());
            }
        }

        let step_label = match next_type {
            TaskType::CloneStep2 => labels::CLONE_STEP_2,
            _ => labels::CLONE_STEP_3,
        };
        let task = build_task(
            &clone_task_name(&ids.target_cluster, next_type),
            next_type,
            BTreeMap::from([
                (step_label.to_string(), "true".to_string()),
                (labels::PG_CLUSTER.to_string(), ids.target_cluster.clone()),
                (labels::WORKFLOW_ID.to_string(), ids.workflow_id.clone()),
            ]),
            parameters,
        );

        if let Err(e) = create_task_if_absent(self.store.as_ref(), namespace, task).await {
            error!(error = %e, "could not create next clone step task");
            self.publish_failure(
                namespace,
                &ids,
                &format!("Could not create task for {}: {}", next_type, e),
            )
            .await;
        }
    }

    pub(crate) fn identifiers(&self, task: &PgTask) -> CloneResult<CloneIdentifiers> {
        let get = |key: &str| -> CloneResult<String> {
            task.spec
                .parameters
                .get(key)
                .cloned()
                .ok_or_else(|| CloneError::Validation(format!("missing task parameter {}", key)))
        };
        Ok(CloneIdentifiers {
            source_cluster: get(task_crd::params::SOURCE_CLUSTER_NAME)?,
            target_cluster: get(task_crd::params::TARGET_CLUSTER_NAME)?,
            workflow_id: get(task_crd::params::WORKFLOW_ID)?,
        })
    }

    /// Stamp a phase marker onto the workflow task tracking this clone.
    /// Workflow bookkeeping is best-effort; the clone proceeds either way.
    pub(crate) async fn update_workflow(&self, namespace: &str, workflow_id: &str, phase: &str) {
        if workflow_id.is_empty() {
            return;
        }
        let selector = Selector::new().eq(labels::WORKFLOW_ID, workflow_id);
        let tasks = match self.store.list_tasks(namespace, &selector).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(workflow_id, error = %e, "could not query workflow task");
                return;
            }
        };
        let workflow = tasks
            .iter()
            .find(|t| t.spec.task_type == TaskType::Workflow);
        match workflow {
            Some(task) => {
                let name = task.name_any();
                if let Err(e) =
                    stamp_parameter(self.store.as_ref(), namespace, &name, phase).await
                {
                    warn!(workflow_id, error = %e, "could not update workflow phase");
                }
            }
            None => debug!(workflow_id, "no workflow task found"),
        }
    }

    pub(crate) async fn mark_complete(&self, namespace: &str, task: &PgTask) {
        if let Err(e) = complete_task(self.store.as_ref(), namespace, &task.name_any()).await {
            error!(task = %task.name_any(), error = %e, "could not mark task completed");
        }
    }

    async fn publish_failure(&self, namespace: &str, ids: &CloneIdentifiers, message: &str) {
        events::publish(
            self.events.as_ref(),
            Event::CloneFailed {
                header: EventHeader::new(namespace),
                source_cluster: ids.source_cluster.clone(),
                target_cluster: ids.target_cluster.clone(),
                workflow_id: ids.workflow_id.clone(),
                error_message: message.to_string(),
            },
        )
        .await;
    }

    /// S3 key material from a cluster's pgBackRest repository secret. For
    /// local-only repositories the secret exists with empty S3 fields.
    pub(crate) async fn s3_credentials(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> CloneResult<S3Credentials> {
        let secret = self
            .store
            .get_secret(namespace, &render::backrest_repo_secret_name(cluster))
            .await
            .map_err(|e| {
                CloneError::Validation(format!(
                    "Unable to get S3 key and key secret from source cluster backrest repo secret: {}",
                    e
                ))
            })?;

        let data = secret.data.unwrap_or_default();
        let field = |key: &str| -> String {
            data.get(key)
                .map(|v| String::from_utf8_lossy(&v.0).to_string())
                .unwrap_or_default()
        };

        Ok(S3Credentials {
            key: field("aws-s3-key"),
            key_secret: field("aws-s3-key-secret"),
            ca: field("aws-s3-ca.crt"),
        })
    }
}

/// Validate that the storage type requested for the clone is compatible with
/// what the source cluster's repository actually has. Asking for `s3` when
/// the source only keeps a local repository (or the reverse) cannot work.
pub(crate) fn validate_storage_types(requested: &str, source: &str) -> CloneResult<()> {
    for token in requested.split(',').filter(|t| !t.is_empty()) {
        if token != "local" && token != "s3" {
            return Err(CloneError::Validation(format!(
                "invalid pgBackRest storage type {:?}",
                token
            )));
        }
    }

    let source_has_s3 = source.contains("s3");
    let source_has_local = source.is_empty() || source.contains("local");
    let requested_s3 = requested.contains("s3");
    let requested_local = requested.is_empty() || requested.contains("local");

    if requested_s3 && !source_has_s3 {
        return Err(CloneError::Validation(
            "s3 storage requested for the clone but the source cluster does not use s3 storage"
                .to_string(),
        ));
    }
    if requested_local && !source_has_local {
        return Err(CloneError::Validation(
            "local storage requested for the clone but the source cluster only uses s3 storage"
                .to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_type_compatibility() {
        // local to local, defaults on either side
        assert!(validate_storage_types("", "").is_ok());
        assert!(validate_storage_types("local", "local").is_ok());
        assert!(validate_storage_types("", "local,s3").is_ok());

        // s3 requires s3 on the source
        assert!(validate_storage_types("s3", "local,s3").is_ok());
        assert!(validate_storage_types("s3", "s3").is_ok());
        assert!(validate_storage_types("s3", "local").is_err());
        assert!(validate_storage_types("s3", "").is_err());

        // local requires a local repository on the source
        assert!(validate_storage_types("local", "s3").is_err());
        assert!(validate_storage_types("", "s3").is_err());

        // combined request needs both
        assert!(validate_storage_types("local,s3", "local,s3").is_ok());
        assert!(validate_storage_types("local,s3", "local").is_err());

        // junk is rejected outright
        assert!(validate_storage_types("tape", "local").is_err());
    }
}
