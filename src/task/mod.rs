//! Task primitives: the create-if-absent guard, completion marking, the
//! audit-trail writer, and dispatch from task type to handler.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::clone::CloneWorkflow;
use crate::crd::task::{COMPLETED_STATUS, PgTask, TaskType};
use crate::failover::FailoverHandler;
use crate::store::{ResourceStore, StoreResult};

/// Outcome of [`create_task_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The task did not exist and was created.
    Created,
    /// A task with this name was already in flight; its parameters and
    /// status were merged, its original type preserved.
    AlreadyExists,
}

/// Create a task under its deterministic name, or fold new state into the
/// one already there.
///
/// The create is atomic: racing callers both reach the store, the store
/// accepts one, and the loser lands in the merge path. The merge appends the
/// incoming parameters (the autofailover event log uses this) and adopts the
/// incoming status marker, but never changes the existing task's type.
pub async fn create_task_if_absent(
    store: &dyn ResourceStore,
    namespace: &str,
    task: PgTask,
) -> StoreResult<CreateOutcome> {
    let name = task.name_any();

    match store.create_task(namespace, &task).await {
        Ok(()) => {
            debug!(task = %name, task_type = %task.spec.task_type, "task created");
            Ok(CreateOutcome::Created)
        }
        Err(e) if e.is_already_exists() => {
            let mut existing = store.get_task(namespace, &name).await?;
            for (key, value) in task.spec.parameters {
                existing.spec.parameters.insert(key, value);
            }
            if !task.spec.status.is_empty() {
                existing.spec.status = task.spec.status;
            }
            store.update_task(namespace, &existing).await?;
            debug!(task = %name, "task already in flight, state merged");
            Ok(CreateOutcome::AlreadyExists)
        }
        Err(e) => Err(e),
    }
}

/// Mark a task's unit of work as done.
pub async fn complete_task(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
) -> StoreResult<()> {
    let mut task = store.get_task(namespace, name).await?;
    task.spec.status = COMPLETED_STATUS.to_string();
    store.update_task(namespace, &task).await
}

/// Append a step to the audit trail kept in a task's status message.
///
/// Best-effort: the trail is operator-facing bookkeeping, so failures are
/// logged and do not interrupt the operation being audited.
pub async fn record_audit(store: &dyn ResourceStore, namespace: &str, name: &str, message: &str) {
    let mut task = match store.get_task(namespace, name).await {
        Ok(task) => task,
        Err(e) => {
            warn!(task = name, error = %e, "audit skipped, task unreadable");
            return;
        }
    };

    let mut status = task.status.unwrap_or_default();
    if status.message.is_empty() {
        status.message = message.to_string();
    } else {
        status.message = format!("{}...{}", status.message, message);
    }
    task.status = Some(status);

    if let Err(e) = store.update_task(namespace, &task).await {
        warn!(task = name, error = %e, "audit write failed");
    }
}

/// Stamp a timestamped parameter onto a task, e.g. a workflow phase marker
/// or a failover-started marker.
pub async fn stamp_parameter(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
    key: &str,
) -> StoreResult<()> {
    let mut task = store.get_task(namespace, name).await?;
    task.spec
        .parameters
        .insert(key.to_string(), Utc::now().to_rfc3339());
    store.update_task(namespace, &task).await
}

/// Build a task with the usual metadata in one go.
pub fn build_task(
    name: &str,
    task_type: TaskType,
    labels: BTreeMap<String, String>,
    parameters: BTreeMap<String, String>,
) -> PgTask {
    let mut task = PgTask::new(
        name,
        crate::crd::task::PgTaskSpec {
            name: name.to_string(),
            task_type,
            status: String::new(),
            parameters,
        },
    );
    task.metadata.labels = Some(labels);
    task
}

/// Routes received tasks to their handlers.
///
/// Handlers run to completion; there is no framework-level retry, so each
/// one tolerates being invoked again with the same, possibly partially
/// applied, task.
pub struct TaskDispatcher {
    clone_workflow: Arc<CloneWorkflow>,
    failover: Arc<FailoverHandler>,
}

impl TaskDispatcher {
    pub fn new(clone_workflow: Arc<CloneWorkflow>, failover: Arc<FailoverHandler>) -> Self {
        Self {
            clone_workflow,
            failover,
        }
    }

    pub async fn dispatch(&self, namespace: &str, task: &PgTask) {
        let name = task.name_any();
        info!(task = %name, task_type = %task.spec.task_type, "dispatching task");

        match task.spec.task_type {
            TaskType::CloneStep1 | TaskType::CloneStep2 | TaskType::CloneStep3 => {
                self.clone_workflow.run(namespace, task).await;
            }
            TaskType::Failover => {
                if let Err(e) = self.failover.run(namespace, task).await {
                    // no rollback: the audit trail in the task status is the
                    // operator-facing record of how far this got
                    error!(task = %name, error = %e, "failover aborted");
                }
            }
            TaskType::AutoFailover => {
                // autofailover tasks are the detector's event log, not work
                debug!(task = %name, "autofailover bookkeeping task, nothing to dispatch");
            }
            TaskType::Workflow => {
                debug!(task = %name, "workflow bookkeeping task, nothing to dispatch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::task::{self, PgTaskSpec};
    use crate::store::MemoryStore;

    fn autofail_task(cluster: &str, status: &str) -> PgTask {
        PgTask::new(
            &task::autofail_task_name(cluster),
            PgTaskSpec {
                name: task::autofail_task_name(cluster),
                task_type: TaskType::AutoFailover,
                status: status.to_string(),
                parameters: BTreeMap::new(),
            },
        )
    }

    #[tokio::test]
    async fn second_create_merges_instead_of_duplicating() {
        let store = MemoryStore::new();

        let outcome = create_task_if_absent(&store, "ns", autofail_task("pg1", "Ready"))
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Created);

        let outcome = create_task_if_absent(&store, "ns", autofail_task("pg1", "NotReady"))
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::AlreadyExists);

        let tasks = store
            .list_tasks("ns", &crate::selector::Selector::new())
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].spec.status, "NotReady");
    }

    #[tokio::test]
    async fn merge_preserves_original_task_type() {
        let store = MemoryStore::new();

        create_task_if_absent(&store, "ns", autofail_task("pg1", "Ready"))
            .await
            .unwrap();

        // a racing caller tries to reuse the name for different work
        let mut imposter = autofail_task("pg1", "NotReady");
        imposter.spec.task_type = TaskType::Failover;
        create_task_if_absent(&store, "ns", imposter).await.unwrap();

        let stored = store.get_task("ns", "pg1-autofail").await.unwrap();
        assert_eq!(stored.spec.task_type, TaskType::AutoFailover);
    }

    #[tokio::test]
    async fn audit_trail_appends() {
        let store = MemoryStore::new();
        create_task_if_absent(&store, "ns", autofail_task("pg1", ""))
            .await
            .unwrap();

        record_audit(&store, "ns", "pg1-autofail", "deleted primary deployment pg1").await;
        record_audit(&store, "ns", "pg1-autofail", "promoting pod pg1-abcd").await;

        let stored = store.get_task("ns", "pg1-autofail").await.unwrap();
        let message = stored.status.unwrap_or_default().message;
        assert!(message.starts_with("deleted primary deployment pg1"));
        assert!(message.contains("promoting pod pg1-abcd"));
    }
}
