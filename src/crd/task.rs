//! PgTask is a durable unit of asynchronous work.
//!
//! Tasks drive every multi-step operation in the operator: each clone step,
//! each failover, and the autofailover event log are all tasks. Names are
//! derived deterministically from the entity and kind of work so that the
//! existence of a task name means the work is already in flight.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sentinel written to `spec.status` when a task's unit of work is done.
/// Handlers short-circuit on it, which is what makes redelivery safe.
pub const COMPLETED_STATUS: &str = "task completed";

/// `spec.status` marker while a task is being worked.
pub const IN_PROGRESS_STATUS: &str = "task in progress";

/// Parameter keys used by the clone workflow and failover tasks.
pub mod params {
    pub const SOURCE_CLUSTER_NAME: &str = "sourceClusterName";
    pub const TARGET_CLUSTER_NAME: &str = "targetClusterName";
    pub const WORKFLOW_ID: &str = "workflowid";
    pub const BACKREST_STORAGE_TYPE: &str = "backrestStorageType";
    pub const PVC_SIZE: &str = "pvcSize";
    pub const BACKREST_PVC_SIZE: &str = "backrestPVCSize";
    pub const ENABLE_METRICS: &str = "enableMetrics";
    pub const CLUSTER_NAME: &str = "clusterName";
    pub const FAILOVER_STARTED: &str = "failoverStarted";
}

/// Workflow phase markers stamped (with a timestamp) onto the workflow task
/// as a clone progresses.
pub mod workflow_phases {
    pub const CREATE_PVC: &str = "creating the pvcs";
    pub const SYNC_REPO: &str = "syncing the pgbackrest repo";
    pub const RESTORE_BACKUP: &str = "restoring the backup";
    pub const CLUSTER_CREATE: &str = "creating the cluster";
}

/// The kind of work a task represents. Serialized values are part of the
/// stored-object contract.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum TaskType {
    #[serde(rename = "clone-step1")]
    CloneStep1,
    #[serde(rename = "clone-step2")]
    CloneStep2,
    #[serde(rename = "clone-step3")]
    CloneStep3,
    #[serde(rename = "failover")]
    Failover,
    #[serde(rename = "autofailover")]
    AutoFailover,
    #[serde(rename = "workflow")]
    Workflow,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::CloneStep1 => "clone-step1",
            TaskType::CloneStep2 => "clone-step2",
            TaskType::CloneStep3 => "clone-step3",
            TaskType::Failover => "failover",
            TaskType::AutoFailover => "autofailover",
            TaskType::Workflow => "workflow",
        };
        f.write_str(s)
    }
}

/// PgTask is the schema for the pgtasks API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pgcluster.example.com",
    version = "v1",
    kind = "PgTask",
    plural = "pgtasks",
    namespaced,
    status = "PgTaskStatus",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.taskType"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".spec.status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgTaskSpec {
    /// Semantic name of the work item; usually matches the object name.
    pub name: String,

    /// What kind of work this task drives.
    pub task_type: TaskType,

    /// Free-text phase/progress marker. Compared by equality against
    /// [`COMPLETED_STATUS`] to short-circuit re-processing.
    #[serde(default)]
    pub status: String,

    /// Ad hoc workflow-scoped storage: cluster names, workflow ID, and
    /// timestamped event-log entries.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Coarse lifecycle state of the task object itself.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum TaskState {
    #[default]
    Created,
    Processed,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgTaskStatus {
    #[serde(default)]
    pub state: TaskState,

    /// Human-readable progress message; the failover executor appends its
    /// audit trail here.
    #[serde(default)]
    pub message: String,
}

impl PgTask {
    /// Whether the unit of work behind this task has already completed.
    pub fn is_completed(&self) -> bool {
        self.spec.status == COMPLETED_STATUS
    }
}

/// Deterministic name for a cluster's failover task.
pub fn failover_task_name(cluster: &str) -> String {
    format!("{}-{}", cluster, crate::labels::FAILOVER)
}

/// Deterministic name for a cluster's autofailover event-log task.
pub fn autofail_task_name(cluster: &str) -> String {
    format!("{}-{}", cluster, crate::labels::AUTOFAIL)
}

/// Deterministic name for a clone step task, keyed by the target cluster.
pub fn clone_task_name(target_cluster: &str, task_type: TaskType) -> String {
    format!("{}-{}", target_cluster, task_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_task_names() {
        assert_eq!(failover_task_name("pg1"), "pg1-failover");
        assert_eq!(autofail_task_name("pg1"), "pg1-autofail");
        assert_eq!(
            clone_task_name("copy1", TaskType::CloneStep2),
            "copy1-clone-step2"
        );
    }

    #[test]
    fn completed_guard_compares_exact_status() {
        let mut task = PgTask::new(
            "copy1-clone-step1",
            PgTaskSpec {
                name: "copy1-clone-step1".to_string(),
                task_type: TaskType::CloneStep1,
                status: String::new(),
                parameters: BTreeMap::new(),
            },
        );
        assert!(!task.is_completed());
        task.spec.status = COMPLETED_STATUS.to_string();
        assert!(task.is_completed());
    }

    #[test]
    fn task_type_serializes_to_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskType::CloneStep1).unwrap(),
            "\"clone-step1\""
        );
        assert_eq!(
            serde_json::to_string(&TaskType::AutoFailover).unwrap(),
            "\"autofailover\""
        );
    }
}
