//! Label and annotation tokens shared with the backing store.
//!
//! These strings are part of the interop contract: other tooling selects and
//! mutates the same objects by these exact keys, so they are centralized here
//! and never built up ad hoc at call sites.

/// Cluster a resource belongs to.
pub const PG_CLUSTER: &str = "pg-cluster";

/// Primary service selector value; `service-name=<cluster>` routes traffic
/// from the cluster's primary Service to the pod carrying it.
pub const SERVICE_NAME: &str = "service-name";

/// Name of the replica deployment a pod belongs to.
pub const REPLICA_NAME: &str = "replica-name";

/// Deployment that owns a pod.
pub const DEPLOYMENT_NAME: &str = "deployment-name";

/// Clusters opted into automated failure detection.
pub const AUTOFAIL: &str = "autofail";

/// Per-event override for replacing the promoted replica.
pub const AUTOFAIL_REPLACE_REPLICA: &str = "autofail-replace-replica";

/// Suffix used for deterministic failover task names.
pub const FAILOVER: &str = "failover";

/// Deployment selected as the failover promotion target.
pub const TARGET: &str = "target";

/// Deployment currently acting as the cluster primary.
pub const CURRENT_PRIMARY: &str = "current-primary";

/// pgBackRest enablement toggle in cluster user labels.
pub const BACKREST: &str = "pgo-backrest";

/// Marks pgBackRest jobs so primary-pod selectors can exclude them.
pub const BACKREST_JOB: &str = "pgo-backrest-job";

/// Marks pgBackRest restore pods, likewise excluded from primary selectors.
pub const BACKREST_RESTORE: &str = "pgo-backrest-restore";

/// Marks the pgBackRest repository secret, excluded when cloning secrets.
pub const BACKREST_REPO: &str = "pgo-backrest-repo";

/// Storage type(s) the cluster's pgBackRest repository uses: `local`, `s3`,
/// or the combined `local,s3`.
pub const BACKREST_STORAGE_TYPE: &str = "backrest-storage-type";

/// Workflow a task or job belongs to.
pub const WORKFLOW_ID: &str = "workflowid";

/// Clone step markers on the asynchronous jobs each step launches.
pub const CLONE_STEP_1: &str = "pgo-clone-step-1";
pub const CLONE_STEP_2: &str = "pgo-clone-step-2";
pub const CLONE_STEP_3: &str = "pgo-clone-step-3";

/// Resource display name.
pub const NAME: &str = "name";

/// Metrics exporter toggle in cluster user labels.
pub const EXPORTER: &str = "exporter";

/// Annotations carried on clone-step jobs so the next step can recover the
/// workflow identifiers and requested overrides.
pub mod annotations {
    pub const CLONE_SOURCE_CLUSTER_NAME: &str = "clone-source-cluster-name";
    pub const CLONE_TARGET_CLUSTER_NAME: &str = "clone-target-cluster-name";
    pub const CLONE_PVC_SIZE: &str = "clone-pvc-size";
    pub const CLONE_BACKREST_PVC_SIZE: &str = "clone-backrest-pvc-size";
    pub const CLONE_ENABLE_METRICS: &str = "clone-enable-metrics";
    pub const CURRENT_PRIMARY: &str = "current-primary";
}
