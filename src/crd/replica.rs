//! PgReplica is one standby instance bound to a cluster.
//!
//! A replica record is created at scale-up or by post-failover replacement and
//! removed on scale-down or when its instance is promoted to primary.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cluster::StorageSpec;
use super::task::TaskState;

/// PgReplica is the schema for the pgreplicas API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pgcluster.example.com",
    version = "v1",
    kind = "PgReplica",
    plural = "pgreplicas",
    namespaced,
    status = "PgReplicaStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgReplicaSpec {
    /// Replica name; matches the object name and the replica deployment
    pub name: String,

    /// Cluster this replica belongs to
    pub cluster_name: String,

    /// Storage for the replica data volume
    #[serde(default)]
    pub replica_storage: StorageSpec,

    /// Labels copied from the owning cluster
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_labels: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgReplicaStatus {
    #[serde(default)]
    pub state: TaskState,

    #[serde(default)]
    pub message: String,
}
