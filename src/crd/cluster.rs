//! PgCluster is the managed PostgreSQL cluster aggregate.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Storage configuration for one of a cluster's volumes.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name (cluster default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Access mode, e.g. "ReadWriteOnce"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,

    /// Size of the persistent volume (e.g. "10Gi"); empty means the volume
    /// is not configured (WAL storage is optional)
    #[serde(default)]
    pub size: String,

    /// Supplemental groups applied to pods mounting this volume
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supplemental_groups: Vec<i64>,
}

impl StorageSpec {
    /// Whether this storage spec is actually configured.
    pub fn is_configured(&self) -> bool {
        !self.size.is_empty()
    }
}

/// PgCluster is the schema for the pgclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pgcluster.example.com",
    version = "v1",
    kind = "PgCluster",
    plural = "pgclusters",
    shortname = "pgc",
    namespaced,
    status = "PgClusterStatus",
    printcolumn = r#"{"name":"Replicas", "type":"string", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgClusterSpec {
    /// Cluster name; the primary identifier, matches the object name
    pub cluster_name: String,

    /// PostgreSQL container image and tag
    #[serde(default)]
    pub ccp_image: String,
    #[serde(default)]
    pub ccp_image_tag: String,

    /// PostgreSQL port
    #[serde(default = "default_port")]
    pub port: String,

    /// Desired replica count, carried as a string in the stored object
    #[serde(default = "default_replicas")]
    pub replicas: String,

    /// Failover strategy key; selects a strategy implementation at dispatch
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Storage for the primary data volume
    #[serde(default)]
    pub primary_storage: StorageSpec,

    /// Storage for replica data volumes
    #[serde(default)]
    pub replica_storage: StorageSpec,

    /// Storage for the pgBackRest repository volume
    #[serde(default)]
    pub backrest_storage: StorageSpec,

    /// Storage for a separate WAL volume; unset size means WAL shares the
    /// data volume
    #[serde(default)]
    pub wal_storage: StorageSpec,

    /// Tablespace name to storage spec, one PVC each
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tablespace_mounts: BTreeMap<String, StorageSpec>,

    /// pgBackRest S3 settings, used when the repository storage type
    /// includes "s3"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backrest_s3_bucket: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backrest_s3_endpoint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backrest_s3_region: String,

    /// Secret names for the managed database credentials
    #[serde(default)]
    pub root_secret_name: String,
    #[serde(default)]
    pub primary_secret_name: String,
    #[serde(default)]
    pub user_secret_name: String,

    /// Application user and database
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub database: String,

    /// Flexible key/value bag toggling features (autofail, backrest,
    /// backrest storage type, exporter, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_labels: BTreeMap<String, String>,
}

fn default_port() -> String {
    "5432".to_string()
}

fn default_replicas() -> String {
    "0".to_string()
}

fn default_strategy() -> String {
    "1".to_string()
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ClusterState {
    #[default]
    Created,
    Processed,
    Shutdown,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgClusterStatus {
    #[serde(default)]
    pub state: ClusterState,

    #[serde(default)]
    pub message: String,
}

impl PgCluster {
    /// Value of a user label, if set.
    pub fn user_label(&self, key: &str) -> Option<&str> {
        self.spec.user_labels.get(key).map(String::as_str)
    }

    /// Whether a boolean-ish user label is set to "true".
    pub fn user_label_enabled(&self, key: &str) -> bool {
        self.user_label(key) == Some("true")
    }

    /// pgBackRest repository storage type, defaulting to local storage.
    pub fn backrest_storage_type(&self) -> &str {
        self.user_label(crate::labels::BACKREST_STORAGE_TYPE)
            .unwrap_or("")
    }
}
