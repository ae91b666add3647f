//! Access to the backing resource store.
//!
//! The operator's shared state lives in external objects: the custom
//! resources (clusters, replicas, tasks) and the workload objects they drive
//! (deployments, services, PVCs, secrets, jobs, pods). [`ResourceStore`] is
//! the boundary through which all of it is read and mutated. Two
//! implementations exist: [`kubernetes::KubeStore`] against a live API
//! server, and [`memory::MemoryStore`] for tests.
//!
//! Creates are atomic: creating a name that already exists surfaces
//! [`StoreError::AlreadyExists`] rather than silently overwriting, which is
//! what the task-existence guards rely on.

pub mod kubernetes;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use thiserror::Error;

use crate::crd::{PgCluster, PgReplica, PgTask};
use crate::selector::Selector;

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// CRUD plus label-selector queries over the object kinds this core touches.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    // --- clusters ---
    async fn get_cluster(&self, namespace: &str, name: &str) -> StoreResult<PgCluster>;
    async fn create_cluster(&self, namespace: &str, cluster: &PgCluster) -> StoreResult<()>;
    /// Merge the given labels into the cluster's metadata labels.
    async fn patch_cluster_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> StoreResult<()>;

    // --- replicas ---
    async fn create_replica(&self, namespace: &str, replica: &PgReplica) -> StoreResult<()>;
    async fn delete_replica(&self, namespace: &str, name: &str) -> StoreResult<()>;
    async fn list_replicas(&self, namespace: &str, selector: &Selector)
        -> StoreResult<Vec<PgReplica>>;

    // --- tasks ---
    async fn get_task(&self, namespace: &str, name: &str) -> StoreResult<PgTask>;
    async fn create_task(&self, namespace: &str, task: &PgTask) -> StoreResult<()>;
    async fn update_task(&self, namespace: &str, task: &PgTask) -> StoreResult<()>;
    async fn delete_task(&self, namespace: &str, name: &str) -> StoreResult<()>;
    async fn list_tasks(&self, namespace: &str, selector: &Selector) -> StoreResult<Vec<PgTask>>;

    // --- deployments ---
    async fn get_deployment(&self, namespace: &str, name: &str) -> StoreResult<Deployment>;
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> StoreResult<()>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> StoreResult<()>;
    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> StoreResult<Vec<Deployment>>;
    async fn add_deployment_label(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> StoreResult<()>;

    // --- services ---
    async fn get_service(&self, namespace: &str, name: &str) -> StoreResult<Service>;
    async fn create_service(&self, namespace: &str, service: &Service) -> StoreResult<()>;
    async fn delete_service(&self, namespace: &str, name: &str) -> StoreResult<()>;

    // --- persistent volume claims ---
    async fn get_pvc(&self, namespace: &str, name: &str) -> StoreResult<PersistentVolumeClaim>;
    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> StoreResult<()>;

    // --- secrets ---
    async fn get_secret(&self, namespace: &str, name: &str) -> StoreResult<Secret>;
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> StoreResult<()>;
    async fn list_secrets(&self, namespace: &str, selector: &Selector) -> StoreResult<Vec<Secret>>;

    // --- jobs ---
    async fn create_job(&self, namespace: &str, job: &Job) -> StoreResult<()>;

    // --- pods ---
    async fn get_pod(&self, namespace: &str, name: &str) -> StoreResult<Pod>;
    async fn list_pods(&self, namespace: &str, selector: &Selector) -> StoreResult<Vec<Pod>>;
    async fn add_pod_label(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> StoreResult<()>;
}
