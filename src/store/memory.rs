//! In-memory [`ResourceStore`] used by tests.
//!
//! Behaves like the API server where the core's semantics depend on it:
//! creates are atomic (`AlreadyExists` on a taken name), gets/deletes of
//! missing names return `NotFound`, and label selectors evaluate against
//! object metadata. It additionally stands in for the deployment controller:
//! deleting a deployment also deletes the pods labeled with its
//! `deployment-name`, so waits for pod disappearance can complete.
//!
//! Every mutation increments a write counter so tests can assert that guarded
//! code paths performed zero writes.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use kube::Resource;

use super::{ResourceStore, StoreError, StoreResult};
use crate::crd::{PgCluster, PgReplica, PgTask};
use crate::labels;
use crate::selector::Selector;

/// One kind's worth of objects, keyed by (namespace, name).
struct Shelf<K> {
    kind: &'static str,
    items: BTreeMap<(String, String), K>,
}

impl<K> Shelf<K>
where
    K: Resource + Clone,
{
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            items: BTreeMap::new(),
        }
    }

    fn key(namespace: &str, name: &str) -> (String, String) {
        (namespace.to_string(), name.to_string())
    }

    fn not_found(&self, namespace: &str, name: &str) -> StoreError {
        StoreError::NotFound {
            kind: self.kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn get(&self, namespace: &str, name: &str) -> StoreResult<K> {
        self.items
            .get(&Self::key(namespace, name))
            .cloned()
            .ok_or_else(|| self.not_found(namespace, name))
    }

    fn create(&mut self, namespace: &str, object: &K) -> StoreResult<()> {
        let name = object.meta().name.clone().unwrap_or_default();
        let key = Self::key(namespace, &name);
        if self.items.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: self.kind,
                namespace: namespace.to_string(),
                name,
            });
        }
        self.items.insert(key, object.clone());
        Ok(())
    }

    fn replace(&mut self, namespace: &str, object: &K) -> StoreResult<()> {
        let name = object.meta().name.clone().unwrap_or_default();
        let key = Self::key(namespace, &name);
        if !self.items.contains_key(&key) {
            return Err(self.not_found(namespace, &name));
        }
        self.items.insert(key, object.clone());
        Ok(())
    }

    fn delete(&mut self, namespace: &str, name: &str) -> StoreResult<()> {
        self.items
            .remove(&Self::key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| self.not_found(namespace, name))
    }

    fn list(&self, namespace: &str, selector: &Selector) -> Vec<K> {
        let empty = BTreeMap::new();
        self.items
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, obj)| selector.matches(obj.meta().labels.as_ref().unwrap_or(&empty)))
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    fn patch_labels(
        &mut self,
        namespace: &str,
        name: &str,
        patch: &BTreeMap<String, String>,
    ) -> StoreResult<()> {
        let obj = self
            .items
            .get_mut(&Self::key(namespace, name))
            .ok_or_else(|| StoreError::NotFound {
                kind: self.kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        let meta_labels = obj.meta_mut().labels.get_or_insert_with(BTreeMap::new);
        for (k, v) in patch {
            meta_labels.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}

struct Inner {
    clusters: Shelf<PgCluster>,
    replicas: Shelf<PgReplica>,
    tasks: Shelf<PgTask>,
    deployments: Shelf<Deployment>,
    services: Shelf<Service>,
    pvcs: Shelf<PersistentVolumeClaim>,
    secrets: Shelf<Secret>,
    jobs: Shelf<Job>,
    pods: Shelf<Pod>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                clusters: Shelf::new("pgcluster"),
                replicas: Shelf::new("pgreplica"),
                tasks: Shelf::new("pgtask"),
                deployments: Shelf::new("deployment"),
                services: Shelf::new("service"),
                pvcs: Shelf::new("persistentvolumeclaim"),
                secrets: Shelf::new("secret"),
                jobs: Shelf::new("job"),
                pods: Shelf::new("pod"),
            }),
            writes: AtomicU64::new(0),
        }
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of mutations performed since construction or the last reset.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Reset the write counter, typically after seeding fixtures.
    pub fn reset_writes(&self) {
        self.writes.store(0, Ordering::SeqCst);
    }

    /// All jobs in a namespace, regardless of labels.
    pub fn jobs(&self, namespace: &str) -> Vec<Job> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .jobs
            .list(namespace, &Selector::new())
    }

    /// All PVCs in a namespace.
    pub fn pvcs(&self, namespace: &str) -> Vec<PersistentVolumeClaim> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .pvcs
            .list(namespace, &Selector::new())
    }

    /// Remove a pod directly, simulating kubelet-side termination.
    pub fn evict_pod(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let _ = inner.pods.delete(namespace, name);
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> StoreResult<PgCluster> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .clusters
            .get(namespace, name)
    }

    async fn create_cluster(&self, namespace: &str, cluster: &PgCluster) -> StoreResult<()> {
        self.record_write();
        self.inner
            .write()
            .expect("store lock poisoned")
            .clusters
            .create(namespace, cluster)
    }

    async fn patch_cluster_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> StoreResult<()> {
        self.record_write();
        self.inner
            .write()
            .expect("store lock poisoned")
            .clusters
            .patch_labels(namespace, name, &labels)
    }

    async fn create_replica(&self, namespace: &str, replica: &PgReplica) -> StoreResult<()> {
        self.record_write();
        self.inner
            .write()
            .expect("store lock poisoned")
            .replicas
            .create(namespace, replica)
    }

    async fn delete_replica(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.record_write();
        self.inner
            .write()
            .expect("store lock poisoned")
            .replicas
            .delete(namespace, name)
    }

    async fn list_replicas(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> StoreResult<Vec<PgReplica>> {
        Ok(self
            .inner
            .read()
            .expect("store lock poisoned")
            .replicas
            .list(namespace, selector))
    }

    async fn get_task(&self, namespace: &str, name: &str) -> StoreResult<PgTask> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .tasks
            .get(namespace, name)
    }

    async fn create_task(&self, namespace: &str, task: &PgTask) -> StoreResult<()> {
        self.record_write();
        self.inner
            .write()
            .expect("store lock poisoned")
            .tasks
            .create(namespace, task)
    }

    async fn update_task(&self, namespace: &str, task: &PgTask) -> StoreResult<()> {
        self.record_write();
        self.inner
            .write()
            .expect("store lock poisoned")
            .tasks
            .replace(namespace, task)
    }

    async fn delete_task(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.record_write();
        self.inner
            .write()
            .expect("store lock poisoned")
            .tasks
            .delete(namespace, name)
    }

    async fn list_tasks(&self, namespace: &str, selector: &Selector) -> StoreResult<Vec<PgTask>> {
        Ok(self
            .inner
            .read()
            .expect("store lock poisoned")
            .tasks
            .list(namespace, selector))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> StoreResult<Deployment> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .deployments
            .get(namespace, name)
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> StoreResult<()> {
        self.record_write();
        self.inner
            .write()
            .expect("store lock poisoned")
            .deployments
            .create(namespace, deployment)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.record_write();
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.deployments.delete(namespace, name)?;
        // stand in for the deployment controller: the deployment's pods go too
        let owned = Selector::new().eq(labels::DEPLOYMENT_NAME, name);
        let pod_names: Vec<String> = inner
            .pods
            .list(namespace, &owned)
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect();
        for pod_name in pod_names {
            let _ = inner.pods.delete(namespace, &pod_name);
        }
        Ok(())
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> StoreResult<Vec<Deployment>> {
        Ok(self
            .inner
            .read()
            .expect("store lock poisoned")
            .deployments
            .list(namespace, selector))
    }

    async fn add_deployment_label(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> StoreResult<()> {
        self.record_write();
        let patch = BTreeMap::from([(key.to_string(), value.to_string())]);
        self.inner
            .write()
            .expect("store lock poisoned")
            .deployments
            .patch_labels(namespace, name, &patch)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> StoreResult<Service> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .services
            .get(namespace, name)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> StoreResult<()> {
        self.record_write();
        self.inner
            .write()
            .expect("store lock poisoned")
            .services
            .create(namespace, service)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.record_write();
        self.inner
            .write()
            .expect("store lock poisoned")
            .services
            .delete(namespace, name)
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> StoreResult<PersistentVolumeClaim> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .pvcs
            .get(namespace, name)
    }

    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> StoreResult<()> {
        self.record_write();
        self.inner
            .write()
            .expect("store lock poisoned")
            .pvcs
            .create(namespace, pvc)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> StoreResult<Secret> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .secrets
            .get(namespace, name)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> StoreResult<()> {
        self.record_write();
        self.inner
            .write()
            .expect("store lock poisoned")
            .secrets
            .create(namespace, secret)
    }

    async fn list_secrets(&self, namespace: &str, selector: &Selector) -> StoreResult<Vec<Secret>> {
        Ok(self
            .inner
            .read()
            .expect("store lock poisoned")
            .secrets
            .list(namespace, selector))
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> StoreResult<()> {
        self.record_write();
        self.inner
            .write()
            .expect("store lock poisoned")
            .jobs
            .create(namespace, job)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> StoreResult<Pod> {
        self.inner
            .read()
            .expect("store lock poisoned")
            .pods
            .get(namespace, name)
    }

    async fn list_pods(&self, namespace: &str, selector: &Selector) -> StoreResult<Vec<Pod>> {
        Ok(self
            .inner
            .read()
            .expect("store lock poisoned")
            .pods
            .list(namespace, selector))
    }

    async fn add_pod_label(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> StoreResult<()> {
        self.record_write();
        let patch = BTreeMap::from([(key.to_string(), value.to_string())]);
        self.inner
            .write()
            .expect("store lock poisoned")
            .pods
            .patch_labels(namespace, name, &patch)
    }
}

/// Seeding helpers for tests. Seeds count as writes, so seed first and call
/// [`MemoryStore::reset_writes`] before exercising guarded paths.
impl MemoryStore {
    pub async fn seed_cluster(&self, namespace: &str, cluster: PgCluster) {
        self.create_cluster(namespace, &cluster)
            .await
            .expect("seed cluster");
    }

    pub async fn seed_pod(&self, namespace: &str, pod: Pod) {
        self.record_write();
        self.inner
            .write()
            .expect("store lock poisoned")
            .pods
            .create(namespace, &pod)
            .expect("seed pod");
    }
}
