//! [`ResourceStore`] backed by the Kubernetes API.
//!
//! Typed selectors are compiled to label-selector strings here and nowhere
//! else. API errors are folded into [`StoreError`]: 404 becomes `NotFound`,
//! 409 on create becomes `AlreadyExists`, everything else passes through.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{ResourceStore, StoreError, StoreResult};
use crate::crd::{PgCluster, PgReplica, PgTask};
use crate::selector::Selector;

/// Field manager recorded on server-side patches.
const FIELD_MANAGER: &str = "pgcluster-operator";

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
        K: Clone + DeserializeOwned + std::fmt::Debug,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map a kube error for a single-object operation into a store error.
fn classify(kind: &'static str, namespace: &str, name: &str, err: kube::Error) -> StoreError {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 => StoreError::AlreadyExists {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        _ => StoreError::Kube(err),
    }
}

async fn get_object<K>(api: &Api<K>, kind: &'static str, namespace: &str, name: &str) -> StoreResult<K>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    api.get(name)
        .await
        .map_err(|e| classify(kind, namespace, name, e))
}

async fn create_object<K>(
    api: &Api<K>,
    kind: &'static str,
    namespace: &str,
    object: &K,
) -> StoreResult<()>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    let name = object.meta().name.clone().unwrap_or_default();
    api.create(&PostParams::default(), object)
        .await
        .map(|_| ())
        .map_err(|e| classify(kind, namespace, &name, e))
}

async fn delete_object<K>(
    api: &Api<K>,
    kind: &'static str,
    namespace: &str,
    name: &str,
) -> StoreResult<()>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    api.delete(name, &DeleteParams::default())
        .await
        .map(|_| ())
        .map_err(|e| classify(kind, namespace, name, e))
}

async fn list_objects<K>(api: &Api<K>, selector: &Selector) -> StoreResult<Vec<K>>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    let mut params = ListParams::default();
    if !selector.is_empty() {
        params = params.labels(&selector.to_string());
    }
    let list = api.list(&params).await?;
    Ok(list.items)
}

/// Merge-patch a single metadata label onto an object.
async fn patch_label<K>(
    api: &Api<K>,
    kind: &'static str,
    namespace: &str,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> StoreResult<()>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    let patch = serde_json::json!({
        "metadata": {
            "labels": labels,
        }
    });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map(|_| ())
        .map_err(|e| classify(kind, namespace, name, e))
}

fn single_label(key: &str, value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(key.to_string(), value.to_string())])
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> StoreResult<PgCluster> {
        get_object(&self.api(namespace), "pgcluster", namespace, name).await
    }

    async fn create_cluster(&self, namespace: &str, cluster: &PgCluster) -> StoreResult<()> {
        create_object(&self.api(namespace), "pgcluster", namespace, cluster).await
    }

    async fn patch_cluster_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> StoreResult<()> {
        let api: Api<PgCluster> = self.api(namespace);
        patch_label(&api, "pgcluster", namespace, name, &labels).await
    }

    async fn create_replica(&self, namespace: &str, replica: &PgReplica) -> StoreResult<()> {
        create_object(&self.api(namespace), "pgreplica", namespace, replica).await
    }

    async fn delete_replica(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let api: Api<PgReplica> = self.api(namespace);
        delete_object(&api, "pgreplica", namespace, name).await
    }

    async fn list_replicas(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> StoreResult<Vec<PgReplica>> {
        let api: Api<PgReplica> = self.api(namespace);
        list_objects(&api, selector).await
    }

    async fn get_task(&self, namespace: &str, name: &str) -> StoreResult<PgTask> {
        get_object(&self.api(namespace), "pgtask", namespace, name).await
    }

    async fn create_task(&self, namespace: &str, task: &PgTask) -> StoreResult<()> {
        create_object(&self.api(namespace), "pgtask", namespace, task).await
    }

    async fn update_task(&self, namespace: &str, task: &PgTask) -> StoreResult<()> {
        let api: Api<PgTask> = self.api(namespace);
        let name = task.meta().name.clone().unwrap_or_default();
        api.replace(&name, &PostParams::default(), task)
            .await
            .map(|_| ())
            .map_err(|e| classify("pgtask", namespace, &name, e))
    }

    async fn delete_task(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let api: Api<PgTask> = self.api(namespace);
        delete_object(&api, "pgtask", namespace, name).await
    }

    async fn list_tasks(&self, namespace: &str, selector: &Selector) -> StoreResult<Vec<PgTask>> {
        let api: Api<PgTask> = self.api(namespace);
        list_objects(&api, selector).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> StoreResult<Deployment> {
        get_object(&self.api(namespace), "deployment", namespace, name).await
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> StoreResult<()> {
        create_object(&self.api(namespace), "deployment", namespace, deployment).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let api: Api<Deployment> = self.api(namespace);
        delete_object(&api, "deployment", namespace, name).await
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> StoreResult<Vec<Deployment>> {
        let api: Api<Deployment> = self.api(namespace);
        list_objects(&api, selector).await
    }

    async fn add_deployment_label(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> StoreResult<()> {
        let api: Api<Deployment> = self.api(namespace);
        patch_label(&api, "deployment", namespace, name, &single_label(key, value)).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> StoreResult<Service> {
        get_object(&self.api(namespace), "service", namespace, name).await
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> StoreResult<()> {
        create_object(&self.api(namespace), "service", namespace, service).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let api: Api<Service> = self.api(namespace);
        delete_object(&api, "service", namespace, name).await
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> StoreResult<PersistentVolumeClaim> {
        get_object(&self.api(namespace), "persistentvolumeclaim", namespace, name).await
    }

    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> StoreResult<()> {
        create_object(&self.api(namespace), "persistentvolumeclaim", namespace, pvc).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> StoreResult<Secret> {
        get_object(&self.api(namespace), "secret", namespace, name).await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> StoreResult<()> {
        create_object(&self.api(namespace), "secret", namespace, secret).await
    }

    async fn list_secrets(&self, namespace: &str, selector: &Selector) -> StoreResult<Vec<Secret>> {
        let api: Api<Secret> = self.api(namespace);
        list_objects(&api, selector).await
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> StoreResult<()> {
        create_object(&self.api(namespace), "job", namespace, job).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> StoreResult<Pod> {
        get_object(&self.api(namespace), "pod", namespace, name).await
    }

    async fn list_pods(&self, namespace: &str, selector: &Selector) -> StoreResult<Vec<Pod>> {
        let api: Api<Pod> = self.api(namespace);
        list_objects(&api, selector).await
    }

    async fn add_pod_label(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> StoreResult<()> {
        let api: Api<Pod> = self.api(namespace);
        patch_label(&api, "pod", namespace, name, &single_label(key, value)).await
    }
}
