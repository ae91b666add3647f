pub mod clone;
pub mod config;
pub mod crd;
pub mod events;
pub mod exec;
pub mod failover;
pub mod labels;
pub mod selector;
pub mod store;
pub mod task;
pub mod wait;

pub use clone::CloneWorkflow;
pub use config::OperatorConfig;
pub use crd::{PgCluster, PgReplica, PgTask};
pub use failover::{
    FailoverDetector, FailoverHandler, PatroniPromotion, RelabelFailover, StrategyRegistry,
};
pub use task::TaskDispatcher;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use thiserror::Error;

use events::LogPublisher;
use exec::KubePodExec;
use failover::replication::ExecReplicationStatus;
use store::KubeStore;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// The operator's wired component graph.
pub struct Operator {
    pub dispatcher: Arc<TaskDispatcher>,
    pub clone_workflow: Arc<CloneWorkflow>,
    pub detector: FailoverDetector,
}

/// Wire the production component graph: the Kubernetes-backed store and exec
/// transport, the log event sink, the exec-based replication probe, Patroni
/// promotion, and the relabel strategy registered under key "1".
pub fn build_operator(client: Client, config: OperatorConfig) -> Operator {
    let store: Arc<dyn store::ResourceStore> = Arc::new(KubeStore::new(client.clone()));
    let pod_exec: Arc<dyn exec::PodExec> = Arc::new(KubePodExec::new(client));
    let event_publisher: Arc<dyn events::EventPublisher> = Arc::new(LogPublisher);

    let replication: Arc<dyn failover::ReplicationStatusProvider> =
        Arc::new(ExecReplicationStatus::new(store.clone(), pod_exec.clone()));
    let promotion: Arc<dyn failover::PromotionService> =
        Arc::new(PatroniPromotion::new(pod_exec.clone()));

    let strategies = StrategyRegistry::new().register(
        "1",
        Arc::new(RelabelFailover::new(
            store.clone(),
            promotion,
            event_publisher.clone(),
            config.clone(),
        )),
    );

    let failover_handler = Arc::new(FailoverHandler::new(
        store.clone(),
        strategies,
        config.clone(),
    ));
    let clone_workflow = Arc::new(CloneWorkflow::new(
        store.clone(),
        event_publisher,
        pod_exec,
        config.clone(),
    ));
    let dispatcher = Arc::new(TaskDispatcher::new(clone_workflow.clone(), failover_handler));
    let detector = FailoverDetector::new(store, replication, config);

    Operator {
        dispatcher,
        clone_workflow,
        detector,
    }
}

/// Reconcile errors surfaced to the controller machinery. Handlers contain
/// their own failures, so this mostly exists to satisfy the signature.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("reconciliation failed: {0}")]
    Failed(String),
}

struct TaskCtx {
    dispatcher: Arc<TaskDispatcher>,
}

/// Run the task controller: every received PgTask is dispatched on its type.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace;
/// `None` watches cluster-wide.
pub async fn run_task_controller(
    client: Client,
    dispatcher: Arc<TaskDispatcher>,
    namespace: Option<&str>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!("Starting controller for PgTask resources (scope: {})", scope_msg);

    let tasks: Api<PgTask> = scoped_api(client, namespace);
    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(tasks, watcher_config)
        .run(
            |task: Arc<PgTask>, ctx: Arc<TaskCtx>| async move {
                let ns = task.namespace().unwrap_or_else(|| "default".to_string());
                ctx.dispatcher.dispatch(&ns, &task).await;
                Ok::<Action, ReconcileError>(Action::await_change())
            },
            |_task, _err, _ctx| Action::requeue(Duration::from_secs(300)),
            Arc::new(TaskCtx { dispatcher }),
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => tracing::debug!("Reconciled task: {}", obj.name),
                Err(e) => tracing::error!("Task reconciliation error: {:?}", e),
            }
        })
        .await;

    tracing::error!("Task controller stream ended unexpectedly");
}

struct JobCtx {
    clone_workflow: Arc<CloneWorkflow>,
}

/// Run the job controller that advances clone workflows.
///
/// Clone-step jobs all carry the workflow label, which scopes the watch; a
/// succeeded job advances the workflow by creating the next step's task.
pub async fn run_job_controller(
    client: Client,
    clone_workflow: Arc<CloneWorkflow>,
    namespace: Option<&str>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!("Starting controller for clone jobs (scope: {})", scope_msg);

    let jobs: Api<Job> = scoped_api(client, namespace);
    let watcher_config = WatcherConfig::default().labels(labels::WORKFLOW_ID);

    Controller::new(jobs, watcher_config)
        .run(
            |job: Arc<Job>, ctx: Arc<JobCtx>| async move {
                let ns = job.namespace().unwrap_or_else(|| "default".to_string());
                ctx.clone_workflow.advance_on_job(&ns, &job).await;
                Ok::<Action, ReconcileError>(Action::await_change())
            },
            |_job, _err, _ctx| Action::requeue(Duration::from_secs(300)),
            Arc::new(JobCtx { clone_workflow }),
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => tracing::debug!("Observed clone job: {}", obj.name),
                Err(e) => tracing::error!("Job reconciliation error: {:?}", e),
            }
        })
        .await;

    tracing::error!("Job controller stream ended unexpectedly");
}

/// Watch autofail-labeled pods and feed primary readiness observations into
/// the detector. This is the thin notification boundary; everything
/// stateful lives in the detector.
pub async fn run_autofail_watcher(client: Client, detector: FailoverDetector, namespace: &str) {
    tracing::info!(namespace, "Starting autofail pod watcher");

    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let watcher_config = watcher::Config::default().labels(labels::AUTOFAIL);

    let mut stream = watcher(pods, watcher_config).applied_objects().boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(pod) => {
                let cluster = match pod
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(labels::PG_CLUSTER))
                {
                    Some(cluster) => cluster.clone(),
                    None => continue,
                };
                let statuses = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.container_statuses.as_ref());
                let database_status = statuses.and_then(|statuses| {
                    statuses
                        .iter()
                        .find(|c| c.name == failover::DATABASE_CONTAINER)
                });
                // no database container status yet means the pod is still
                // coming up; not an observation either way
                if let Some(status) = database_status {
                    detector.observe(namespace, &cluster, status.ready).await;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "autofail pod watch error");
            }
        }
    }

    tracing::error!("Autofail pod watcher stream ended unexpectedly");
}
