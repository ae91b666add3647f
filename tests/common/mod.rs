//! Test fixtures and builders shared by the scenario tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{Container, ContainerStatus, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use pgcluster_operator::config::OperatorConfig;
use pgcluster_operator::crd::task::{PgTaskSpec, TaskType, params};
use pgcluster_operator::crd::{
    PgCluster, PgClusterSpec, PgReplica, PgReplicaSpec, PgTask, StorageSpec,
};
use pgcluster_operator::exec::{ExecOutput, ExecResult, PodExec};
use pgcluster_operator::labels;
use pgcluster_operator::wait::WaitParams;

pub const NS: &str = "pgo-test";

/// Operator config with millisecond-scale waits so timeout paths finish
/// quickly in tests.
pub fn test_config() -> OperatorConfig {
    let fast = WaitParams {
        timeout: Duration::from_millis(200),
        period: Duration::from_millis(10),
    };
    OperatorConfig {
        autofail_sleep_seconds: 0,
        autofail_replace_replica: false,
        preferred_failover_node: None,
        repo_ready_wait: fast,
        repo_delete_wait: fast,
        primary_delete_wait: fast,
        primary_isolate_wait: fast,
        images: Default::default(),
    }
}

pub fn storage(size: &str) -> StorageSpec {
    StorageSpec {
        size: size.to_string(),
        ..Default::default()
    }
}

/// A minimal cluster with local pgBackRest storage.
pub fn cluster(name: &str) -> PgCluster {
    let mut cluster = PgCluster::new(
        name,
        PgClusterSpec {
            cluster_name: name.to_string(),
            ccp_image: "postgres-ha".to_string(),
            ccp_image_tag: "16.3".to_string(),
            port: "5432".to_string(),
            replicas: "2".to_string(),
            strategy: "1".to_string(),
            primary_storage: storage("10Gi"),
            replica_storage: storage("10Gi"),
            backrest_storage: storage("20Gi"),
            wal_storage: StorageSpec::default(),
            tablespace_mounts: BTreeMap::new(),
            backrest_s3_bucket: String::new(),
            backrest_s3_endpoint: String::new(),
            backrest_s3_region: String::new(),
            root_secret_name: format!("{}-postgres-secret", name),
            primary_secret_name: format!("{}-primaryuser-secret", name),
            user_secret_name: format!("{}-appuser-secret", name),
            user: "appuser".to_string(),
            database: "appdb".to_string(),
            user_labels: BTreeMap::from([
                (labels::AUTOFAIL.to_string(), "true".to_string()),
                (labels::BACKREST.to_string(), "true".to_string()),
            ]),
        },
    );
    cluster.metadata.labels = Some(BTreeMap::from([(
        labels::NAME.to_string(),
        name.to_string(),
    )]));
    cluster
}

pub fn replica_record(cluster_name: &str, name: &str) -> PgReplica {
    let mut replica = PgReplica::new(
        name,
        PgReplicaSpec {
            name: name.to_string(),
            cluster_name: cluster_name.to_string(),
            replica_storage: storage("10Gi"),
            user_labels: BTreeMap::new(),
        },
    );
    replica.metadata.labels = Some(BTreeMap::from([
        (labels::PG_CLUSTER.to_string(), cluster_name.to_string()),
        (labels::NAME.to_string(), name.to_string()),
    ]));
    replica
}

fn deployment(name: &str, labels_map: BTreeMap<String, String>) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels_map),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector::default(),
            template: Default::default(),
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            ready_replicas: Some(1),
            ..Default::default()
        }),
    }
}

/// The primary deployment, carrying the primary service selector label.
pub fn primary_deployment(cluster_name: &str) -> Deployment {
    deployment(
        cluster_name,
        BTreeMap::from([
            (labels::PG_CLUSTER.to_string(), cluster_name.to_string()),
            (labels::SERVICE_NAME.to_string(), cluster_name.to_string()),
            (labels::DEPLOYMENT_NAME.to_string(), cluster_name.to_string()),
        ]),
    )
}

/// A replica deployment: labeled with the cluster but no service label.
pub fn replica_deployment(cluster_name: &str, name: &str) -> Deployment {
    deployment(
        name,
        BTreeMap::from([
            (labels::PG_CLUSTER.to_string(), cluster_name.to_string()),
            (labels::DEPLOYMENT_NAME.to_string(), name.to_string()),
        ]),
    )
}

fn pod(name: &str, labels_map: BTreeMap<String, String>, node: &str, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels_map),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            containers: vec![Container {
                name: "database".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "database".to_string(),
                ready,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn primary_pod(cluster_name: &str, ready: bool) -> Pod {
    pod(
        &format!("{}-pod", cluster_name),
        BTreeMap::from([
            (labels::PG_CLUSTER.to_string(), cluster_name.to_string()),
            (labels::SERVICE_NAME.to_string(), cluster_name.to_string()),
            (labels::DEPLOYMENT_NAME.to_string(), cluster_name.to_string()),
            (labels::AUTOFAIL.to_string(), "true".to_string()),
        ]),
        "node0",
        ready,
    )
}

pub fn replica_pod(cluster_name: &str, deployment_name: &str, node: &str, ready: bool) -> Pod {
    pod(
        &format!("{}-pod", deployment_name),
        BTreeMap::from([
            (labels::PG_CLUSTER.to_string(), cluster_name.to_string()),
            (labels::REPLICA_NAME.to_string(), deployment_name.to_string()),
            (
                labels::DEPLOYMENT_NAME.to_string(),
                deployment_name.to_string(),
            ),
        ]),
        node,
        ready,
    )
}

/// A clone-step task with the usual identifiers.
pub fn clone_task(task_type: TaskType, source: &str, target: &str) -> PgTask {
    let step_label = match task_type {
        TaskType::CloneStep1 => labels::CLONE_STEP_1,
        TaskType::CloneStep2 => labels::CLONE_STEP_2,
        _ => labels::CLONE_STEP_3,
    };
    let name = format!("{}-{}", target, task_type);
    let mut task = PgTask::new(
        &name,
        PgTaskSpec {
            name: name.clone(),
            task_type,
            status: String::new(),
            parameters: BTreeMap::from([
                (params::SOURCE_CLUSTER_NAME.to_string(), source.to_string()),
                (params::TARGET_CLUSTER_NAME.to_string(), target.to_string()),
                (params::WORKFLOW_ID.to_string(), "wf-test".to_string()),
            ]),
        },
    );
    task.metadata.labels = Some(BTreeMap::from([
        (step_label.to_string(), "true".to_string()),
        (labels::PG_CLUSTER.to_string(), target.to_string()),
        (labels::WORKFLOW_ID.to_string(), "wf-test".to_string()),
    ]));
    task
}

/// A succeeded clone-step job, as the job controller would observe it.
pub fn succeeded_clone_job(step_label: &str, source: &str, target: &str) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(format!("{}-job", step_label)),
            labels: Some(BTreeMap::from([
                (step_label.to_string(), "true".to_string()),
                (labels::PG_CLUSTER.to_string(), target.to_string()),
                (labels::WORKFLOW_ID.to_string(), "wf-test".to_string()),
            ])),
            annotations: Some(BTreeMap::from([
                (
                    labels::annotations::CLONE_SOURCE_CLUSTER_NAME.to_string(),
                    source.to_string(),
                ),
                (
                    labels::annotations::CLONE_TARGET_CLUSTER_NAME.to_string(),
                    target.to_string(),
                ),
            ])),
            ..Default::default()
        },
        spec: None,
        status: Some(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        }),
    }
}

/// Pod exec stub that fails every call; for flows that must not exec.
pub struct NoExec;

#[async_trait]
impl PodExec for NoExec {
    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        _command: &[String],
    ) -> ExecResult<ExecOutput> {
        Err(pgcluster_operator::exec::ExecError::CommandFailed {
            pod: pod.to_string(),
            container: container.to_string(),
            message: "exec not expected in this test".to_string(),
        })
    }
}

pub fn no_exec() -> Arc<dyn PodExec> {
    Arc::new(NoExec)
}
