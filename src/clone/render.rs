//! Rendering of the workload objects the clone workflow submits.
//!
//! The workflow supplies typed field values; these builders turn them into
//! the concrete Kubernetes objects. Nothing in here talks to the store.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec, Secret,
    SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::config::ImageConfig;
use crate::crd::StorageSpec;
use crate::labels;

/// The pgBackRest stanza name, fixed across all managed clusters.
pub const PGBACKREST_STANZA: &str = "db";

/// Port of the repository host's sshd.
const REPO_SSHD_PORT: i32 = 2022;

const REPO_VOLUME: &str = "backrestrepo";
const REPO_MOUNT_PATH: &str = "/backrestrepo";
const SSHD_VOLUME: &str = "sshd";
const SSHD_MOUNT_PATH: &str = "/sshd";

pub fn backrest_repo_pvc_name(cluster: &str) -> String {
    format!("{}-pgbr-repo", cluster)
}

pub fn backrest_repo_deployment_name(cluster: &str) -> String {
    format!("{}-backrest-shared-repo", cluster)
}

/// The repo service shares the deployment's name.
pub fn backrest_repo_service_name(cluster: &str) -> String {
    backrest_repo_deployment_name(cluster)
}

pub fn backrest_repo_secret_name(cluster: &str) -> String {
    format!("{}-backrest-repo-config", cluster)
}

/// Path of a cluster's repository on the repo volume.
pub fn backrest_repo_path(cluster: &str) -> String {
    format!("{}/{}-backrest-shared-repo", REPO_MOUNT_PATH, cluster)
}

pub fn pgdata_path(cluster: &str) -> String {
    format!("/pgdata/{}", cluster)
}

pub fn wal_path(cluster: &str) -> String {
    format!("/pgwal/{}", cluster)
}

pub fn tablespace_pvc_name(cluster: &str, tablespace: &str) -> String {
    format!("{}-tablespace-{}", cluster, tablespace)
}

/// A persistent volume claim for one of the target cluster's volumes.
pub fn pvc(name: &str, cluster: &str, storage: &StorageSpec) -> PersistentVolumeClaim {
    let access_mode = storage
        .access_mode
        .clone()
        .unwrap_or_else(|| "ReadWriteOnce".to_string());

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                labels::PG_CLUSTER.to_string(),
                cluster.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![access_mode]),
            storage_class_name: storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// S3 environment passed to sync and restore containers when the repository
/// uses S3 storage.
#[derive(Debug, Clone, Default)]
pub struct S3Env {
    pub storage_source: String,
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub key: String,
    pub key_secret: String,
    /// Combined local+S3 repository mode.
    pub local_and_s3: bool,
}

impl S3Env {
    fn env_vars(&self) -> Vec<EnvVar> {
        let mut env = vec![
            env_var("BACKREST_STORAGE_SOURCE", &self.storage_source),
            env_var("PGBACKREST_REPO1_S3_BUCKET", &self.bucket),
            env_var("PGBACKREST_REPO1_S3_ENDPOINT", &self.endpoint),
            env_var("PGBACKREST_REPO1_S3_REGION", &self.region),
            env_var("PGBACKREST_REPO1_S3_KEY", &self.key),
            env_var("PGBACKREST_REPO1_S3_KEY_SECRET", &self.key_secret),
            env_var("PGBACKREST_REPO1_S3_CA_FILE", "/sshd/aws-s3-ca.crt"),
        ];
        if self.local_and_s3 {
            env.push(env_var("PGHA_PGBACKREST_LOCAL_S3_STORAGE", "true"));
        }
        env
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

/// Field values for the repository sync job of clone step 1.
pub struct RepoSyncJobFields<'a> {
    pub job_name: String,
    pub source_cluster: &'a str,
    pub target_cluster: &'a str,
    pub workflow_id: &'a str,
    pub images: &'a ImageConfig,
    pub supplemental_groups: Vec<i64>,
    pub s3: Option<S3Env>,
    /// Requested override annotations carried forward for later steps.
    pub pvc_size: &'a str,
    pub backrest_pvc_size: &'a str,
    pub enable_metrics: &'a str,
}

/// The job that rsyncs the source cluster's pgBackRest repository onto the
/// target's fresh repository volume.
pub fn repo_sync_job(fields: &RepoSyncJobFields<'_>) -> Job {
    let mut env = vec![
        env_var(
            "PGBACKREST_REPO1_HOST",
            &backrest_repo_service_name(fields.source_cluster),
        ),
        env_var(
            "PGBACKREST_REPO1_PATH",
            &backrest_repo_path(fields.source_cluster),
        ),
        // named this way so pgBackRest itself does not pick it up as a
        // REPO* setting
        env_var(
            "NEW_PGBACKREST_REPO",
            &backrest_repo_path(fields.target_cluster),
        ),
    ];
    if let Some(s3) = &fields.s3 {
        env.extend(s3.env_vars());
    }

    let job_labels = BTreeMap::from([
        (labels::CLONE_STEP_1.to_string(), "true".to_string()),
        (
            labels::PG_CLUSTER.to_string(),
            fields.target_cluster.to_string(),
        ),
        (
            labels::WORKFLOW_ID.to_string(),
            fields.workflow_id.to_string(),
        ),
    ]);

    Job {
        metadata: ObjectMeta {
            name: Some(fields.job_name.clone()),
            annotations: Some(clone_annotations(
                fields.source_cluster,
                fields.target_cluster,
                fields.pvc_size,
                fields.backrest_pvc_size,
                fields.enable_metrics,
            )),
            labels: Some(job_labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(fields.job_name.clone()),
                    labels: Some(job_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "rsync".to_string(),
                        image: Some(format!(
                            "{}/pgo-backrest-repo-sync:{}",
                            fields.images.prefix, fields.images.tag
                        )),
                        env: Some(env),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: REPO_VOLUME.to_string(),
                                mount_path: REPO_MOUNT_PATH.to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: SSHD_VOLUME.to_string(),
                                mount_path: SSHD_MOUNT_PATH.to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    restart_policy: Some("Never".to_string()),
                    security_context: Some(PodSecurityContext {
                        supplemental_groups: Some(fields.supplemental_groups.clone()),
                        ..Default::default()
                    }),
                    service_account_name: Some(labels::BACKREST.to_string()),
                    volumes: Some(vec![
                        Volume {
                            name: REPO_VOLUME.to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: backrest_repo_pvc_name(fields.target_cluster),
                                read_only: None,
                            }),
                            ..Default::default()
                        },
                        // the sshd secret still lives under the source
                        // cluster's name; the target does not exist yet
                        Volume {
                            name: SSHD_VOLUME.to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(backrest_repo_secret_name(
                                    fields.source_cluster,
                                )),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Field values for the delta restore job of clone step 2.
pub struct RestoreJobFields<'a> {
    pub job_name: String,
    pub source_cluster: &'a str,
    pub target_cluster: &'a str,
    pub workflow_id: &'a str,
    pub images: &'a ImageConfig,
    pub supplemental_groups: Vec<i64>,
    /// pgBackRest command options, e.g. `--delta --repo1-type=s3`.
    pub command_opts: String,
    pub s3: Option<S3Env>,
    pub pvc_size: &'a str,
    pub backrest_pvc_size: &'a str,
    pub enable_metrics: &'a str,
}

/// The job that performs the pgBackRest delta restore onto the target's
/// data volume, reading from the target's temporary repository host.
pub fn restore_job(fields: &RestoreJobFields<'_>) -> Job {
    let mut env = vec![
        env_var("COMMAND", "restore"),
        env_var("COMMAND_OPTS", &fields.command_opts),
        env_var("PGBACKREST_STANZA", PGBACKREST_STANZA),
        env_var("PGBACKREST_DB_PATH", &pgdata_path(fields.target_cluster)),
        env_var(
            "PGBACKREST_REPO1_PATH",
            &backrest_repo_path(fields.target_cluster),
        ),
        env_var(
            "PGBACKREST_REPO1_HOST",
            &backrest_repo_service_name(fields.target_cluster),
        ),
    ];
    if let Some(s3) = &fields.s3 {
        env.extend(s3.env_vars());
    }

    let job_labels = BTreeMap::from([
        (labels::CLONE_STEP_2.to_string(), "true".to_string()),
        (labels::BACKREST_RESTORE.to_string(), "true".to_string()),
        (
            labels::PG_CLUSTER.to_string(),
            fields.target_cluster.to_string(),
        ),
        (
            labels::WORKFLOW_ID.to_string(),
            fields.workflow_id.to_string(),
        ),
    ]);

    Job {
        metadata: ObjectMeta {
            name: Some(fields.job_name.clone()),
            annotations: Some(clone_annotations(
                fields.source_cluster,
                fields.target_cluster,
                fields.pvc_size,
                fields.backrest_pvc_size,
                fields.enable_metrics,
            )),
            labels: Some(job_labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(fields.job_name.clone()),
                    labels: Some(job_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "backrest-restore".to_string(),
                        image: Some(format!(
                            "{}/pgo-backrest-restore:{}",
                            fields.images.prefix, fields.images.tag
                        )),
                        env: Some(env),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: "pgdata".to_string(),
                                mount_path: "/pgdata".to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: SSHD_VOLUME.to_string(),
                                mount_path: SSHD_MOUNT_PATH.to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    restart_policy: Some("Never".to_string()),
                    security_context: Some(PodSecurityContext {
                        supplemental_groups: Some(fields.supplemental_groups.clone()),
                        ..Default::default()
                    }),
                    service_account_name: Some(labels::BACKREST.to_string()),
                    volumes: Some(vec![
                        Volume {
                            name: "pgdata".to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: fields.target_cluster.to_string(),
                                read_only: None,
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: SSHD_VOLUME.to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(backrest_repo_secret_name(
                                    fields.target_cluster,
                                )),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Mount the target's WAL volume into a restore job's pod.
pub fn add_wal_volume(job: &mut Job, target_cluster: &str) {
    let pod_spec = job
        .spec
        .get_or_insert_with(Default::default)
        .template
        .spec
        .get_or_insert_with(Default::default);

    pod_spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: "pgwal".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: format!("{}-wal", target_cluster),
            read_only: None,
        }),
        ..Default::default()
    });
    if let Some(container) = pod_spec.containers.first_mut() {
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(VolumeMount {
                name: "pgwal".to_string(),
                mount_path: "/pgwal".to_string(),
                ..Default::default()
            });
    }
}

/// Mount a tablespace volume into a restore job's pod.
pub fn add_tablespace_volume(job: &mut Job, target_cluster: &str, tablespace: &str) {
    let pod_spec = job
        .spec
        .get_or_insert_with(Default::default)
        .template
        .spec
        .get_or_insert_with(Default::default);

    let volume_name = format!("tablespace-{}", tablespace);
    pod_spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: volume_name.clone(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: tablespace_pvc_name(target_cluster, tablespace),
            read_only: None,
        }),
        ..Default::default()
    });
    if let Some(container) = pod_spec.containers.first_mut() {
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(VolumeMount {
                name: volume_name,
                mount_path: format!("/tablespaces/{}", tablespace),
                ..Default::default()
            });
    }
}

/// The temporary pgBackRest repository deployment for the target cluster.
pub fn repo_deployment(target_cluster: &str, images: &ImageConfig) -> Deployment {
    let name = backrest_repo_deployment_name(target_cluster);
    let pod_labels = BTreeMap::from([
        (labels::NAME.to_string(), name.clone()),
        (
            labels::PG_CLUSTER.to_string(),
            target_cluster.to_string(),
        ),
        (labels::BACKREST_REPO.to_string(), "true".to_string()),
    ]);

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(pod_labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    labels::NAME.to_string(),
                    name.clone(),
                )])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "database".to_string(),
                        image: Some(format!(
                            "{}/pgo-backrest-repo:{}",
                            images.prefix, images.tag
                        )),
                        env: Some(vec![
                            env_var("PGBACKREST_STANZA", PGBACKREST_STANZA),
                            env_var(
                                "PGBACKREST_REPO1_PATH",
                                &backrest_repo_path(target_cluster),
                            ),
                        ]),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: REPO_VOLUME.to_string(),
                                mount_path: REPO_MOUNT_PATH.to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: SSHD_VOLUME.to_string(),
                                mount_path: SSHD_MOUNT_PATH.to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: REPO_VOLUME.to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: backrest_repo_pvc_name(target_cluster),
                                read_only: None,
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: SSHD_VOLUME.to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(backrest_repo_secret_name(target_cluster)),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Service fronting the temporary repository deployment.
pub fn repo_service(target_cluster: &str) -> Service {
    let name = backrest_repo_service_name(target_cluster);
    Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(BTreeMap::from([(
                labels::PG_CLUSTER.to_string(),
                target_cluster.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(labels::NAME.to_string(), name)])),
            ports: Some(vec![ServicePort {
                port: REPO_SSHD_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// The target's pgBackRest repository secret, carrying the source's S3 key
/// material forward so the synced repository stays readable.
pub fn backrest_repo_secret(
    target_cluster: &str,
    s3_key: &str,
    s3_key_secret: &str,
    s3_ca: &str,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(backrest_repo_secret_name(target_cluster)),
            labels: Some(BTreeMap::from([
                (
                    labels::PG_CLUSTER.to_string(),
                    target_cluster.to_string(),
                ),
                (labels::BACKREST_REPO.to_string(), "true".to_string()),
            ])),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([
            ("aws-s3-key".to_string(), s3_key.to_string()),
            ("aws-s3-key-secret".to_string(), s3_key_secret.to_string()),
            ("aws-s3-ca.crt".to_string(), s3_ca.to_string()),
        ])),
        ..Default::default()
    }
}

fn clone_annotations(
    source: &str,
    target: &str,
    pvc_size: &str,
    backrest_pvc_size: &str,
    enable_metrics: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            labels::annotations::CLONE_SOURCE_CLUSTER_NAME.to_string(),
            source.to_string(),
        ),
        (
            labels::annotations::CLONE_TARGET_CLUSTER_NAME.to_string(),
            target.to_string(),
        ),
        (
            labels::annotations::CLONE_PVC_SIZE.to_string(),
            pvc_size.to_string(),
        ),
        (
            labels::annotations::CLONE_BACKREST_PVC_SIZE.to_string(),
            backrest_pvc_size.to_string(),
        ),
        (
            labels::annotations::CLONE_ENABLE_METRICS.to_string(),
            enable_metrics.to_string(),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_names_derive_from_cluster() {
        assert_eq!(backrest_repo_pvc_name("copy1"), "copy1-pgbr-repo");
        assert_eq!(
            backrest_repo_deployment_name("copy1"),
            "copy1-backrest-shared-repo"
        );
        assert_eq!(
            backrest_repo_path("copy1"),
            "/backrestrepo/copy1-backrest-shared-repo"
        );
        assert_eq!(
            backrest_repo_secret_name("copy1"),
            "copy1-backrest-repo-config"
        );
    }

    #[test]
    fn sync_job_reads_source_writes_target() {
        let images = ImageConfig::default();
        let job = repo_sync_job(&RepoSyncJobFields {
            job_name: "pgo-backrest-repo-sync-copy1-abcd".to_string(),
            source_cluster: "pg1",
            target_cluster: "copy1",
            workflow_id: "wf-1",
            images: &images,
            supplemental_groups: vec![],
            s3: None,
            pvc_size: "",
            backrest_pvc_size: "",
            enable_metrics: "",
        });

        let spec = job.spec.unwrap();
        let pod = spec.template.spec.unwrap();
        let env = pod.containers[0].env.clone().unwrap();
        let lookup = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.clone())
                .unwrap()
        };

        assert_eq!(lookup("PGBACKREST_REPO1_HOST"), "pg1-backrest-shared-repo");
        assert_eq!(
            lookup("PGBACKREST_REPO1_PATH"),
            "/backrestrepo/pg1-backrest-shared-repo"
        );
        assert_eq!(
            lookup("NEW_PGBACKREST_REPO"),
            "/backrestrepo/copy1-backrest-shared-repo"
        );
        // repo volume is the target's, sshd secret is still the source's
        let volumes = pod.volumes.unwrap();
        let repo_claim = volumes
            .iter()
            .find_map(|v| v.persistent_volume_claim.as_ref())
            .unwrap();
        assert_eq!(repo_claim.claim_name, "copy1-pgbr-repo");
        let sshd = volumes.iter().find_map(|v| v.secret.as_ref()).unwrap();
        assert_eq!(
            sshd.secret_name.as_deref(),
            Some("pg1-backrest-repo-config")
        );
    }

    #[test]
    fn s3_env_includes_combined_mode_flag_only_when_set() {
        let with_flag = S3Env {
            local_and_s3: true,
            ..Default::default()
        };
        assert!(with_flag
            .env_vars()
            .iter()
            .any(|e| e.name == "PGHA_PGBACKREST_LOCAL_S3_STORAGE"));

        let without_flag = S3Env::default();
        assert!(!without_flag
            .env_vars()
            .iter()
            .any(|e| e.name == "PGHA_PGBACKREST_LOCAL_S3_STORAGE"));
    }
}
