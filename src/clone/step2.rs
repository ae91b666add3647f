//! Clone step 2: stand up the target's temporary repository host and launch
//! the delta restore job.

use tracing::{debug, info};

use super::step1::is_local_and_s3;
use super::{CloneError, CloneIdentifiers, CloneResult, CloneWorkflow, render};
use crate::crd::PgCluster;
use crate::crd::task::{PgTask, params};
use crate::failover::{DATABASE_CONTAINER, random_suffix};
use crate::labels;
use crate::selector::Selector;
use crate::wait;

impl CloneWorkflow {
    pub(crate) async fn step2(
        &self,
        namespace: &str,
        task: &PgTask,
        ids: &CloneIdentifiers,
    ) -> CloneResult<()> {
        debug!(
            namespace,
            source = %ids.source_cluster,
            target = %ids.target_cluster,
            workflow = %ids.workflow_id,
            "clone step 2 called"
        );

        let source = self
            .store
            .get_cluster(namespace, &ids.source_cluster)
            .await
            .map_err(|e| CloneError::SourceClusterMissing(e.to_string()))?;

        // re-derive the PVC set; the volumes were created during step 1, so
        // this only recomputes names and supplemental groups
        let volumes = self
            .create_clone_pvcs(namespace, task, &source, &ids.target_cluster)
            .await?;

        let s3_creds = self.s3_credentials(namespace, &ids.source_cluster).await?;

        // fresh repo secret for the target; a clone never shares the
        // source's repository host keys
        let secret = render::backrest_repo_secret(
            &ids.target_cluster,
            &s3_creds.key,
            &s3_creds.key_secret,
            &s3_creds.ca,
        );
        match self.store.create_secret(namespace, &secret).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                debug!(target = %ids.target_cluster, "backrest repo secret already exists")
            }
            Err(e) => return Err(e.into()),
        }

        // bring up the temporary repository host and wait for it; the
        // restore job cannot start against a repository that is not serving
        let repo_name = render::backrest_repo_deployment_name(&ids.target_cluster);
        let deployment = render::repo_deployment(&ids.target_cluster, &self.config.images);
        match self.store.create_deployment(namespace, &deployment).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                debug!(deployment = %repo_name, "repo deployment already exists")
            }
            Err(e) => return Err(e.into()),
        }
        let service = render::repo_service(&ids.target_cluster);
        match self.store.create_service(namespace, &service).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }

        wait::deployment_ready(
            self.store.as_ref(),
            namespace,
            &repo_name,
            self.config.repo_ready_wait,
        )
        .await
        .map_err(|e| CloneError::Validation(format!("Could not start pgbackrest repo: {}", e)))?;

        // a delta restore skips files already copied by the repo sync
        let mut command_opts = "--delta".to_string();

        let requested_storage = task
            .spec
            .parameters
            .get(params::BACKREST_STORAGE_TYPE)
            .map(String::as_str)
            .unwrap_or("");
        let repo_is_s3 = requested_storage.contains("s3");
        if repo_is_s3 && !command_opts.contains("--repo1-type") {
            command_opts.push_str(" --repo1-type=s3");
        }

        // when the source keeps WAL on its own volume, the restore must map
        // the WAL link into the target's WAL volume; the link name depends
        // on the source's PostgreSQL major version
        if source.spec.wal_storage.is_configured() {
            let link_map = self.wal_link_map(namespace, &source, &ids.target_cluster).await?;
            command_opts.push(' ');
            command_opts.push_str(&link_map);
        }

        let get_param = |key: &str| {
            task.spec
                .parameters
                .get(key)
                .map(String::as_str)
                .unwrap_or("")
                .to_string()
        };

        let s3 = if repo_is_s3 {
            Some(render::S3Env {
                storage_source: requested_storage.to_string(),
                bucket: source.spec.backrest_s3_bucket.clone(),
                endpoint: source.spec.backrest_s3_endpoint.clone(),
                region: source.spec.backrest_s3_region.clone(),
                key: s3_creds.key.clone(),
                key_secret: s3_creds.key_secret.clone(),
                local_and_s3: is_local_and_s3(source.backrest_storage_type()),
            })
        } else {
            None
        };

        let mut job = render::restore_job(&render::RestoreJobFields {
            job_name: format!("restore-{}-{}", ids.target_cluster, random_suffix(4)),
            source_cluster: &ids.source_cluster,
            target_cluster: &ids.target_cluster,
            workflow_id: &ids.workflow_id,
            images: &self.config.images,
            supplemental_groups: volumes.supplemental_groups.clone(),
            command_opts,
            s3,
            pvc_size: &get_param(params::PVC_SIZE),
            backrest_pvc_size: &get_param(params::BACKREST_PVC_SIZE),
            enable_metrics: &get_param(params::ENABLE_METRICS),
        });

        if volumes.wal_pvc.is_some() {
            render::add_wal_volume(&mut job, &ids.target_cluster);
        }
        for tablespace in volumes.tablespace_pvcs.keys() {
            render::add_tablespace_volume(&mut job, &ids.target_cluster, tablespace);
        }

        self.store.create_job(namespace, &job).await?;
        info!(
            job = job.metadata.name.as_deref().unwrap_or_default(),
            "clone step 2: created restore job"
        );

        self.mark_complete(namespace, task).await;
        Ok(())
    }

    /// Derive the `--link-map` restore argument by probing the source's
    /// PostgreSQL major version inside a live pod. Versions before 10 call
    /// the WAL directory `pg_xlog`.
    async fn wal_link_map(
        &self,
        namespace: &str,
        source: &PgCluster,
        target_cluster: &str,
    ) -> CloneResult<String> {
        let selector = Selector::new()
            .eq(labels::PG_CLUSTER, &source.spec.cluster_name)
            .ne(labels::BACKREST_JOB, "true");
        let pods = self.store.list_pods(namespace, &selector).await?;
        let pod = pods
            .first()
            .and_then(|p| p.metadata.name.as_deref())
            .ok_or_else(|| {
                CloneError::Validation("Could not determine PostgreSQL version: found no cluster pods".to_string())
            })?;

        // PGVERSION is set in the database containers; the sort -VC trick
        // is a version comparison against 10
        let script = concat!(
            "if printf '10\\n'${PGVERSION} | sort -VC\n",
            "then\n",
            "\techo -n '--link-map=pg_wal='\n",
            "else\n",
            "\techo -n '--link-map=pg_xlog='\n",
            "fi"
        );
        let command = vec![
            "bash".to_string(),
            "-c".to_string(),
            script.to_string(),
        ];

        let output = self
            .exec
            .exec(namespace, pod, DATABASE_CONTAINER, &command)
            .await
            .map_err(|e| {
                CloneError::Validation(format!("Could not determine PostgreSQL version: {}", e))
            })?;

        Ok(format!("{}{}", output.stdout, render::wal_path(target_cluster)))
    }
}
