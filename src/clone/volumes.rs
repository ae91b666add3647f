//! Derivation and provisioning of the target cluster's volumes.
//!
//! The same PVC set is derived in step 1 (which creates it) and step 2
//! (which only needs the derived names and groups); creation tolerates
//! already-existing claims, so recomputation is free.

use std::collections::BTreeMap;

use tracing::debug;

use super::{CloneError, CloneResult, CloneWorkflow, render};
use crate::crd::task::{PgTask, params};
use crate::crd::{PgCluster, StorageSpec};

/// The PVC set backing a clone target.
pub(crate) struct CloneVolumes {
    pub backrest_pvc: String,
    pub data_pvc: String,
    pub wal_pvc: Option<String>,
    /// Tablespace name to PVC name.
    pub tablespace_pvcs: BTreeMap<String, String>,
    /// Supplemental groups combined across the data and tablespace volumes.
    pub supplemental_groups: Vec<i64>,
}

impl CloneWorkflow {
    /// Derive the target's PVC set from the source cluster and ensure every
    /// claim exists. Per-request size overrides apply to the data and
    /// repository volumes.
    pub(crate) async fn create_clone_pvcs(
        &self,
        namespace: &str,
        task: &PgTask,
        source: &PgCluster,
        target: &str,
    ) -> CloneResult<CloneVolumes> {
        // repository volume first; the sync job needs it soonest
        let mut backrest_storage = source.spec.backrest_storage.clone();
        if let Some(size) = task.spec.parameters.get(params::BACKREST_PVC_SIZE) {
            if !size.is_empty() {
                backrest_storage.size = size.clone();
            }
        }
        let backrest_pvc = render::backrest_repo_pvc_name(target);
        self.create_pvc_if_absent(namespace, &backrest_pvc, target, &backrest_storage)
            .await?;

        let mut data_storage = source.spec.primary_storage.clone();
        if let Some(size) = task.spec.parameters.get(params::PVC_SIZE) {
            if !size.is_empty() {
                data_storage.size = size.clone();
            }
        }
        let data_pvc = target.to_string();
        self.create_pvc_if_absent(namespace, &data_pvc, target, &data_storage)
            .await?;

        let wal_pvc = if source.spec.wal_storage.is_configured() {
            let name = format!("{}-wal", target);
            self.create_pvc_if_absent(namespace, &name, target, &source.spec.wal_storage)
                .await?;
            Some(name)
        } else {
            None
        };

        let mut tablespace_pvcs = BTreeMap::new();
        let mut supplemental_groups = data_storage.supplemental_groups.clone();
        for (tablespace, storage) in &source.spec.tablespace_mounts {
            let name = render::tablespace_pvc_name(target, tablespace);
            self.create_pvc_if_absent(namespace, &name, target, storage)
                .await?;
            supplemental_groups.extend(storage.supplemental_groups.iter().copied());
            tablespace_pvcs.insert(tablespace.clone(), name);
        }

        Ok(CloneVolumes {
            backrest_pvc,
            data_pvc,
            wal_pvc,
            tablespace_pvcs,
            supplemental_groups,
        })
    }

    async fn create_pvc_if_absent(
        &self,
        namespace: &str,
        name: &str,
        target: &str,
        storage: &StorageSpec,
    ) -> CloneResult<()> {
        if storage.size.is_empty() {
            return Err(CloneError::Validation(format!(
                "no storage size configured for pvc {}",
                name
            )));
        }
        let pvc = render::pvc(name, target, storage);
        match self.store.create_pvc(namespace, &pvc).await {
            Ok(()) => {
                debug!(pvc = name, "created pvc");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!(pvc = name, "pvc already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
