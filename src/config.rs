//! Operator tuning knobs.
//!
//! Config-file loading is out of scope; the values its file carried surface
//! here with defaults and environment overrides, resolved once at startup
//! and passed by value to the components that need them.

use std::env;

use tracing::warn;

use crate::wait::WaitParams;

/// Container image coordinates for the jobs the clone workflow launches.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub prefix: String,
    pub tag: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            prefix: "registry.example.com/pgcluster".to_string(),
            tag: "latest".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Debounce before a NotReady primary triggers a failover.
    pub autofail_sleep_seconds: u64,

    /// Global default for provisioning a replacement replica after failover.
    /// A per-event label overrides this.
    pub autofail_replace_replica: bool,

    /// Node preferred among failover candidates tied at the maximum receive
    /// location.
    pub preferred_failover_node: Option<String>,

    /// Wait for the temporary pgBackRest repo deployment to become ready.
    pub repo_ready_wait: WaitParams,

    /// Wait for the temporary pgBackRest repo deployment/service to delete.
    pub repo_delete_wait: WaitParams,

    /// Wait for the old primary pod to disappear after its deployment is
    /// deleted.
    pub primary_delete_wait: WaitParams,

    /// Wait for a single primary pod to be isolable before deletion.
    pub primary_isolate_wait: WaitParams,

    /// Images for rsync/restore jobs and the temporary repo deployment.
    pub images: ImageConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            autofail_sleep_seconds: 9,
            autofail_replace_replica: false,
            preferred_failover_node: None,
            repo_ready_wait: WaitParams::from_secs(30, 3),
            repo_delete_wait: WaitParams::from_secs(30, 3),
            primary_delete_wait: WaitParams::from_secs(90, 9),
            primary_isolate_wait: WaitParams::from_secs(10, 2),
            images: ImageConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = env::var("PGO_AUTOFAIL_SLEEP_SECONDS") {
            match value.parse() {
                Ok(secs) => config.autofail_sleep_seconds = secs,
                Err(_) => warn!(value, "ignoring unparseable PGO_AUTOFAIL_SLEEP_SECONDS"),
            }
        }
        if let Ok(value) = env::var("PGO_AUTOFAIL_REPLACE_REPLICA") {
            config.autofail_replace_replica = value == "true";
        }
        if let Ok(value) = env::var("PGO_PREFERRED_FAILOVER_NODE") {
            if !value.is_empty() {
                config.preferred_failover_node = Some(value);
            }
        }
        if let Ok(value) = env::var("PGO_IMAGE_PREFIX") {
            config.images.prefix = value;
        }
        if let Ok(value) = env::var("PGO_IMAGE_TAG") {
            config.images.tag = value;
        }

        config
    }
}
