//! Promoting a standby to primary.
//!
//! Promotion is a command run inside the target pod. The trait keeps the
//! transport out of the executor; the real implementation posts to the HA
//! agent's failover endpoint on localhost, naming the pod as the candidate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use super::{DATABASE_CONTAINER, FailoverResult};
use crate::exec::PodExec;

/// Port of the HA agent's REST API inside database pods.
const PATRONI_PORT: u16 = 8008;

#[async_trait]
pub trait PromotionService: Send + Sync {
    /// Promote the instance running in `pod` to primary.
    async fn promote(&self, namespace: &str, pod: &str) -> FailoverResult<()>;
}

/// Promotes by exec'ing a failover request against the Patroni API in the
/// target pod.
pub struct PatroniPromotion {
    exec: Arc<dyn PodExec>,
}

impl PatroniPromotion {
    pub fn new(exec: Arc<dyn PodExec>) -> Self {
        Self { exec }
    }
}

#[async_trait]
impl PromotionService for PatroniPromotion {
    async fn promote(&self, namespace: &str, pod: &str) -> FailoverResult<()> {
        let command = vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            format!(
                "curl -s http://127.0.0.1:{}/failover -XPOST -d '{{\"candidate\":\"{}\"}}'",
                PATRONI_PORT, pod
            ),
        ];

        debug!(namespace, pod, "running promotion command");
        let output = self
            .exec
            .exec(namespace, pod, DATABASE_CONTAINER, &command)
            .await?;
        debug!(stdout = %output.stdout, stderr = %output.stderr, "promotion command output");
        Ok(())
    }
}

/// Records promotions instead of performing them, for tests.
#[derive(Default)]
pub struct RecordingPromotion {
    promoted: Mutex<Vec<String>>,
}

impl RecordingPromotion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn promoted(&self) -> Vec<String> {
        self.promoted.lock().expect("promotion lock poisoned").clone()
    }
}

#[async_trait]
impl PromotionService for RecordingPromotion {
    async fn promote(&self, _namespace: &str, pod: &str) -> FailoverResult<()> {
        self.promoted
            .lock()
            .expect("promotion lock poisoned")
            .push(pod.to_string());
        Ok(())
    }
}
