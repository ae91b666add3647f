//! Failover strategy selection.
//!
//! The algorithm that replaces a primary is chosen by the cluster's
//! `strategy` key from a registry injected at construction time, so dispatch
//! never consults process-global state and tests can register their own.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{FailoverError, FailoverResult};
use crate::crd::{PgCluster, PgTask};

#[async_trait]
pub trait FailoverStrategy: Send + Sync {
    /// Replace the cluster's primary with the target named on the task.
    /// Returns the deployment name of the promoted replica.
    async fn failover(
        &self,
        namespace: &str,
        cluster: &PgCluster,
        task: &PgTask,
    ) -> FailoverResult<String>;
}

/// Strategy key to implementation, fixed at construction.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn FailoverStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, key: &str, strategy: Arc<dyn FailoverStrategy>) -> Self {
        self.strategies.insert(key.to_string(), strategy);
        self
    }

    /// Look up the strategy for a cluster's key. An empty key selects the
    /// default strategy `"1"`.
    pub fn strategy_for(&self, key: &str) -> FailoverResult<&Arc<dyn FailoverStrategy>> {
        let effective = if key.is_empty() { "1" } else { key };
        self.strategies
            .get(effective)
            .ok_or_else(|| FailoverError::UnknownStrategy(effective.to_string()))
    }
}
