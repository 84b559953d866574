//! Policy snapshot used to compute pending rule traces
//!
//! The collector never evaluates policy for enforcement. It asks the current
//! snapshot which rules a flow would hit so that consumers can see verdicts
//! the dataplane has not confirmed yet.

use crate::endpoint::Endpoint;
use crate::rule::{RuleDirection, RuleId};
use flowscope_common::Tuple;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub trait PolicyCalculator: Send + Sync {
    /// Ordered rules `tuple` would hit at `endpoint` in `direction`.
    fn calculate(&self, endpoint: &Endpoint, direction: RuleDirection, tuple: &Tuple) -> Vec<Arc<RuleId>>;
}

/// Shared, swappable policy snapshot.
#[derive(Clone)]
pub struct PolicyStore {
    inner: Arc<RwLock<Box<dyn PolicyCalculator>>>,
}

impl PolicyStore {
    pub fn new(calculator: Box<dyn PolicyCalculator>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(calculator)),
        }
    }

    /// Install a new snapshot. Waits for in-flight evaluations to finish.
    pub async fn replace(&self, calculator: Box<dyn PolicyCalculator>) {
        *self.inner.write().await = calculator;
    }

    pub async fn evaluate(
        &self,
        endpoint: &Endpoint,
        direction: RuleDirection,
        tuple: &Tuple,
    ) -> Vec<Arc<RuleId>> {
        let calculator = self.inner.read().await;
        calculator.calculate(endpoint, direction, tuple)
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(Box::new(StaticPolicyCalculator::default()))
    }
}

/// Snapshot holding a fixed rule list per endpoint key and direction.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyCalculator {
    rules: HashMap<(String, RuleDirection), Vec<Arc<RuleId>>>,
}

impl StaticPolicyCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(mut self, endpoint_key: &str, direction: RuleDirection, rules: Vec<RuleId>) -> Self {
        self.rules.insert(
            (endpoint_key.to_string(), direction),
            rules.into_iter().map(Arc::new).collect(),
        );
        self
    }
}

impl PolicyCalculator for StaticPolicyCalculator {
    fn calculate(&self, endpoint: &Endpoint, direction: RuleDirection, _tuple: &Tuple) -> Vec<Arc<RuleId>> {
        self.rules
            .get(&(endpoint.key(), direction))
            .cloned()
            .unwrap_or_default()
    }
}
