//! Engine tuning knobs.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SheevaError};
use crate::graph::NamespaceMatching;
use crate::reconcile::FailurePolicy;

/// Settings shared by every pass of one engine run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Upper bound on reconciliation tasks in flight across the run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub namespace_matching: NamespaceMatching,
}

fn default_max_concurrency() -> usize {
    num_cpus::get() * 2
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            failure_policy: FailurePolicy::default(),
            namespace_matching: NamespaceMatching::default(),
        }
    }
}

impl EngineSettings {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_namespace_matching(mut self, matching: NamespaceMatching) -> Self {
        self.namespace_matching = matching;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(SheevaError::Settings(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert!(settings.max_concurrency >= 2);
        assert_eq!(settings.failure_policy, FailurePolicy::FailFast);
        assert_eq!(settings.namespace_matching, NamespaceMatching::PathPrefix);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let settings = EngineSettings::default().with_max_concurrency(0);
        assert!(matches!(settings.validate(), Err(SheevaError::Settings(_))));
    }
}
