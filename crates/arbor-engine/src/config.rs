//! Engine configuration, loadable from YAML. Every field has a default so an
//! empty document is a valid configuration.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use arbor_types::Result;

use crate::license::Edition;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub restrictions: OrchestrationRestrictionConfig,
    pub license_cache_ttl_secs: u64,
    /// Page size used when an interrupt walks node executions.
    pub interrupt_batch_size: usize,
    pub event_channel_capacity: usize,
    /// How long a satisfied callback id is kept for waits registered late.
    pub wait_retention_secs: u64,
    pub feature_flags: FeatureFlags,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            restrictions: OrchestrationRestrictionConfig::default(),
            license_cache_ttl_secs: 24 * 60 * 60,
            interrupt_batch_size: 1000,
            event_channel_capacity: 256,
            wait_retention_secs: 60 * 60,
            feature_flags: FeatureFlags::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let yaml = tokio::fs::read_to_string(path).await?;
        let config = Self::from_yaml_str(&yaml)?;
        tracing::debug!(path = %path.display(), "Engine config loaded");
        Ok(config)
    }

    pub fn license_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.license_cache_ttl_secs)
    }

    pub fn wait_retention(&self) -> Duration {
        Duration::from_secs(self.wait_retention_secs)
    }
}

/// Per-edition limit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditionLimits {
    pub free: u64,
    pub team: u64,
    pub enterprise: u64,
}

impl EditionLimits {
    pub fn for_edition(&self, edition: Edition) -> u64 {
        match edition {
            Edition::Free => self.free,
            Edition::Team => self.team,
            Edition::Enterprise => self.enterprise,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationRestrictionConfig {
    pub use_restriction_for_free: bool,
    pub use_restriction_for_team: bool,
    pub use_restriction_for_enterprise: bool,
    /// Running executions of one pipeline before new ones are queued.
    pub plan_execution_restriction: EditionLimits,
    pub pipeline_creation_restriction: EditionLimits,
    /// Effective fan-out bound handed to a children step.
    pub max_concurrency_restriction: EditionLimits,
    /// Child counts above this are rejected outright.
    pub total_parallelism_stop_restriction: EditionLimits,
}

impl Default for OrchestrationRestrictionConfig {
    fn default() -> Self {
        Self {
            use_restriction_for_free: false,
            use_restriction_for_team: false,
            use_restriction_for_enterprise: false,
            plan_execution_restriction: EditionLimits {
                free: 5,
                team: 50,
                enterprise: 500,
            },
            pipeline_creation_restriction: EditionLimits {
                free: 100,
                team: 1_000,
                enterprise: 10_000,
            },
            max_concurrency_restriction: EditionLimits {
                free: 20,
                team: 50,
                enterprise: 100,
            },
            total_parallelism_stop_restriction: EditionLimits {
                free: 100,
                team: 500,
                enterprise: 1_000,
            },
        }
    }
}

impl OrchestrationRestrictionConfig {
    pub fn uses_restriction(&self, edition: Edition) -> bool {
        match edition {
            Edition::Free => self.use_restriction_for_free,
            Edition::Team => self.use_restriction_for_team,
            Edition::Enterprise => self.use_restriction_for_enterprise,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Accounts whose resumed nodes inherit the previous attempt's variables.
    pub merge_runtime_variables_in_resume: BTreeSet<String>,
}

impl FeatureFlags {
    pub fn merge_runtime_variables(&self, account_id: &str) -> bool {
        self.merge_runtime_variables_in_resume.contains(account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let config = EngineConfig::from_yaml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.interrupt_batch_size, 1000);
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.license_cache_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.wait_retention(), Duration::from_secs(3_600));
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let yaml = r#"
interrupt_batch_size: 10
restrictions:
  use_restriction_for_team: true
  max_concurrency_restriction:
    free: 2
    team: 3
    enterprise: 4
feature_flags:
  merge_runtime_variables_in_resume: [acc1]
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.interrupt_batch_size, 10);
        assert!(config.restrictions.uses_restriction(Edition::Team));
        assert!(!config.restrictions.uses_restriction(Edition::Free));
        assert_eq!(
            config
                .restrictions
                .max_concurrency_restriction
                .for_edition(Edition::Enterprise),
            4
        );
        // untouched sections keep their defaults
        assert_eq!(
            config
                .restrictions
                .total_parallelism_stop_restriction
                .for_edition(Edition::Free),
            100
        );
        assert!(config.feature_flags.merge_runtime_variables("acc1"));
        assert!(!config.feature_flags.merge_runtime_variables("acc2"));
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let err = EngineConfig::from_yaml_str("interrupt_batch_size: [").unwrap_err();
        assert!(matches!(err, arbor_types::ArborError::Yaml(_)));
    }

    #[tokio::test]
    async fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        tokio::fs::write(&path, "event_channel_capacity: 16\n")
            .await
            .unwrap();
        let config = EngineConfig::load(&path).await.unwrap();
        assert_eq!(config.event_channel_capacity, 16);
    }
}
