//! Configuration types for the Vigil supervisor

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, VigilError};
use crate::registry::{DescriptorDefaults, DescriptorSpec};

/// Main configuration for a Vigil deployment
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VigilConfig {
    /// Supervisor loop settings
    pub supervisor: SupervisorSettings,

    /// Result persistence settings
    pub results: ResultsConfig,

    /// Descriptor discovery settings
    pub discovery: DiscoveryConfig,

    /// Periodic task intervals
    pub schedule: ScheduleConfig,

    /// Inline agent descriptors
    pub agents: Vec<DescriptorSpec>,
}

/// Supervisor loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Health monitor polling tick
    #[serde(with = "humantime_serde")]
    pub health_tick: Duration,

    /// Scheduler polling tick
    #[serde(with = "humantime_serde")]
    pub scheduler_tick: Duration,

    /// Time a worker gets to exit after a termination request
    #[serde(with = "humantime_serde")]
    pub stop_grace_period: Duration,

    /// Time allowed for the loops to wind down during shutdown
    #[serde(with = "humantime_serde")]
    pub loop_shutdown_timeout: Duration,

    /// Consecutive restarts allowed before an agent is parked as stopped
    pub max_restart_failures: u32,

    /// Scheduled handlers allowed to run at once
    pub handler_concurrency: usize,

    /// Directory receiving stdout/stderr of background workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_log_dir: Option<PathBuf>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            health_tick: Duration::from_secs(5),
            scheduler_tick: Duration::from_secs(15),
            stop_grace_period: Duration::from_secs(5),
            loop_shutdown_timeout: Duration::from_secs(10),
            max_restart_failures: 3,
            handler_concurrency: 4,
            worker_log_dir: None,
        }
    }
}

/// Result persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    /// Root results directory
    pub results_dir: PathBuf,

    /// Prefix of every artifact name and of manifest source tags
    pub artifact_prefix: String,

    /// Subdirectory of `results_dir` receiving artifacts
    pub compiled_subdir: String,

    /// Manifest file name, stored in `results_dir`
    pub manifest_file: String,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("./results"),
            artifact_prefix: "supervisor".to_string(),
            compiled_subdir: "compiled".to_string(),
            manifest_file: "compiled_manifest.json".to_string(),
        }
    }
}

impl ResultsConfig {
    /// Results rooted at `dir`, other settings default
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: dir.into(),
            ..Self::default()
        }
    }
}

/// Descriptor discovery settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Directories scanned for one-descriptor-per-file sources, in order
    pub descriptor_dirs: Vec<PathBuf>,

    /// Root for relative working directories
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    /// Values inherited by descriptors that omit them
    pub defaults: DescriptorDefaults,
}

/// Periodic task intervals; a zero interval disables the task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Maintenance sweep
    #[serde(with = "humantime_serde")]
    pub maintenance: Duration,

    /// Health report generation
    #[serde(with = "humantime_serde")]
    pub health_report: Duration,

    /// Result-system sync
    #[serde(with = "humantime_serde")]
    pub data_sync: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            maintenance: Duration::from_secs(6 * 60 * 60),
            health_report: Duration::from_secs(60 * 60),
            data_sync: Duration::from_secs(30 * 60),
        }
    }
}

impl VigilConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `vigil.toml` in the working directory
    /// 3. File named by `VIGIL_CONFIG_PATH`
    /// 4. `VIGIL_` environment overrides (nested keys split on `__`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(VigilConfig::default()))
            .merge(Toml::file("vigil.toml"));

        if let Ok(path) = std::env::var("VIGIL_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: VigilConfig = figment
            .merge(Env::prefixed("VIGIL_").split("__"))
            .extract()
            .map_err(|e| VigilError::Configuration(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// Unlike [`load`](Self::load), a missing file is an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let path = path.as_ref();
        if !path.is_file() {
            return Err(VigilError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let config: VigilConfig = Figment::from(Serialized::defaults(VigilConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("VIGIL_").split("__"))
            .extract()
            .map_err(|e| {
                VigilError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: VigilConfig = Figment::from(Serialized::defaults(VigilConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the supervisor-wide sections.
    ///
    /// Agent entries are not checked here; a bad agent is skipped at
    /// discovery instead of failing the whole deployment.
    pub fn validate(&self) -> Result<()> {
        let s = &self.supervisor;
        if s.health_tick.is_zero() || s.scheduler_tick.is_zero() {
            return Err(VigilError::Configuration(
                "health_tick and scheduler_tick must be non-zero".to_string(),
            ));
        }
        if s.handler_concurrency == 0 {
            return Err(VigilError::Configuration(
                "handler_concurrency must be at least 1".to_string(),
            ));
        }
        if self.results.artifact_prefix.trim().is_empty() {
            return Err(VigilError::Configuration(
                "results.artifact_prefix must not be empty".to_string(),
            ));
        }
        if self.results.manifest_file.trim().is_empty() {
            return Err(VigilError::Configuration(
                "results.manifest_file must not be empty".to_string(),
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
        let config = VigilConfig::default();
        assert_eq!(config.supervisor.max_restart_failures, 3);
        assert_eq!(config.supervisor.health_tick, Duration::from_secs(5));
        assert_eq!(config.results.manifest_file, "compiled_manifest.json");
        assert_eq!(config.schedule.data_sync, Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_str_partial() {
        let config = VigilConfig::from_toml_str(
            r#"
            [supervisor]
            health_tick = "2s"
            stop_grace_period = "500ms"

            [results]
            results_dir = "/tmp/vigil-results"

            [schedule]
            data_sync = "0s"

            [[agents]]
            id = "crawler-a"
            kind = "crawler"
            working_dir = "."
            command = ["sleep", "30"]
            workers = 3
            health_check_interval = "30s"
            "#,
        )
        .unwrap();

        assert_eq!(config.supervisor.health_tick, Duration::from_secs(2));
        assert_eq!(config.supervisor.stop_grace_period, Duration::from_millis(500));
        assert_eq!(config.supervisor.scheduler_tick, Duration::from_secs(15));
        assert_eq!(config.results.results_dir, PathBuf::from("/tmp/vigil-results"));
        assert_eq!(config.results.artifact_prefix, "supervisor");
        assert!(config.schedule.data_sync.is_zero());
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].workers, Some(3));
        assert_eq!(config.agents[0].health_check_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_tick_rejected() {
        let result = VigilConfig::from_toml_str(
            r#"
            [supervisor]
            health_tick = "0s"
            "#,
        );
        assert!(matches!(result, Err(VigilError::Configuration(_))));
    }

    #[test]
    fn test_from_file_missing() {
        let result = VigilConfig::from_file("/definitely/not/here/vigil.toml");
        assert!(matches!(result, Err(VigilError::Configuration(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(
            &path,
            r#"
            [supervisor]
            max_restart_failures = 5
            "#,
        )
        .unwrap();

        let config = VigilConfig::from_file(&path).unwrap();
        assert_eq!(config.supervisor.max_restart_failures, 5);
    }
}
