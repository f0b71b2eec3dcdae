//! Agent registry: resolves descriptors from declarative sources
//!
//! Sources are read in a fixed order and later sources override earlier
//! ones for the same agent ID:
//!
//! 1. every directory in `discovery.descriptor_dirs`, in listed order, each
//!    holding one descriptor per `.toml` / `.json` / `.yaml` / `.yml` file,
//!    read in lexicographic file-name order;
//! 2. inline `[[agents]]` entries from the configuration.
//!
//! A source that is missing, unreadable or invalid is skipped with a
//! warning; it never aborts discovery of the other agents.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::agent::{AgentDescriptor, AgentKind};
use crate::config::{DiscoveryConfig, VigilConfig};
use crate::error::{Result, VigilError};

/// Descriptor as written in a source; unset fields fall back to
/// [`DescriptorDefaults`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptorSpec {
    /// Unique agent ID
    pub id: String,

    /// Workload category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<AgentKind>,

    /// Directory the workers are launched in
    #[serde(default, alias = "path")]
    pub working_dir: PathBuf,

    /// Program followed by its arguments
    #[serde(default)]
    pub command: Vec<String>,

    /// Number of workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Start automatically
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomous: Option<bool>,

    /// OS process workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<bool>,

    /// Probe interval
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub health_check_interval: Option<Duration>,

    /// Restart on probe failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_on_failure: Option<bool>,

    /// Cron-like schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Domain metadata, merged over the defaults' metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Values inherited by descriptors that leave them unset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorDefaults {
    /// Kind used when a descriptor has none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<AgentKind>,
    /// Worker count
    pub workers: usize,
    /// Autonomous flag
    pub autonomous: bool,
    /// Background flag
    pub background: bool,
    /// Restart-on-failure flag
    pub restart_on_failure: bool,
    /// Probe interval; the kind's default when unset
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub health_check_interval: Option<Duration>,
    /// Metadata shared by every descriptor
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Default for DescriptorDefaults {
    fn default() -> Self {
        Self {
            kind: None,
            workers: 1,
            autonomous: true,
            background: true,
            restart_on_failure: true,
            health_check_interval: None,
            metadata: BTreeMap::new(),
        }
    }
}

impl DescriptorSpec {
    /// Resolve against defaults into a validated descriptor.
    ///
    /// Relative working directories are joined onto `base`.
    pub fn resolve(&self, defaults: &DescriptorDefaults, base: Option<&Path>) -> Result<AgentDescriptor> {
        let kind = self
            .kind
            .or(defaults.kind)
            .ok_or_else(|| VigilError::invalid(&self.id, "kind is not set"))?;

        if self.working_dir.as_os_str().is_empty() {
            return Err(VigilError::invalid(&self.id, "working_dir is not set"));
        }
        let working_dir = match base {
            Some(base) if self.working_dir.is_relative() => base.join(&self.working_dir),
            _ => self.working_dir.clone(),
        };

        if let Some(schedule) = &self.schedule {
            parse_schedule(schedule).map_err(|reason| VigilError::invalid(&self.id, reason))?;
        }

        let mut metadata = defaults.metadata.clone();
        metadata.extend(self.metadata.clone());

        let descriptor = AgentDescriptor {
            id: self.id.clone(),
            kind,
            working_dir,
            command: self.command.clone(),
            workers: self.workers.unwrap_or(defaults.workers),
            autonomous: self.autonomous.unwrap_or(defaults.autonomous),
            background: self.background.unwrap_or(defaults.background),
            health_check_interval: self
                .health_check_interval
                .or(defaults.health_check_interval)
                .unwrap_or_else(|| kind.default_health_check_interval()),
            restart_on_failure: self.restart_on_failure.unwrap_or(defaults.restart_on_failure),
            schedule: self.schedule.clone(),
            metadata,
        };

        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Parse a 5-field (minute precision) or 6/7-field (second precision) cron
/// expression
pub fn parse_schedule(expr: &str) -> std::result::Result<cron::Schedule, String> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| format!("invalid schedule '{}': {}", expr, e))
}

/// Outcome of a discovery pass
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Resolved descriptors by agent ID
    pub descriptors: BTreeMap<String, AgentDescriptor>,
    /// Sources that were skipped, with the reason
    pub skipped: Vec<VigilError>,
}

/// Resolves static descriptors for every known agent
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    discovery: DiscoveryConfig,
    inline: Vec<DescriptorSpec>,
}

impl AgentRegistry {
    /// Create a registry over explicit sources
    pub fn new(discovery: DiscoveryConfig, inline: Vec<DescriptorSpec>) -> Self {
        Self { discovery, inline }
    }

    /// Create a registry from a loaded configuration
    pub fn from_config(config: &VigilConfig) -> Self {
        Self::new(config.discovery.clone(), config.agents.clone())
    }

    /// Discover every agent; skipped sources are only logged
    pub fn discover(&self) -> BTreeMap<String, AgentDescriptor> {
        self.discover_detailed().descriptors
    }

    /// Discover every agent and report what was skipped
    pub fn discover_detailed(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        for dir in &self.discovery.descriptor_dirs {
            for (path, spec) in self.read_dir(dir, &mut report.skipped) {
                let base = self
                    .discovery
                    .workspace_root
                    .clone()
                    .or_else(|| path.parent().map(Path::to_path_buf));
                self.admit(&spec, base.as_deref(), &mut report);
            }
        }

        for spec in &self.inline {
            self.admit(spec, self.discovery.workspace_root.as_deref(), &mut report);
        }

        info!(
            "Discovered {} agents ({} sources skipped)",
            report.descriptors.len(),
            report.skipped.len()
        );
        report
    }

    fn admit(&self, spec: &DescriptorSpec, base: Option<&Path>, report: &mut DiscoveryReport) {
        let descriptor = match spec.resolve(&self.discovery.defaults, base) {
            Ok(d) => d,
            Err(e) => {
                warn!(agent_id = %spec.id, "Skipping agent: {}", e);
                report.skipped.push(e);
                return;
            }
        };

        if !descriptor.working_dir.is_dir() {
            let e = VigilError::Discovery(format!(
                "working directory for {} does not exist: {}",
                descriptor.id,
                descriptor.working_dir.display()
            ));
            warn!(agent_id = %descriptor.id, "Skipping agent: {}", e);
            report.skipped.push(e);
            return;
        }

        if report.descriptors.contains_key(&descriptor.id) {
            debug!(agent_id = %descriptor.id, "Descriptor overridden by a later source");
        }
        report.descriptors.insert(descriptor.id.clone(), descriptor);
    }

    fn read_dir(&self, dir: &Path, skipped: &mut Vec<VigilError>) -> Vec<(PathBuf, DescriptorSpec)> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                let e = VigilError::Discovery(format!(
                    "cannot read descriptor directory {}: {}",
                    dir.display(),
                    e
                ));
                warn!("{}", e);
                skipped.push(e);
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && descriptor_format(p).is_some())
            .collect();
        paths.sort();

        let mut specs = Vec::with_capacity(paths.len());
        for path in paths {
            match load_descriptor_file(&path) {
                Ok(spec) => specs.push((path, spec)),
                Err(e) => {
                    warn!(path = %path.display(), "Skipping descriptor file: {}", e);
                    skipped.push(e);
                }
            }
        }
        specs
    }
}

#[derive(Debug, Clone, Copy)]
enum DescriptorFormat {
    Toml,
    Json,
    Yaml,
}

fn descriptor_format(path: &Path) -> Option<DescriptorFormat> {
    match path.extension()?.to_str()? {
        "toml" => Some(DescriptorFormat::Toml),
        "json" => Some(DescriptorFormat::Json),
        "yaml" | "yml" => Some(DescriptorFormat::Yaml),
        _ => None,
    }
}

/// Load one descriptor file. A file without an `id` takes its file stem.
pub fn load_descriptor_file(path: &Path) -> Result<DescriptorSpec> {
    use figment::{
        Figment,
        providers::{Format, Json, Toml, Yaml},
    };

    let format = descriptor_format(path).ok_or_else(|| {
        VigilError::Discovery(format!("unsupported descriptor file: {}", path.display()))
    })?;

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    let figment = Figment::from(figment::providers::Serialized::default("id", stem));
    let figment = match format {
        DescriptorFormat::Toml => figment.merge(Toml::file(path)),
        DescriptorFormat::Json => figment.merge(Json::file(path)),
        DescriptorFormat::Yaml => figment.merge(Yaml::file(path)),
    };

    figment.extract().map_err(|e| {
        VigilError::Discovery(format!("malformed descriptor {}: {}", path.display(), e))
    })
}
