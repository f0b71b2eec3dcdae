//! # Vigil Core - descriptors, discovery and result persistence
//!
//! Vigil supervises long-running agent workloads. This crate holds everything
//! that does not touch a process:
//! - Agent descriptors, instance status and health records
//! - Layered configuration (defaults, `vigil.toml`, environment)
//! - Descriptor discovery from config and descriptor directories
//! - The result sink: timestamped JSON artifacts plus an append-only manifest
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vigil_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = VigilConfig::load()?;
//!
//!     let agents = AgentRegistry::from_config(&config).discover();
//!     let sink = ResultSink::new(&config.results)?;
//!     sink.save("discovery", &agents).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! Process management lives in `vigil-supervisor`.

pub mod agent;
pub mod config;
pub mod error;
pub mod registry;
pub mod results;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::agent::{
        AgentDescriptor, AgentKind, HealthRecord, InstanceStatus, TaskKind, WorkerLiveness,
    };
    pub use crate::config::{
        DiscoveryConfig, ResultsConfig, ScheduleConfig, SupervisorSettings, VigilConfig,
    };
    pub use crate::error::{Result, VigilError};
    pub use crate::registry::{AgentRegistry, DescriptorDefaults, DescriptorSpec, DiscoveryReport};
    pub use crate::results::{ManifestEntry, ResultSink, SavedArtifact};
}
