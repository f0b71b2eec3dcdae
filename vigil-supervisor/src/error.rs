//! Error types for supervisor operations

use thiserror::Error;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error types for supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to launch worker {worker} of agent {agent_id}: {reason}")]
    Launch {
        agent_id: String,
        worker: usize,
        reason: String,
    },

    #[error("Health probe failed for worker {worker_id}: {reason}")]
    HealthProbe { worker_id: String, reason: String },

    #[error("Restart of agent {agent_id} failed: {reason}")]
    Restart { agent_id: String, reason: String },

    #[error("Worker {worker_id} of agent {agent_id} could not be killed: {reason}")]
    Stop {
        agent_id: String,
        worker_id: String,
        reason: String,
    },

    #[error("Agent shutdown timeout")]
    ShutdownTimeout,

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Startup failed: {0}")]
    StartupFatal(String),

    #[error(transparent)]
    Core(#[from] vigil_core::error::VigilError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
