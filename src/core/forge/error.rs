use thiserror::Error;

/// Orchestration-level failures. `Cancelled` is the cooperative stop signal
/// and is only ever handled at the top of a run.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("run {0} cancelled by stop request")]
    Cancelled(String),
    #[error("agent {0} not found")]
    AgentNotFound(String),
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("checkpoint {seq} not found in run {run_id}")]
    CheckpointNotFound { run_id: String, seq: i64 },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForgeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ForgeError::Cancelled(_))
    }
}

pub type ForgeResult<T> = Result<T, ForgeError>;
