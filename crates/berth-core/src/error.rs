use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BerthError {
    #[error("credential not found: {} (pass --identity or set BERTH_IDENTITY)", .0.display())]
    CredentialMissing(PathBuf),

    #[error("credential {} is readable by others: chmod 600 it first", .0.display())]
    CredentialPermissions(PathBuf),

    #[error("working tree at {0} has local modifications: resolve them on the host before re-running")]
    DirtyWorkingTree(String),

    #[error("refusing to start '{unit}': {reason}")]
    StartPrecondition { unit: String, reason: String },

    #[error("invalid service name '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidServiceName(String),

    #[error("ssh not found on PATH")]
    SshNotInstalled,

    #[error("transport failure talking to {host}: {message}")]
    Transport { host: String, message: String },

    #[error("remote command failed with exit code {exit_code}: {command}{detail}")]
    RemoteCommand {
        command: String,
        exit_code: i32,
        detail: String,
    },

    #[error("unit '{unit}' did not reach '{wanted}' within {waited_secs}s (last state: {last})")]
    Supervisor {
        unit: String,
        wanted: String,
        last: String,
        waited_secs: u64,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used by callers to decide what a failure means:
/// preconditions need operator action, transport failures are retryable by
/// re-invocation, remote command and supervisor failures halt the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Precondition,
    Transport,
    RemoteCommand,
    Supervisor,
    Other,
}

impl BerthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BerthError::CredentialMissing(_)
            | BerthError::CredentialPermissions(_)
            | BerthError::DirtyWorkingTree(_)
            | BerthError::StartPrecondition { .. }
            | BerthError::InvalidServiceName(_)
            | BerthError::SshNotInstalled => ErrorKind::Precondition,
            BerthError::Transport { .. } => ErrorKind::Transport,
            BerthError::RemoteCommand { .. } => ErrorKind::RemoteCommand,
            BerthError::Supervisor { .. } => ErrorKind::Supervisor,
            BerthError::Io(_) | BerthError::Yaml(_) | BerthError::Json(_) => ErrorKind::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, BerthError>;
