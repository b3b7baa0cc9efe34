use crate::configs::ConfigError;
use thiserror::Error;

/// Errors surfaced by supervisor operations and the control protocol.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A selection named a process type that is not configured.
    #[error("process '{0}' is not configured; you may need to reload the config")]
    UnknownProcess(String),
    #[error("failed to spawn {description}: {reason}")]
    Spawn { description: String, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{description} crashed {crashes} times within {window}; giving up")]
    CrashLoopExceeded {
        description: String,
        crashes: u32,
        window: String,
    },
}

impl SupervisorError {
    /// Short stable label used on the wire and in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::Config(_) => "config_error",
            SupervisorError::UnknownProcess(_) => "naming_error",
            SupervisorError::Spawn { .. } => "spawn_error",
            SupervisorError::Protocol(_) => "protocol_error",
            SupervisorError::CrashLoopExceeded { .. } => "crash_loop_exceeded",
        }
    }
}
