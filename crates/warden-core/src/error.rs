use crate::phase::TransitionCheck;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("layer '{layer}' budget exceeded: needed {needed} tokens, {available} available")]
    BudgetExceeded {
        layer: String,
        needed: usize,
        available: usize,
    },

    #[error("transition from '{from}' to '{to}' is blocked")]
    TransitionBlocked {
        from: String,
        to: String,
        check: TransitionCheck,
    },

    #[error("gate not found: {0}")]
    GateNotFound(String),

    #[error("phase not found: {0}")]
    PhaseNotFound(String),

    #[error("invalid id '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidId(String),

    #[error("command '{command}' blocked by '{blocker}'")]
    CommandBlocked {
        command: String,
        blocker: String,
        errors: Vec<String>,
    },

    #[error("gate '{gate}' attempt {attempt} exceeded {limit_ms}ms")]
    Timeout {
        gate: String,
        attempt: u32,
        limit_ms: u64,
    },

    #[error("not initialized: no .warden directory at workspace root")]
    NotInitialized,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WardenError>;
