use std::time::Duration;

use thiserror::Error;

/// Graph-shape problems found while loading an ensemble. Never raised per request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ensemble '{0}' declares no steps")]
    NoSteps(String),
    #[error("ensemble '{0}' declares no inputs")]
    NoInputs(String),
    #[error("ensemble '{0}' declares no outputs")]
    NoOutputs(String),
    #[error("step name '{0}' is used more than once")]
    DuplicateStep(String),
    #[error("ensemble output '{0}' is declared more than once")]
    DuplicateOutput(String),
    #[error("step '{step}' calls the ensemble '{ensemble}' it belongs to")]
    SelfReference { step: String, ensemble: String },
    #[error("step '{step}' has model_version {version}; expected -1 (latest) or a version >= 1")]
    InvalidVersion { step: String, version: i64 },
    #[error("step '{step}' consumes '{tensor}', which is neither an ensemble input nor a step output")]
    UnresolvedInput { step: String, tensor: String },
    #[error("tensor '{tensor}' is produced by both {first} and {second}")]
    DuplicateProducer {
        tensor: String,
        first: String,
        second: String,
    },
    #[error("steps form a cycle: {}", steps.join(", "))]
    Cycle { steps: Vec<String> },
    #[error("ensemble output '{tensor}' is not produced by any step")]
    UnproducedOutput { tensor: String },
}

/// Terminal error of one ensemble request.
#[derive(Debug, Error)]
pub enum EnsembleError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("step '{step}' ({model}) failed: {source}")]
    StepInvocation {
        step: String,
        model: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("internal consistency error: {0}")]
    InternalConsistency(String),
    #[error("request timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("request cancelled by the caller")]
    Cancelled,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EnsembleError {
    /// Name of the step a [`EnsembleError::StepInvocation`] is attributed to.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            EnsembleError::StepInvocation { step, .. } => Some(step),
            _ => None,
        }
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        EnsembleError::InternalConsistency(msg.into())
    }
}

pub type Result<T, E = EnsembleError> = std::result::Result<T, E>;
