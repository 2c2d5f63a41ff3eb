use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::sample::{SampleId, SampleStatus, WorkerId};

/// Main error type for the samplex system
#[derive(Error, Debug)]
pub enum SxError {
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Model evaluation error: {0}")]
    Model(#[from] ModelError),

    /// The only recoverable error: the submission loop retries later.
    #[error("No free worker available ({pool_size} workers busy)")]
    NoFreeWorker { pool_size: usize },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Remote failure on rank {rank}: {message}")]
    Remote { rank: usize, message: String },

    #[error("Checkpoint error: {message}")]
    Checkpoint { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SxError {
    /// Whether this error must end the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SxError::NoFreeWorker { .. })
    }
}

/// Violations of the suspend/resume and messaging protocol. Always fatal.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolViolation {
    #[error("{context}: resumed after it had already finished")]
    ResumeAfterFinish { context: String },

    #[error("{context}: suspend called outside of its running context")]
    SuspendOutsideRunningContext { context: String },

    #[error("{context}: resumed while it was already running")]
    DoubleResume { context: String },

    #[error("sample {sample_id}: invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        sample_id: SampleId,
        from: SampleStatus,
        to: SampleStatus,
    },

    #[error("sample {sample_id}: termination status '{value}' is neither 'Terminal' nor 'Truncated'")]
    InvalidTermination { sample_id: SampleId, value: String },

    #[error("sample {sample_id}: environment id {environment_id} exceeds environment count {environment_count}")]
    EnvironmentOutOfRange {
        sample_id: SampleId,
        environment_id: usize,
        environment_count: usize,
    },

    #[error("worker {worker} already holds sample {holding}, cannot take sample {requested}")]
    WorkerAlreadyAssigned {
        worker: WorkerId,
        holding: SampleId,
        requested: SampleId,
    },

    #[error("sample {sample_id} is not in flight")]
    UnknownSample { sample_id: SampleId },

    #[error("{context}: execution context was abandoned before completion")]
    Abandoned { context: String },

    #[error("unexpected message for sample {sample_id}: {message}")]
    UnexpectedMessage { sample_id: SampleId, message: String },
}

/// Missing or invalid settings, detected before any sample runs.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("[{component}] no value provided for mandatory setting '{setting}'")]
    Missing { component: String, setting: String },

    #[error("[{component}] invalid value for setting '{setting}': {message}")]
    Invalid {
        component: String,
        setting: String,
        message: String,
    },

    #[error("[{component}] no registered model named '{name}'")]
    UnknownModel { component: String, name: String },
}

/// Invalid data produced by a model callback.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelError {
    #[error("sample {sample_id}: field '{field}' holds a non-finite value ({value})")]
    NonFinite {
        sample_id: SampleId,
        field: String,
        #[serde(deserialize_with = "null_as_nan")]
        value: f64,
    },

    #[error("sample {sample_id}: result field '{field}' was not set")]
    MissingField { sample_id: SampleId, field: String },

    #[error("sample {sample_id}: field '{field}' has {actual} entries, expected {expected}")]
    Arity {
        sample_id: SampleId,
        field: String,
        expected: usize,
        actual: usize,
    },

    #[error("sample {sample_id}: field '{field}' has the wrong type: {message}")]
    WrongType {
        sample_id: SampleId,
        field: String,
        message: String,
    },

    #[error("sample {sample_id}: model panicked: {message}")]
    Panicked { sample_id: SampleId, message: String },
}

/// JSON writes non-finite floats as `null`.
fn null_as_nan<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// An error raised on a worker rank, in a form that crosses the wire.
///
/// Protocol, configuration and model errors keep their variant so the home
/// rank classifies them exactly as a local worker's error would be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteError {
    Protocol(ProtocolViolation),
    Config(ConfigError),
    Model(ModelError),
    Other { message: String },
}

impl From<&SxError> for RemoteError {
    fn from(error: &SxError) -> Self {
        match error {
            SxError::Protocol(v) => RemoteError::Protocol(v.clone()),
            SxError::Config(c) => RemoteError::Config(c.clone()),
            SxError::Model(m) => RemoteError::Model(m.clone()),
            other => RemoteError::Other {
                message: other.to_string(),
            },
        }
    }
}

impl RemoteError {
    /// Rebuild the error on the home rank. Errors without a wire form
    /// become [`SxError::Remote`] naming the rank they came from.
    pub fn into_error(self, rank: usize) -> SxError {
        match self {
            RemoteError::Protocol(v) => SxError::Protocol(v),
            RemoteError::Config(c) => SxError::Config(c),
            RemoteError::Model(m) => SxError::Model(m),
            RemoteError::Other { message } => SxError::Remote { rank, message },
        }
    }
}

/// Result type alias for samplex operations
pub type SxResult<T> = Result<T, SxError>;

/// Macro for creating invalid-setting configuration errors
#[macro_export]
macro_rules! config_error {
    ($component:expr, $setting:expr, $($arg:tt)*) => {
        $crate::SxError::Config($crate::ConfigError::Invalid {
            component: $component.to_string(),
            setting: $setting.to_string(),
            message: format!($($arg)*),
        })
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::SxError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ModelError::NonFinite {
            sample_id: SampleId(7),
            field: "logLikelihood".to_string(),
            value: f64::NAN,
        };

        assert!(error.to_string().contains("non-finite"));
        assert!(error.to_string().contains("logLikelihood"));
        assert!(error.to_string().contains("7"));
    }

    #[test]
    fn test_error_conversion() {
        let violation = ProtocolViolation::ResumeAfterFinish {
            context: "sample 3".to_string(),
        };
        let error: SxError = violation.into();

        match error {
            SxError::Protocol(ProtocolViolation::ResumeAfterFinish { .. }) => (),
            _ => panic!("Expected protocol violation"),
        }
    }

    #[test]
    fn only_no_free_worker_is_recoverable() {
        assert!(!SxError::NoFreeWorker { pool_size: 4 }.is_fatal());
        assert!(internal_error!("boom").is_fatal());
        assert!(config_error!("MCMC", "Chain Length", "must be positive").is_fatal());
    }

    #[test]
    fn remote_errors_keep_their_kind() {
        let error: SxError = ModelError::NonFinite {
            sample_id: SampleId(2),
            field: "F(x)".to_string(),
            value: f64::INFINITY,
        }
        .into();
        let text = serde_json::to_string(&RemoteError::from(&error)).unwrap();
        let rebuilt = serde_json::from_str::<RemoteError>(&text).unwrap().into_error(3);
        match rebuilt {
            SxError::Model(ModelError::NonFinite { sample_id, value, .. }) => {
                assert_eq!(sample_id, SampleId(2));
                assert!(value.is_nan());
            }
            other => panic!("expected a model error, got {other:?}"),
        }

        let rebuilt = RemoteError::from(&SxError::Transport {
            message: "closed".to_string(),
        })
        .into_error(3);
        assert!(matches!(rebuilt, SxError::Remote { rank: 3, .. }));
        assert!(rebuilt.is_fatal());
    }

    #[test]
    fn config_error_names_component_and_setting() {
        let err = config_error!("MCMC", "Rejection Levels", "must be at least one (is {})", 0);
        let text = err.to_string();
        assert!(text.contains("MCMC"));
        assert!(text.contains("Rejection Levels"));
        assert!(text.contains("is 0"));
    }
}
