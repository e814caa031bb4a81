use std::path::PathBuf;
use thiserror::Error;

/// Conditions callers branch on. Everything else travels as a plain
/// `anyhow::Error` with a code-prefixed message.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("interrupted: task was terminated")]
    Interrupted,

    #[error("no_parameter_set_found: {0}")]
    NoParameterSetFound(String),

    #[error("missing_parameter_value: no value for parameter \"{0}\"")]
    MissingParameterValue(String),

    #[error("incompatible_dataset_format: program \"{program}\" cannot read format \"{format}\"")]
    IncompatibleDataSetFormat { program: String, format: String },

    #[error("result_parse: {path}:{line}: {message}")]
    ResultParse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("unknown_plugin: {kind} \"{name}\" is not registered")]
    UnknownPlugin { kind: &'static str, name: String },

    #[error("invalid_transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("setup_error: {0}")]
    Setup(String),
}

impl RunnerError {
    pub fn is_interrupted(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<RunnerError>(),
            Some(RunnerError::Interrupted)
        )
    }
}
