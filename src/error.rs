use thiserror::Error;

/// Errors surfaced by the environment controller.
///
/// Every variant is fatal to the current run; nothing in the crate retries.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Engine load error: {0}")]
    EngineLoad(String),

    /// A single engine step failed. `inputs` is the serialized row that was
    /// pushed into the engine and `state` the last observation returned to the
    /// caller before the failure.
    #[error("Engine evaluation failed at t={time}s: {source}")]
    EngineEvaluation {
        time: f64,
        inputs: String,
        state: Vec<f64>,
        #[source]
        source: anyhow::Error,
    },

    #[error("Engine not loaded")]
    EngineNotLoaded,

    #[error("Invalid action: expected {expected} values, got {actual}")]
    InvalidAction { expected: usize, actual: usize },

    #[error("Missing column in step record: {0}")]
    MissingColumn(String),

    /// Errors raised by caller-supplied pipeline stages, passed through as-is.
    #[error(transparent)]
    Stage(anyhow::Error),
}

pub type EnvResult<T> = std::result::Result<T, EnvError>;

impl EnvError {
    /// Short machine-readable kind, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            EnvError::Configuration(_) => "ConfigurationError",
            EnvError::EngineLoad(_) => "EngineLoadError",
            EnvError::EngineEvaluation { .. } => "EngineEvaluationError",
            EnvError::EngineNotLoaded => "EngineNotLoaded",
            EnvError::InvalidAction { .. } => "InvalidAction",
            EnvError::MissingColumn(_) => "MissingColumn",
            EnvError::Stage(_) => "StageError",
        }
    }
}

impl From<figment::Error> for EnvError {
    fn from(error: figment::Error) -> Self {
        EnvError::Configuration(error.to_string())
    }
}

impl From<validator::ValidationErrors> for EnvError {
    fn from(errors: validator::ValidationErrors) -> Self {
        EnvError::Configuration(errors.to_string())
    }
}
