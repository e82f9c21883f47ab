use std::path::PathBuf;

/// Errors raised while loading or applying configuration.
///
/// These are only ever produced at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration text is not valid JSON or does not fit the expected shape.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A required key is absent.
    #[error("missing required config key {0:?}")]
    MissingKey(String),

    /// A key is present but its value is unusable.
    #[error("invalid value for {key:?}: {reason}")]
    InvalidValue { key: String, reason: String },

    /// Any other configuration problem.
    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid_value(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur building or running the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// No factory is registered under this stage name.
    #[error("unknown stage {0:?}")]
    UnknownStage(String),

    /// A factory with this name is already registered.
    #[error("stage {0:?} registered twice")]
    DuplicateStage(String),

    /// A stage rejected its configuration.
    #[error("stage {stage:?} rejected its configuration: {source}")]
    Configure {
        stage: String,
        #[source]
        source: ConfigError,
    },

    /// The pipeline would contain no stages.
    #[error("pipeline has no stages")]
    Empty,

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] mongoproxy_transport::TransportError),

    /// Wire-level error on a connection.
    #[error("wire error: {0}")]
    Wire(#[from] mongoproxy_wire::WireError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
