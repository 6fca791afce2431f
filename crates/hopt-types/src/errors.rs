use thiserror::Error;

/// Main error type for hopt
#[derive(Error, Debug)]
pub enum HoptError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Invalid declarations and scheduler setup
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("`{name}`: log-scale range requires 0 < low <= high, got [{low}, {high}]")]
    NonPositiveLogBound { name: String, low: f64, high: f64 },

    #[error("`{name}`: range low {low} is greater than high {high}")]
    InvertedRange { name: String, low: f64, high: f64 },

    #[error("`{name}`: range bounds must be finite")]
    NonFiniteBound { name: String },

    #[error("`{name}`: log base must be positive and not 1, got {base}")]
    InvalidLogBase { name: String, base: f64 },

    #[error("`{name}`: sample count must be at least 1")]
    ZeroSampleCount { name: String },

    #[error("`{name}`: tunable option list is empty")]
    EmptyCandidates { name: String },

    #[error("Unknown search strategy: {0}")]
    UnknownStrategy(String),

    #[error("Resource pool needs at least one token")]
    EmptyTokenPool,

    #[error("Duplicate resource token: {token}")]
    DuplicateToken { token: String },

    #[error("Worker count must be at least 1")]
    ZeroWorkers,

    #[error("Config overlay {path} is not a JSON object")]
    OverlayNotObject { path: String },
}

/// Failures raised while executing trials
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Trial {trial} failed: {message}")]
    CallbackFailed { trial: usize, message: String },

    #[error("Trial {trial} panicked: {message}")]
    Panicked { trial: usize, message: String },

    #[error("Worker pool could not be built: {message}")]
    PoolBuild { message: String },

    #[error("Could not spawn child for trial {trial}: {message}")]
    Spawn { trial: usize, message: String },

    #[error("Child process I/O failed for trial {trial}: {message}")]
    ChildIo { trial: usize, message: String },

    #[error("Worker process died while running trial {trial}: {status}")]
    Crashed { trial: usize, status: String },
}

impl WorkerError {
    /// Trial number the failure belongs to, if any.
    pub fn trial(&self) -> Option<usize> {
        match self {
            Self::CallbackFailed { trial, .. }
            | Self::Panicked { trial, .. }
            | Self::Spawn { trial, .. }
            | Self::ChildIo { trial, .. }
            | Self::Crashed { trial, .. } => Some(*trial),
            Self::PoolBuild { .. } => None,
        }
    }
}

/// Result type alias for hopt operations
pub type HoptResult<T> = Result<T, HoptError>;
