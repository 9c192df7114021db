use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Import not found: {0}")]
    ImportNotFound(String),

    #[error("Import already running: {0}")]
    AlreadyRunning(String),

    #[error("Invalid subject id: {0:?}")]
    InvalidSubject(String),

    #[error("Stage sequence cycle detected at {0}")]
    SequenceCycle(String),

    #[error("Task queue closed")]
    QueueClosed,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }
}

/// Error category used by the failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Infrastructure hiccup (timeout, rate limit, connection). Importers retry
    /// these themselves; by the time one reaches the pipeline it is recorded only.
    Transient,
    /// Phase-level problem; recorded and the stage proceeds with partial results
    Recoverable,
    /// Authorization loss or corrupt source data; aborts the whole run
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Recoverable => "recoverable",
            ErrorCategory::Fatal => "fatal",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "recoverable" => Ok(ErrorCategory::Recoverable),
            "fatal" => Ok(ErrorCategory::Fatal),
            _ => Err(PipelineError::parse(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed error raised by a phase importer or one of its fan-out jobs
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Rate limited (resets in {reset_in_secs}s)")]
    RateLimited { reset_in_secs: u64 },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid source data: {0}")]
    InvalidData(String),

    #[error("Importer panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ImportError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ImportError::RateLimited { .. } | ImportError::Timeout(_) | ImportError::Network(_) => {
                ErrorCategory::Transient
            }
            ImportError::Unauthorized(_) | ImportError::InvalidData(_) => ErrorCategory::Fatal,
            ImportError::NotFound(_) | ImportError::Panicked(_) | ImportError::Other(_) => {
                ErrorCategory::Recoverable
            }
        }
    }

    /// Short machine-readable name, used as a metrics attribute
    pub fn kind(&self) -> &'static str {
        match self {
            ImportError::RateLimited { .. } => "rate_limited",
            ImportError::Timeout(_) => "timeout",
            ImportError::Network(_) => "network",
            ImportError::NotFound(_) => "not_found",
            ImportError::Unauthorized(_) => "unauthorized",
            ImportError::InvalidData(_) => "invalid_data",
            ImportError::Panicked(_) => "panicked",
            ImportError::Other(_) => "other",
        }
    }
}

// Lets importers use `?` on pipeline helpers such as `FanOut::spawn`.
impl From<PipelineError> for ImportError {
    fn from(e: PipelineError) -> Self {
        ImportError::Other(anyhow::Error::new(e))
    }
}
