use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the benchmark workers
#[derive(Error, Debug)]
pub enum NbError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Coarse classification used for exit codes and failure records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Data,
    NumericInstability,
    Persistence,
    Cancelled,
    Internal,
}

impl NbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Validation(_) => ErrorKind::Configuration,
            Self::Data(_) => ErrorKind::Data,
            Self::Training(e) => e.kind(),
            Self::Persistence(_) | Self::Io(_) => ErrorKind::Persistence,
            Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Errors raised by dataset collaborators.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Dataset not found: {name}")]
    DatasetNotFound { name: String },

    #[error("Data file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Malformed record in {} at line {line}: {message}", path.display())]
    ParseError {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Dataset {name} contains no samples")]
    Empty { name: String },

    #[error("Batch stream exhausted: {message}")]
    Exhausted { message: String },

    #[error("Data loading failed: {message}")]
    LoadingFailed { message: String },
}

/// Errors local to training a single architecture.
#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Loss diverged at epoch {epoch}, iteration {iteration}: {loss}")]
    NumericInstability {
        epoch: usize,
        iteration: usize,
        loss: f64,
    },

    #[error("Batch unavailable: {0}")]
    Data(#[from] DataError),

    #[error("Invalid model: {message}")]
    InvalidModel { message: String },

    #[error("Training cancelled")]
    Cancelled,
}

impl TrainingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NumericInstability { .. } => ErrorKind::NumericInstability,
            Self::Data(_) => ErrorKind::Data,
            Self::InvalidModel { .. } => ErrorKind::Internal,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Errors writing or reading the per-worker result log.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Cannot create result directory {}: {message}", path.display())]
    CreateDirFailed { path: PathBuf, message: String },

    #[error("Write to {} failed after {attempts} attempts: {message}", path.display())]
    WriteFailed {
        path: PathBuf,
        attempts: u32,
        message: String,
    },

    #[error("Cannot read {}: {message}", path.display())]
    ReadFailed { path: PathBuf, message: String },
}

/// Result type alias for benchmark operations
pub type NbResult<T> = Result<T, NbError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::NbError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::NbError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::NbError::Config(format!($($arg)*))
    };
}
