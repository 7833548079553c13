use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtomGraphError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Extraction failed for {file}: {message}")]
    Extraction { file: String, message: String },

    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Deep analysis error: {0}")]
    DeepAnalysis(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, AtomGraphError>;
