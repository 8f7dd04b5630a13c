use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed faces record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("person not found: {0}")]
    PersonNotFound(String),
    #[error("sample {sample_id} not found for person {person_id}")]
    SampleNotFound { person_id: String, sample_id: String },
    #[error("person already exists: {0}")]
    DuplicateId(String),
    #[error("sample image does not exist: {0}")]
    MissingImage(PathBuf),
    #[error("classification threshold must be in (0, 1], got {0}")]
    InvalidThreshold(f32),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("projection failed: {0}")]
    Projection(#[from] facegallery_core::pca::PcaError),
    #[error("store lock poisoned")]
    Poisoned,
}
