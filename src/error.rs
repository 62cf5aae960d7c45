//! Error kinds callers need to tell apart. Everything else travels as
//! `anyhow::Error`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no record found for '{0}'")]
    NotFound(String),
    #[error("invalid record key '{0}'")]
    InvalidKey(String),
    #[error("unsupported {kind} format version {found} (expected {expected})")]
    IncompatibleVersion {
        kind: &'static str,
        found: u32,
        expected: u32,
    },
    #[error("malformed record {}: {source}", path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt record {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("observation lists differ in length (left {left}, right {right})")]
    MismatchedObservations { left: usize, right: usize },
    #[error("not enough valid synchronized pairs (got {found}, need >= {required})")]
    InsufficientPairs { found: usize, required: usize },
    #[error("degenerate calibration input: {0}")]
    Degenerate(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecorderError {
    #[error("a recording session is already active")]
    AlreadyRecording,
}
