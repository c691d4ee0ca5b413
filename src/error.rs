// src/error.rs
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::recording::UnitId;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error type shared by every stage of the pipeline.
///
/// Shard lookups that miss or find corrupt data are not errors: they come
/// back as [`crate::waveforms::ShardLoad`] and simply mean "extract again".
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("sorting has no units, nothing to extract")]
    EmptyUnitSet,

    #[error("waveform extraction failed for units {first} to {last}: {reason}")]
    ExtractionFailed {
        first: UnitId,
        last: UnitId,
        reason: String,
    },

    #[error("waveform extraction for units {first} to {last} failed {attempts} times, giving up")]
    ExhaustedRetries {
        first: UnitId,
        last: UnitId,
        attempts: u32,
    },

    #[error("merge into '{}' aborted: {reason}", target.display())]
    MergeAborted { target: PathBuf, reason: String },

    #[error("recording error: {0}")]
    Recording(String),

    #[error("recordings cannot be merged: {0}")]
    RecordingMismatch(String),

    #[error("spike sorting failed: {0}")]
    Sorter(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid data in '{}': {reason}", path.display())]
    InvalidData { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    pub(crate) fn invalid_data(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::InvalidData {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
