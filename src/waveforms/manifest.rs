// src/waveforms/manifest.rs
//
// extraction_info.json: the sole proof that a shard finished extracting.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::recording::UnitId;

pub const MANIFEST_FILE: &str = "extraction_info.json";

const STATUS_SUCCEEDED: &str = "extraction successful";
const STATUS_FAILED: &str = "extraction failed";
const STATUS_UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ManifestStatus {
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl From<String> for ManifestStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            STATUS_SUCCEEDED => ManifestStatus::Succeeded,
            STATUS_FAILED => ManifestStatus::Failed,
            _ => ManifestStatus::Unknown,
        }
    }
}

impl From<ManifestStatus> for String {
    fn from(status: ManifestStatus) -> Self {
        status.as_str().to_string()
    }
}

impl ManifestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestStatus::Succeeded => STATUS_SUCCEEDED,
            ManifestStatus::Failed => STATUS_FAILED,
            ManifestStatus::Unknown => STATUS_UNKNOWN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionManifest {
    pub units: Vec<UnitId>,
    pub folder: String,
    #[serde(default)]
    pub status: ManifestStatus,
}

impl ExtractionManifest {
    pub fn succeeded(units: &[UnitId], folder: &Path) -> Self {
        Self {
            units: units.to_vec(),
            folder: folder.display().to_string(),
            status: ManifestStatus::Succeeded,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Why a shard on disk cannot be trusted.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardDefect {
    StatusNotSuccessful(ManifestStatus),
    NoUnits,
    NoSegments,
}

impl fmt::Display for ShardDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardDefect::StatusNotSuccessful(status) => {
                write!(f, "manifest status is '{}'", status.as_str())
            }
            ShardDefect::NoUnits => write!(f, "manifest lists no units"),
            ShardDefect::NoSegments => write!(f, "shard holds zero segments"),
        }
    }
}

/// The two checks a shard must pass before it is trusted: a successful
/// manifest and a non-zero segment count in its parameters.
pub fn validate_shard(manifest: &ExtractionManifest, num_segments: usize) -> Result<(), ShardDefect> {
    if manifest.status != ManifestStatus::Succeeded {
        return Err(ShardDefect::StatusNotSuccessful(manifest.status));
    }
    if manifest.units.is_empty() {
        return Err(ShardDefect::NoUnits);
    }
    if num_segments == 0 {
        return Err(ShardDefect::NoSegments);
    }
    Ok(())
}
