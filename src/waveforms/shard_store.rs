// src/waveforms/shard_store.rs
//
// Temporary shards live under `<target>_unit_by_unit_temp/`:
//   units_<first>_to_<last>/   a range of two or more units
//   unit_<id>/                 a single unit
// Each holds params.json, waveforms/ and, once verified, extraction_info.json.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::manifest::{validate_shard, ExtractionManifest, MANIFEST_FILE};
use super::storage::Storage;
use super::{ShardSummary, WaveformParams};
use crate::error::{PipelineError, Result};
use crate::recording::UnitId;

pub const TEMP_SUFFIX: &str = "_unit_by_unit_temp";

pub fn temp_root(target: &Path) -> PathBuf {
    let mut root = target.as_os_str().to_os_string();
    root.push(TEMP_SUFFIX);
    PathBuf::from(root)
}

/// A verified shard: its manifest claims success and its parameters load.
#[derive(Debug, Clone, PartialEq)]
pub struct Shard {
    pub folder: PathBuf,
    pub units: Vec<UnitId>,
    pub params: WaveformParams,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShardLoad {
    Loaded(Shard),
    NotFound,
    /// Present but untrustworthy. Handled exactly like `NotFound`.
    Corrupt(String),
}

impl ShardLoad {
    pub fn into_shard(self) -> Option<Shard> {
        match self {
            ShardLoad::Loaded(shard) => Some(shard),
            _ => None,
        }
    }
}

pub struct UnitRangeStore {
    storage: Arc<dyn Storage>,
    root: PathBuf,
}

impl UnitRangeStore {
    pub fn new(storage: Arc<dyn Storage>, target: &Path) -> Self {
        Self {
            storage,
            root: temp_root(target),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn locate_wide(&self, first: UnitId, last: UnitId) -> PathBuf {
        self.root.join(format!("units_{}_to_{}", first, last))
    }

    pub fn locate_single(&self, unit: UnitId) -> PathBuf {
        self.root.join(format!("unit_{}", unit))
    }

    /// Folder a fresh extraction of `range` is written to.
    pub fn locate(&self, range: &[UnitId]) -> PathBuf {
        match range {
            [unit] => self.locate_single(*unit),
            [first, .., last] => self.locate_wide(*first, *last),
            [] => self.root.clone(),
        }
    }

    pub fn load(&self, folder: &Path) -> ShardLoad {
        if !self.storage.exists(folder) {
            return ShardLoad::NotFound;
        }
        let manifest_path = folder.join(MANIFEST_FILE);
        if !self.storage.exists(&manifest_path) {
            return ShardLoad::NotFound;
        }

        let manifest = match self
            .storage
            .read(&manifest_path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| ExtractionManifest::from_bytes(&bytes).map_err(|e| e.to_string()))
        {
            Ok(manifest) => manifest,
            Err(e) => return ShardLoad::Corrupt(format!("unreadable manifest: {}", e)),
        };

        let params = match WaveformParams::read(self.storage.as_ref(), folder) {
            Ok(params) => params,
            Err(e) => return ShardLoad::Corrupt(format!("unreadable params: {}", e)),
        };

        if let Err(defect) = validate_shard(&manifest, params.num_segments) {
            return ShardLoad::Corrupt(defect.to_string());
        }

        ShardLoad::Loaded(Shard {
            folder: folder.to_path_buf(),
            units: manifest.units,
            params,
        })
    }

    /// Verifies a freshly extracted shard, then writes its manifest.
    ///
    /// The manifest is the last file written, so a crash at any earlier
    /// point leaves a folder that `load` reports as `NotFound`.
    pub fn write(&self, range: &[UnitId], summary: &ShardSummary) -> Result<Shard> {
        let (first, last) = bounds(range);
        let failed = |reason: String| PipelineError::ExtractionFailed { first, last, reason };

        if summary.num_segments == 0 {
            return Err(failed("extraction produced zero segments".into()));
        }
        if summary.units != range {
            return Err(failed(format!(
                "extractor returned units {:?}, expected {:?}",
                summary.units, range
            )));
        }
        let expected = self.locate(range);
        if summary.folder != expected {
            return Err(failed(format!(
                "extractor wrote to {}, expected {}",
                summary.folder.display(),
                expected.display()
            )));
        }
        let params = WaveformParams::read(self.storage.as_ref(), &summary.folder)
            .map_err(|e| failed(format!("shard parameters missing: {}", e)))?;
        if params.num_segments == 0 {
            return Err(failed("shard parameters list zero segments".into()));
        }

        let manifest = ExtractionManifest::succeeded(range, &summary.folder);
        self.storage
            .write(&summary.folder.join(MANIFEST_FILE), &manifest.to_bytes()?)?;
        debug!("Manifest written for units {} to {}", first, last);

        Ok(Shard {
            folder: summary.folder.clone(),
            units: range.to_vec(),
            params,
        })
    }

    /// Manifest first, then data: `load` never sees data claimed by a stale manifest.
    pub fn delete(&self, folder: &Path) -> Result<()> {
        self.storage.delete(&folder.join(MANIFEST_FILE))?;
        self.storage.delete(folder)?;
        Ok(())
    }

    /// Removes every shard and the temporary root itself.
    pub fn clear(&self) -> Result<()> {
        for folder in self.storage.list(&self.root)? {
            if let Err(e) = self.delete(&folder) {
                warn!("Could not delete shard {}: {}", folder.display(), e);
                return Err(e);
            }
        }
        self.storage.delete(&self.root)?;
        Ok(())
    }
}

pub(crate) fn bounds(range: &[UnitId]) -> (UnitId, UnitId) {
    match (range.first(), range.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => (0, 0),
    }
}
