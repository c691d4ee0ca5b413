// src/waveforms/mod.rs
//
// Unit-by-unit waveform extraction. The planner walks the sorted unit list,
// the resumable extractor resolves each range by loading a cached shard or
// extracting a fresh one, and the merger folds every shard into one store.

pub mod array;
pub mod extractor;
pub mod manifest;
pub mod merge;
pub mod planner;
pub mod resume;
pub mod shard_store;
pub mod storage;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ExtractionConfig;
use crate::error::{PipelineError, Result};
use crate::recording::{SharedRecording, SharedSorting, UnitId};
use crate::utils::log::LogContext;

pub use array::WaveformArray;
pub use extractor::{ShardSummary, SnippetExtractor, WaveformExtractor};
pub use manifest::{ExtractionManifest, ManifestStatus, MANIFEST_FILE};
pub use merge::ShardMerger;
pub use planner::ExtractionPlanner;
pub use resume::{ExtractionReport, RangeState, ResumableExtractor, Transition};
pub use shard_store::{temp_root, Shard, ShardLoad, UnitRangeStore};
pub use storage::{FsStorage, MemoryStorage, Storage};
pub use store::{StoreInfo, WaveformStore};

pub const PARAMS_FILE: &str = "params.json";
pub const WAVEFORMS_DIR: &str = "waveforms";

pub fn waveforms_file(folder: &Path, unit: UnitId) -> PathBuf {
    folder
        .join(WAVEFORMS_DIR)
        .join(format!("waveforms_{}.bin", unit))
}

pub fn sampled_index_file(folder: &Path, unit: UnitId) -> PathBuf {
    folder
        .join(WAVEFORMS_DIR)
        .join(format!("sampled_index_{}.json", unit))
}

/// Where in the recording a stored waveform was cut from.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SpikeIndex {
    pub segment: usize,
    pub frame: usize,
}

/// Parameters shared by every unit of a shard or store (`params.json`).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WaveformParams {
    pub sampling_frequency: f64,
    pub ms_before: f64,
    pub ms_after: f64,
    pub nbefore: usize,
    pub nafter: usize,
    pub sparse: bool,
    pub sparsity_radius_um: f64,
    pub num_segments: usize,
    pub channel_ids: Vec<String>,
    pub dtype: String,
}

impl WaveformParams {
    pub fn num_samples(&self) -> usize {
        self.nbefore + self.nafter
    }

    pub fn read(storage: &dyn Storage, folder: &Path) -> Result<Self> {
        let path = folder.join(PARAMS_FILE);
        let bytes = storage.read(&path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::invalid_data(path, e.to_string()))
    }

    pub fn write(&self, storage: &dyn Storage, folder: &Path) -> Result<()> {
        storage.write(&folder.join(PARAMS_FILE), &serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ENTRY POINTS
// -----------------------------------------------------------------------------

#[derive(Debug)]
pub struct ExtractionOutcome {
    pub store: WaveformStore,
    /// `None` when an existing store was reused without extracting anything.
    pub report: Option<ExtractionReport>,
}

/// Builder for one unit-by-unit extraction of a (recording, sorting) pair.
pub struct UnitByUnitExtraction {
    recording: SharedRecording,
    sorting: SharedSorting,
    target: PathBuf,
    storage: Arc<dyn Storage>,
    extractor: Option<Arc<dyn WaveformExtractor>>,
    config: ExtractionConfig,
    reuse_existing: bool,
    log: LogContext,
}

impl UnitByUnitExtraction {
    pub fn new(recording: SharedRecording, sorting: SharedSorting, target: impl Into<PathBuf>) -> Self {
        Self {
            recording,
            sorting,
            target: target.into(),
            storage: Arc::new(FsStorage::new()),
            extractor: None,
            config: ExtractionConfig::default(),
            reuse_existing: true,
            log: LogContext::disabled(),
        }
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    /// Defaults to a [`SnippetExtractor`] writing through the same storage.
    pub fn extractor(mut self, extractor: Arc<dyn WaveformExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn config(mut self, config: ExtractionConfig) -> Self {
        self.config = config;
        self
    }

    /// When off, a finished store already at the target is overwritten.
    pub fn reuse_existing_store(mut self, reuse: bool) -> Self {
        self.reuse_existing = reuse;
        self
    }

    pub fn log(mut self, log: LogContext) -> Self {
        self.log = log;
        self
    }

    pub fn run(self) -> Result<ExtractionOutcome> {
        let log = self.log.child("waveforms");

        let range_store = UnitRangeStore::new(Arc::clone(&self.storage), &self.target);
        if self.reuse_existing {
            if let Some(store) = self.existing_store(&range_store, &log) {
                return Ok(ExtractionOutcome { store, report: None });
            }
        }

        let mut planner =
            ExtractionPlanner::new(self.sorting.unit_ids(), self.config.range_width())?;
        {
            let _span = log.enter();
            info!(
                "Extracting waveforms for {} units, up to {} at a time",
                planner.unit_ids().len(),
                planner.width()
            );
        }

        let extractor: Arc<dyn WaveformExtractor> = match &self.extractor {
            Some(extractor) => Arc::clone(extractor),
            None => Arc::new(SnippetExtractor::new(Arc::clone(&self.storage))),
        };

        let report = ResumableExtractor::new(
            &range_store,
            extractor.as_ref(),
            &self.recording,
            &self.sorting,
            &self.config,
            &log,
        )
        .run(&mut planner)?;

        let store =
            ShardMerger::new(&range_store, &log).merge(&report.shards, &self.target, &self.config)?;

        Ok(ExtractionOutcome {
            store,
            report: Some(report),
        })
    }

    fn existing_store(&self, range_store: &UnitRangeStore, log: &LogContext) -> Option<WaveformStore> {
        let _span = log.enter();
        match WaveformStore::load(Arc::clone(&self.storage), &self.target) {
            Ok(store) if store.unit_ids().len() == self.sorting.unit_ids().len() => {
                info!("Waveform store loaded from {}", self.target.display());
                // Left over when a run stopped between saving the store and cleaning up.
                if self.storage.exists(range_store.root()) {
                    info!("Deleting leftover shards under {}", range_store.root().display());
                    if let Err(e) = range_store.clear() {
                        warn!("Could not delete {}: {}", range_store.root().display(), e);
                    }
                }
                Some(store)
            }
            Ok(store) => {
                info!(
                    "Waveform store at {} holds {} units, sorting has {}; extracting again",
                    self.target.display(),
                    store.unit_ids().len(),
                    self.sorting.unit_ids().len()
                );
                None
            }
            Err(_) => {
                info!("Waveform store not found at {}", self.target.display());
                None
            }
        }
    }
}

/// Resumable chunked extraction on the local filesystem.
pub fn generate_waveform_store_unit_by_unit(
    recording: SharedRecording,
    sorting: SharedSorting,
    target: &Path,
    config: &ExtractionConfig,
    log: &LogContext,
) -> Result<WaveformStore> {
    let outcome = UnitByUnitExtraction::new(recording, sorting, target)
        .config(config.clone())
        .log(log.clone())
        .run()?;
    Ok(outcome.store)
}

/// One-shot extraction: a single range covering every unit, never resumed.
pub fn extract_waveforms(
    recording: SharedRecording,
    sorting: SharedSorting,
    target: &Path,
    config: &ExtractionConfig,
    log: &LogContext,
) -> Result<WaveformStore> {
    let config = ExtractionConfig {
        units_per_extraction: Some(sorting.unit_ids().len().max(1)),
        load_if_exists: false,
        ..config.clone()
    };
    let outcome = UnitByUnitExtraction::new(recording, sorting, target)
        .config(config)
        .reuse_existing_store(false)
        .log(log.clone())
        .run()?;
    Ok(outcome.store)
}
