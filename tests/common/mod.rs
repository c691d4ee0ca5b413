#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mea_pipeline::config::ExtractionConfig;
use mea_pipeline::recording::synthetic::{generate, SyntheticConfig};
use mea_pipeline::recording::{SharedRecording, SharedSorting, Sorting, UnitId};
use mea_pipeline::waveforms::{ShardSummary, SnippetExtractor, Storage, WaveformExtractor};
use mea_pipeline::{PipelineError, Result};

pub fn synthetic(num_units: usize) -> (SharedRecording, SharedSorting) {
    let data = generate(&SyntheticConfig {
        num_units,
        num_channels: 4,
        duration_s: 0.3,
        firing_rate_hz: 20.0,
        seed: 3,
        ..SyntheticConfig::default()
    })
    .expect("synthetic recording");
    (Arc::new(data.recording), Arc::new(data.sorting))
}

pub fn config(units_per_extraction: usize, load_if_exists: bool) -> ExtractionConfig {
    ExtractionConfig {
        n_jobs: 2,
        units_per_extraction: Some(units_per_extraction),
        load_if_exists,
        max_spikes_per_unit: 20,
        ..ExtractionConfig::default()
    }
}

/// Snippet extraction that remembers every range it was asked for.
pub struct CountingExtractor {
    inner: SnippetExtractor,
    calls: AtomicUsize,
    ranges: Mutex<Vec<Vec<UnitId>>>,
}

impl CountingExtractor {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            inner: SnippetExtractor::new(storage),
            calls: AtomicUsize::new(0),
            ranges: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn ranges(&self) -> Vec<Vec<UnitId>> {
        self.ranges.lock().unwrap().clone()
    }
}

impl WaveformExtractor for CountingExtractor {
    fn extract(
        &self,
        recording: &SharedRecording,
        sorting: &SharedSorting,
        target: &Path,
        config: &ExtractionConfig,
    ) -> Result<ShardSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ranges.lock().unwrap().push(sorting.unit_ids());
        self.inner.extract(recording, sorting, target, config)
    }
}

/// Fails ranges that start at `first_unit`, `failures` times (forever when
/// `None`). With `only_wide` single-unit ranges always go through.
pub struct FlakyExtractor {
    inner: SnippetExtractor,
    first_unit: UnitId,
    failures: Mutex<Option<usize>>,
    only_wide: bool,
}

impl FlakyExtractor {
    pub fn new(storage: Arc<dyn Storage>, first_unit: UnitId, failures: Option<usize>) -> Self {
        Self {
            inner: SnippetExtractor::new(storage),
            first_unit,
            failures: Mutex::new(failures),
            only_wide: false,
        }
    }

    pub fn only_wide(mut self) -> Self {
        self.only_wide = true;
        self
    }
}

impl WaveformExtractor for FlakyExtractor {
    fn extract(
        &self,
        recording: &SharedRecording,
        sorting: &SharedSorting,
        target: &Path,
        config: &ExtractionConfig,
    ) -> Result<ShardSummary> {
        let units = sorting.unit_ids();
        let targeted = units.first() == Some(&self.first_unit) && !(self.only_wide && units.len() == 1);
        if targeted {
            let mut failures = self.failures.lock().unwrap();
            let fail = match failures.as_mut() {
                None => true,
                Some(0) => false,
                Some(n) => {
                    *n -= 1;
                    true
                }
            };
            if fail {
                // Leave half a shard behind, like a crash would.
                self.inner.extract(recording, sorting, target, config)?;
                return Err(PipelineError::Recording("worker died".into()));
            }
        }
        self.inner.extract(recording, sorting, target, config)
    }
}
