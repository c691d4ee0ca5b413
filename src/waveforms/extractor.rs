// src/waveforms/extractor.rs
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use super::array::WaveformArray;
use super::storage::Storage;
use super::{sampled_index_file, waveforms_file, SpikeIndex, WaveformParams};
use crate::config::ExtractionConfig;
use crate::error::{PipelineError, Result};
use crate::recording::{Recording, SharedRecording, SharedSorting, Sorting, UnitId};

/// What an extraction call left on storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardSummary {
    pub folder: PathBuf,
    pub units: Vec<UnitId>,
    pub num_segments: usize,
}

/// Cuts waveforms for every unit of `sorting` into a shard folder at `target`.
///
/// Implementations may parallelise internally but must either return a
/// complete shard or an error.
pub trait WaveformExtractor: Send + Sync {
    fn extract(
        &self,
        recording: &SharedRecording,
        sorting: &SharedSorting,
        target: &Path,
        config: &ExtractionConfig,
    ) -> Result<ShardSummary>;
}

// -----------------------------------------------------------------------------
// SNIPPET EXTRACTOR
// -----------------------------------------------------------------------------

pub struct SnippetExtractor {
    storage: Arc<dyn Storage>,
}

impl SnippetExtractor {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

impl WaveformExtractor for SnippetExtractor {
    fn extract(
        &self,
        recording: &SharedRecording,
        sorting: &SharedSorting,
        target: &Path,
        config: &ExtractionConfig,
    ) -> Result<ShardSummary> {
        self.storage.delete(target)?;

        let fs = recording.sampling_frequency();
        let params = WaveformParams {
            sampling_frequency: fs,
            ms_before: config.ms_before,
            ms_after: config.ms_after,
            nbefore: config.nbefore(fs),
            nafter: config.nafter(fs),
            sparse: config.sparse,
            sparsity_radius_um: config.sparsity_radius_um,
            num_segments: recording.num_segments(),
            channel_ids: recording.channel_ids(),
            dtype: "float32".to_string(),
        };
        let units = sorting.unit_ids();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.n_jobs.max(1))
            .build()
            .map_err(|e| PipelineError::Config(format!("could not start extraction workers: {}", e)))?;

        let cut = pool.install(|| {
            units
                .par_iter()
                .map(|&unit| {
                    let (array, index) =
                        cut_unit(recording.as_ref(), sorting.as_ref(), unit, &params, config)?;
                    Ok((unit, array, index))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        for (unit, array, index) in cut {
            debug!("Unit {}: {} waveforms", unit, array.num_spikes);
            self.storage
                .write(&waveforms_file(target, unit), &array.to_bytes())?;
            self.storage
                .write(&sampled_index_file(target, unit), &serde_json::to_vec(&index)?)?;
        }
        params.write(self.storage.as_ref(), target)?;

        Ok(ShardSummary {
            folder: target.to_path_buf(),
            units,
            num_segments: params.num_segments,
        })
    }
}

fn cut_unit(
    recording: &dyn Recording,
    sorting: &dyn Sorting,
    unit: UnitId,
    params: &WaveformParams,
    config: &ExtractionConfig,
) -> Result<(WaveformArray, Vec<SpikeIndex>)> {
    let (nbefore, nafter) = (params.nbefore, params.nafter);

    let mut spikes: Vec<SpikeIndex> = Vec::new();
    for segment in 0..recording.num_segments() {
        let num_samples = recording.num_samples(segment);
        spikes.extend(
            sorting
                .spike_train(unit, segment)
                .into_iter()
                .filter(|&frame| frame >= nbefore && frame + nafter <= num_samples)
                .map(|frame| SpikeIndex { segment, frame }),
        );
    }
    let spikes = subsample_evenly(spikes, config.max_spikes_per_unit);

    let num_channels = recording.num_channels();
    let mut data = Vec::with_capacity(spikes.len() * params.num_samples() * num_channels);
    for spike in &spikes {
        data.extend(recording.traces(spike.segment, spike.frame - nbefore, spike.frame + nafter)?);
    }

    let channel_indices = (0..num_channels as u32).collect();
    let dense = WaveformArray::new(spikes.len(), params.num_samples(), channel_indices, data)
        .ok_or_else(|| PipelineError::Recording(format!("trace windows for unit {} have the wrong size", unit)))?;

    if !config.sparse || dense.num_spikes == 0 {
        return Ok((dense, spikes));
    }
    let neighbours = sparse_channels(&dense, &recording.channel_locations(), config.sparsity_radius_um);
    Ok((dense.select_channels(&neighbours), spikes))
}

fn subsample_evenly<T>(items: Vec<T>, max: usize) -> Vec<T> {
    let n = items.len();
    if max == 0 || n <= max {
        return items;
    }
    let keep: Vec<usize> = (0..max).map(|i| i * n / max).collect();
    items
        .into_iter()
        .enumerate()
        .filter(|(i, _)| keep.binary_search(i).is_ok())
        .map(|(_, item)| item)
        .collect()
}

/// Positions of channels within `radius_um` of the channel carrying the
/// deepest trough of the unit's average waveform.
fn sparse_channels(dense: &WaveformArray, locations: &[[f64; 2]], radius_um: f64) -> Vec<usize> {
    let template = dense.average();
    let num_channels = template.num_channels();
    let mut trough = vec![f32::INFINITY; num_channels];
    for row in template.data.chunks_exact(num_channels.max(1)) {
        for (lowest, v) in trough.iter_mut().zip(row) {
            *lowest = lowest.min(*v);
        }
    }
    let extremum = trough
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(c, _)| c)
        .unwrap_or(0);

    let centre = locations[extremum];
    (0..num_channels)
        .filter(|&c| {
            let dx = locations[c][0] - centre[0];
            let dy = locations[c][1] - centre[1];
            (dx * dx + dy * dy).sqrt() <= radius_um
        })
        .collect()
}
