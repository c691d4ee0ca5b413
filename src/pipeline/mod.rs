// src/pipeline/mod.rs
//
// One block = one recording of one well, taken from raw file to the
// electrodes of its well-isolated units.

pub mod parallel;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::curation::templates::{extremum_channels, remove_similar_templates};
use crate::curation::{remove_violated_units, QualityMetricsSource};
use crate::discovery::maxwell::{get_data_maxwell, MaxwellReader};
use crate::error::Result;
use crate::preprocessing::preprocess_recording;
use crate::recording::stats::{channel_locations_mapping, electrode_index, get_channel_recording_stats};
use crate::recording::{frame_slice, Recording, UnitId};
use crate::sorting::curate::{remove_empty_units, remove_excess_spikes};
use crate::sorting::SpikeSorter;
use crate::utils::log::LogContext;
use crate::waveforms::generate_waveform_store_unit_by_unit;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BlockResult {
    pub rec_name: String,
    pub stream_id: Option<String>,
    /// Units that passed curation, ascending.
    pub units: Vec<UnitId>,
    /// Electrode under the extremum channel of each kept unit, in unit order.
    pub electrodes: Vec<usize>,
}

/// Everything a block needs besides the recording it works on.
pub struct BlockPipeline<'a> {
    reader: &'a dyn MaxwellReader,
    sorter: &'a dyn SpikeSorter,
    metrics: &'a dyn QualityMetricsSource,
    config: &'a Config,
    log: &'a LogContext,
}

impl<'a> BlockPipeline<'a> {
    pub fn new(
        reader: &'a dyn MaxwellReader,
        sorter: &'a dyn SpikeSorter,
        metrics: &'a dyn QualityMetricsSource,
        config: &'a Config,
        log: &'a LogContext,
    ) -> Self {
        Self {
            reader,
            sorter,
            metrics,
            config,
            log,
        }
    }

    /// Sorts, extracts and curates one recording. The sorting folder is
    /// emptied beforehand and, with `clear_temp_files`, afterwards whether or
    /// not the block succeeded.
    pub fn process_block(&self, path: &Path, rec_num: usize, well: Option<usize>) -> Result<BlockResult> {
        let sorting_folder = &self.config.pipeline.sorting_folder;
        empty_directory(sorting_folder)?;

        let result = self.run_block(path, rec_num, well);
        if let Err(e) = &result {
            let _span = self.log.enter();
            error!("{}", e);
            error!("Error processing rec{:04}. Continuing to the next block", rec_num);
        }
        if !self.config.pipeline.clear_temp_files {
            return result;
        }
        after_cleanup(result, empty_directory(sorting_folder), sorting_folder, self.log)
    }

    fn run_block(&self, path: &Path, rec_num: usize, well: Option<usize>) -> Result<BlockResult> {
        let read = get_data_maxwell(self.reader, path, rec_num, well, self.log)?;
        let log = self.log.child(&read.rec_name);
        {
            let _span = log.enter();
            info!("Processing recording: {}", read.rec_name);
        }

        let stats = get_channel_recording_stats(read.recording.as_ref(), &log);
        let time_in_s = self
            .config
            .pipeline
            .time_in_s
            .map_or(stats.total_duration, |t| t.min(stats.total_duration));
        let end = ((time_in_s * stats.sampling_frequency) as usize).min(read.recording.num_samples(0));
        let chunk = frame_slice(&read.recording, 0, end)?;
        let chunk = preprocess_recording(chunk, &self.config.preprocessing, &log)?;

        let block_dir = self
            .config
            .pipeline
            .sorting_folder
            .join(format!("block_{}", read.rec_name));
        fs::create_dir_all(&block_dir)?;

        let start = Instant::now();
        let sorter_output = block_dir.join(format!("sorter_{}", read.rec_name));
        let sorting = self.sorter.run(&chunk, &sorter_output, &log)?;
        let sorting = remove_empty_units(&sorting, &log);
        let sorting = remove_excess_spikes(&sorting, chunk.as_ref(), &log);
        let waveform_folder = block_dir.join(format!("waveforms_{}", read.rec_name));
        let store = generate_waveform_store_unit_by_unit(
            chunk.clone(),
            sorting,
            &waveform_folder,
            &self.config.extraction,
            &log,
        )?;
        {
            let _span = log.enter();
            debug!("Sort and extract waveforms took {:?}", start.elapsed());
        }

        let start = Instant::now();
        let curation = &self.config.curation;
        let metrics = self.metrics.compute(&store, &log)?;
        let passing = remove_violated_units(&metrics, &curation.thresholds, &log);
        let redundant = remove_similar_templates(&store, &metrics, curation.similarity_threshold, &log)?;
        let units: Vec<UnitId> = passing.into_iter().filter(|u| !redundant.contains(u)).collect();

        let mut extremum = extremum_channels(&store, curation.peak_sign)?;
        extremum.retain(|unit, _| units.contains(unit));
        store.select_units(&units, &block_dir.join(format!("waveforms_good_{}", read.rec_name)))?;

        let locations = channel_locations_mapping(chunk.as_ref());
        let pitch = self.config.pipeline.electrode_pitch_um;
        let columns = self.config.pipeline.electrode_columns;
        let electrodes = extremum
            .values()
            .filter_map(|channel| locations.get(channel))
            .map(|&location| electrode_index(location, pitch, columns))
            .collect();

        let _span = log.enter();
        info!("Redundant units: {:?}", redundant);
        info!("Removing redundant units took {:?}", start.elapsed());
        Ok(BlockResult {
            rec_name: read.rec_name,
            stream_id: read.stream_id,
            units,
            electrodes,
        })
    }

    /// Every recording `0..num_recordings` in turn. A failed block is logged
    /// and kept in the results; the batch carries on.
    pub fn routine_sequential(
        &self,
        path: &Path,
        num_recordings: usize,
        well: Option<usize>,
    ) -> Vec<Result<BlockResult>> {
        (0..num_recordings)
            .map(|rec_num| self.process_block(path, rec_num, well))
            .collect()
    }
}

/// A failed cleanup is logged; the block's own outcome is what the caller sees.
fn after_cleanup<T>(result: Result<T>, cleanup: Result<()>, folder: &Path, log: &LogContext) -> Result<T> {
    if let Err(e) = cleanup {
        let _span = log.enter();
        warn!("Could not clear {}: {}", folder.display(), e);
    }
    result
}

/// Removes everything inside `dir`, keeping `dir` itself. Missing is fine.
pub fn empty_directory(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path: PathBuf = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
