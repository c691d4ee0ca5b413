// src/sorting/mod.rs
//
// The spike sorter runs outside this process. Recordings go out as binary
// folders, spike times come back as a `unit_id,segment,frame` table.

pub mod curate;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::{SorterConfig, SorterParams};
use crate::error::{PipelineError, Result};
use crate::recording::binary::write_binary_recording;
use crate::recording::{InMemorySorting, SharedRecording, SharedSorting, Sorting, UnitId};
use crate::utils::log::LogContext;

pub const SPIKES_FILE: &str = "spikes.csv";
pub const SORTER_PARAMS_FILE: &str = "sorter_params.json";
pub const SORTER_INPUT_DIR: &str = "recording";
pub const SORTER_OUTPUT_DIR: &str = "sorter_output";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SpikeRecord {
    pub unit_id: UnitId,
    pub segment: usize,
    pub frame: usize,
}

pub fn read_spike_table<P: AsRef<Path>>(path: P, fs: f64, num_segments: usize) -> Result<InMemorySorting> {
    let mut reader = csv::Reader::from_path(path.as_ref())?;
    let mut trains: BTreeMap<UnitId, Vec<Vec<usize>>> = BTreeMap::new();
    for record in reader.deserialize() {
        let spike: SpikeRecord = record?;
        if spike.segment >= num_segments {
            return Err(PipelineError::invalid_data(
                path.as_ref(),
                format!(
                    "spike of unit {} in segment {}, recording has {}",
                    spike.unit_id, spike.segment, num_segments
                ),
            ));
        }
        let segments = trains
            .entry(spike.unit_id)
            .or_insert_with(|| vec![Vec::new(); num_segments]);
        segments[spike.segment].push(spike.frame);
    }
    Ok(InMemorySorting::with_segments(fs, num_segments, trains))
}

pub fn write_spike_table<P: AsRef<Path>>(sorting: &dyn Sorting, path: P) -> Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    for unit_id in sorting.unit_ids() {
        for segment in 0..sorting.num_segments() {
            for frame in sorting.spike_train(unit_id, segment) {
                writer.serialize(SpikeRecord {
                    unit_id,
                    segment,
                    frame,
                })?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

pub trait SpikeSorter: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, recording: &SharedRecording, output_folder: &Path, log: &LogContext) -> Result<SharedSorting>;
}

/// Runs a containerised sorter image:
/// `<command> run --rm -v <output_folder>:/data <image> /data`.
pub struct ContainerSorter {
    command: String,
    image: String,
    params: SorterParams,
}

impl ContainerSorter {
    pub fn new(command: impl Into<String>, image: impl Into<String>, params: SorterParams) -> Self {
        Self {
            command: command.into(),
            image: image.into(),
            params,
        }
    }

    pub fn from_config(config: &SorterConfig) -> Self {
        Self::new(&config.command, &config.image, config.params.clone())
    }

    fn command_line(&self, output_folder: &Path) -> Command {
        let mut command = Command::new(&self.command);
        command
            .arg("run")
            .arg("--rm")
            .arg("-v")
            .arg(format!("{}:/data", output_folder.display()))
            .arg(&self.image)
            .arg("/data");
        command
    }
}

impl SpikeSorter for ContainerSorter {
    fn name(&self) -> &str {
        &self.image
    }

    fn run(&self, recording: &SharedRecording, output_folder: &Path, log: &LogContext) -> Result<SharedSorting> {
        let _span = log.enter();
        fs::create_dir_all(output_folder)?;
        let output_folder = output_folder.canonicalize()?;

        write_binary_recording(recording.as_ref(), output_folder.join(SORTER_INPUT_DIR))?;
        fs::write(
            output_folder.join(SORTER_PARAMS_FILE),
            serde_json::to_vec_pretty(&self.params)?,
        )?;

        info!("Running {} on {}", self.image, output_folder.display());
        let status = self
            .command_line(&output_folder)
            .status()
            .map_err(|e| PipelineError::Sorter(format!("could not start '{}': {}", self.command, e)))?;
        if !status.success() {
            error!("Sorter exited with {}", status);
            return Err(PipelineError::Sorter(format!("{} exited with {}", self.image, status)));
        }

        let spikes = output_folder.join(SORTER_OUTPUT_DIR).join(SPIKES_FILE);
        if !spikes.exists() {
            return Err(PipelineError::Sorter(format!(
                "sorter finished without writing {}",
                spikes.display()
            )));
        }
        let sorting = read_spike_table(&spikes, recording.sampling_frequency(), recording.num_segments())?;
        info!("Sorter found {} units", sorting.unit_ids().len());
        Ok(Arc::new(sorting))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::InMemoryRecording;
    use tempfile::TempDir;

    #[test]
    fn spike_table_keeps_segments_apart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out/spikes.csv");
        let mut trains = BTreeMap::new();
        trains.insert(3, vec![vec![10, 20], vec![5]]);
        trains.insert(8, vec![vec![], vec![7, 9]]);
        write_spike_table(&InMemorySorting::new(20000.0, trains), &path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("unit_id,segment,frame\n3,0,10\n"));

        let sorting = read_spike_table(&path, 20000.0, 2).unwrap();
        assert_eq!(sorting.unit_ids(), vec![3, 8]);
        assert_eq!(sorting.spike_train(8, 1), vec![7, 9]);
        assert!(sorting.spike_train(8, 0).is_empty());
        assert!(read_spike_table(&path, 20000.0, 1).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn failing_sorter_is_reported() {
        let dir = TempDir::new().unwrap();
        let recording: SharedRecording = Arc::new(
            InMemoryRecording::new(100.0, vec!["0".into()], vec![[0.0, 0.0]], vec![vec![0.0; 10]])
                .unwrap(),
        );
        let log = LogContext::disabled();

        let failing = ContainerSorter::new("false", "sorter:test", SorterParams::default());
        let err = failing.run(&recording, dir.path(), &log).unwrap_err();
        assert!(matches!(err, PipelineError::Sorter(_)));
        assert!(dir.path().join(SORTER_PARAMS_FILE).exists());

        let silent = ContainerSorter::new("true", "sorter:test", SorterParams::default());
        let err = silent.run(&recording, dir.path(), &log).unwrap_err();
        assert!(err.to_string().contains("without writing"));
    }
}
