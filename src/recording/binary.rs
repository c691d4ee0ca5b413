// src/recording/binary.rs
//
// Raw binary recording folders:
//   recording.json        sampling frequency, channel ids/locations, segment count
//   traces_seg<N>.raw     little-endian f32, frame-major

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{InMemoryRecording, Recording};
use crate::error::{PipelineError, Result};

pub const RECORDING_INFO_FILE: &str = "recording.json";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BinaryRecordingInfo {
    pub sampling_frequency: f64,
    pub channel_ids: Vec<String>,
    pub channel_locations: Vec<[f64; 2]>,
    pub num_segments: usize,
    #[serde(default = "default_dtype")]
    pub dtype: String,
}

fn default_dtype() -> String {
    "float32".to_string()
}

pub fn segment_file_name(segment: usize) -> String {
    format!("traces_seg{}.raw", segment)
}

pub fn read_binary_recording<P: AsRef<Path>>(folder: P) -> Result<InMemoryRecording> {
    let folder = folder.as_ref();
    let info_path = folder.join(RECORDING_INFO_FILE);
    let info: BinaryRecordingInfo = serde_json::from_slice(&fs::read(&info_path)?)?;
    if info.dtype != "float32" {
        return Err(PipelineError::invalid_data(
            info_path,
            format!("unsupported dtype '{}'", info.dtype),
        ));
    }

    let mut segments = Vec::with_capacity(info.num_segments);
    for segment in 0..info.num_segments {
        let path = folder.join(segment_file_name(segment));
        let bytes = fs::read(&path)?;
        if bytes.len() % 4 != 0 {
            return Err(PipelineError::invalid_data(
                path,
                "trace file length is not a whole number of f32 samples",
            ));
        }
        let samples = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        segments.push(samples);
    }

    InMemoryRecording::new(
        info.sampling_frequency,
        info.channel_ids,
        info.channel_locations,
        segments,
    )
}

pub fn write_binary_recording<P: AsRef<Path>>(recording: &dyn Recording, folder: P) -> Result<()> {
    let folder = folder.as_ref();
    fs::create_dir_all(folder)?;

    let info = BinaryRecordingInfo {
        sampling_frequency: recording.sampling_frequency(),
        channel_ids: recording.channel_ids(),
        channel_locations: recording.channel_locations(),
        num_segments: recording.num_segments(),
        dtype: default_dtype(),
    };
    fs::write(
        folder.join(RECORDING_INFO_FILE),
        serde_json::to_vec_pretty(&info)?,
    )?;

    for segment in 0..recording.num_segments() {
        let traces = recording.traces(segment, 0, recording.num_samples(segment))?;
        let bytes: Vec<u8> = traces.iter().flat_map(|v| v.to_le_bytes()).collect();
        fs::write(folder.join(segment_file_name(segment)), bytes)?;
    }
    Ok(())
}
