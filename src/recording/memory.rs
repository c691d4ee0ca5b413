// src/recording/memory.rs
use std::collections::BTreeMap;

use super::{check_window, ChannelId, Recording, Sorting, UnitId};
use crate::error::{PipelineError, Result};

/// Recording held fully in memory, one frame-major buffer per segment.
#[derive(Debug, Clone)]
pub struct InMemoryRecording {
    fs: f64,
    channel_ids: Vec<ChannelId>,
    locations: Vec<[f64; 2]>,
    segments: Vec<Vec<f32>>,
}

impl InMemoryRecording {
    pub fn new(
        fs: f64,
        channel_ids: Vec<ChannelId>,
        locations: Vec<[f64; 2]>,
        segments: Vec<Vec<f32>>,
    ) -> Result<Self> {
        if fs <= 0.0 {
            return Err(PipelineError::Recording(format!(
                "sampling frequency must be positive, got {}",
                fs
            )));
        }
        if channel_ids.is_empty() {
            return Err(PipelineError::Recording("recording has no channels".into()));
        }
        if channel_ids.len() != locations.len() {
            return Err(PipelineError::Recording(format!(
                "{} channel ids but {} channel locations",
                channel_ids.len(),
                locations.len()
            )));
        }
        let num_channels = channel_ids.len();
        for (index, segment) in segments.iter().enumerate() {
            if segment.len() % num_channels != 0 {
                return Err(PipelineError::Recording(format!(
                    "segment {} holds {} samples, not a multiple of {} channels",
                    index,
                    segment.len(),
                    num_channels
                )));
            }
        }
        Ok(Self {
            fs,
            channel_ids,
            locations,
            segments,
        })
    }

    /// Copy any recording into memory.
    pub fn from_recording(recording: &dyn Recording) -> Result<Self> {
        let segments = (0..recording.num_segments())
            .map(|s| recording.traces(s, 0, recording.num_samples(s)))
            .collect::<Result<Vec<_>>>()?;
        Self::new(
            recording.sampling_frequency(),
            recording.channel_ids(),
            recording.channel_locations(),
            segments,
        )
    }

    pub fn segment_data(&self, segment: usize) -> Option<&[f32]> {
        self.segments.get(segment).map(Vec::as_slice)
    }
}

impl Recording for InMemoryRecording {
    fn sampling_frequency(&self) -> f64 {
        self.fs
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        self.channel_ids.clone()
    }

    fn channel_locations(&self) -> Vec<[f64; 2]> {
        self.locations.clone()
    }

    fn num_segments(&self) -> usize {
        self.segments.len()
    }

    fn num_samples(&self, segment: usize) -> usize {
        self.segments
            .get(segment)
            .map(|data| data.len() / self.channel_ids.len())
            .unwrap_or(0)
    }

    fn traces(&self, segment: usize, start: usize, end: usize) -> Result<Vec<f32>> {
        check_window(self, segment, start, end)?;
        let num_channels = self.channel_ids.len();
        Ok(self.segments[segment][start * num_channels..end * num_channels].to_vec())
    }
}

/// Sorting held in memory: unit id -> per-segment spike frames.
#[derive(Debug, Clone)]
pub struct InMemorySorting {
    fs: f64,
    num_segments: usize,
    trains: BTreeMap<UnitId, Vec<Vec<usize>>>,
}

impl InMemorySorting {
    pub fn new(fs: f64, trains: BTreeMap<UnitId, Vec<Vec<usize>>>) -> Self {
        let num_segments = trains.values().map(Vec::len).max().unwrap_or(1).max(1);
        Self::with_segments(fs, num_segments, trains)
    }

    pub fn with_segments(
        fs: f64,
        num_segments: usize,
        mut trains: BTreeMap<UnitId, Vec<Vec<usize>>>,
    ) -> Self {
        for segments in trains.values_mut() {
            segments.resize(num_segments, Vec::new());
            for train in segments.iter_mut() {
                train.sort_unstable();
            }
        }
        Self {
            fs,
            num_segments,
            trains,
        }
    }

    pub fn from_sorting(sorting: &dyn Sorting) -> Self {
        let num_segments = sorting.num_segments();
        let trains = sorting
            .unit_ids()
            .into_iter()
            .map(|unit| {
                let segments = (0..num_segments)
                    .map(|s| sorting.spike_train(unit, s))
                    .collect();
                (unit, segments)
            })
            .collect();
        Self::with_segments(sorting.sampling_frequency(), num_segments, trains)
    }
}

impl Sorting for InMemorySorting {
    fn unit_ids(&self) -> Vec<UnitId> {
        self.trains.keys().copied().collect()
    }

    fn sampling_frequency(&self) -> f64 {
        self.fs
    }

    fn num_segments(&self) -> usize {
        self.num_segments
    }

    fn spike_train(&self, unit: UnitId, segment: usize) -> Vec<usize> {
        self.trains
            .get(&unit)
            .and_then(|segments| segments.get(segment))
            .cloned()
            .unwrap_or_default()
    }
}
