// src/recording/merge.rs
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    check_window, ChannelId, InMemorySorting, Recording, SharedRecording, SharedSorting, UnitId,
};
use crate::error::{PipelineError, Result};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Same channels; every input segment becomes a segment of the result.
    Append,
    /// Same channels; all segments joined end to end into one segment.
    Concatenate,
    /// Different channels over the same time base; channel lists are joined.
    Aggregate,
}

pub fn merge_recording_segments(
    recordings: Vec<SharedRecording>,
    mode: MergeMode,
) -> Result<SharedRecording> {
    let first = recordings
        .first()
        .ok_or_else(|| PipelineError::RecordingMismatch("no recordings to merge".into()))?;
    let fs = first.sampling_frequency();
    if let Some(other) = recordings.iter().find(|r| r.sampling_frequency() != fs) {
        return Err(PipelineError::RecordingMismatch(format!(
            "sampling frequencies differ: {} vs {}",
            fs,
            other.sampling_frequency()
        )));
    }

    match mode {
        MergeMode::Append | MergeMode::Concatenate => {
            let channel_ids = first.channel_ids();
            if recordings.iter().any(|r| r.channel_ids() != channel_ids) {
                return Err(PipelineError::RecordingMismatch(
                    "channel ids differ between recordings".into(),
                ));
            }
            let parts: Vec<(SharedRecording, usize)> = recordings
                .iter()
                .flat_map(|r| (0..r.num_segments()).map(move |s| (Arc::clone(r), s)))
                .collect();
            if mode == MergeMode::Append {
                Ok(Arc::new(AppendedRecording { parts }))
            } else {
                Ok(Arc::new(ConcatenatedRecording { parts }))
            }
        }
        MergeMode::Aggregate => {
            let num_segments = first.num_segments();
            for rec in &recordings {
                if rec.num_segments() != num_segments {
                    return Err(PipelineError::RecordingMismatch(format!(
                        "segment counts differ: {} vs {}",
                        num_segments,
                        rec.num_segments()
                    )));
                }
                for segment in 0..num_segments {
                    if rec.num_samples(segment) != first.num_samples(segment) {
                        return Err(PipelineError::RecordingMismatch(format!(
                            "segment {} lengths differ: {} vs {}",
                            segment,
                            first.num_samples(segment),
                            rec.num_samples(segment)
                        )));
                    }
                }
            }
            let mut seen = BTreeSet::new();
            for id in recordings.iter().flat_map(|r| r.channel_ids()) {
                if !seen.insert(id.clone()) {
                    return Err(PipelineError::RecordingMismatch(format!(
                        "channel id '{}' appears in more than one recording",
                        id
                    )));
                }
            }
            Ok(Arc::new(AggregatedRecording { parts: recordings }))
        }
    }
}

struct AppendedRecording {
    parts: Vec<(SharedRecording, usize)>,
}

impl Recording for AppendedRecording {
    fn sampling_frequency(&self) -> f64 {
        self.parts[0].0.sampling_frequency()
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        self.parts[0].0.channel_ids()
    }

    fn channel_locations(&self) -> Vec<[f64; 2]> {
        self.parts[0].0.channel_locations()
    }

    fn num_segments(&self) -> usize {
        self.parts.len()
    }

    fn num_samples(&self, segment: usize) -> usize {
        self.parts
            .get(segment)
            .map(|(rec, s)| rec.num_samples(*s))
            .unwrap_or(0)
    }

    fn traces(&self, segment: usize, start: usize, end: usize) -> Result<Vec<f32>> {
        check_window(self, segment, start, end)?;
        let (rec, s) = &self.parts[segment];
        rec.traces(*s, start, end)
    }

    fn is_filtered(&self) -> bool {
        self.parts.iter().all(|(rec, _)| rec.is_filtered())
    }
}

struct ConcatenatedRecording {
    parts: Vec<(SharedRecording, usize)>,
}

impl Recording for ConcatenatedRecording {
    fn sampling_frequency(&self) -> f64 {
        self.parts[0].0.sampling_frequency()
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        self.parts[0].0.channel_ids()
    }

    fn channel_locations(&self) -> Vec<[f64; 2]> {
        self.parts[0].0.channel_locations()
    }

    fn num_segments(&self) -> usize {
        1
    }

    fn num_samples(&self, _segment: usize) -> usize {
        self.parts.iter().map(|(rec, s)| rec.num_samples(*s)).sum()
    }

    fn traces(&self, segment: usize, start: usize, end: usize) -> Result<Vec<f32>> {
        check_window(self, segment, start, end)?;
        let mut out = Vec::with_capacity((end - start) * self.num_channels());
        let mut offset = 0;
        for (rec, s) in &self.parts {
            let len = rec.num_samples(*s);
            let lo = start.max(offset);
            let hi = end.min(offset + len);
            if lo < hi {
                out.extend(rec.traces(*s, lo - offset, hi - offset)?);
            }
            offset += len;
            if offset >= end {
                break;
            }
        }
        Ok(out)
    }

    fn is_filtered(&self) -> bool {
        self.parts.iter().all(|(rec, _)| rec.is_filtered())
    }
}

struct AggregatedRecording {
    parts: Vec<SharedRecording>,
}

impl Recording for AggregatedRecording {
    fn sampling_frequency(&self) -> f64 {
        self.parts[0].sampling_frequency()
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        self.parts.iter().flat_map(|r| r.channel_ids()).collect()
    }

    fn channel_locations(&self) -> Vec<[f64; 2]> {
        self.parts.iter().flat_map(|r| r.channel_locations()).collect()
    }

    fn num_segments(&self) -> usize {
        self.parts[0].num_segments()
    }

    fn num_samples(&self, segment: usize) -> usize {
        self.parts[0].num_samples(segment)
    }

    fn traces(&self, segment: usize, start: usize, end: usize) -> Result<Vec<f32>> {
        check_window(self, segment, start, end)?;
        let blocks = self
            .parts
            .iter()
            .map(|r| Ok((r.num_channels(), r.traces(segment, start, end)?)))
            .collect::<Result<Vec<_>>>()?;
        let total_channels: usize = blocks.iter().map(|(n, _)| n).sum();
        let mut out = Vec::with_capacity((end - start) * total_channels);
        for frame in 0..(end - start) {
            for (n, data) in &blocks {
                out.extend_from_slice(&data[frame * n..(frame + 1) * n]);
            }
        }
        Ok(out)
    }

    fn is_filtered(&self) -> bool {
        self.parts.iter().all(|r| r.is_filtered())
    }
}

/// Aggregates sortings over the same time base. Units are renumbered
/// consecutively from zero in input order.
pub fn merge_sortings(sortings: &[SharedSorting]) -> Result<SharedSorting> {
    let first = sortings
        .first()
        .ok_or_else(|| PipelineError::RecordingMismatch("no sortings to merge".into()))?;
    let num_segments = first.num_segments();
    if sortings.iter().any(|s| s.num_segments() != num_segments) {
        return Err(PipelineError::RecordingMismatch(
            "sortings have different segment counts".into(),
        ));
    }

    let mut trains: BTreeMap<UnitId, Vec<Vec<usize>>> = BTreeMap::new();
    let mut next: UnitId = 0;
    for sorting in sortings {
        for unit in sorting.unit_ids() {
            let segments = (0..num_segments)
                .map(|s| sorting.spike_train(unit, s))
                .collect();
            trains.insert(next, segments);
            next += 1;
        }
    }
    Ok(Arc::new(InMemorySorting::with_segments(
        first.sampling_frequency(),
        num_segments,
        trains,
    )))
}
