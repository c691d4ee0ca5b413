// src/recording/mod.rs
//
// Read-only views of recordings and sortings. The HDF5 reader and the sorter
// that produce these live outside the crate; everything here only consumes
// them through the two traits below.

pub mod binary;
pub mod memory;
pub mod merge;
pub mod stats;
pub mod synthetic;

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{PipelineError, Result};

pub use memory::{InMemoryRecording, InMemorySorting};

pub type UnitId = u32;
pub type ChannelId = String;

pub type SharedRecording = Arc<dyn Recording>;
pub type SharedSorting = Arc<dyn Sorting>;

impl std::fmt::Debug for dyn Recording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recording").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for dyn Sorting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sorting").finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// RECORDING
// -----------------------------------------------------------------------------

pub trait Recording: Send + Sync {
    fn sampling_frequency(&self) -> f64;

    fn channel_ids(&self) -> Vec<ChannelId>;

    /// Probe-plane location of every channel in micrometres, same order as `channel_ids`.
    fn channel_locations(&self) -> Vec<[f64; 2]>;

    fn num_segments(&self) -> usize;

    fn num_samples(&self, segment: usize) -> usize;

    /// Frame-major traces for frames `[start, end)` of one segment:
    /// sample `(frame, channel)` lives at `(frame - start) * num_channels + channel`.
    fn traces(&self, segment: usize, start: usize, end: usize) -> Result<Vec<f32>>;

    fn num_channels(&self) -> usize {
        self.channel_ids().len()
    }

    fn total_samples(&self) -> usize {
        (0..self.num_segments()).map(|s| self.num_samples(s)).sum()
    }

    fn total_duration(&self) -> f64 {
        self.total_samples() as f64 / self.sampling_frequency()
    }

    fn is_filtered(&self) -> bool {
        false
    }
}

pub(crate) fn check_window(
    recording: &dyn Recording,
    segment: usize,
    start: usize,
    end: usize,
) -> Result<()> {
    if segment >= recording.num_segments() {
        return Err(PipelineError::Recording(format!(
            "segment {} out of range ({} segments)",
            segment,
            recording.num_segments()
        )));
    }
    let num_samples = recording.num_samples(segment);
    if start > end || end > num_samples {
        return Err(PipelineError::Recording(format!(
            "frame window {}..{} outside segment {} ({} samples)",
            start, end, segment, num_samples
        )));
    }
    Ok(())
}

/// A view over frames `[start, end)` of a single-segment recording.
pub struct FrameSlice {
    parent: SharedRecording,
    start: usize,
    end: usize,
}

pub fn frame_slice(recording: &SharedRecording, start: usize, end: usize) -> Result<SharedRecording> {
    if recording.num_segments() != 1 {
        return Err(PipelineError::Recording(format!(
            "frame_slice needs a mono-segment recording, got {} segments",
            recording.num_segments()
        )));
    }
    check_window(recording.as_ref(), 0, start, end)?;
    Ok(Arc::new(FrameSlice {
        parent: Arc::clone(recording),
        start,
        end,
    }))
}

impl Recording for FrameSlice {
    fn sampling_frequency(&self) -> f64 {
        self.parent.sampling_frequency()
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        self.parent.channel_ids()
    }

    fn channel_locations(&self) -> Vec<[f64; 2]> {
        self.parent.channel_locations()
    }

    fn num_segments(&self) -> usize {
        1
    }

    fn num_samples(&self, _segment: usize) -> usize {
        self.end - self.start
    }

    fn traces(&self, segment: usize, start: usize, end: usize) -> Result<Vec<f32>> {
        check_window(self, segment, start, end)?;
        self.parent.traces(0, self.start + start, self.start + end)
    }

    fn is_filtered(&self) -> bool {
        self.parent.is_filtered()
    }
}

// -----------------------------------------------------------------------------
// SORTING
// -----------------------------------------------------------------------------

pub trait Sorting: Send + Sync {
    /// Ordered, unique unit ids.
    fn unit_ids(&self) -> Vec<UnitId>;

    fn sampling_frequency(&self) -> f64;

    fn num_segments(&self) -> usize;

    /// Spike frames of one unit in one segment, ascending.
    fn spike_train(&self, unit: UnitId, segment: usize) -> Vec<usize>;

    fn num_spikes(&self, unit: UnitId) -> usize {
        (0..self.num_segments())
            .map(|s| self.spike_train(unit, s).len())
            .sum()
    }
}

/// Restriction of a sorting to a subset of its units.
pub struct UnitSelection {
    parent: SharedSorting,
    units: Vec<UnitId>,
}

pub fn select_units(sorting: &SharedSorting, units: &[UnitId]) -> SharedSorting {
    let known: BTreeSet<UnitId> = sorting.unit_ids().into_iter().collect();
    let mut selected: Vec<UnitId> = units.iter().copied().filter(|u| known.contains(u)).collect();
    selected.sort_unstable();
    selected.dedup();
    Arc::new(UnitSelection {
        parent: Arc::clone(sorting),
        units: selected,
    })
}

impl Sorting for UnitSelection {
    fn unit_ids(&self) -> Vec<UnitId> {
        self.units.clone()
    }

    fn sampling_frequency(&self) -> f64 {
        self.parent.sampling_frequency()
    }

    fn num_segments(&self) -> usize {
        self.parent.num_segments()
    }

    fn spike_train(&self, unit: UnitId, segment: usize) -> Vec<usize> {
        if self.units.binary_search(&unit).is_ok() {
            self.parent.spike_train(unit, segment)
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ramp_recording() -> SharedRecording {
        // 2 channels, 10 frames, value = frame * 10 + channel
        let data: Vec<f32> = (0..10)
            .flat_map(|f| (0..2).map(move |c| (f * 10 + c) as f32))
            .collect();
        Arc::new(
            InMemoryRecording::new(
                1000.0,
                vec!["0".into(), "1".into()],
                vec![[0.0, 0.0], [0.0, 17.5]],
                vec![data],
            )
            .unwrap(),
        )
    }

    #[test]
    fn frame_slice_offsets_traces() {
        let rec = ramp_recording();
        let sliced = frame_slice(&rec, 4, 8).unwrap();
        assert_eq!(sliced.num_samples(0), 4);
        assert_eq!(sliced.traces(0, 0, 1).unwrap(), vec![40.0, 41.0]);
        assert!(sliced.traces(0, 2, 5).is_err());
    }

    #[test]
    fn frame_slice_rejects_multi_segment() {
        let rec: SharedRecording = Arc::new(
            InMemoryRecording::new(
                1000.0,
                vec!["0".into()],
                vec![[0.0, 0.0]],
                vec![vec![0.0; 4], vec![0.0; 4]],
            )
            .unwrap(),
        );
        assert!(frame_slice(&rec, 0, 2).is_err());
    }

    #[test]
    fn select_units_restricts_view() {
        let mut trains = BTreeMap::new();
        trains.insert(1, vec![vec![5, 9]]);
        trains.insert(2, vec![vec![3]]);
        trains.insert(7, vec![vec![1, 2, 3]]);
        let sorting: SharedSorting = Arc::new(InMemorySorting::new(1000.0, trains));

        let view = select_units(&sorting, &[7, 1, 42]);
        assert_eq!(view.unit_ids(), vec![1, 7]);
        assert_eq!(view.spike_train(7, 0), vec![1, 2, 3]);
        assert!(view.spike_train(2, 0).is_empty());
        assert_eq!(view.num_spikes(1), 2);
    }
}
