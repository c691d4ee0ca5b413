// src/recording/stats.rs
use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use super::{ChannelId, Recording};
use crate::utils::log::LogContext;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChannelStats {
    pub sampling_frequency: f64,
    pub num_channels: usize,
    pub num_segments: usize,
    pub channel_ids: Vec<ChannelId>,
    pub total_duration: f64,
}

pub fn get_channel_recording_stats(recording: &dyn Recording, log: &LogContext) -> ChannelStats {
    let _span = log.enter();
    let stats = ChannelStats {
        sampling_frequency: recording.sampling_frequency(),
        num_channels: recording.num_channels(),
        num_segments: recording.num_segments(),
        channel_ids: recording.channel_ids(),
        total_duration: recording.total_duration(),
    };

    info!("Sampling frequency: {}", stats.sampling_frequency);
    info!("Number of channels: {}", stats.num_channels);
    info!("Number of segments: {}", stats.num_segments);
    info!("Total recording duration: {} s", stats.total_duration);

    stats
}

pub fn count_recording_segments(recording: &dyn Recording, log: &LogContext) -> usize {
    let _span = log.enter();
    let num_segments = recording.num_segments();
    info!("Number of segments in the recording: {}", num_segments);
    num_segments
}

pub fn channel_locations_mapping(recording: &dyn Recording) -> BTreeMap<ChannelId, [f64; 2]> {
    recording
        .channel_ids()
        .into_iter()
        .zip(recording.channel_locations())
        .collect()
}

/// Electrode number on a rectangular MEA grid with `columns` electrodes per row
/// spaced `pitch_um` apart.
pub fn electrode_index(location: [f64; 2], pitch_um: f64, columns: usize) -> usize {
    let column = (location[0] / pitch_um).max(0.0) as usize;
    let row = (location[1] / pitch_um).max(0.0) as usize;
    columns * row + column
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::InMemoryRecording;

    #[test]
    fn stats_report_duration_over_all_segments() {
        let rec = InMemoryRecording::new(
            100.0,
            vec!["0".into(), "1".into()],
            vec![[0.0, 0.0], [17.5, 0.0]],
            vec![vec![0.0; 200], vec![0.0; 100]],
        )
        .unwrap();
        let stats = get_channel_recording_stats(&rec, &LogContext::disabled());
        assert_eq!(stats.num_channels, 2);
        assert_eq!(stats.num_segments, 2);
        assert!((stats.total_duration - 1.5).abs() < 1e-9);
    }

    #[test]
    fn electrode_index_uses_grid_rows() {
        assert_eq!(electrode_index([0.0, 0.0], 17.5, 220), 0);
        assert_eq!(electrode_index([35.0, 17.5], 17.5, 220), 222);
        assert_eq!(electrode_index([40.0, 52.6], 17.5, 220), 3 * 220 + 2);
    }

    #[test]
    fn locations_are_keyed_by_channel_id() {
        let rec = InMemoryRecording::new(
            100.0,
            vec!["7".into(), "9".into()],
            vec![[1.0, 2.0], [3.0, 4.0]],
            vec![vec![0.0; 4]],
        )
        .unwrap();
        let mapping = channel_locations_mapping(&rec);
        assert_eq!(mapping["9"], [3.0, 4.0]);
    }
}
