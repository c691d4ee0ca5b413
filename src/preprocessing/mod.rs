// src/preprocessing/mod.rs
pub mod bandpass;

use std::sync::Arc;

use tracing::info;

use self::bandpass::BandPassFilter;
use crate::config::{PreprocessingConfig, ReferenceMode, ReferenceOperator};
use crate::error::{PipelineError, Result};
use crate::recording::stats::get_channel_recording_stats;
use crate::recording::{check_window, frame_slice, ChannelId, Recording, SharedRecording};
use crate::utils::log::LogContext;

/// Band edges for a recording: `freq_max` defaults to one hertz under Nyquist.
pub fn bandpass_limits(fs: f64, config: &PreprocessingConfig) -> Result<(f64, f64)> {
    let nyquist = fs / 2.0;
    let freq_max = config.freq_max.unwrap_or(nyquist - 1.0);
    if config.freq_min <= 0.0 || freq_max <= config.freq_min || freq_max >= nyquist {
        return Err(PipelineError::Config(format!(
            "band {}..{} Hz does not fit a recording sampled at {} Hz",
            config.freq_min, freq_max, fs
        )));
    }
    Ok((config.freq_min, freq_max))
}

// -----------------------------------------------------------------------------
// FILTERED RECORDING
// -----------------------------------------------------------------------------

/// Band-passed, common-referenced view of another recording.
///
/// Each read filters from `margin` frames before the requested window so the
/// filter state has settled by the first returned frame.
pub struct FilteredRecording {
    parent: SharedRecording,
    freq_min: f64,
    freq_max: f64,
    reference: ReferenceMode,
    operator: ReferenceOperator,
    margin: usize,
}

impl Recording for FilteredRecording {
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
        self.parent.num_segments()
    }

    fn num_samples(&self, segment: usize) -> usize {
        self.parent.num_samples(segment)
    }

    fn traces(&self, segment: usize, start: usize, end: usize) -> Result<Vec<f32>> {
        check_window(self, segment, start, end)?;
        let padded_start = start.saturating_sub(self.margin);
        let raw = self.parent.traces(segment, padded_start, end)?;
        let num_channels = self.num_channels();
        let fs = self.sampling_frequency();
        let skip = start - padded_start;

        let mut out = vec![0.0f32; (end - start) * num_channels];
        for channel in 0..num_channels {
            let mut filter = BandPassFilter::new(self.freq_min, self.freq_max, fs);
            for (i, row) in raw.chunks_exact(num_channels).enumerate() {
                let value = filter.filter(row[channel] as f64);
                if i >= skip {
                    out[(i - skip) * num_channels + channel] = value as f32;
                }
            }
        }

        if self.reference == ReferenceMode::Global {
            let mut scratch = Vec::with_capacity(num_channels);
            for row in out.chunks_exact_mut(num_channels) {
                let reference = match self.operator {
                    ReferenceOperator::Median => median(row, &mut scratch),
                    ReferenceOperator::Average => row.iter().sum::<f32>() / num_channels as f32,
                };
                row.iter_mut().for_each(|v| *v -= reference);
            }
        }
        Ok(out)
    }

    fn is_filtered(&self) -> bool {
        true
    }
}

fn median(values: &[f32], scratch: &mut Vec<f32>) -> f32 {
    scratch.clear();
    scratch.extend_from_slice(values);
    scratch.sort_by(|a, b| a.total_cmp(b));
    let n = scratch.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        scratch[n / 2]
    } else {
        (scratch[n / 2 - 1] + scratch[n / 2]) / 2.0
    }
}

// -----------------------------------------------------------------------------
// PIPELINE STEPS
// -----------------------------------------------------------------------------

/// Band-pass plus global common reference, marked as filtered.
pub fn preprocess_recording(
    recording: SharedRecording,
    config: &PreprocessingConfig,
    log: &LogContext,
) -> Result<SharedRecording> {
    let fs = recording.sampling_frequency();
    let (freq_min, freq_max) = bandpass_limits(fs, config)?;
    {
        let _span = log.enter();
        info!(
            "Band-pass {}..{} Hz, {:?} reference ({:?})",
            freq_min, freq_max, config.reference, config.operator
        );
    }
    Ok(Arc::new(FilteredRecording {
        parent: recording,
        freq_min,
        freq_max,
        reference: config.reference,
        operator: config.operator,
        margin: (config.margin_ms * fs / 1000.0) as usize,
    }))
}

/// Whole seconds of the recording when rounding would cut it short,
/// otherwise its exact duration.
pub fn usable_duration(total_duration: f64) -> f64 {
    let rounded = total_duration.round();
    if total_duration > rounded {
        rounded
    } else {
        total_duration
    }
}

/// Slices `[0, duration)` of a single recording and preprocesses it.
pub fn preprocess_single_recording(
    recording: SharedRecording,
    config: &PreprocessingConfig,
    log: &LogContext,
) -> Result<SharedRecording> {
    let stats = get_channel_recording_stats(recording.as_ref(), log);
    let time_in_s = usable_duration(stats.total_duration);
    let end = ((time_in_s * stats.sampling_frequency) as usize).min(recording.num_samples(0));
    let chunk = frame_slice(&recording, 0, end)?;
    preprocess_recording(chunk, config, log)
}

/// Preprocesses every recording and checks they can be merged.
pub fn prepare_recordings_for_merge(
    recordings: Vec<SharedRecording>,
    config: &PreprocessingConfig,
    log: &LogContext,
) -> Result<Vec<SharedRecording>> {
    let prepared = recordings
        .into_iter()
        .map(|recording| preprocess_single_recording(recording, config, log))
        .collect::<Result<Vec<_>>>()?;

    let first = prepared
        .first()
        .ok_or_else(|| PipelineError::RecordingMismatch("no recordings to prepare".into()))?;
    let fs = first.sampling_frequency();
    let num_segments = first.num_segments();
    let consistent = prepared.iter().all(|rec| {
        rec.sampling_frequency() == fs
            && rec.num_segments() == num_segments
            && (0..num_segments).all(|s| rec.num_samples(s) == first.num_samples(s))
    });
    if !consistent {
        return Err(PipelineError::RecordingMismatch(
            "recordings don't have the same sampling frequency, segment count or sample count".into(),
        ));
    }
    Ok(prepared)
}
