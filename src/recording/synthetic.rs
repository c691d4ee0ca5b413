// src/recording/synthetic.rs
//
// Synthetic MEA recordings with injected spikes and their ground-truth sorting.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{InMemoryRecording, InMemorySorting, UnitId};
use crate::error::{PipelineError, Result};

const GRID_COLUMNS: usize = 4;
const SPATIAL_DECAY_UM: f64 = 40.0;
const REFRACTORY_MS: f64 = 2.0;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyntheticConfig {
    pub sampling_frequency: f64,
    pub num_channels: usize,
    pub duration_s: f64,
    pub num_units: usize,
    pub firing_rate_hz: f64,
    pub noise_amplitude: f64,
    pub spike_amplitude: f64,
    pub pitch_um: f64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            sampling_frequency: 20000.0,
            num_channels: 8,
            duration_s: 2.0,
            num_units: 6,
            firing_rate_hz: 10.0,
            noise_amplitude: 4.0,
            spike_amplitude: 80.0,
            pitch_um: 17.5,
            seed: 0,
        }
    }
}

pub struct SyntheticData {
    pub recording: InMemoryRecording,
    pub sorting: InMemorySorting,
}

// Biphasic extracellular spike: sharp trough then a slower, smaller peak.
fn spike_shape(t: f64, fs: f64) -> f64 {
    let t_ms = t * 1000.0 / fs;
    let trough = -(-(t_ms / 0.15).powi(2)).exp();
    let peak = 0.35 * (-((t_ms - 0.5) / 0.3).powi(2)).exp();
    trough + peak
}

pub fn generate(config: &SyntheticConfig) -> Result<SyntheticData> {
    if config.num_channels == 0 || config.duration_s <= 0.0 || config.sampling_frequency <= 0.0 {
        return Err(PipelineError::Config(
            "synthetic recording needs channels, a positive duration and sampling frequency".into(),
        ));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let fs = config.sampling_frequency;
    let num_frames = (config.duration_s * fs) as usize;
    let num_channels = config.num_channels;

    let channel_ids = (0..num_channels).map(|c| c.to_string()).collect();
    let locations: Vec<[f64; 2]> = (0..num_channels)
        .map(|c| {
            [
                (c % GRID_COLUMNS) as f64 * config.pitch_um,
                (c / GRID_COLUMNS) as f64 * config.pitch_um,
            ]
        })
        .collect();

    let mut traces: Vec<f32> = (0..num_frames * num_channels)
        .map(|_| (rng.gen_range(-1.0..1.0) * config.noise_amplitude) as f32)
        .collect();

    let half_width = (0.002 * fs) as usize;
    let refractory = (REFRACTORY_MS * fs / 1000.0) as usize;
    let expected_spikes = (config.firing_rate_hz * config.duration_s).round() as usize;

    let mut trains: BTreeMap<UnitId, Vec<Vec<usize>>> = BTreeMap::new();
    for unit in 0..config.num_units {
        let home = unit % num_channels;
        let gain = rng.gen_range(0.7..1.3) * config.spike_amplitude;

        let mut frames: Vec<usize> = if num_frames > 2 * half_width {
            (0..expected_spikes)
                .map(|_| rng.gen_range(half_width..num_frames - half_width))
                .collect()
        } else {
            Vec::new()
        };
        frames.sort_unstable();
        frames.dedup_by(|later, earlier| *later - *earlier < refractory);

        for &frame in &frames {
            for offset in 0..(2 * half_width) {
                let t = offset as f64 - half_width as f64;
                let shape = spike_shape(t, fs) * gain;
                let f = frame + offset - half_width;
                for (channel, location) in locations.iter().enumerate() {
                    let dx = location[0] - locations[home][0];
                    let dy = location[1] - locations[home][1];
                    let decay = (-(dx * dx + dy * dy).sqrt() / SPATIAL_DECAY_UM).exp();
                    traces[f * num_channels + channel] += (shape * decay) as f32;
                }
            }
        }
        trains.insert(unit as UnitId, vec![frames]);
    }

    let recording = InMemoryRecording::new(fs, channel_ids, locations, vec![traces])?;
    let sorting = InMemorySorting::with_segments(fs, 1, trains);
    Ok(SyntheticData { recording, sorting })
}
