// src/waveforms/array.rs
//
// Binary layout (little endian):
//   b"MEAW" | u32 num_spikes | u32 num_samples | u32 num_channels
//   | u32 channel index * num_channels | f32 data
// with data[(spike * num_samples + sample) * num_channels + channel].

use std::path::Path;

use crate::error::{PipelineError, Result};

const MAGIC: &[u8; 4] = b"MEAW";
const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct WaveformArray {
    pub num_spikes: usize,
    pub num_samples: usize,
    /// Recording channel index of each stored channel.
    pub channel_indices: Vec<u32>,
    pub data: Vec<f32>,
}

impl WaveformArray {
    pub fn new(
        num_spikes: usize,
        num_samples: usize,
        channel_indices: Vec<u32>,
        data: Vec<f32>,
    ) -> Option<Self> {
        if data.len() != num_spikes * num_samples * channel_indices.len() {
            return None;
        }
        Some(Self {
            num_spikes,
            num_samples,
            channel_indices,
            data,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.channel_indices.len()
    }

    pub fn spike(&self, index: usize) -> &[f32] {
        let len = self.num_samples * self.num_channels();
        &self.data[index * len..(index + 1) * len]
    }

    /// Mean over spikes, kept as a one-spike array. Zero-filled when there are no spikes.
    pub fn average(&self) -> WaveformArray {
        let len = self.num_samples * self.num_channels();
        let mut mean = vec![0.0f64; len];
        for spike in 0..self.num_spikes {
            for (acc, v) in mean.iter_mut().zip(self.spike(spike)) {
                *acc += *v as f64;
            }
        }
        let n = self.num_spikes.max(1) as f64;
        WaveformArray {
            num_spikes: 1,
            num_samples: self.num_samples,
            channel_indices: self.channel_indices.clone(),
            data: mean.into_iter().map(|v| (v / n) as f32).collect(),
        }
    }

    /// Keeps only the listed positions of `channel_indices`.
    pub fn select_channels(&self, positions: &[usize]) -> WaveformArray {
        let num_channels = self.num_channels();
        let mut data = Vec::with_capacity(self.num_spikes * self.num_samples * positions.len());
        for row in self.data.chunks_exact(num_channels.max(1)) {
            data.extend(positions.iter().map(|&p| row[p]));
        }
        WaveformArray {
            num_spikes: self.num_spikes,
            num_samples: self.num_samples,
            channel_indices: positions.iter().map(|&p| self.channel_indices[p]).collect(),
            data,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(HEADER_LEN + 4 * (self.channel_indices.len() + self.data.len()));
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(self.num_spikes as u32).to_le_bytes());
        out.extend_from_slice(&(self.num_samples as u32).to_le_bytes());
        out.extend_from_slice(&(self.channel_indices.len() as u32).to_le_bytes());
        for index in &self.channel_indices {
            out.extend_from_slice(&index.to_le_bytes());
        }
        for value in &self.data {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8], path: &Path) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(PipelineError::invalid_data(path, "not a waveform array"));
        }
        let word = |i: usize| {
            let at = 4 + 4 * i;
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as usize
        };
        let (num_spikes, num_samples, num_channels) = (word(0), word(1), word(2));
        let expected = num_spikes
            .checked_mul(num_samples)
            .and_then(|n| n.checked_mul(num_channels))
            .and_then(|n| n.checked_add(num_channels))
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(HEADER_LEN));
        if expected != Some(bytes.len()) {
            return Err(PipelineError::invalid_data(
                path,
                format!(
                    "header describes {:?} bytes, found {}",
                    expected,
                    bytes.len()
                ),
            ));
        }

        let mut words = bytes[HEADER_LEN..]
            .chunks_exact(4)
            .map(|b| [b[0], b[1], b[2], b[3]]);
        let channel_indices = words
            .by_ref()
            .take(num_channels)
            .map(u32::from_le_bytes)
            .collect();
        let data = words.map(f32::from_le_bytes).collect();

        Ok(Self {
            num_spikes,
            num_samples,
            channel_indices,
            data,
        })
    }
}
