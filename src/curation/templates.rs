// src/curation/templates.rs
//
// Template-based curation: redundant units and extremum channels.

use std::collections::BTreeMap;

use tracing::{info, warn};

use super::MetricsTable;
use crate::config::PeakSign;
use crate::error::{PipelineError, Result};
use crate::recording::{ChannelId, UnitId};
use crate::utils::log::LogContext;
use crate::waveforms::{WaveformArray, WaveformStore};

/// Template of `unit` spread over every recording channel, zeros where the
/// store kept no data: `dense[sample * num_channels + channel]`.
pub fn dense_template(store: &WaveformStore, unit: UnitId) -> Result<Vec<f32>> {
    let num_channels = store.params()?.channel_ids.len();
    let template = store.template(unit)?;
    densify(&template, num_channels).ok_or_else(|| {
        PipelineError::invalid_data(
            store.folder(),
            format!("template of unit {} refers to a channel outside the recording", unit),
        )
    })
}

fn densify(template: &WaveformArray, num_channels: usize) -> Option<Vec<f32>> {
    if template.channel_indices.iter().any(|&c| c as usize >= num_channels) {
        return None;
    }
    let mut dense = vec![0.0; template.num_samples * num_channels];
    let row_len = template.num_channels();
    for (sample, row) in template.spike(0).chunks_exact(row_len.max(1)).enumerate() {
        for (&channel, &value) in template.channel_indices.iter().zip(row) {
            dense[sample * num_channels + channel as usize] = value;
        }
    }
    Some(dense)
}

/// Cosine similarity; 0 when either template is flat.
pub fn template_similarity(a: &[f32], b: &[f32]) -> f64 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Pairwise similarity matrix in `store.unit_ids()` order.
pub fn compute_template_similarity(store: &WaveformStore) -> Result<Vec<Vec<f64>>> {
    let templates = store
        .unit_ids()
        .iter()
        .map(|&unit| dense_template(store, unit))
        .collect::<Result<Vec<_>>>()?;
    let n = templates.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        matrix[i][i] = 1.0;
        for j in 0..i {
            let similarity = template_similarity(&templates[i], &templates[j]);
            matrix[i][j] = similarity;
            matrix[j][i] = similarity;
        }
    }
    Ok(matrix)
}

/// For every pair of units whose templates are more similar than `threshold`,
/// the one with the smaller median amplitude. Sorted, no repeats.
pub fn remove_similar_templates(
    store: &WaveformStore,
    metrics: &MetricsTable,
    threshold: f64,
    log: &LogContext,
) -> Result<Vec<UnitId>> {
    let matrix = compute_template_similarity(store)?;
    let units = store.unit_ids();
    let _span = log.enter();

    let mut removable = Vec::new();
    for i in 1..units.len() {
        for j in 0..i {
            if matrix[i][j] <= threshold {
                continue;
            }
            let (a, b) = (units[i], units[j]);
            let (Some(ma), Some(mb)) = (metrics.get(&a), metrics.get(&b)) else {
                warn!("Units {} and {} look alike but lack metrics, keeping both", a, b);
                continue;
            };
            info!("Units {} and {} are similar ({:.3})", a, b, matrix[i][j]);
            removable.push(if ma.amplitude_median < mb.amplitude_median { a } else { b });
        }
    }
    removable.sort_unstable();
    removable.dedup();
    Ok(removable)
}

/// Channel holding the extreme sample of each unit's template.
pub fn extremum_channels(store: &WaveformStore, peak_sign: PeakSign) -> Result<BTreeMap<UnitId, ChannelId>> {
    let channel_ids = &store.params()?.channel_ids;
    let num_channels = channel_ids.len();
    let mut extremum = BTreeMap::new();
    for &unit in store.unit_ids() {
        let dense = dense_template(store, unit)?;
        let score = |value: f32| match peak_sign {
            PeakSign::Neg => -value,
            PeakSign::Pos => value,
            PeakSign::Both => value.abs(),
        };
        let mut best: Option<(usize, f32)> = None;
        for (i, &value) in dense.iter().enumerate() {
            let channel = i % num_channels;
            let s = score(value);
            if best.map_or(true, |(_, top)| s > top) {
                best = Some((channel, s));
            }
        }
        if let Some((channel, _)) = best {
            extremum.insert(unit, channel_ids[channel].clone());
        }
    }
    Ok(extremum)
}

/// One unit per extremum channel; where several share a channel the one with
/// the highest median amplitude stays. Units without metrics lose ties.
pub fn unique_templates_channels(
    extremum: &BTreeMap<UnitId, ChannelId>,
    metrics: &MetricsTable,
) -> Vec<UnitId> {
    let amplitude = |unit: &UnitId| {
        metrics
            .get(unit)
            .map(|m| m.amplitude_median)
            .filter(|a| !a.is_nan())
            .unwrap_or(f64::NEG_INFINITY)
    };
    let mut best: BTreeMap<&ChannelId, UnitId> = BTreeMap::new();
    for (unit, channel) in extremum {
        let replace = best
            .get(channel)
            .map_or(true, |current| amplitude(current) < amplitude(unit));
        if replace {
            best.insert(channel, *unit);
        }
    }
    let mut kept: Vec<UnitId> = best.into_values().collect();
    kept.sort_unstable();
    kept
}
