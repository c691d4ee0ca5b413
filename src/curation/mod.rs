// src/curation/mod.rs
//
// Unit curation on quality metrics. The metric formulas themselves belong to
// an external calculator; this module only reads its output and applies
// thresholds.

pub mod templates;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::MetricThresholds;
use crate::error::Result;
use crate::recording::UnitId;
use crate::utils::log::LogContext;
use crate::waveforms::WaveformStore;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct QualityMetrics {
    pub unit_id: UnitId,
    pub num_spikes: f64,
    pub firing_rate: f64,
    pub presence_ratio: f64,
    pub snr: f64,
    pub isi_violations_ratio: f64,
    pub amplitude_cutoff: f64,
    pub amplitude_median: f64,
}

impl QualityMetrics {
    /// Comparisons against NaN are false, so a missing metric never passes.
    pub fn passes(&self, thresholds: &MetricThresholds) -> bool {
        self.num_spikes > thresholds.min_num_spikes
            && self.amplitude_cutoff < thresholds.max_amplitude_cutoff
            && self.isi_violations_ratio < thresholds.max_isi_violations_ratio
            && self.presence_ratio > thresholds.min_presence_ratio
            && self.firing_rate > thresholds.min_firing_rate
    }
}

pub type MetricsTable = BTreeMap<UnitId, QualityMetrics>;

pub trait QualityMetricsSource {
    fn compute(&self, store: &WaveformStore, log: &LogContext) -> Result<MetricsTable>;
}

/// Metrics exported by the external calculator as CSV, one row per unit.
pub struct CsvMetricsSource {
    path: PathBuf,
}

impl CsvMetricsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl QualityMetricsSource for CsvMetricsSource {
    fn compute(&self, store: &WaveformStore, log: &LogContext) -> Result<MetricsTable> {
        let mut table = read_metrics_csv(&self.path)?;
        table.retain(|unit, _| store.unit_ids().contains(unit));
        let _span = log.enter();
        info!("Loaded metrics for {} units from {}", table.len(), self.path.display());
        Ok(table)
    }
}

pub fn read_metrics_csv<P: AsRef<Path>>(path: P) -> Result<MetricsTable> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut table = MetricsTable::new();
    for row in reader.deserialize() {
        let metrics: QualityMetrics = row?;
        table.insert(metrics.unit_id, metrics);
    }
    Ok(table)
}

pub fn write_metrics_csv<P: AsRef<Path>>(table: &MetricsTable, path: P) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for metrics in table.values() {
        writer.serialize(metrics)?;
    }
    writer.flush()?;
    Ok(())
}

/// Units passing every threshold, ascending.
pub fn remove_violated_units(
    metrics: &MetricsTable,
    thresholds: &MetricThresholds,
    log: &LogContext,
) -> Vec<UnitId> {
    let kept: Vec<UnitId> = metrics
        .values()
        .filter(|m| m.passes(thresholds))
        .map(|m| m.unit_id)
        .collect();
    let _span = log.enter();
    info!("{} of {} units pass the quality thresholds", kept.len(), metrics.len());
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn metrics(unit_id: UnitId, amplitude_median: f64) -> QualityMetrics {
        QualityMetrics {
            unit_id,
            num_spikes: 500.0,
            firing_rate: 2.0,
            presence_ratio: 0.95,
            snr: 8.0,
            isi_violations_ratio: 0.2,
            amplitude_cutoff: 0.01,
            amplitude_median,
        }
    }

    #[test]
    fn each_threshold_can_reject() {
        let thresholds = MetricThresholds::default();
        let mut table = MetricsTable::new();
        table.insert(0, metrics(0, 50.0));
        table.insert(1, QualityMetrics { num_spikes: 150.0, ..metrics(1, 50.0) });
        table.insert(2, QualityMetrics { amplitude_cutoff: 0.2, ..metrics(2, 50.0) });
        table.insert(3, QualityMetrics { isi_violations_ratio: 1.5, ..metrics(3, 50.0) });
        table.insert(4, QualityMetrics { presence_ratio: 0.5, ..metrics(4, 50.0) });
        table.insert(5, QualityMetrics { firing_rate: 0.05, ..metrics(5, 50.0) });
        table.insert(6, QualityMetrics { amplitude_cutoff: f64::NAN, ..metrics(6, 50.0) });
        table.insert(7, metrics(7, 50.0));

        let kept = remove_violated_units(&table, &thresholds, &LogContext::disabled());
        assert_eq!(kept, vec![0, 7]);
    }

    #[test]
    fn csv_table_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.csv");
        let mut table = MetricsTable::new();
        table.insert(4, metrics(4, 61.5));
        write_metrics_csv(&table, &path).unwrap();
        assert_eq!(read_metrics_csv(&path).unwrap(), table);
    }
}
