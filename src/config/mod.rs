// src/config/mod.rs
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub extraction: ExtractionConfig,
    pub preprocessing: PreprocessingConfig,
    pub sorter: SorterConfig,
    pub curation: CurationConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

// EXTRACTION ------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExtractionConfig {
    pub ms_before: f64,
    pub ms_after: f64,
    pub sparse: bool,
    pub sparsity_radius_um: f64,
    /// Worker threads used inside one extraction call.
    pub n_jobs: usize,
    /// Range width k. Falls back to `n_jobs` when unset.
    pub units_per_extraction: Option<usize>,
    pub max_spikes_per_unit: usize,
    /// Resume from shards left by an earlier run.
    pub load_if_exists: bool,
    pub max_attempts: u32,
    pub shrink_on_failure: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            ms_before: 1.0,
            ms_after: 2.0,
            sparse: true,
            sparsity_radius_um: 100.0,
            n_jobs: 4,
            units_per_extraction: None,
            max_spikes_per_unit: 500,
            load_if_exists: false,
            max_attempts: 3,
            shrink_on_failure: false,
        }
    }
}

impl ExtractionConfig {
    pub fn range_width(&self) -> usize {
        self.units_per_extraction.unwrap_or(self.n_jobs).max(1)
    }

    pub fn nbefore(&self, fs: f64) -> usize {
        (self.ms_before * fs / 1000.0) as usize
    }

    pub fn nafter(&self, fs: f64) -> usize {
        (self.ms_after * fs / 1000.0) as usize
    }
}

// PREPROCESSING ---------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceMode {
    #[default]
    Global,
    None,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceOperator {
    #[default]
    Median,
    Average,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub freq_min: f64,
    /// Defaults to just under Nyquist.
    pub freq_max: Option<f64>,
    pub reference: ReferenceMode,
    pub operator: ReferenceOperator,
    pub margin_ms: f64,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            freq_min: 300.0,
            freq_max: None,
            reference: ReferenceMode::Global,
            operator: ReferenceOperator::Median,
            margin_ms: 5.0,
        }
    }
}

// SORTER ----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SorterConfig {
    pub command: String,
    pub image: String,
    pub params: SorterParams,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            command: "docker".to_string(),
            image: "spikeinterface/kilosort2-compiled-base:latest".to_string(),
            params: SorterParams::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SorterParams {
    pub detect_threshold: f64,
    pub projection_threshold: [f64; 2],
    pub preclust_threshold: f64,
    pub car: bool,
    pub minfr_goodchannels: f64,
    pub keep_good_only: bool,
    pub verbose: bool,
}

impl Default for SorterParams {
    fn default() -> Self {
        Self {
            detect_threshold: 12.0,
            projection_threshold: [18.0, 10.0],
            preclust_threshold: 14.0,
            car: true,
            minfr_goodchannels: 0.0,
            keep_good_only: true,
            verbose: false,
        }
    }
}

// CURATION --------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PeakSign {
    #[default]
    Neg,
    Pos,
    Both,
}

/// A unit is kept only when every metric passes its bound.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MetricThresholds {
    pub min_num_spikes: f64,
    pub max_amplitude_cutoff: f64,
    pub max_isi_violations_ratio: f64,
    pub min_presence_ratio: f64,
    pub min_firing_rate: f64,
}

impl Default for MetricThresholds {
    fn default() -> Self {
        Self {
            min_num_spikes: 200.0,
            max_amplitude_cutoff: 0.1,
            max_isi_violations_ratio: 1.0,
            min_presence_ratio: 0.9,
            min_firing_rate: 0.1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CurationConfig {
    pub thresholds: MetricThresholds,
    pub similarity_threshold: f64,
    pub peak_sign: PeakSign,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            thresholds: MetricThresholds::default(),
            similarity_threshold: 0.7,
            peak_sign: PeakSign::Neg,
        }
    }
}

// PIPELINE --------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    /// Seconds of each recording to process. Whole recording when unset.
    pub time_in_s: Option<f64>,
    pub sorting_folder: PathBuf,
    pub clear_temp_files: bool,
    pub electrode_pitch_um: f64,
    pub electrode_columns: usize,
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            time_in_s: None,
            sorting_folder: PathBuf::from("./sorting"),
            clear_temp_files: true,
            electrode_pitch_um: 17.5,
            electrode_columns: 220,
            workers: 4,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub attempt_log: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            attempt_log: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let e = &self.extraction;
        if e.n_jobs == 0 {
            return Err(PipelineError::Config("extraction.n_jobs must be at least 1".into()));
        }
        if e.units_per_extraction == Some(0) {
            return Err(PipelineError::Config(
                "extraction.units_per_extraction must be at least 1".into(),
            ));
        }
        if e.max_attempts == 0 {
            return Err(PipelineError::Config(
                "extraction.max_attempts must be at least 1".into(),
            ));
        }
        if e.ms_before < 0.0 || e.ms_after < 0.0 || e.ms_before + e.ms_after <= 0.0 {
            return Err(PipelineError::Config(format!(
                "waveform window ms_before={} ms_after={} is empty",
                e.ms_before, e.ms_after
            )));
        }
        if e.max_spikes_per_unit == 0 {
            return Err(PipelineError::Config(
                "extraction.max_spikes_per_unit must be at least 1".into(),
            ));
        }

        let p = &self.preprocessing;
        if p.freq_min <= 0.0 || p.freq_max.map_or(false, |max| max <= p.freq_min) {
            return Err(PipelineError::Config(format!(
                "invalid band: freq_min={} freq_max={:?}",
                p.freq_min, p.freq_max
            )));
        }

        if self.pipeline.workers == 0 {
            return Err(PipelineError::Config("pipeline.workers must be at least 1".into()));
        }
        if self.pipeline.time_in_s.map_or(false, |t| t <= 0.0) {
            return Err(PipelineError::Config("pipeline.time_in_s must be positive".into()));
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config_str = fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&config_str)?;
    config.validate()?;
    Ok(config)
}

pub fn save_config<P: AsRef<Path>>(config: &Config, path: P) -> Result<()> {
    let yaml = serde_yaml::to_string(config)?;
    fs::write(path, yaml)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "extraction:\n  n_jobs: 8\n  load_if_exists: true\ncuration:\n  peak_sign: both\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.extraction.n_jobs, 8);
        assert!(config.extraction.load_if_exists);
        assert_eq!(config.extraction.range_width(), 8);
        assert_eq!(config.extraction.max_attempts, 3);
        assert_eq!(config.curation.peak_sign, PeakSign::Both);
        assert_eq!(config.sorter.params.projection_threshold, [18.0, 10.0]);
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.extraction.units_per_extraction = Some(5);
        config.logging.attempt_log = Some(PathBuf::from("attempts.csv"));
        save_config(&config, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.extraction.range_width(), 5);
        assert_eq!(loaded.logging.attempt_log, Some(PathBuf::from("attempts.csv")));
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = Config::default();
        config.extraction.max_attempts = 0;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn inverted_band_rejected() {
        let mut config = Config::default();
        config.preprocessing.freq_max = Some(100.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn window_samples_follow_sampling_rate() {
        let e = ExtractionConfig::default();
        assert_eq!(e.nbefore(20000.0), 20);
        assert_eq!(e.nafter(20000.0), 40);
    }
}
