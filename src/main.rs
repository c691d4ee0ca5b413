use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use mea_pipeline::config::{load_config, Config};
use mea_pipeline::curation::{read_metrics_csv, remove_violated_units, CsvMetricsSource};
use mea_pipeline::discovery::maxwell::{count_wells_and_recs, BinaryFolderReader, Device};
use mea_pipeline::discovery::{extract_raw_h5_filepaths, extract_recording_details};
use mea_pipeline::pipeline::parallel::routine_parallel;
use mea_pipeline::pipeline::BlockPipeline;
use mea_pipeline::recording::binary::{read_binary_recording, write_binary_recording};
use mea_pipeline::recording::synthetic::{generate, SyntheticConfig};
use mea_pipeline::recording::{Recording, SharedRecording, SharedSorting};
use mea_pipeline::sorting::{read_spike_table, write_spike_table, ContainerSorter, SPIKES_FILE};
use mea_pipeline::utils::log::{init_tracing, LogContext};
use mea_pipeline::waveforms::UnitByUnitExtraction;

#[derive(Parser, Debug)]
#[command(name = "mea-pipeline")]
#[command(about = "Spike sorting and waveform extraction for MEA recordings")]
#[command(version)]
struct Args {
    /// YAML configuration; defaults apply to anything it leaves out
    #[arg(short, long, global = true, env = "MEA_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides logging.level from the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Find data.raw.h5 files and print what their paths say about them
    Discover {
        #[arg(required = true)]
        directories: Vec<PathBuf>,
    },
    /// Unit-by-unit waveform extraction of a binary recording folder
    Extract {
        #[arg(long)]
        recording: PathBuf,
        /// Spike table with columns unit_id,segment,frame
        #[arg(long)]
        spikes: PathBuf,
        #[arg(long)]
        target: PathBuf,
        /// Reuse shards left by an earlier run
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        units_per_extraction: Option<usize>,
        #[arg(long)]
        n_jobs: Option<usize>,
    },
    /// Units of a metrics table that pass the curation thresholds
    Filter {
        #[arg(long)]
        metrics: PathBuf,
    },
    /// Write a synthetic recording and its ground-truth spike table
    Demo {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 6)]
        units: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Process one block of a folder of exported recordings
    Block {
        #[arg(long)]
        raw: PathBuf,
        #[arg(long)]
        rec: usize,
        #[arg(long)]
        well: Option<usize>,
        #[arg(long)]
        metrics: PathBuf,
        /// Overrides pipeline.sorting_folder
        #[arg(long)]
        sorting_folder: Option<PathBuf>,
    },
    /// Process every block of one well, each in its own process
    Batch {
        #[arg(long)]
        raw: PathBuf,
        #[arg(long)]
        well: Option<usize>,
        #[arg(long)]
        metrics: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    init_tracing(&config.logging.level)?;

    let mut log = LogContext::new(env!("CARGO_PKG_NAME"));
    if let Some(path) = &config.logging.attempt_log {
        log = log.with_attempt_log(path);
    }
    info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    match args.command {
        Cmd::Discover { directories } => discover(&directories, &log),
        Cmd::Extract {
            recording,
            spikes,
            target,
            resume,
            units_per_extraction,
            n_jobs,
        } => {
            config.extraction.load_if_exists |= resume;
            if let Some(n) = units_per_extraction {
                config.extraction.units_per_extraction = Some(n);
            }
            if let Some(n) = n_jobs {
                config.extraction.n_jobs = n;
            }
            config.validate()?;
            extract(&recording, &spikes, &target, &config, &log)
        }
        Cmd::Filter { metrics } => filter(&metrics, &config, &log),
        Cmd::Demo { out, units, seed } => demo(&out, units, seed),
        Cmd::Block {
            raw,
            rec,
            well,
            metrics,
            sorting_folder,
        } => {
            if let Some(folder) = sorting_folder {
                config.pipeline.sorting_folder = folder;
            }
            block(&raw, rec, well, &metrics, &config, &log)
        }
        Cmd::Batch { raw, well, metrics } => batch(&raw, well, &metrics, args.config.as_deref(), &config, &log),
    }
}

fn discover(directories: &[PathBuf], log: &LogContext) -> Result<()> {
    let paths = extract_raw_h5_filepaths(directories, log);
    let details = extract_recording_details(&paths, log);
    println!("{}", serde_json::to_string_pretty(&details)?);
    eprintln!("{}", format!("{} recordings found", details.len()).green());
    Ok(())
}

fn extract(recording: &Path, spikes: &Path, target: &Path, config: &Config, log: &LogContext) -> Result<()> {
    let recording: SharedRecording = Arc::new(
        read_binary_recording(recording)
            .with_context(|| format!("reading recording {}", recording.display()))?,
    );
    let sorting: SharedSorting = Arc::new(read_spike_table(
        spikes,
        recording.sampling_frequency(),
        recording.num_segments(),
    )?);

    let outcome = UnitByUnitExtraction::new(recording, sorting, target)
        .config(config.extraction.clone())
        .log(log.clone())
        .run()?;

    println!(
        "{} {} units in {}",
        "Waveform store ready:".green().bold(),
        outcome.store.unit_ids().len(),
        target.display()
    );
    match outcome.report {
        Some(report) => {
            println!("  ranges loaded:    {}", report.loaded.to_string().cyan());
            println!("  ranges extracted: {}", report.extracted.to_string().cyan());
            if report.failures > 0 {
                println!("  failed attempts:  {}", report.failures.to_string().red());
            }
        }
        None => println!("  {}", "existing store reused".yellow()),
    }
    Ok(())
}

fn filter(metrics: &Path, config: &Config, log: &LogContext) -> Result<()> {
    let table = read_metrics_csv(metrics).with_context(|| format!("reading {}", metrics.display()))?;
    let kept = remove_violated_units(&table, &config.curation.thresholds, log);
    println!("{}", serde_json::to_string(&kept)?);
    eprintln!(
        "{}",
        format!("{} of {} units kept", kept.len(), table.len()).green()
    );
    Ok(())
}

fn demo(out: &Path, units: usize, seed: u64) -> Result<()> {
    let data = generate(&SyntheticConfig {
        num_units: units,
        seed,
        ..SyntheticConfig::default()
    })?;
    let recording_dir = out.join("recording");
    write_binary_recording(&data.recording, &recording_dir)?;
    write_spike_table(&data.sorting, out.join(SPIKES_FILE))?;
    println!(
        "{} {} and {}",
        "Wrote".green().bold(),
        recording_dir.display(),
        out.join(SPIKES_FILE).display()
    );
    Ok(())
}

fn block(
    raw: &Path,
    rec: usize,
    well: Option<usize>,
    metrics: &Path,
    config: &Config,
    log: &LogContext,
) -> Result<()> {
    let sorter = ContainerSorter::from_config(&config.sorter);
    let source = CsvMetricsSource::new(metrics);
    let pipeline = BlockPipeline::new(&BinaryFolderReader, &sorter, &source, config, log);
    let result = pipeline.process_block(raw, rec, well)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn batch(
    raw: &Path,
    well: Option<usize>,
    metrics: &Path,
    config_path: Option<&Path>,
    config: &Config,
    log: &LogContext,
) -> Result<()> {
    let counts = count_wells_and_recs(&BinaryFolderReader, raw, log);
    let num_recordings = match (counts.device, well) {
        (None, _) => bail!("no recordings found under {}", raw.display()),
        (Some(Device::MaxOne), _) => counts.rec_counts.first().copied().unwrap_or(0),
        (Some(Device::MaxTwo), Some(well)) => *counts
            .rec_counts
            .get(well)
            .with_context(|| format!("well {} not found, {} wells", well, counts.num_wells()))?,
        (Some(Device::MaxTwo), None) => bail!("MaxTwo recording, pass --well"),
    };

    let exe = std::env::current_exe()?;
    let statuses = routine_parallel(
        num_recordings,
        config.pipeline.workers,
        |rec| {
            let mut command = Command::new(&exe);
            if let Some(path) = config_path {
                command.arg("--config").arg(path);
            }
            command
                .arg("block")
                .arg("--raw")
                .arg(raw)
                .arg("--rec")
                .arg(rec.to_string())
                .arg("--metrics")
                .arg(metrics)
                .arg("--sorting-folder")
                .arg(config.pipeline.sorting_folder.join(format!("rec{:04}", rec)));
            if let Some(well) = well {
                command.arg("--well").arg(well.to_string());
            }
            command
        },
        log,
    )?;

    for status in &statuses {
        let label = if status.success { "ok".green() } else { "failed".red() };
        println!("rec{:04}: {}", status.rec_num, label);
    }
    Ok(())
}
