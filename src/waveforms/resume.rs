// src/waveforms/resume.rs
//
// Range state machine:  Requested -> {Loaded, Extracting} -> {Resolved, Failed}

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::extractor::WaveformExtractor;
use super::planner::ExtractionPlanner;
use super::shard_store::{bounds, Shard, ShardLoad, UnitRangeStore};
use crate::config::ExtractionConfig;
use crate::error::{PipelineError, Result};
use crate::recording::{select_units, SharedRecording, SharedSorting, UnitId};
use crate::utils::log::LogContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeState {
    Requested,
    Loaded,
    Extracting,
    Resolved,
    Failed,
}

impl fmt::Display for RangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RangeState::Requested => "Requested",
            RangeState::Loaded => "Loaded",
            RangeState::Extracting => "Extracting",
            RangeState::Resolved => "Resolved",
            RangeState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub first: UnitId,
    pub last: UnitId,
    pub state: RangeState,
    pub location: PathBuf,
}

#[derive(Debug, Default)]
pub struct ExtractionReport {
    /// Resolved shards in unit order; together they cover every unit once.
    pub shards: Vec<Shard>,
    pub transitions: Vec<Transition>,
    pub loaded: usize,
    pub extracted: usize,
    pub failures: usize,
}

impl ExtractionReport {
    /// States visited by the range `[first, last]`, in order.
    pub fn states_of(&self, first: UnitId, last: UnitId) -> Vec<RangeState> {
        self.transitions
            .iter()
            .filter(|t| t.first == first && t.last == last)
            .map(|t| t.state)
            .collect()
    }

    fn record(&mut self, log: &LogContext, range: &[UnitId], state: RangeState, location: &Path, detail: &str) {
        let (first, last) = bounds(range);
        log.record_transition(first, last, state, location, detail);
        self.transitions.push(Transition {
            first,
            last,
            state,
            location: location.to_path_buf(),
        });
    }
}

// -----------------------------------------------------------------------------
// LOOKUP STRATEGIES
// -----------------------------------------------------------------------------

/// Everything a strategy may consult for the range at the planner's cursor.
pub struct Attempt<'a> {
    pub planner: &'a ExtractionPlanner,
    /// Width of a fresh extraction; narrower than the planner's after failures
    /// when shrinking is enabled.
    pub width: usize,
    pub store: &'a UnitRangeStore,
    pub extractor: &'a dyn WaveformExtractor,
    pub recording: &'a SharedRecording,
    pub sorting: &'a SharedSorting,
    pub config: &'a ExtractionConfig,
    pub log: &'a LogContext,
}

/// One way of resolving the range at the cursor. `Ok(None)` passes to the
/// next strategy; an error is a failed attempt.
pub trait LookupStrategy {
    fn name(&self) -> &'static str;

    fn resolve(&self, attempt: &Attempt<'_>, report: &mut ExtractionReport) -> Result<Option<Shard>>;
}

/// Accepts a loaded shard only if it holds exactly the expected units.
fn accept(load: ShardLoad, expected: &[UnitId], log: &LogContext) -> Option<Shard> {
    match load {
        ShardLoad::Loaded(shard) if shard.units == expected => Some(shard),
        ShardLoad::Loaded(shard) => {
            warn!(
                "Shard {} lists units {:?}, expected {:?}; ignoring it",
                shard.folder.display(),
                shard.units,
                expected
            );
            None
        }
        ShardLoad::Corrupt(reason) => {
            let _span = log.enter();
            warn!("Ignoring corrupt shard: {}", reason);
            None
        }
        ShardLoad::NotFound => None,
    }
}

/// Widest cached multi-unit range starting at the cursor.
pub struct WideLookup;

impl LookupStrategy for WideLookup {
    fn name(&self) -> &'static str {
        "wide lookup"
    }

    fn resolve(&self, attempt: &Attempt<'_>, report: &mut ExtractionReport) -> Result<Option<Shard>> {
        for range in attempt.planner.wide_candidates() {
            let (first, last) = bounds(range);
            let folder = attempt.store.locate_wide(first, last);
            if let Some(shard) = accept(attempt.store.load(&folder), range, attempt.log) {
                info!("Waveforms for units {} to {} loaded from {}", first, last, folder.display());
                report.record(attempt.log, range, RangeState::Loaded, &folder, "");
                return Ok(Some(shard));
            }
        }
        Ok(None)
    }
}

/// Cached single-unit shard for the unit at the cursor.
pub struct SingleLookup;

impl LookupStrategy for SingleLookup {
    fn name(&self) -> &'static str {
        "single lookup"
    }

    fn resolve(&self, attempt: &Attempt<'_>, report: &mut ExtractionReport) -> Result<Option<Shard>> {
        let range = attempt.planner.range_of(1);
        let Some(&unit) = range.first() else {
            return Ok(None);
        };
        let folder = attempt.store.locate_single(unit);
        match accept(attempt.store.load(&folder), range, attempt.log) {
            Some(shard) => {
                info!("Waveform for unit {} loaded from {}", unit, folder.display());
                report.record(attempt.log, range, RangeState::Loaded, &folder, "");
                Ok(Some(shard))
            }
            None => Ok(None),
        }
    }
}

/// Extracts the next `width` units into a fresh shard.
pub struct FreshExtract;

impl LookupStrategy for FreshExtract {
    fn name(&self) -> &'static str {
        "fresh extraction"
    }

    fn resolve(&self, attempt: &Attempt<'_>, report: &mut ExtractionReport) -> Result<Option<Shard>> {
        let range = attempt.planner.range_of(attempt.width);
        let (first, last) = bounds(range);
        let folder = attempt.store.locate(range);

        info!("Extracting waveforms for units {} to {} to {}", first, last, folder.display());
        report.record(attempt.log, range, RangeState::Extracting, &folder, "");

        // A stale manifest must not outlive the data it described.
        attempt.store.delete(&folder)?;

        let sorting = select_units(attempt.sorting, range);
        let summary = attempt
            .extractor
            .extract(attempt.recording, &sorting, &folder, attempt.config)
            .map_err(|e| match e {
                PipelineError::ExtractionFailed { .. } => e,
                other => PipelineError::ExtractionFailed {
                    first,
                    last,
                    reason: other.to_string(),
                },
            })?;
        let shard = attempt.store.write(range, &summary)?;
        info!("Waveforms extracted for units {} to {}", first, last);
        report.extracted += 1;
        Ok(Some(shard))
    }
}

// -----------------------------------------------------------------------------
// DRIVER
// -----------------------------------------------------------------------------

pub struct ResumableExtractor<'a> {
    store: &'a UnitRangeStore,
    extractor: &'a dyn WaveformExtractor,
    recording: &'a SharedRecording,
    sorting: &'a SharedSorting,
    config: &'a ExtractionConfig,
    log: &'a LogContext,
}

impl<'a> ResumableExtractor<'a> {
    pub fn new(
        store: &'a UnitRangeStore,
        extractor: &'a dyn WaveformExtractor,
        recording: &'a SharedRecording,
        sorting: &'a SharedSorting,
        config: &'a ExtractionConfig,
        log: &'a LogContext,
    ) -> Self {
        Self {
            store,
            extractor,
            recording,
            sorting,
            config,
            log,
        }
    }

    fn strategies(&self) -> Vec<Box<dyn LookupStrategy>> {
        if self.config.load_if_exists {
            vec![Box::new(WideLookup), Box::new(SingleLookup), Box::new(FreshExtract)]
        } else {
            vec![Box::new(FreshExtract)]
        }
    }

    /// Resolves every range the planner hands out, in order.
    ///
    /// A failed fresh extraction leaves the cursor where it was, so the same
    /// range is attempted again, up to `max_attempts` times in total.
    pub fn run(&self, planner: &mut ExtractionPlanner) -> Result<ExtractionReport> {
        let _span = self.log.enter();
        let strategies = self.strategies();
        let max_attempts = self.config.max_attempts.max(1);
        let mut report = ExtractionReport::default();
        let mut width = planner.width();
        let mut attempts: u32 = 0;

        info!("Total number of units: {}", planner.unit_ids().len());

        while !planner.is_done() {
            let requested = planner.range_of(width).to_vec();
            report.record(
                self.log,
                &requested,
                RangeState::Requested,
                &self.store.locate(&requested),
                "",
            );

            let attempt = Attempt {
                planner: &*planner,
                width,
                store: self.store,
                extractor: self.extractor,
                recording: self.recording,
                sorting: self.sorting,
                config: self.config,
                log: self.log,
            };

            match resolve_with(&strategies, &attempt, &mut report) {
                Ok(Some(shard)) => {
                    let loaded = report
                        .transitions
                        .last()
                        .map_or(false, |t| t.state == RangeState::Loaded);
                    if loaded {
                        report.loaded += 1;
                    }
                    report.record(self.log, &shard.units, RangeState::Resolved, &shard.folder, "");
                    planner.advance(shard.units.len());
                    report.shards.push(shard);
                    width = planner.width();
                    attempts = 0;
                }
                Ok(None) => {
                    // FreshExtract always answers; reaching here means no strategy ran.
                    let (first, last) = bounds(&requested);
                    return Err(PipelineError::ExtractionFailed {
                        first,
                        last,
                        reason: "no lookup strategy resolved the range".into(),
                    });
                }
                Err(e) => {
                    attempts += 1;
                    report.failures += 1;
                    let failed = planner.range_of(width).to_vec();
                    let (first, last) = bounds(&failed);
                    let folder = self.store.locate(&failed);
                    warn!(
                        "Attempt {}/{} for units {} to {} at {} failed: {}",
                        attempts,
                        max_attempts,
                        first,
                        last,
                        folder.display(),
                        e
                    );
                    report.record(self.log, &failed, RangeState::Failed, &folder, &e.to_string());

                    if let Err(cleanup) = self.store.delete(&folder) {
                        warn!("Could not remove failed shard {}: {}", folder.display(), cleanup);
                    }
                    if attempts >= max_attempts {
                        return Err(PipelineError::ExhaustedRetries {
                            first,
                            last,
                            attempts,
                        });
                    }
                    if self.config.shrink_on_failure {
                        width = (width / 2).max(1);
                    }
                }
            }
        }

        info!(
            "All {} units resolved: {} shards loaded, {} extracted, {} failed attempts",
            planner.unit_ids().len(),
            report.loaded,
            report.extracted,
            report.failures
        );
        Ok(report)
    }
}

fn resolve_with(
    strategies: &[Box<dyn LookupStrategy>],
    attempt: &Attempt<'_>,
    report: &mut ExtractionReport,
) -> Result<Option<Shard>> {
    for strategy in strategies {
        if let Some(shard) = strategy.resolve(attempt, report)? {
            tracing::debug!("Range resolved by {}", strategy.name());
            return Ok(Some(shard));
        }
    }
    Ok(None)
}
