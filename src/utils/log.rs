// src/utils/log.rs
use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::span::Entered;
use tracing::{info_span, warn, Span};
use tracing_subscriber::EnvFilter;

use crate::error::{PipelineError, Result};
use crate::recording::UnitId;

pub const ATTEMPT_LOG_HEADERS: [&str; 6] =
    ["timestamp", "first_unit", "last_unit", "state", "location", "detail"];

/// Installs the process-wide fmt subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| PipelineError::Config(format!("invalid log level '{}': {}", level, e)))?;

    // Only the first subscriber installed in a process is kept.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
    Ok(())
}

/// Logging context handed to every component of a run.
///
/// Holds the span that tags events with the run they belong to and, when
/// configured, the CSV ledger that extraction state transitions are appended to.
#[derive(Debug, Clone)]
pub struct LogContext {
    span: Span,
    attempt_log: Option<PathBuf>,
}

impl LogContext {
    pub fn new(run: &str) -> Self {
        Self {
            span: info_span!("mea", run = %run),
            attempt_log: None,
        }
    }

    /// Context that emits nothing. Used by tests and quiet helpers.
    pub fn disabled() -> Self {
        Self {
            span: Span::none(),
            attempt_log: None,
        }
    }

    pub fn with_attempt_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.attempt_log = Some(path.into());
        self
    }

    /// Nested context for one stage of a run; shares the attempt ledger.
    pub fn child(&self, stage: &str) -> Self {
        Self {
            span: info_span!(parent: &self.span, "stage", stage = %stage),
            attempt_log: self.attempt_log.clone(),
        }
    }

    pub fn enter(&self) -> Entered<'_> {
        self.span.enter()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn attempt_log(&self) -> Option<&Path> {
        self.attempt_log.as_deref()
    }

    /// Appends one range state transition to the attempt ledger, if any.
    pub fn record_transition(
        &self,
        first: UnitId,
        last: UnitId,
        state: impl Display,
        location: &Path,
        detail: &str,
    ) {
        let Some(path) = &self.attempt_log else {
            return;
        };
        let row = [
            Utc::now().to_rfc3339(),
            first.to_string(),
            last.to_string(),
            state.to_string(),
            location.display().to_string(),
            detail.to_string(),
        ];
        if let Err(e) = log_csv(path, &ATTEMPT_LOG_HEADERS, &row) {
            let _span = self.enter();
            warn!("Could not append to attempt log {}: {}", path.display(), e);
        }
    }
}

/// Appends a row to a CSV file, writing `headers` first if the file is new.
pub fn log_csv<S: AsRef<str>>(path: &Path, headers: &[&str], row: &[S]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file_is_new = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    if file_is_new && !headers.is_empty() {
        writer.write_record(headers)?;
    }
    writer.write_record(row.iter().map(|s| s.as_ref()))?;
    writer.flush()?;

    Ok(())
}
