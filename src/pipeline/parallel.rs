// src/pipeline/parallel.rs
//
// Blocks share nothing, so batches run them as separate child processes.
// The rayon pool only bounds how many children are alive at once.

use std::process::Command;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info};

use crate::error::{PipelineError, Result};
use crate::utils::log::LogContext;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BlockStatus {
    pub rec_num: usize,
    pub success: bool,
    /// Exit code, `None` if the child was killed by a signal or never started.
    pub code: Option<i32>,
    pub error: Option<String>,
}

/// Runs `command_for(rec_num)` for every recording, at most `workers` at a
/// time. Results are in recording order.
pub fn routine_parallel<F>(
    num_recordings: usize,
    workers: usize,
    command_for: F,
    log: &LogContext,
) -> Result<Vec<BlockStatus>>
where
    F: Fn(usize) -> Command + Sync,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| PipelineError::Config(format!("could not start {} workers: {}", workers, e)))?;

    {
        let _span = log.enter();
        info!("Processing {} blocks on {} workers", num_recordings, workers.max(1));
    }

    let statuses = pool.install(|| {
        (0..num_recordings)
            .into_par_iter()
            .map(|rec_num| run_block(rec_num, command_for(rec_num), log))
            .collect::<Vec<_>>()
    });

    let failed = statuses.iter().filter(|s| !s.success).count();
    let _span = log.enter();
    if failed > 0 {
        error!("{} of {} blocks failed", failed, statuses.len());
    } else {
        info!("All {} blocks finished", statuses.len());
    }
    Ok(statuses)
}

fn run_block(rec_num: usize, mut command: Command, log: &LogContext) -> BlockStatus {
    let _span = log.enter();
    match command.status() {
        Ok(status) => {
            if !status.success() {
                error!("Block {} exited with {}", rec_num, status);
            }
            BlockStatus {
                rec_num,
                success: status.success(),
                code: status.code(),
                error: None,
            }
        }
        Err(e) => {
            error!("Block {} could not start: {}", rec_num, e);
            BlockStatus {
                rec_num,
                success: false,
                code: None,
                error: Some(e.to_string()),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_recording_order() {
        let statuses = routine_parallel(
            4,
            2,
            |rec_num| {
                let mut command = Command::new("sh");
                command.arg("-c").arg(format!("exit {}", rec_num % 2));
                command
            },
            &LogContext::disabled(),
        )
        .unwrap();

        let codes: Vec<Option<i32>> = statuses.iter().map(|s| s.code).collect();
        assert_eq!(codes, vec![Some(0), Some(1), Some(0), Some(1)]);
        assert!(statuses[0].success);
        assert!(!statuses[3].success);
    }

    #[test]
    fn missing_program_is_reported_per_block() {
        let statuses =
            routine_parallel(1, 1, |_| Command::new("/nonexistent/block-runner"), &LogContext::disabled())
                .unwrap();
        assert!(!statuses[0].success);
        assert!(statuses[0].error.is_some());
    }
}
