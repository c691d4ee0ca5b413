// src/waveforms/merge.rs
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::shard_store::{Shard, UnitRangeStore};
use super::store::WaveformStore;
use super::{sampled_index_file, waveforms_file, PARAMS_FILE};
use crate::config::ExtractionConfig;
use crate::error::{PipelineError, Result};
use crate::recording::UnitId;
use crate::utils::log::LogContext;

/// Folds resolved shards into one waveform store at the target location.
pub struct ShardMerger<'a> {
    shards: &'a UnitRangeStore,
    log: &'a LogContext,
}

impl<'a> ShardMerger<'a> {
    pub fn new(shards: &'a UnitRangeStore, log: &'a LogContext) -> Self {
        Self { shards, log }
    }

    /// Shards are only deleted once every unit has been copied. On
    /// `MergeAborted` they are left in place so the merge can be repeated
    /// without extracting again.
    pub fn merge(&self, shards: &[Shard], target: &Path, config: &ExtractionConfig) -> Result<WaveformStore> {
        let _span = self.log.enter();
        let storage = Arc::clone(self.shards.storage());
        let abort = |reason: String| PipelineError::MergeAborted {
            target: target.to_path_buf(),
            reason,
        };

        if let Some(shard) = shards
            .iter()
            .find(|s| !storage.exists(&s.folder.join(PARAMS_FILE)))
        {
            return Err(abort(format!(
                "parameter file missing in shard {}",
                shard.folder.display()
            )));
        }

        // First shard wins when a unit shows up twice.
        let mut seen: BTreeSet<UnitId> = BTreeSet::new();
        let mut plan: Vec<(&Shard, UnitId)> = Vec::new();
        for shard in shards {
            for &unit in &shard.units {
                if seen.insert(unit) {
                    plan.push((shard, unit));
                } else {
                    warn!(
                        "Unit {} from {} already merged, skipping",
                        unit,
                        shard.folder.display()
                    );
                }
            }
        }
        let unit_ids: Vec<UnitId> = seen.into_iter().collect();

        info!("Generating waveform store for {} units at {}", unit_ids.len(), target.display());
        let mut store = WaveformStore::create(
            Arc::clone(&storage),
            target,
            unit_ids,
            config.ms_before,
            config.ms_after,
            config.sparse,
        )?;

        info!("Copying and merging waveforms from {} shards", shards.len());
        for (shard, unit) in plan {
            for (from, to) in [
                (waveforms_file(&shard.folder, unit), waveforms_file(target, unit)),
                (sampled_index_file(&shard.folder, unit), sampled_index_file(target, unit)),
            ] {
                if !storage.exists(&from) {
                    return Err(abort(format!("{} is missing", from.display())));
                }
                storage.copy(&from, &to)?;
            }
            let params = target.join(PARAMS_FILE);
            if !storage.exists(&params) {
                storage.copy(&shard.folder.join(PARAMS_FILE), &params)?;
            }
        }
        info!("Unit waveforms copied");

        store.read_params()?;
        store.get_all_templates()?;
        store.save()?;

        info!("Deleting temporary shards under {}", self.shards.root().display());
        for shard in shards {
            self.shards.delete(&shard.folder)?;
        }
        self.shards.clear()?;

        info!("Waveform store saved to {}", target.display());
        Ok(store)
    }
}
