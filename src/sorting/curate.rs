// src/sorting/curate.rs
use std::sync::Arc;

use tracing::info;

use crate::recording::{select_units, InMemorySorting, Recording, SharedSorting, Sorting, UnitId};
use crate::utils::log::LogContext;

pub fn remove_empty_units(sorting: &SharedSorting, log: &LogContext) -> SharedSorting {
    let keep: Vec<UnitId> = sorting
        .unit_ids()
        .into_iter()
        .filter(|&unit| sorting.num_spikes(unit) > 0)
        .collect();
    let _span = log.enter();
    info!(
        "Removed {} empty units, {} left",
        sorting.unit_ids().len() - keep.len(),
        keep.len()
    );
    select_units(sorting, &keep)
}

/// Drops spikes at or beyond the end of their segment.
pub fn remove_excess_spikes(sorting: &SharedSorting, recording: &dyn Recording, log: &LogContext) -> SharedSorting {
    let mut removed = 0;
    let trains = sorting
        .unit_ids()
        .into_iter()
        .map(|unit| {
            let segments = (0..sorting.num_segments())
                .map(|segment| {
                    let limit = recording.num_samples(segment);
                    let train = sorting.spike_train(unit, segment);
                    let before = train.len();
                    let kept: Vec<usize> = train.into_iter().filter(|&f| f < limit).collect();
                    removed += before - kept.len();
                    kept
                })
                .collect();
            (unit, segments)
        })
        .collect();
    let _span = log.enter();
    if removed > 0 {
        info!("Removed {} spikes beyond the recording", removed);
    }
    Arc::new(InMemorySorting::with_segments(
        sorting.sampling_frequency(),
        sorting.num_segments(),
        trains,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::InMemoryRecording;
    use std::collections::BTreeMap;

    fn sorting() -> SharedSorting {
        let mut trains = BTreeMap::new();
        trains.insert(0, vec![vec![1, 4, 9, 10]]);
        trains.insert(1, vec![vec![]]);
        trains.insert(2, vec![vec![12]]);
        Arc::new(InMemorySorting::new(100.0, trains))
    }

    #[test]
    fn empty_units_disappear() {
        let curated = remove_empty_units(&sorting(), &LogContext::disabled());
        assert_eq!(curated.unit_ids(), vec![0, 2]);
    }

    #[test]
    fn spikes_past_the_end_are_dropped() {
        let recording =
            InMemoryRecording::new(100.0, vec!["0".into()], vec![[0.0, 0.0]], vec![vec![0.0; 10]]).unwrap();
        let curated = remove_excess_spikes(&sorting(), &recording, &LogContext::disabled());
        assert_eq!(curated.spike_train(0, 0), vec![1, 4, 9]);
        assert!(curated.spike_train(2, 0).is_empty());
        assert_eq!(curated.unit_ids(), vec![0, 1, 2]);
    }
}
