mod common;

use std::path::Path;
use std::sync::Arc;

use mea_pipeline::recording::{select_units, InMemorySorting, SharedSorting, Sorting, UnitId};
use mea_pipeline::utils::log::LogContext;
use mea_pipeline::waveforms::{
    temp_root, ExtractionPlanner, MemoryStorage, RangeState, ResumableExtractor, ShardLoad, ShardMerger,
    waveforms_file, SnippetExtractor, Storage, UnitByUnitExtraction, UnitRangeStore, WaveformExtractor, MANIFEST_FILE,
    PARAMS_FILE,
};
use mea_pipeline::PipelineError;

use common::{config, synthetic, CountingExtractor, FlakyExtractor};

const TARGET: &str = "/out/waveforms";

fn memory() -> (Arc<MemoryStorage>, Arc<dyn Storage>) {
    let storage = Arc::new(MemoryStorage::new());
    let shared: Arc<dyn Storage> = storage.clone();
    (storage, shared)
}

fn flatten(shards: &[mea_pipeline::waveforms::Shard]) -> Vec<UnitId> {
    shards.iter().flat_map(|s| s.units.iter().copied()).collect()
}

#[test]
fn six_units_in_threes_take_two_extractions() {
    let (recording, sorting) = synthetic(6);
    let (memory, storage) = memory();
    let extractor = Arc::new(CountingExtractor::new(storage.clone()));

    let outcome = UnitByUnitExtraction::new(recording, sorting, TARGET)
        .storage(storage.clone())
        .extractor(extractor.clone())
        .config(config(3, false))
        .run()
        .unwrap();

    assert_eq!(extractor.calls(), 2);
    assert_eq!(extractor.ranges(), vec![vec![0, 1, 2], vec![3, 4, 5]]);
    assert_eq!(outcome.store.unit_ids(), &[0, 1, 2, 3, 4, 5]);
    let report = outcome.report.unwrap();
    assert_eq!((report.extracted, report.loaded, report.failures), (2, 0, 0));
    assert!(!memory.exists(&temp_root(Path::new(TARGET))));
}

#[test]
fn transient_failure_is_retried_at_the_same_range() {
    let (recording, sorting) = synthetic(6);
    let (_, storage) = memory();
    let extractor = Arc::new(FlakyExtractor::new(storage.clone(), 3, Some(1)));

    let outcome = UnitByUnitExtraction::new(recording, sorting, TARGET)
        .storage(storage)
        .extractor(extractor)
        .config(config(3, false))
        .run()
        .unwrap();

    assert_eq!(outcome.store.unit_ids().len(), 6);
    let report = outcome.report.unwrap();
    assert_eq!(report.failures, 1);
    let outcomes: Vec<RangeState> = report
        .states_of(3, 5)
        .into_iter()
        .filter(|s| matches!(s, RangeState::Failed | RangeState::Resolved))
        .collect();
    assert_eq!(outcomes, vec![RangeState::Failed, RangeState::Resolved]);
    assert_eq!(
        report.states_of(0, 2),
        vec![RangeState::Requested, RangeState::Extracting, RangeState::Resolved]
    );
}

#[test]
fn retries_stop_at_the_attempt_cap() {
    let (recording, sorting) = synthetic(6);
    let (memory, storage) = memory();
    let extractor = Arc::new(FlakyExtractor::new(storage.clone(), 3, None));
    let mut cfg = config(3, false);
    cfg.max_attempts = 2;

    let err = UnitByUnitExtraction::new(recording, sorting, TARGET)
        .storage(storage.clone())
        .extractor(extractor)
        .config(cfg)
        .run()
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::ExhaustedRetries { first: 3, last: 5, attempts: 2 }
    ));
    let store = UnitRangeStore::new(storage, Path::new(TARGET));
    assert!(matches!(store.load(&store.locate_wide(0, 2)), ShardLoad::Loaded(_)));
    assert!(!memory.exists(&store.locate_wide(3, 5)));
}

#[test]
fn shrinking_isolates_the_failing_range() {
    let (recording, sorting) = synthetic(6);
    let (_, storage) = memory();
    let extractor = Arc::new(FlakyExtractor::new(storage.clone(), 3, None).only_wide());
    let mut cfg = config(3, false);
    cfg.shrink_on_failure = true;

    let outcome = UnitByUnitExtraction::new(recording, sorting, TARGET)
        .storage(storage)
        .extractor(extractor)
        .config(cfg)
        .run()
        .unwrap();

    let report = outcome.report.unwrap();
    let shards: Vec<Vec<UnitId>> = report.shards.iter().map(|s| s.units.clone()).collect();
    assert_eq!(shards, vec![vec![0, 1, 2], vec![3], vec![4, 5]]);
    assert_eq!(report.states_of(3, 3).last(), Some(&RangeState::Resolved));
}

#[test]
fn ranges_partition_the_unit_set_for_every_width() {
    let (recording, sorting) = synthetic(7);
    for width in 1..=8 {
        let (_, storage) = memory();
        let store = UnitRangeStore::new(storage.clone(), Path::new(TARGET));
        let extractor = SnippetExtractor::new(storage);
        let cfg = config(width, false);
        let log = LogContext::disabled();
        let mut planner = ExtractionPlanner::new(sorting.unit_ids(), width).unwrap();

        let report = ResumableExtractor::new(&store, &extractor, &recording, &sorting, &cfg, &log)
            .run(&mut planner)
            .unwrap();

        assert_eq!(flatten(&report.shards), sorting.unit_ids(), "width {}", width);
        assert!(report.shards.iter().all(|s| s.units.len() <= width));
        assert_eq!(report.extracted, (7 + width - 1) / width);
    }
}

#[test]
fn resuming_a_finished_run_extracts_nothing() {
    let (recording, sorting) = synthetic(6);
    let (_, storage) = memory();
    let store = UnitRangeStore::new(storage.clone(), Path::new(TARGET));
    let log = LogContext::disabled();

    let first = SnippetExtractor::new(storage.clone());
    let cfg = config(4, false);
    let mut planner = ExtractionPlanner::new(sorting.unit_ids(), 4).unwrap();
    let report = ResumableExtractor::new(&store, &first, &recording, &sorting, &cfg, &log)
        .run(&mut planner)
        .unwrap();
    let manifests = |shards: &[mea_pipeline::waveforms::Shard]| -> Vec<Vec<u8>> {
        shards
            .iter()
            .map(|s| storage.read(&s.folder.join(MANIFEST_FILE)).unwrap())
            .collect()
    };
    let before = manifests(&report.shards);

    let counting = CountingExtractor::new(storage.clone());
    let cfg = config(4, true);
    let mut planner = ExtractionPlanner::new(sorting.unit_ids(), 4).unwrap();
    let resumed = ResumableExtractor::new(&store, &counting, &recording, &sorting, &cfg, &log)
        .run(&mut planner)
        .unwrap();

    assert_eq!(counting.calls(), 0);
    assert_eq!(resumed.loaded, 2);
    assert_eq!(resumed.extracted, 0);
    assert_eq!(manifests(&resumed.shards), before);
    assert_eq!(flatten(&resumed.shards), sorting.unit_ids());
}

#[test]
fn widest_cached_range_wins() {
    let (recording, sorting) = synthetic(10);
    let (_, storage) = memory();
    let store = UnitRangeStore::new(storage.clone(), Path::new(TARGET));
    let snippets = SnippetExtractor::new(storage.clone());
    let cfg = config(5, true);

    let all: Vec<UnitId> = (0..10).collect();
    for range in [&all[..], &all[..5], &all[5..]] {
        let folder = store.locate(range);
        let summary = snippets
            .extract(&recording, &select_units(&sorting, range), &folder, &cfg)
            .unwrap();
        store.write(range, &summary).unwrap();
    }

    let counting = CountingExtractor::new(storage);
    let log = LogContext::disabled();
    let mut planner = ExtractionPlanner::new(sorting.unit_ids(), 5).unwrap();
    let report = ResumableExtractor::new(&store, &counting, &recording, &sorting, &cfg, &log)
        .run(&mut planner)
        .unwrap();

    assert_eq!(counting.calls(), 0);
    assert_eq!(report.shards.len(), 1);
    assert_eq!(report.shards[0].folder, store.locate_wide(0, 9));
    assert_eq!(report.states_of(0, 9), vec![RangeState::Loaded, RangeState::Resolved]);
}

#[test]
fn shard_without_manifest_is_extracted_again() {
    let (recording, sorting) = synthetic(3);
    let (_, storage) = memory();
    let store = UnitRangeStore::new(storage.clone(), Path::new(TARGET));
    let cfg = config(3, true);
    let range: Vec<UnitId> = vec![0, 1, 2];
    let folder = store.locate(&range);

    // Crash between the data and the manifest.
    SnippetExtractor::new(storage.clone())
        .extract(&recording, &sorting, &folder, &cfg)
        .unwrap();
    assert!(storage.exists(&folder.join(PARAMS_FILE)));
    assert_eq!(store.load(&folder), ShardLoad::NotFound);

    storage.write(&folder.join(MANIFEST_FILE), b"{ not json").unwrap();
    assert!(matches!(store.load(&folder), ShardLoad::Corrupt(_)));

    let counting = CountingExtractor::new(storage.clone());
    let log = LogContext::disabled();
    let mut planner = ExtractionPlanner::new(sorting.unit_ids(), 3).unwrap();
    let report = ResumableExtractor::new(&store, &counting, &recording, &sorting, &cfg, &log)
        .run(&mut planner)
        .unwrap();
    assert_eq!(counting.calls(), 1);
    assert!(matches!(store.load(&folder), ShardLoad::Loaded(_)));
    assert_eq!(report.loaded, 0);
}

#[test]
fn tail_units_resume_from_single_shards() {
    let (recording, sorting) = synthetic(5);
    let (_, storage) = memory();
    let store = UnitRangeStore::new(storage.clone(), Path::new(TARGET));
    let log = LogContext::disabled();

    // Width 2 over five units leaves unit 4 in a single-unit shard.
    let first = SnippetExtractor::new(storage.clone());
    let mut planner = ExtractionPlanner::new(sorting.unit_ids(), 2).unwrap();
    ResumableExtractor::new(&store, &first, &recording, &sorting, &config(2, false), &log)
        .run(&mut planner)
        .unwrap();
    assert!(matches!(store.load(&store.locate_single(4)), ShardLoad::Loaded(_)));

    let counting = CountingExtractor::new(storage);
    let mut planner = ExtractionPlanner::new(sorting.unit_ids(), 2).unwrap();
    let report = ResumableExtractor::new(&store, &counting, &recording, &sorting, &config(2, true), &log)
        .run(&mut planner)
        .unwrap();
    assert_eq!(counting.calls(), 0);
    assert_eq!(report.loaded, 3);
}

#[test]
fn merged_store_holds_every_unit_once() {
    let (recording, sorting) = synthetic(8);
    let (memory, storage) = memory();
    let store = UnitRangeStore::new(storage.clone(), Path::new(TARGET));
    let snippets = SnippetExtractor::new(storage.clone());
    let cfg = config(4, false);

    let all: Vec<UnitId> = (0..8).collect();
    let shards: Vec<_> = [&all[..4], &all[4..]]
        .into_iter()
        .map(|range| {
            let folder = store.locate(range);
            let summary = snippets
                .extract(&recording, &select_units(&sorting, range), &folder, &cfg)
                .unwrap();
            store.write(range, &summary).unwrap()
        })
        .collect();

    let log = LogContext::disabled();
    let mut merged = ShardMerger::new(&store, &log)
        .merge(&shards, Path::new(TARGET), &cfg)
        .unwrap();

    assert_eq!(merged.unit_ids(), &all[..]);
    assert_eq!(merged.get_all_templates().unwrap().len(), 8);
    assert!(merged.params().is_ok());
    assert!(!memory.exists(store.root()));
    for &unit in &all {
        assert!(merged.waveforms(unit).unwrap().num_spikes > 0);
    }
}

#[test]
fn merge_without_parameters_keeps_the_shards() {
    let (recording, sorting) = synthetic(4);
    let (_, storage) = memory();
    let store = UnitRangeStore::new(storage.clone(), Path::new(TARGET));
    let snippets = SnippetExtractor::new(storage.clone());
    let cfg = config(2, false);

    let all: Vec<UnitId> = (0..4).collect();
    let shards: Vec<_> = [&all[..2], &all[2..]]
        .into_iter()
        .map(|range| {
            let folder = store.locate(range);
            let summary = snippets
                .extract(&recording, &select_units(&sorting, range), &folder, &cfg)
                .unwrap();
            store.write(range, &summary).unwrap()
        })
        .collect();
    let params = shards[1].folder.join(PARAMS_FILE);
    let saved = storage.read(&params).unwrap();
    storage.delete(&params).unwrap();

    let log = LogContext::disabled();
    let merger = ShardMerger::new(&store, &log);
    let err = merger.merge(&shards, Path::new(TARGET), &cfg).unwrap_err();
    assert!(matches!(err, PipelineError::MergeAborted { .. }));
    assert!(matches!(store.load(&shards[0].folder), ShardLoad::Loaded(_)));
    assert!(storage.exists(&shards[1].folder.join(MANIFEST_FILE)));

    storage.write(&params, &saved).unwrap();
    let merged = merger.merge(&shards, Path::new(TARGET), &cfg).unwrap();
    assert_eq!(merged.unit_ids(), &all[..]);
    assert!(!storage.exists(store.root()));
}

#[test]
fn aborted_merge_is_finished_by_the_next_run() {
    let (recording, sorting) = synthetic(4);
    let (_, storage) = memory();
    let store = UnitRangeStore::new(storage.clone(), Path::new(TARGET));
    let snippets = SnippetExtractor::new(storage.clone());
    let cfg = config(2, true);

    let all: Vec<UnitId> = (0..4).collect();
    for range in [&all[..2], &all[2..]] {
        let folder = store.locate(range);
        let summary = snippets
            .extract(&recording, &select_units(&sorting, range), &folder, &cfg)
            .unwrap();
        store.write(range, &summary).unwrap();
    }
    let missing = waveforms_file(&store.locate(&all[2..]), 3);
    let saved = storage.read(&missing).unwrap();
    storage.delete(&missing).unwrap();

    let counting = Arc::new(CountingExtractor::new(storage.clone()));
    let run = || {
        UnitByUnitExtraction::new(recording.clone(), sorting.clone(), TARGET)
            .storage(storage.clone())
            .extractor(counting.clone())
            .config(cfg.clone())
            .run()
    };

    let err = run().err().unwrap();
    assert!(matches!(err, PipelineError::MergeAborted { .. }));
    assert!(storage.exists(store.root()));

    storage.write(&missing, &saved).unwrap();
    let outcome = run().unwrap();
    assert_eq!(counting.calls(), 0);
    let report = outcome.report.unwrap();
    assert_eq!(report.loaded, 2);
    assert_eq!(outcome.store.unit_ids(), &all[..]);
    assert!(outcome.store.waveforms(3).unwrap().num_spikes > 0);
    assert!(!storage.exists(store.root()));
}

#[test]
fn sparse_unit_ids_are_planned_by_position() {
    let (recording, dense) = synthetic(4);
    let renamed: std::collections::BTreeMap<UnitId, Vec<Vec<usize>>> = [2, 5, 9, 40]
        .into_iter()
        .zip(dense.unit_ids())
        .map(|(id, unit)| (id, vec![dense.spike_train(unit, 0)]))
        .collect();
    let sorting: SharedSorting = Arc::new(InMemorySorting::new(dense.sampling_frequency(), renamed));
    let (_, storage) = memory();
    let extractor = Arc::new(CountingExtractor::new(storage.clone()));

    let outcome = UnitByUnitExtraction::new(recording, sorting, TARGET)
        .storage(storage)
        .extractor(extractor.clone())
        .config(config(2, false))
        .run()
        .unwrap();

    assert_eq!(extractor.ranges(), vec![vec![2, 5], vec![9, 40]]);
    assert_eq!(outcome.store.unit_ids(), &[2, 5, 9, 40]);
}

#[test]
fn empty_sorting_is_refused() {
    let (recording, _) = synthetic(1);
    let sorting: SharedSorting = Arc::new(InMemorySorting::new(20000.0, Default::default()));
    let (_, storage) = memory();
    let err = UnitByUnitExtraction::new(recording, sorting, TARGET)
        .storage(storage)
        .run()
        .unwrap_err();
    assert!(matches!(err, PipelineError::EmptyUnitSet));
}
