//! Idempotency Integration Tests
//!
//! Run keys make run creation exactly-once per sensor, across ticks and
//! across crashes between creating and launching a run.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{sensor, Harness, RejectingBackend, ScriptedEvaluator, Step};
use sensord::core::{CrashPoint, DebugCrashFlags, EngineError, TickEngine};
use sensord::domain::{
    DynamicPartitionsRequest, NewRun, Run, RunRequest, RunStatus, SensorExecutionData, TickStatus, RUN_KEY_TAG,
    SENSOR_NAME_TAG,
};
use sensord::store::{PartitionStore, RunStore, RunsFilter, TickStore};

fn keyed(keys: &[&str]) -> Step {
    Step::Data(SensorExecutionData::with_run_requests(
        keys.iter()
            .map(|key| RunRequest::new().with_run_key(*key))
            .collect(),
    ))
}

async fn all_runs(harness: &Harness) -> Vec<Run> {
    harness.storage.get_runs(&RunsFilter::new()).await.unwrap()
}

/// Persist a run as if an earlier daemon had created it
async fn seed_run(harness: &Harness, sensor_name: &str, run_key: &str, status: RunStatus) -> Run {
    let mut tags = BTreeMap::new();
    tags.insert(SENSOR_NAME_TAG.to_string(), sensor_name.to_string());
    tags.insert(RUN_KEY_TAG.to_string(), run_key.to_string());
    let run = harness
        .storage
        .add_run(Run::from_new_run(NewRun {
            job_name: "ingest".to_string(),
            run_config: serde_json::Value::Null,
            tags,
            origin: None,
            asset_selection: None,
        }))
        .await
        .unwrap();
    harness
        .storage
        .update_run_status(run.run_id, status)
        .await
        .unwrap();
    run
}

#[tokio::test]
async fn test_same_run_key_across_ticks_creates_one_run() {
    let harness = Harness::new(ScriptedEvaluator::new([keyed(&["k1"]), keyed(&["k1"])]));
    let engine = harness.engine();
    let sensor = Arc::new(sensor("new_files"));

    let first = engine.process_tick(&sensor).await.unwrap().unwrap();
    assert_eq!(first.status, TickStatus::Success);

    let second = engine.process_tick(&sensor).await.unwrap().unwrap();
    assert_eq!(second.status, TickStatus::Skipped);
    assert!(second.run_ids.is_empty());
    assert_eq!(second.run_keys, vec!["k1".to_string()]);

    assert_eq!(all_runs(&harness).await.len(), 1);
}

#[tokio::test]
async fn test_duplicate_keys_in_one_evaluation() {
    let harness = Harness::new(ScriptedEvaluator::new([keyed(&["a", "b", "a"])]));
    let sensor = Arc::new(sensor("new_files"));

    let tick = harness.engine().process_tick(&sensor).await.unwrap().unwrap();
    assert_eq!(tick.run_ids.len(), 2);
    assert_eq!(tick.run_keys, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(all_runs(&harness).await.len(), 2);
}

#[tokio::test]
async fn test_requests_without_key_always_create_runs() {
    let harness = Harness::new(ScriptedEvaluator::new([Step::Data(
        SensorExecutionData::with_run_requests(vec![RunRequest::new(), RunRequest::new()]),
    )]));
    let sensor = Arc::new(sensor("new_files"));

    let tick = harness.engine().process_tick(&sensor).await.unwrap().unwrap();
    assert_eq!(tick.run_ids.len(), 2);
    assert!(tick.run_keys.is_empty());
}

#[tokio::test]
async fn test_crash_after_create_reuses_not_started_run() {
    let harness = Harness::new(ScriptedEvaluator::new([keyed(&["k1"]), keyed(&["k1"])]));
    let sensor = Arc::new(sensor("new_files"));

    let crashing = harness
        .engine()
        .with_crash_flags(DebugCrashFlags::new().with("new_files", CrashPoint::RunCreated));
    let result = crashing.process_tick(&sensor).await;
    assert!(matches!(
        result,
        Err(EngineError::SimulatedCrash(CrashPoint::RunCreated))
    ));

    let runs = all_runs(&harness).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::NotStarted);
    let ticks = harness.storage.get_ticks(&sensor.selector_id(), None).await.unwrap();
    assert_eq!(ticks[0].status, TickStatus::Started);

    // Restarted daemon picks the orphaned run back up
    let tick = harness.engine().process_tick(&sensor).await.unwrap().unwrap();
    assert_eq!(tick.status, TickStatus::Success);
    assert_eq!(tick.run_ids, vec![runs[0].run_id]);

    let runs = all_runs(&harness).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Queued);
}

#[tokio::test]
async fn test_crash_after_launch_skips_on_retry() {
    let harness = Harness::new(ScriptedEvaluator::new([keyed(&["k1"]), keyed(&["k1"])]));
    let sensor = Arc::new(sensor("new_files"));

    let crashing = harness
        .engine()
        .with_crash_flags(DebugCrashFlags::new().with("new_files", CrashPoint::RunLaunched));
    assert!(crashing.process_tick(&sensor).await.is_err());

    let tick = harness.engine().process_tick(&sensor).await.unwrap().unwrap();
    assert_eq!(tick.status, TickStatus::Skipped);
    assert_eq!(tick.run_keys, vec!["k1".to_string()]);
    assert_eq!(all_runs(&harness).await.len(), 1);
}

#[tokio::test]
async fn test_run_key_of_another_sensor_does_not_match() {
    let harness = Harness::new(ScriptedEvaluator::new([keyed(&["shared"])]));
    seed_run(&harness, "other_sensor", "shared", RunStatus::Success).await;
    let sensor = Arc::new(sensor("new_files"));

    let tick = harness.engine().process_tick(&sensor).await.unwrap().unwrap();
    assert_eq!(tick.status, TickStatus::Success);
    assert_eq!(tick.run_ids.len(), 1);
    assert_eq!(all_runs(&harness).await.len(), 2);
}

#[tokio::test]
async fn test_legacy_run_without_origin_counts_as_existing() {
    let harness = Harness::new(ScriptedEvaluator::new([keyed(&["k1"])]));
    let legacy = seed_run(&harness, "new_files", "k1", RunStatus::Success).await;
    assert!(legacy.origin.is_none());
    let sensor = Arc::new(sensor("new_files"));

    let tick = harness.engine().process_tick(&sensor).await.unwrap().unwrap();
    assert_eq!(tick.status, TickStatus::Skipped);
    assert_eq!(all_runs(&harness).await.len(), 1);
}

#[tokio::test]
async fn test_submit_failure_keeps_tick_successful() {
    let harness = Harness::new(ScriptedEvaluator::new([keyed(&["k1"])]));
    let backend = Arc::new(RejectingBackend::new(harness.storage.clone()));
    let engine = TickEngine::new(harness.services(), harness.evaluator.clone(), backend);
    let sensor = Arc::new(sensor("new_files"));

    let tick = engine.process_tick(&sensor).await.unwrap().unwrap();
    assert_eq!(tick.status, TickStatus::Success);
    assert_eq!(tick.run_ids.len(), 1);

    let run = harness.storage.get_run(tick.run_ids[0]).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::NotStarted);
}

#[tokio::test]
async fn test_submit_failure_does_not_abort_siblings() {
    let harness = Harness::new(ScriptedEvaluator::new([keyed(&["k1", "k2", "k3"])]));
    let backend =
        Arc::new(RejectingBackend::new(harness.storage.clone()).only_run_key("k2"));
    let engine = TickEngine::new(harness.services(), harness.evaluator.clone(), backend);
    let sensor = Arc::new(sensor("new_files"));

    let tick = engine.process_tick(&sensor).await.unwrap().unwrap();
    assert_eq!(tick.status, TickStatus::Success);
    assert_eq!(tick.run_ids.len(), 3);
    assert!(tick.error.is_none());

    let mut statuses = Vec::new();
    for run_id in &tick.run_ids {
        let run = harness.storage.get_run(*run_id).await.unwrap().unwrap();
        statuses.push((run.run_key().unwrap().to_string(), run.status));
    }
    assert_eq!(
        statuses,
        vec![
            ("k1".to_string(), RunStatus::Queued),
            ("k2".to_string(), RunStatus::NotStarted),
            ("k3".to_string(), RunStatus::Queued),
        ]
    );
}

#[tokio::test]
async fn test_re_adding_existing_partition_is_skipped_every_tick() {
    let add = || {
        Step::Data(
            SensorExecutionData::default()
                .with_partitions_request(DynamicPartitionsRequest::add("files", ["a.csv"])),
        )
    };
    let harness = Harness::new(ScriptedEvaluator::new([add(), add()]));
    harness
        .storage
        .add_dynamic_partitions("files", &["a.csv".to_string()])
        .await
        .unwrap();
    let engine = harness.engine();
    let sensor = Arc::new(sensor("new_files"));

    for _ in 0..2 {
        let tick = engine.process_tick(&sensor).await.unwrap().unwrap();
        assert_eq!(tick.dynamic_partitions_request_results.len(), 1);
        let result = &tick.dynamic_partitions_request_results[0];
        assert_eq!(result.skipped_partitions, vec!["a.csv".to_string()]);
        assert_eq!(result.added_partitions, Some(Vec::new()));
    }

    assert_eq!(
        harness.storage.get_dynamic_partitions("files").await.unwrap(),
        vec!["a.csv".to_string()]
    );
}

#[tokio::test]
async fn test_submit_pool_preserves_request_order() {
    let keys = ["k0", "k1", "k2", "k3", "k4", "k5"];
    let harness = Harness::new(ScriptedEvaluator::new([keyed(&keys)]));
    let engine = harness.engine().with_submit_workers(3);
    let sensor = Arc::new(sensor("new_files"));

    let tick = engine.process_tick(&sensor).await.unwrap().unwrap();
    assert_eq!(tick.status, TickStatus::Success);
    assert_eq!(tick.run_keys, keys.map(String::from).to_vec());

    let runs = all_runs(&harness).await;
    assert_eq!(runs.len(), keys.len());
    assert!(runs.iter().all(|r| r.status == RunStatus::Queued));
}
