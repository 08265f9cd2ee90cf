//! Runs backed by the JSON file store.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

use stageguard::prelude::*;
use stageguard::store::{collections, load_document};
use stageguard::testing::fixed_date;

fn config() -> StageguardConfig {
    StageguardConfig::default()
        .with_budget(BudgetConfig::default().with_start_date(fixed_date(2024, 5, 1)))
}

async fn run_once(
    lock: &RunLock,
    store: Arc<JsonFileStore>,
    run_id: &str,
    cost: f64,
) -> QualityDecision {
    let deps = RunDependencies::new(config(), store as _);
    let mut run = assert_ok!(PipelineRun::start(lock, run_id, deps).await);
    assert_ok!(
        run.run_stage(
            (),
            "render",
            |(), ctx| async move {
                ctx.costs().record_call("remotion-lambda", cost)?;
                Ok::<_, StageguardError>(UnitOutput::new(json!({
                    "duration_seconds": 300.0,
                    "file_size_bytes": 40_000_000,
                    "narration_duration_seconds": 299.5,
                })))
            },
            ExecuteOptions::new().with_quality_gate("render"),
        )
        .await
    );
    run.record_metric("word_count", 1500.0);
    let decision = assert_ok!(run.finish().await);
    run.close();
    decision
}

#[tokio::test]
async fn documents_survive_a_new_store_instance() {
    let dir = tempfile::tempdir().unwrap();
    let lock = RunLock::new();

    run_once(&lock, Arc::new(JsonFileStore::new(dir.path())), "2024-05-01", 0.12).await;
    run_once(&lock, Arc::new(JsonFileStore::new(dir.path())), "2024-05-02", 0.30).await;

    assert!(dir.path().join("costs").join("2024-05-01.json").exists());
    assert!(dir.path().join("quality_decisions").join("2024-05-02.json").exists());

    let store = JsonFileStore::new(dir.path());
    let budget = assert_ok!(BudgetTracker::load(&store, config().budget).await);
    assert_eq!(budget.state().total_spent_usd, 0.42);
    assert_eq!(budget.state().daily_spend.len(), 2);

    let costs: Option<Value> =
        assert_ok!(load_document(&store, collections::COSTS, "2024-05-02").await);
    let costs = costs.unwrap();
    assert_eq!(costs["categories"]["render"], json!(0.3));
}

#[tokio::test]
async fn stored_decision_carries_digest() {
    let dir = tempfile::tempdir().unwrap();
    let lock = RunLock::new();
    let store = Arc::new(JsonFileStore::new(dir.path()));

    let decision = run_once(&lock, Arc::clone(&store), "2024-05-03", 0.05).await;
    assert_eq!(decision.decision, PublishDecision::AutoPublish);

    let stored: Option<Value> = assert_ok!(
        load_document(store.as_ref(), collections::QUALITY_DECISIONS, "2024-05-03").await
    );
    let stored = stored.unwrap();
    assert_eq!(stored["digest"], json!(decision.digest()));
    assert_eq!(stored["run_id"], "2024-05-03");
}

#[test]
fn config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stageguard.json");
    let config = config().with_review_timeout_seconds(600);
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let loaded = assert_ok!(StageguardConfig::from_path(&path));
    assert_eq!(loaded, config);

    std::fs::write(&path, r#"{"decision": {"max_minor_issues": 2, "cost_ceiling_usd": -1}}"#)
        .unwrap();
    assert_err!(StageguardConfig::from_path(&path));
}

#[test]
fn run_lock_blocks_concurrent_start() {
    tokio_test::block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let lock = RunLock::new();
        let store: Arc<dyn DocumentStore> = Arc::new(JsonFileStore::new(dir.path()));

        let deps = RunDependencies::new(config(), Arc::clone(&store));
        let first = assert_ok!(PipelineRun::start(&lock, "2024-05-04", deps).await);
        let second =
            PipelineRun::start(&lock, "2024-05-05", RunDependencies::new(config(), store)).await;
        let err = assert_err!(second);
        assert_eq!(err.code(), "RUN_IN_PROGRESS");
        first.close();
    });
}
