//! End-to-end runs through the executor, fallback chain, gates, decision
//! and review queue.

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use stageguard::budget::{AlertSeverity, AlertThresholds};
use stageguard::decision::issue_codes;
use stageguard::events::event_types;
use stageguard::prelude::*;
use stageguard::store::{collections, load_document};
use stageguard::testing::{ScriptedProvider, TestHarness};

fn fast_retry(max_retries: i64) -> RetryPolicy {
    RetryPolicy::new(
        &RetryConfig::new()
            .with_max_retries(max_retries)
            .with_base_delay_ms(1)
            .with_max_delay_ms(2),
    )
    .unwrap()
}

fn tts_chain(primary_fails: bool) -> FallbackChain<String, String> {
    let primary: Arc<dyn Provider<String, String>> = if primary_fails {
        Arc::new(ScriptedProvider::always_fail(
            "tts-a",
            ProviderError::recoverable("HTTP_503", "unavailable"),
        ))
    } else {
        Arc::new(ScriptedProvider::always_ok("tts-a", "a.mp3"))
    };
    FallbackChain::new("tts")
        .with_provider(primary)
        .with_provider(Arc::new(ScriptedProvider::always_ok("tts-b", "b.mp3")))
        .with_retry(fast_retry(1))
}

async fn script_stage(run: &mut PipelineRun, words: u64) {
    run.run_stage(
        "topic".to_string(),
        "script",
        |_topic, ctx| async move {
            ctx.costs().record_call("gemini-2.5-flash", 0.08)?;
            ctx.costs().record_call("gemini-2.5-flash", 0.15)?;
            Ok::<_, StageguardError>(
                UnitOutput::new(json!({"word_count": words}))
                    .with_provider(ProviderInfo::primary("gemini")),
            )
        },
        ExecuteOptions::new().with_quality_gate("script"),
    )
    .await
    .unwrap();
    run.record_metric("word_count", words as f64);
}

async fn narration_stage(run: &mut PipelineRun, chain: &FallbackChain<String, String>) {
    run.run_stage(
        "script text".to_string(),
        "narration",
        |text, ctx| async move {
            let outcome = chain.run(&text).await?;
            ctx.costs().record_tts(&outcome.provider_name, 1000)?;
            Ok::<_, StageguardError>(UnitOutput::from_fallback(outcome.map(|path| {
                json!({"audio_path": path, "duration_seconds": 300.0, "audio_bytes": 48_000})
            })))
        },
        ExecuteOptions::new().with_quality_gate("narration"),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn clean_run_auto_publishes() {
    let harness = TestHarness::new();
    let mut run = harness.start_run("2024-05-01").await.unwrap();

    script_stage(&mut run, 1500).await;
    narration_stage(&mut run, &tts_chain(false)).await;

    let decision = run.finish().await.unwrap();
    assert_eq!(decision.decision, PublishDecision::AutoPublish);
    assert!(decision.issues.is_empty());
    assert_eq!(run.total_cost_usd(), 0.246);

    let clearance = run.publish_clearance(None).await.unwrap();
    assert_eq!(
        clearance,
        PublishClearance::Cleared {
            decision: PublishDecision::AutoPublish
        }
    );

    let costs: Value = load_document(harness.store.as_ref(), collections::COSTS, "2024-05-01")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(costs["total_cost_usd"], json!(0.246));
    assert!(costs["stages"]["script"].is_object());
    assert!(costs["stages"]["narration"].is_object());

    let types = harness.events.event_types();
    assert!(types.contains(&event_types::DECISION_MADE.to_string()));
    assert!(!types.contains(&event_types::REVIEW_CREATED.to_string()));
}

#[tokio::test]
async fn fallback_narration_is_held_then_rejected() {
    let harness = TestHarness::new();
    let mut run = harness.start_run("2024-05-02").await.unwrap();

    script_stage(&mut run, 1500).await;
    narration_stage(&mut run, &tts_chain(true)).await;

    let narration = &run.signals()[1];
    assert_eq!(narration.provider.name, "tts-b");
    assert_eq!(narration.provider.tier, ProviderTier::Fallback);
    assert_eq!(narration.provider.attempts, 3);

    let decision = run.finish().await.unwrap();
    assert_eq!(decision.decision, PublishDecision::HumanReview);
    assert!(decision
        .issues
        .iter()
        .any(|issue| issue.code == issue_codes::PROVIDER_FALLBACK));

    let review_id = run.review_id().unwrap().to_string();
    assert_eq!(harness.reviews.pending(), vec![review_id.clone()]);

    let reviews = Arc::clone(&harness.reviews);
    let id = review_id.clone();
    let reviewer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        reviews
            .resolve_review(&id, ReviewOutcome::Rejected, "editor@example.com")
            .await
    });

    let clearance = run
        .publish_clearance(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let resolved = reviewer.await.unwrap().unwrap();

    assert_eq!(clearance, PublishClearance::Blocked { review_id });
    assert!(!clearance.is_cleared());
    assert_eq!(resolved.resolved_by.as_deref(), Some("editor@example.com"));
    assert!(harness
        .events
        .event_types()
        .contains(&event_types::REVIEW_RESOLVED.to_string()));
}

#[tokio::test]
async fn review_wait_times_out() {
    let harness = TestHarness::new();
    let mut run = harness.start_run("2024-05-03").await.unwrap();
    script_stage(&mut run, 1500).await;
    run.set_thumbnail_fallback(true);
    run.record_assets(10, 2);

    let decision = run.finish().await.unwrap();
    assert_eq!(decision.decision, PublishDecision::HumanReview);
    assert!(decision
        .issues
        .iter()
        .any(|issue| issue.code == issue_codes::COMBINED_FALLBACK));

    let err = run
        .publish_clearance(Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "REVIEW_TIMED_OUT");
}

#[tokio::test]
async fn few_visual_fallbacks_publish_with_warning() {
    let harness = TestHarness::new();
    let mut run = harness.start_run("2024-05-04").await.unwrap();
    script_stage(&mut run, 1500).await;
    run.record_assets(10, 1);

    let decision = run.finish().await.unwrap();
    assert_eq!(decision.decision, PublishDecision::AutoPublishWithWarning);
    assert_eq!(decision.minor_count(), 1);
    assert!(run.publish_clearance(None).await.unwrap().is_cleared());
}

#[tokio::test]
async fn gate_failure_stops_stage_but_cost_is_kept() {
    let harness = TestHarness::new();
    let mut run = harness.start_run("2024-05-05").await.unwrap();

    let err = run
        .run_stage(
            (),
            "script",
            |(), ctx| async move {
                ctx.costs().record_call("gemini-2.5-flash", 0.05)?;
                Ok::<_, StageguardError>(UnitOutput::new(json!({"word_count": 120})))
            },
            ExecuteOptions::new().with_quality_gate("script"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code, "QUALITY_GATE_FAILED");
    assert_eq!(err.error_name, "QualityGateError");
    assert!(!err.recoverable);
    assert_eq!(run.total_cost_usd(), 0.05);
    assert!(run.signals().is_empty());
}

#[tokio::test]
async fn expensive_run_raises_critical_alert() {
    let config = TestHarness::new()
        .config
        .with_alerts(AlertThresholds::default().with_thresholds(0.10, 0.20));
    let harness = TestHarness::with_config(config);
    let mut run = harness.start_run("2024-05-06").await.unwrap();
    script_stage(&mut run, 1500).await;

    run.finish().await.unwrap();

    let alert = run.alert().unwrap();
    assert_eq!(alert.severity, Some(AlertSeverity::Critical));
    assert!(alert.notified);
    let sent = harness.alerts.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].run_id.as_deref(), Some("2024-05-06"));
}

#[tokio::test]
async fn spend_accumulates_across_runs() {
    let harness = TestHarness::new();

    for run_id in ["2024-05-01", "2024-05-02"] {
        let mut run = harness.start_run(run_id).await.unwrap();
        script_stage(&mut run, 1500).await;
        run.finish().await.unwrap();
        run.close();
    }

    let budget = BudgetTracker::load(harness.store.as_ref(), harness.config.budget.clone())
        .await
        .unwrap();
    assert_eq!(budget.state().total_spent_usd, 0.46);
    assert_eq!(budget.state().remaining_usd, 299.54);

    let status = budget.status_on(stageguard::testing::fixed_date(2024, 5, 2));
    assert_eq!(status.avg_daily_cost_usd, 0.23);
    assert!(status.within_budget);
    assert!(status.within_credit_period);
}
