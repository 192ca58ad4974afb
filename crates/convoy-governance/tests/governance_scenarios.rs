#![allow(clippy::unwrap_used, clippy::expect_used)]

use convoy_core::{BudgetPeriod, ConvoyError, PermissionLevel};
use convoy_governance::*;
use convoy_store::MemoryStore;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// 1. Budget: two calls of 1000 tokens against a 1500 token task budget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn budget_exceeded_after_second_call() {
    let mut config = BudgetConfig::default();
    config.task = BudgetLimits::new(1500, 100.0);
    let tracker = CostTracker::new(Arc::new(MemoryStore::new()), config);

    tracker.track_usage("trace-a", 1000, None, "gpt-4", "generate").await;
    assert!(tracker.enforce_budget("trace-a", BudgetPeriod::Task).await.is_ok());

    tracker.track_usage("trace-a", 1000, None, "gpt-4", "generate").await;
    let check = tracker.check_budget("trace-a", BudgetPeriod::Task).await;
    assert!(!check.within_budget);
    assert_eq!(check.metrics.tokens, 2000);
    assert!((check.metrics.usd - 0.06).abs() < 1e-9);

    let err = tracker
        .enforce_budget("trace-a", BudgetPeriod::Task)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("tokens=2000/1500"), "{err}");
    assert!(err.is_governance());

    // other traces are unaffected
    assert!(tracker.enforce_budget("trace-b", BudgetPeriod::Task).await.is_ok());
}

#[tokio::test]
async fn budget_is_monotonic_across_checks() {
    let tracker = CostTracker::new(Arc::new(MemoryStore::new()), BudgetConfig::default());
    let mut last = 0;
    for _ in 0..5 {
        tracker.track_usage("t", 123, Some(0.001), "gpt-4o", "chat").await;
        let tokens = tracker.check_budget("t", BudgetPeriod::Daily).await.metrics.tokens;
        assert!(tokens > last);
        last = tokens;
    }
}

// ---------------------------------------------------------------------------
// 2. Reputation: 85 → test_passed → 105 crosses into staging_access
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_passed_promotes_to_staging() {
    let config = ReputationConfig {
        initial_score: 85,
        ..ReputationConfig::default()
    };
    let engine = ReputationEngine::new(Arc::new(MemoryReputationStore::new()), config);
    let id = engine.get_or_create_agent("code_agent").await.unwrap();
    assert_eq!(
        engine.get_permission_level(&id).await.unwrap(),
        PermissionLevel::SandboxOnly
    );

    let record = engine
        .record_event(&id, "test_passed", Some("trace-1"), Some("suite green"))
        .await
        .unwrap();
    assert_eq!(record.reputation_score, 105);
    assert_eq!(record.permission_level, PermissionLevel::StagingAccess);

    let history = engine.get_history(&id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].delta, 20);
    assert_eq!(history[0].trace_id.as_deref(), Some("trace-1"));
}

#[tokio::test]
async fn permission_level_is_monotonic_in_score() {
    let thresholds = LevelThresholds::default();
    let mut previous = thresholds.level_for_score(-100);
    for score in -100..300 {
        let level = thresholds.level_for_score(score);
        assert!(level >= previous);
        previous = level;
    }
}

// ---------------------------------------------------------------------------
// 3. SQLite persistence survives reopening
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sqlite_reputation_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reputation.db");

    {
        let store = Arc::new(SqliteReputationStore::open(&path).unwrap());
        let engine = ReputationEngine::new(store, ReputationConfig::default());
        let id = engine.get_or_create_agent("deploy_agent").await.unwrap();
        engine.record_event(&id, "deploy_succeeded", None, None).await.unwrap();
        engine.record_event(&id, "deploy_succeeded", None, None).await.unwrap();
    }

    let store = Arc::new(SqliteReputationStore::open(&path).unwrap());
    let engine = ReputationEngine::new(store, ReputationConfig::default());
    let record = engine.get_record("deploy_agent").await.unwrap();
    assert_eq!(record.reputation_score, 150);
    assert_eq!(record.permission_level, PermissionLevel::ProdLowRisk);
    assert_eq!(engine.get_history("deploy_agent", 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn concurrent_events_lose_no_updates() {
    let store = Arc::new(SqliteReputationStore::open_in_memory().unwrap());
    let engine = Arc::new(ReputationEngine::new(store, ReputationConfig::default()));
    let id = engine.get_or_create_agent("code_agent").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            engine.record_event(&id, "task_completed", None, None).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(engine.get_reputation_score(&id).await.unwrap(), 200);
}

// ---------------------------------------------------------------------------
// 4. Guard: a deploy agent climbing from sandbox to production
// ---------------------------------------------------------------------------

#[tokio::test]
async fn guard_follows_reputation() {
    let reputation = Arc::new(ReputationEngine::new(
        Arc::new(MemoryReputationStore::new()),
        ReputationConfig::default(),
    ));
    let id = reputation.get_or_create_agent("deploy_agent").await.unwrap();
    let guard = GovernanceGuard::new(
        reputation.clone(),
        PolicyGuard::new(&PolicyConfig::default()).unwrap(),
        ViolationDetector::with_defaults().unwrap(),
        Arc::new(CostTracker::new(
            Arc::new(MemoryStore::new()),
            BudgetConfig::default(),
        )),
    );
    let invocation = ToolInvocation {
        agent_id: id.clone(),
        tool: "kubectl".into(),
        operation: "rollout".into(),
        permission: Some("restart_service".into()),
        ..ToolInvocation::default()
    };

    match guard.authorize(&invocation).await.unwrap_err() {
        ConvoyError::PermissionDenied { required, actual, .. } => {
            assert_eq!(required, PermissionLevel::ProdLowRisk);
            assert_eq!(actual, PermissionLevel::StagingAccess);
        }
        other => panic!("unexpected: {other}"),
    }

    reputation.record_event(&id, "deploy_succeeded", None, None).await.unwrap();
    reputation.record_event(&id, "deploy_succeeded", None, None).await.unwrap();
    let auth = guard.authorize(&invocation).await.unwrap();
    assert_eq!(auth.level, PermissionLevel::ProdLowRisk);
}
