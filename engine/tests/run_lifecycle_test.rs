//! Run lifecycle integration tests: admission, dedup, staleness
//! reclamation, failure stamping, and job attachment.

mod support;

use std::sync::Arc;
use std::time::Duration;

use engine::orchestrator::StartOutcome;
use engine::store::{InMemoryStateStore, StateStore};
use shared_types::{
    ConversationState, ResearchRun, RunMode, RunOutcome, RunOwner, StartRunRequest,
};
use support::{build_orchestrator, seed_conversation, wait_until_finished, Scripted, StubGateway};

fn start_request(conversation_state_id: &str, root_message_id: &str) -> StartRunRequest {
    StartRunRequest {
        conversation_state_id: conversation_state_id.to_string(),
        root_message_id: root_message_id.to_string(),
        state_id: format!("{root_message_id}-state"),
        mode: RunMode::InProcess,
        job_id: None,
        latest_user_input: "map the field".to_string(),
    }
}

const SINGLE_TASK_PLAN: &str =
    r#"{"current_objective":"survey","tasks":[{"objective":"survey the field","type":"LITERATURE"}]}"#;

#[tokio::test]
async fn test_duplicate_start_refused_while_active() {
    let store = Arc::new(InMemoryStateStore::new());
    seed_conversation(&store, &ConversationState::new("conv_dup", "objective")).await;

    let gateway = StubGateway::new(&[("planner", &[Scripted::Ok(SINGLE_TASK_PLAN)])]);
    // Slow specialists keep the first run alive while the second start races.
    let orchestrator = build_orchestrator(store, gateway, Duration::from_millis(400));

    let (first, second) = tokio::join!(
        orchestrator.start_run(start_request("conv_dup", "msg_a")),
        orchestrator.start_run(start_request("conv_dup", "msg_b")),
    );

    let outcomes = [first.unwrap(), second.unwrap()];
    let started = outcomes
        .iter()
        .filter(|o| matches!(o, StartOutcome::Started { .. }))
        .count();
    assert_eq!(started, 1, "exactly one start attempt may win");

    // The loser observed the winner's ledger entry (or its start lock).
    let refused = outcomes
        .iter()
        .find(|o| matches!(o, StartOutcome::AlreadyRunning { .. }))
        .unwrap();
    if let StartOutcome::AlreadyRunning {
        existing: Some(info),
    } = refused
    {
        assert!(info.root_message_id == "msg_a" || info.root_message_id == "msg_b");
    }

    let status = wait_until_finished(&orchestrator, "conv_dup").await;
    assert!(status.last_result.is_some());
}

#[tokio::test]
async fn test_stale_run_is_reclaimed() {
    let store = Arc::new(InMemoryStateStore::new());
    let mut state = ConversationState::new("conv_stale", "objective");
    // A crashed process left a running flag with a long-dead heartbeat
    // and no lease at all.
    state.deep_research_run = Some(ResearchRun {
        is_running: true,
        root_message_id: "msg_dead".to_string(),
        state_id: "st_dead".to_string(),
        mode: RunMode::Queue,
        job_id: None,
        started_at: chrono::Utc::now() - chrono::Duration::days(1),
        last_heartbeat_at: Some(chrono::Utc::now() - chrono::Duration::days(1)),
        expires_at: None,
        last_result: None,
        last_error: None,
        ended_at: None,
    });
    seed_conversation(&store, &state).await;

    let gateway = StubGateway::new(&[("planner", &[Scripted::Ok(SINGLE_TASK_PLAN)])]);
    let orchestrator = build_orchestrator(store, gateway, Duration::from_millis(10));

    let outcome = orchestrator
        .start_run(start_request("conv_stale", "msg_new"))
        .await
        .unwrap();
    assert!(matches!(outcome, StartOutcome::Started { .. }));

    // The dead owner is fenced out of its reclaimed entry.
    let dead_owner = RunOwner {
        root_message_id: "msg_dead".to_string(),
        state_id: "st_dead".to_string(),
    };
    assert!(!orchestrator
        .attach_job("conv_stale", &dead_owner, "job-zombie".to_string())
        .await
        .unwrap());

    wait_until_finished(&orchestrator, "conv_stale").await;
}

#[tokio::test]
async fn test_planner_outage_marks_run_failed() {
    let store = Arc::new(InMemoryStateStore::new());
    seed_conversation(&store, &ConversationState::new("conv_fail", "objective")).await;

    let gateway = StubGateway::new(&[("planner", &[Scripted::TransportError])]);
    let orchestrator = build_orchestrator(store, gateway, Duration::from_millis(10));

    let outcome = orchestrator
        .start_run(start_request("conv_fail", "msg_a"))
        .await
        .unwrap();
    assert!(matches!(outcome, StartOutcome::Started { .. }));

    let status = wait_until_finished(&orchestrator, "conv_fail").await;
    assert_eq!(status.last_result, Some(RunOutcome::Failed));
    let error = status.last_error.expect("failed run records its error");
    assert!(error.contains("planning judgment call failed"));
}

#[tokio::test]
async fn test_attach_job_is_identity_checked() {
    let store = Arc::new(InMemoryStateStore::new());
    seed_conversation(&store, &ConversationState::new("conv_job", "objective")).await;

    let gateway = StubGateway::new(&[("planner", &[Scripted::Ok(SINGLE_TASK_PLAN)])]);
    let orchestrator = build_orchestrator(store.clone(), gateway, Duration::from_millis(400));

    let outcome = orchestrator
        .start_run(start_request("conv_job", "msg_a"))
        .await
        .unwrap();
    assert!(matches!(outcome, StartOutcome::Started { .. }));

    let owner = RunOwner {
        root_message_id: "msg_a".to_string(),
        state_id: "msg_a-state".to_string(),
    };
    assert!(orchestrator
        .attach_job("conv_job", &owner, "job-77".to_string())
        .await
        .unwrap());

    let impostor = RunOwner {
        root_message_id: "msg_x".to_string(),
        state_id: "msg_a-state".to_string(),
    };
    assert!(!orchestrator
        .attach_job("conv_job", &impostor, "job-evil".to_string())
        .await
        .unwrap());

    let state = store.get("conv_job").await.unwrap();
    assert_eq!(
        state.deep_research_run.unwrap().job_id.as_deref(),
        Some("job-77")
    );

    wait_until_finished(&orchestrator, "conv_job").await;
}

#[tokio::test]
async fn test_finished_conversation_can_start_again() {
    let store = Arc::new(InMemoryStateStore::new());
    seed_conversation(&store, &ConversationState::new("conv_again", "objective")).await;

    let gateway = StubGateway::new(&[(
        "planner",
        &[
            Scripted::Ok(SINGLE_TASK_PLAN),
            Scripted::Ok(SINGLE_TASK_PLAN),
        ],
    )]);
    let orchestrator = build_orchestrator(store, gateway, Duration::from_millis(10));

    let outcome = orchestrator
        .start_run(start_request("conv_again", "msg_a"))
        .await
        .unwrap();
    assert!(matches!(outcome, StartOutcome::Started { .. }));
    wait_until_finished(&orchestrator, "conv_again").await;

    let outcome = orchestrator
        .start_run(start_request("conv_again", "msg_b"))
        .await
        .unwrap();
    assert!(matches!(outcome, StartOutcome::Started { .. }));
    wait_until_finished(&orchestrator, "conv_again").await;
}
