use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};

use crate::orchestrator::dispatch::{
    DispatchError, DispatchRequest, GithubDispatchConfig, GithubWorkflowDispatcher,
    RunDispatcher,
};
use crate::orchestrator::run_token::verify_run_token;
use crate::orchestrator::service::{OrchestratorError, OrchestratorPolicy, OrchestratorService};
use crate::orchestrator::store::{
    self, AbandonOutcome, AbandonRun, FinishOutcome, FinishRun, OrchestratorStore, RunLockClaim,
    RunLockOutcome, StoreError,
};
use crate::orchestrator::templates::{RUNNER_FILE_PATH, WORKFLOW_FILE_PATH};
use crate::orchestrator::types::{
    CreditWalletRequest, FinishedRunStatus, GateReason, ProjectRow, ProjectStatus,
    QueueEntryRow, RunAuthorization, RunCredentials, RunFinishedRequest, RunHeartbeatRequest,
    RunRow, RunStatus, StartRunState,
};

const BACKEND_BASE_URL: &str = "https://orchestrator.test";

#[derive(Default)]
struct RecordingDispatcher {
    requests: Mutex<Vec<DispatchRequest>>,
    fail_with: Option<String>,
}

impl RecordingDispatcher {
    fn failing(message: &str) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            fail_with: Some(message.to_string()),
        }
    }

    async fn last_request(&self) -> Result<DispatchRequest> {
        self.requests
            .lock()
            .await
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("no dispatch recorded"))
    }

    async fn count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl RunDispatcher for RecordingDispatcher {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), DispatchError> {
        self.requests.lock().await.push(request.clone());
        match &self.fail_with {
            Some(message) => Err(DispatchError::Github {
                status: 500,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn project(project_id: &str, balance_cents: i64) -> ProjectRow {
    let now = Utc::now();
    ProjectRow {
        project_id: project_id.to_string(),
        status: ProjectStatus::Active,
        balance_cents,
        current_run_id: None,
        repo_ref: format!("gitcorps/{project_id}"),
        created_at: now,
        updated_at: now,
    }
}

fn service_with(
    store: Arc<dyn OrchestratorStore>,
    dispatcher: Arc<RecordingDispatcher>,
    policy: OrchestratorPolicy,
) -> OrchestratorService {
    OrchestratorService::new_with_policy(
        store,
        dispatcher,
        Some(BACKEND_BASE_URL.to_string()),
        policy,
    )
}

async fn start_run(
    service: &OrchestratorService,
    dispatcher: &RecordingDispatcher,
    project_id: &str,
) -> Result<(RunAuthorization, String)> {
    let result = service.maybe_start_run(project_id).await?;
    if result.state != StartRunState::Started {
        return Err(anyhow!("expected started, got {result:?}"));
    }
    let request = dispatcher.last_request().await?;
    Ok((
        RunAuthorization {
            project_id: request.project_id,
            run_id: request.run_id,
        },
        request.run_token,
    ))
}

fn finished(auth: &RunAuthorization, spent_cents: Option<i64>) -> RunFinishedRequest {
    RunFinishedRequest {
        project_id: auth.project_id.clone(),
        run_id: auth.run_id.clone(),
        status: FinishedRunStatus::Succeeded,
        summary_md: "Implemented the requested change.".to_string(),
        spent_cents,
    }
}

#[tokio::test]
async fn start_claims_lock_issues_token_and_dispatches() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 1_500)).await?;
    store
        .enqueue_project("proj_a", "global_concurrency", Utc::now())
        .await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());

    let (auth, token) = start_run(&service, &dispatcher, "proj_a").await?;

    let request = dispatcher.last_request().await?;
    assert_eq!(request.repo_ref, "gitcorps/proj_a");
    assert_eq!(request.budget_cents, 1_000);
    assert_eq!(request.runtime_minutes, 50);
    assert_eq!(request.token_budget, 750_000);
    assert_eq!(request.backend_base_url, BACKEND_BASE_URL);
    assert_eq!(request.agent_runtime, "copilot_cli");
    assert_eq!(token.len(), 64);

    let run = store
        .get_run(&auth.project_id, &auth.run_id)
        .await?
        .ok_or_else(|| anyhow!("run missing"))?;
    assert_eq!(run.status, RunStatus::Queued);
    let stored_hash = run
        .run_token_hash
        .as_deref()
        .ok_or_else(|| anyhow!("token hash missing"))?;
    assert!(verify_run_token(stored_hash, &token));
    assert_ne!(stored_hash, token);

    let project = store
        .get_project("proj_a")
        .await?
        .ok_or_else(|| anyhow!("project missing"))?;
    assert_eq!(project.current_run_id.as_deref(), Some(auth.run_id.as_str()));
    assert_eq!(project.balance_cents, 1_500);
    assert_eq!(store.count_active_runs().await?, 1);
    assert!(store.list_queue(10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn non_runnable_projects_are_reported_without_side_effects() -> Result<()> {
    let store = store::memory();
    let mut paused = project("proj_paused", 5_000);
    paused.status = ProjectStatus::Paused;
    store.put_project(paused).await?;
    store.put_project(project("proj_poor", 199)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());

    let missing = service.maybe_start_run("proj_nope").await?;
    assert_eq!(missing.state, StartRunState::MissingProject);

    let paused = service.maybe_start_run("proj_paused").await?;
    assert_eq!(paused.state, StartRunState::Skipped);
    assert_eq!(paused.gate_reason, None);

    let poor = service.maybe_start_run("proj_poor").await?;
    assert_eq!(poor.state, StartRunState::Skipped);
    assert_eq!(poor.gate_reason, Some(GateReason::InsufficientBalance));

    assert_eq!(dispatcher.count().await, 0);
    assert!(store.list_queue(10).await?.is_empty());
    assert_eq!(store.count_active_runs().await?, 0);
    Ok(())
}

#[tokio::test]
async fn second_start_while_locked_is_skipped_not_queued() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 5_000)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());

    start_run(&service, &dispatcher, "proj_a").await?;
    let second = service.maybe_start_run("proj_a").await?;
    assert_eq!(second.state, StartRunState::Skipped);
    assert_eq!(second.gate_reason, Some(GateReason::AlreadyRunning));
    assert!(store.list_queue(10).await?.is_empty());
    assert_eq!(dispatcher.count().await, 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_starts_for_one_project_produce_exactly_one_run() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 5_000)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());

    let (first, second) = tokio::join!(
        service.maybe_start_run("proj_a"),
        service.maybe_start_run("proj_a")
    );
    let results = [first?, second?];
    let started = results
        .iter()
        .filter(|result| result.state == StartRunState::Started)
        .count();
    assert_eq!(started, 1);
    assert!(results.iter().any(|result| {
        result.state == StartRunState::Skipped
            && result.gate_reason == Some(GateReason::AlreadyRunning)
    }));
    assert_eq!(store.count_active_runs().await?, 1);
    assert_eq!(dispatcher.count().await, 1);
    Ok(())
}

/// Delegates to a real store, optionally serving a stale project snapshot to the
/// pre-check or failing selected calls.
struct ScriptedStore {
    inner: Arc<dyn OrchestratorStore>,
    snapshot: Option<ProjectRow>,
    fail_dequeue: bool,
    fail_count: bool,
}

impl ScriptedStore {
    fn over(inner: Arc<dyn OrchestratorStore>) -> Self {
        Self {
            inner,
            snapshot: None,
            fail_dequeue: false,
            fail_count: false,
        }
    }

    fn with_snapshot(inner: Arc<dyn OrchestratorStore>, snapshot: ProjectRow) -> Self {
        Self {
            snapshot: Some(snapshot),
            ..Self::over(inner)
        }
    }
}

#[async_trait]
impl OrchestratorStore for ScriptedStore {
    async fn put_project(&self, project: ProjectRow) -> Result<(), StoreError> {
        self.inner.put_project(project).await
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<ProjectRow>, StoreError> {
        if let Some(snapshot) = self
            .snapshot
            .as_ref()
            .filter(|snapshot| snapshot.project_id == project_id)
        {
            return Ok(Some(snapshot.clone()));
        }
        self.inner.get_project(project_id).await
    }

    async fn get_run(&self, project_id: &str, run_id: &str) -> Result<Option<RunRow>, StoreError> {
        self.inner.get_run(project_id, run_id).await
    }

    async fn count_active_runs(&self) -> Result<u64, StoreError> {
        if self.fail_count {
            return Err(StoreError::Db("connection refused".to_string()));
        }
        self.inner.count_active_runs().await
    }

    async fn sum_charged_cents_since(
        &self,
        project_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.inner.sum_charged_cents_since(project_id, since).await
    }

    async fn claim_run_lock(&self, claim: RunLockClaim) -> Result<RunLockOutcome, StoreError> {
        self.inner.claim_run_lock(claim).await
    }

    async fn abandon_run(&self, request: AbandonRun) -> Result<AbandonOutcome, StoreError> {
        self.inner.abandon_run(request).await
    }

    async fn mark_run_started(
        &self,
        project_id: &str,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RunRow>, StoreError> {
        self.inner.mark_run_started(project_id, run_id, now).await
    }

    async fn record_heartbeat(
        &self,
        project_id: &str,
        run_id: &str,
        phase: Option<String>,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<RunRow>, StoreError> {
        self.inner
            .record_heartbeat(project_id, run_id, phase, message, now)
            .await
    }

    async fn finish_run(&self, request: FinishRun) -> Result<FinishOutcome, StoreError> {
        self.inner.finish_run(request).await
    }

    async fn enqueue_project(
        &self,
        project_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.enqueue_project(project_id, reason, now).await
    }

    async fn dequeue_project(&self, project_id: &str) -> Result<(), StoreError> {
        if self.fail_dequeue {
            return Err(StoreError::Db("queue table locked".to_string()));
        }
        self.inner.dequeue_project(project_id).await
    }

    async fn list_queue(&self, limit: usize) -> Result<Vec<QueueEntryRow>, StoreError> {
        self.inner.list_queue(limit).await
    }

    async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<RunRow>, StoreError> {
        self.inner.list_runs_by_status(status).await
    }

    async fn credit_wallet(
        &self,
        project_id: &str,
        payment_ref: &str,
        amount_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner
            .credit_wallet(project_id, payment_ref, amount_cents, now)
            .await
    }
}

#[tokio::test]
async fn claim_loses_to_a_lock_taken_after_the_gate_check() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 5_000)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());
    let (winner, _) = start_run(&service, &dispatcher, "proj_a").await?;

    let racing = service_with(
        Arc::new(ScriptedStore::with_snapshot(
            store.clone(),
            project("proj_a", 5_000),
        )),
        dispatcher.clone(),
        OrchestratorPolicy::default(),
    );
    let result = racing.maybe_start_run("proj_a").await?;
    assert_eq!(result.state, StartRunState::Skipped);
    assert_eq!(result.gate_reason, Some(GateReason::AlreadyRunning));
    assert_eq!(result.run_id, None);
    let message = result.message.unwrap_or_default();
    assert!(message.contains("holds the project lock"), "{message}");
    assert!(message.contains(&winner.run_id), "{message}");

    let locked = store
        .get_project("proj_a")
        .await?
        .ok_or_else(|| anyhow!("project missing"))?;
    assert_eq!(locked.current_run_id.as_deref(), Some(winner.run_id.as_str()));
    assert_eq!(store.count_active_runs().await?, 1);
    assert_eq!(store.list_runs_by_status(RunStatus::Queued).await?.len(), 1);
    assert_eq!(dispatcher.count().await, 1);
    Ok(())
}

#[tokio::test]
async fn claim_rechecks_the_balance_the_gate_saw() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_b", 100)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(
        Arc::new(ScriptedStore::with_snapshot(
            store.clone(),
            project("proj_b", 5_000),
        )),
        dispatcher.clone(),
        OrchestratorPolicy::default(),
    );

    let result = service.maybe_start_run("proj_b").await?;
    assert_eq!(result.state, StartRunState::Skipped);
    assert_eq!(result.gate_reason, Some(GateReason::AlreadyRunning));
    let message = result.message.unwrap_or_default();
    assert!(message.contains("dropped below the minimum"), "{message}");

    let stored = store
        .get_project("proj_b")
        .await?
        .ok_or_else(|| anyhow!("project missing"))?;
    assert_eq!(stored.current_run_id, None);
    assert_eq!(stored.balance_cents, 100);
    assert_eq!(store.count_active_runs().await?, 0);
    assert!(store.list_runs_by_status(RunStatus::Queued).await?.is_empty());
    assert!(store.list_queue(10).await?.is_empty());
    assert_eq!(dispatcher.count().await, 0);
    Ok(())
}

#[tokio::test]
async fn queue_cleanup_failure_after_dispatch_still_reports_started() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 5_000)).await?;
    store
        .enqueue_project("proj_a", GateReason::GlobalConcurrency.as_str(), Utc::now())
        .await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(
        Arc::new(ScriptedStore {
            fail_dequeue: true,
            ..ScriptedStore::over(store.clone())
        }),
        dispatcher.clone(),
        OrchestratorPolicy::default(),
    );

    let result = service.maybe_start_run("proj_a").await?;
    assert_eq!(result.state, StartRunState::Started);
    let run_id = result.run_id.ok_or_else(|| anyhow!("run id missing"))?;
    let run = store
        .get_run("proj_a", &run_id)
        .await?
        .ok_or_else(|| anyhow!("run missing"))?;
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(dispatcher.count().await, 1);
    Ok(())
}

#[tokio::test]
async fn readiness_reports_an_unreachable_store_as_dependency_unavailable() -> Result<()> {
    let service = service_with(
        Arc::new(ScriptedStore {
            fail_count: true,
            ..ScriptedStore::over(store::memory())
        }),
        Arc::new(RecordingDispatcher::default()),
        OrchestratorPolicy::default(),
    );
    match service.readiness().await {
        Err(error @ OrchestratorError::DependencyUnavailable(_)) => {
            assert_eq!(error.code(), "dependency_unavailable");
        }
        other => return Err(anyhow!("expected dependency_unavailable, got {other:?}")),
    }
    Ok(())
}

#[tokio::test]
async fn global_concurrency_pressure_enqueues_the_project() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 5_000)).await?;
    store.put_project(project("proj_b", 5_000)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let policy = OrchestratorPolicy {
        global_max_concurrent_runs: 1,
        ..OrchestratorPolicy::default()
    };
    let service = service_with(store.clone(), dispatcher.clone(), policy);

    start_run(&service, &dispatcher, "proj_a").await?;
    let blocked = service.maybe_start_run("proj_b").await?;
    assert_eq!(blocked.state, StartRunState::QueueEnqueued);
    assert_eq!(blocked.gate_reason, Some(GateReason::GlobalConcurrency));

    let queue = store.list_queue(10).await?;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].project_id, "proj_b");
    assert_eq!(queue[0].reason, "global_concurrency");
    Ok(())
}

#[tokio::test]
async fn project_daily_cap_counts_runs_charged_today() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 5_000)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let policy = OrchestratorPolicy {
        per_project_max_daily_spend_cents: 1_500,
        ..OrchestratorPolicy::default()
    };
    let service = service_with(store.clone(), dispatcher.clone(), policy);

    let (auth, _) = start_run(&service, &dispatcher, "proj_a").await?;
    let response = service
        .run_finished(&auth, finished(&auth, Some(800)), Utc::now())
        .await?;
    assert!(response.applied);
    assert_eq!(response.charged_cents, 800);

    // 800 spent today plus a proposed 1000 cent run exceeds the 1500 cap.
    let continuation = response
        .continuation
        .ok_or_else(|| anyhow!("continuation missing"))?;
    assert_eq!(continuation.state, StartRunState::QueueEnqueued);
    assert_eq!(continuation.gate_reason, Some(GateReason::ProjectDailyCap));
    Ok(())
}

#[tokio::test]
async fn dispatch_failure_fails_run_unlocks_and_requeues() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 1_500)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::failing("workflow not found"));
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());

    let result = service.maybe_start_run("proj_a").await?;
    assert_eq!(result.state, StartRunState::DispatchFailed);
    let run_id = result.run_id.ok_or_else(|| anyhow!("run id missing"))?;
    assert!(
        result
            .message
            .as_deref()
            .is_some_and(|message| message.contains("workflow not found"))
    );

    let run = store
        .get_run("proj_a", &run_id)
        .await?
        .ok_or_else(|| anyhow!("run missing"))?;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.charged_cents, Some(0));
    assert!(run.ended_at.is_some());
    assert!(run.run_token_hash.is_none());
    assert!(
        run.summary_md
            .as_deref()
            .is_some_and(|summary| summary.starts_with("Dispatch failed before run start:"))
    );

    let project = store
        .get_project("proj_a")
        .await?
        .ok_or_else(|| anyhow!("project missing"))?;
    assert!(project.current_run_id.is_none());
    assert_eq!(project.balance_cents, 1_500);
    assert_eq!(store.count_active_runs().await?, 0);

    let queue = store.list_queue(10).await?;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].reason, "dispatch_failed");
    Ok(())
}

#[tokio::test]
async fn missing_backend_base_url_is_a_dispatch_failure() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 1_500)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = OrchestratorService::new(store.clone(), dispatcher.clone(), None);

    let result = service.maybe_start_run("proj_a").await?;
    assert_eq!(result.state, StartRunState::DispatchFailed);
    assert!(
        result
            .message
            .as_deref()
            .is_some_and(|message| message.contains("BACKEND_BASE_URL is required"))
    );
    assert_eq!(dispatcher.count().await, 0);
    Ok(())
}

#[tokio::test]
async fn run_callbacks_move_the_run_through_its_lifecycle() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 1_500)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());
    let (auth, token) = start_run(&service, &dispatcher, "proj_a").await?;

    let credentials = RunCredentials {
        project_id: auth.project_id.clone(),
        run_id: auth.run_id.clone(),
        run_token: token,
    };
    let now = Utc::now();
    let verified = service.authorize_run(&credentials, now).await?;
    assert_eq!(verified, auth);

    let running = service.run_started(&verified, now).await?;
    assert_eq!(running.status, RunStatus::Running);
    assert_eq!(running.started_at, Some(now));

    let later = now + Duration::minutes(5);
    let beat = service
        .run_heartbeat(
            &verified,
            RunHeartbeatRequest {
                phase: Some("editing".to_string()),
                message: Some("x".repeat(700)),
            },
            later,
        )
        .await?;
    assert_eq!(beat.heartbeat_at, Some(later));
    assert_eq!(beat.heartbeat_phase.as_deref(), Some("editing"));
    assert_eq!(
        beat.heartbeat_message.map(|message| message.chars().count()),
        Some(500)
    );

    // A repeated runStarted refreshes the heartbeat without resetting started_at.
    let again = service.run_started(&verified, later).await?;
    assert_eq!(again.started_at, Some(now));
    assert_eq!(again.status, RunStatus::Running);

    let response = service
        .run_finished(&verified, finished(&verified, None), later)
        .await?;
    assert!(response.applied);
    assert_eq!(response.charged_cents, 1_000);

    let run = store
        .get_run(&auth.project_id, &auth.run_id)
        .await?
        .ok_or_else(|| anyhow!("run missing"))?;
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.run_token_hash.is_none());

    // Token material is gone once the run ends.
    let rejected = service.authorize_run(&credentials, later).await;
    assert!(matches!(rejected, Err(OrchestratorError::Unauthorized(_))));
    Ok(())
}

#[tokio::test]
async fn run_finished_twice_charges_once() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 1_500)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());
    let (auth, _) = start_run(&service, &dispatcher, "proj_a").await?;

    let first = service
        .run_finished(&auth, finished(&auth, Some(300)), Utc::now())
        .await?;
    assert!(first.applied);
    let balance_after_first = store
        .get_project("proj_a")
        .await?
        .ok_or_else(|| anyhow!("project missing"))?
        .balance_cents;
    assert_eq!(balance_after_first, 1_200);

    let second = service
        .run_finished(&auth, finished(&auth, Some(900)), Utc::now())
        .await?;
    assert!(!second.applied);
    assert_eq!(second.charged_cents, 300);

    let run = store
        .get_run(&auth.project_id, &auth.run_id)
        .await?
        .ok_or_else(|| anyhow!("run missing"))?;
    assert_eq!(run.charged_cents, Some(300));
    let project = store
        .get_project("proj_a")
        .await?
        .ok_or_else(|| anyhow!("project missing"))?;
    // The first finish auto-continued into a new run, which holds the lock
    // but has not been charged.
    assert_eq!(project.balance_cents, 1_200);
    Ok(())
}

#[tokio::test]
async fn run_finished_auto_continues_while_funds_remain() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 2_100)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());
    let (auth, _) = start_run(&service, &dispatcher, "proj_a").await?;

    let response = service
        .run_finished(&auth, finished(&auth, None), Utc::now())
        .await?;
    let continuation = response
        .continuation
        .ok_or_else(|| anyhow!("continuation missing"))?;
    assert_eq!(continuation.state, StartRunState::Started);
    assert_ne!(continuation.run_id.as_deref(), Some(auth.run_id.as_str()));

    // 1100 left after the first run; the second finish leaves 100, below the minimum.
    let next = dispatcher.last_request().await?;
    let next_auth = RunAuthorization {
        project_id: next.project_id,
        run_id: next.run_id,
    };
    let response = service
        .run_finished(&next_auth, finished(&next_auth, None), Utc::now())
        .await?;
    let continuation = response
        .continuation
        .ok_or_else(|| anyhow!("continuation missing"))?;
    assert_eq!(continuation.state, StartRunState::Skipped);
    assert_eq!(continuation.gate_reason, Some(GateReason::InsufficientBalance));
    assert_eq!(dispatcher.count().await, 2);
    Ok(())
}

#[tokio::test]
async fn run_finished_rejects_mismatched_body_and_bad_input() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 1_500)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());
    let (auth, _) = start_run(&service, &dispatcher, "proj_a").await?;

    let mismatched = RunFinishedRequest {
        run_id: "run_other".to_string(),
        ..finished(&auth, None)
    };
    assert!(matches!(
        service.run_finished(&auth, mismatched, Utc::now()).await,
        Err(OrchestratorError::Unauthorized(_))
    ));

    let empty_summary = RunFinishedRequest {
        summary_md: String::new(),
        ..finished(&auth, None)
    };
    assert!(matches!(
        service.run_finished(&auth, empty_summary, Utc::now()).await,
        Err(OrchestratorError::InvalidRequest(_))
    ));

    let run = store
        .get_run(&auth.project_id, &auth.run_id)
        .await?
        .ok_or_else(|| anyhow!("run missing"))?;
    assert!(run.ended_at.is_none());
    Ok(())
}

#[tokio::test]
async fn authorize_run_distinguishes_failure_modes() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 1_500)).await?;
    store.put_project(project("proj_b", 1_500)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());
    let (auth_a, token_a) = start_run(&service, &dispatcher, "proj_a").await?;
    let (auth_b, _) = start_run(&service, &dispatcher, "proj_b").await?;
    let now = Utc::now();

    let missing_token = RunCredentials {
        project_id: auth_a.project_id.clone(),
        run_id: auth_a.run_id.clone(),
        run_token: "  ".to_string(),
    };
    assert!(matches!(
        service.authorize_run(&missing_token, now).await,
        Err(OrchestratorError::InvalidRequest(message)) if message == "Missing run token, projectId, or runId"
    ));

    let unknown_run = RunCredentials {
        run_id: "run_unknown".to_string(),
        run_token: token_a.clone(),
        ..missing_token.clone()
    };
    assert!(matches!(
        service.authorize_run(&unknown_run, now).await,
        Err(OrchestratorError::NotFound(message)) if message == "Run not found"
    ));

    // A token is bound to the run that minted it.
    let other_run = RunCredentials {
        project_id: auth_b.project_id.clone(),
        run_id: auth_b.run_id.clone(),
        run_token: token_a.clone(),
    };
    assert!(matches!(
        service.authorize_run(&other_run, now).await,
        Err(OrchestratorError::Unauthorized(message)) if message == "Invalid run token"
    ));

    let valid = RunCredentials {
        run_token: token_a,
        ..missing_token
    };
    assert!(service.authorize_run(&valid, now).await.is_ok());
    assert!(matches!(
        service.authorize_run(&valid, now + Duration::minutes(120)).await,
        Err(OrchestratorError::Unauthorized(message)) if message == "Run token expired"
    ));
    Ok(())
}

#[tokio::test]
async fn queue_drain_starts_oldest_first() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 1_500)).await?;
    store.put_project(project("proj_b", 1_500)).await?;
    let start = Utc::now();
    store
        .enqueue_project("proj_b", "global_daily_cap", start)
        .await?;
    store
        .enqueue_project("proj_a", "global_daily_cap", start + Duration::seconds(1))
        .await?;
    store
        .enqueue_project("proj_gone", "global_daily_cap", start + Duration::seconds(2))
        .await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());

    let summary = service.process_run_queue_batch(25).await?;
    assert_eq!(summary.scanned, 3);
    assert_eq!(summary.started, 2);
    assert_eq!(summary.skipped, 1);
    assert!(!summary.stopped_on_global_concurrency);

    let order: Vec<String> = dispatcher
        .requests
        .lock()
        .await
        .iter()
        .map(|request| request.project_id.clone())
        .collect();
    assert_eq!(order, vec!["proj_b".to_string(), "proj_a".to_string()]);
    assert!(store.list_queue(10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn queue_drain_stops_at_global_concurrency() -> Result<()> {
    let store = store::memory();
    for project_id in ["proj_running", "proj_a", "proj_b", "proj_c"] {
        store.put_project(project(project_id, 1_500)).await?;
    }
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let policy = OrchestratorPolicy {
        global_max_concurrent_runs: 1,
        ..OrchestratorPolicy::default()
    };
    let service = service_with(store.clone(), dispatcher.clone(), policy);
    start_run(&service, &dispatcher, "proj_running").await?;

    let start = Utc::now();
    for (offset, project_id) in ["proj_a", "proj_b", "proj_c"].into_iter().enumerate() {
        store
            .enqueue_project(
                project_id,
                "global_concurrency",
                start + Duration::seconds(offset as i64),
            )
            .await?;
    }

    let summary = service.process_run_queue_batch(25).await?;
    assert_eq!(summary.scanned, 1);
    assert_eq!(summary.re_enqueued, 1);
    assert!(summary.stopped_on_global_concurrency);
    assert_eq!(store.list_queue(10).await?.len(), 3);
    assert_eq!(dispatcher.count().await, 1);
    Ok(())
}

#[tokio::test]
async fn stale_queued_runs_fail_without_charge_and_requeue() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 1_500)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());
    let (auth, _) = start_run(&service, &dispatcher, "proj_a").await?;

    let early = service
        .recover_stale_queued_runs(Utc::now() + Duration::minutes(5), Duration::minutes(15))
        .await?;
    assert_eq!(early.reaped, 0);

    let sweep_at = Utc::now() + Duration::minutes(16);
    let summary = service
        .recover_stale_queued_runs(sweep_at, Duration::minutes(15))
        .await?;
    assert_eq!(summary.scanned, 1);
    assert_eq!(summary.reaped, 1);

    let run = store
        .get_run(&auth.project_id, &auth.run_id)
        .await?
        .ok_or_else(|| anyhow!("run missing"))?;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.charged_cents, Some(0));
    assert_eq!(run.ended_at, Some(sweep_at));

    let project = store
        .get_project("proj_a")
        .await?
        .ok_or_else(|| anyhow!("project missing"))?;
    assert!(project.current_run_id.is_none());
    assert_eq!(project.balance_cents, 1_500);
    assert_eq!(store.count_active_runs().await?, 0);
    let queue = store.list_queue(10).await?;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].reason, "stale_queued_run");

    let repeat = service
        .recover_stale_queued_runs(sweep_at, Duration::minutes(15))
        .await?;
    assert_eq!(repeat.reaped, 0);
    Ok(())
}

#[tokio::test]
async fn stale_running_runs_are_charged_their_full_budget() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 1_500)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());
    let (auth, _) = start_run(&service, &dispatcher, "proj_a").await?;
    let started_at = Utc::now();
    service.run_started(&auth, started_at).await?;

    let fresh = service
        .recover_stale_running_runs(started_at + Duration::minutes(60), Duration::minutes(90))
        .await?;
    assert_eq!(fresh.reaped, 0);

    let sweep_at = started_at + Duration::minutes(91);
    let summary = service.recover_stale_runs(sweep_at).await?;
    assert_eq!(summary.running.reaped, 1);
    assert_eq!(summary.running.charged_cents, 1_000);
    assert_eq!(summary.queued.reaped, 0);

    let run = store
        .get_run(&auth.project_id, &auth.run_id)
        .await?
        .ok_or_else(|| anyhow!("run missing"))?;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.spent_cents, Some(1_000));
    assert_eq!(run.charged_cents, Some(1_000));

    let project = store
        .get_project("proj_a")
        .await?
        .ok_or_else(|| anyhow!("project missing"))?;
    assert_eq!(project.balance_cents, 500);
    assert!(project.current_run_id.is_none());
    let queue = store.list_queue(10).await?;
    assert_eq!(queue[0].reason, "stale_running_run");

    let repeat = service.recover_stale_runs(sweep_at).await?;
    assert_eq!(repeat.running.reaped, 0);
    let project = store
        .get_project("proj_a")
        .await?
        .ok_or_else(|| anyhow!("project missing"))?;
    assert_eq!(project.balance_cents, 500);
    Ok(())
}

#[tokio::test]
async fn late_finish_after_reaping_is_ignored() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 1_500)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());
    let (auth, _) = start_run(&service, &dispatcher, "proj_a").await?;
    let started_at = Utc::now();
    service.run_started(&auth, started_at).await?;
    service
        .recover_stale_running_runs(started_at + Duration::minutes(91), Duration::minutes(90))
        .await?;

    let response = service
        .run_finished(&auth, finished(&auth, Some(10)), Utc::now())
        .await?;
    assert!(!response.applied);
    assert_eq!(response.charged_cents, 1_000);
    Ok(())
}

#[tokio::test]
async fn wallet_credit_is_idempotent_and_starts_a_run() -> Result<()> {
    let store = store::memory();
    store.put_project(project("proj_a", 0)).await?;
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = service_with(store.clone(), dispatcher.clone(), OrchestratorPolicy::default());

    let first = service
        .credit_wallet(
            "proj_a",
            CreditWalletRequest {
                payment_ref: "pi_123".to_string(),
                amount_cents: 2_000,
            },
        )
        .await?;
    assert!(first.credited);
    assert_eq!(
        first.start.map(|start| start.state),
        Some(StartRunState::Started)
    );

    let replay = service
        .credit_wallet(
            "proj_a",
            CreditWalletRequest {
                payment_ref: "pi_123".to_string(),
                amount_cents: 2_000,
            },
        )
        .await?;
    assert!(!replay.credited);
    assert_eq!(
        replay.start.and_then(|start| start.gate_reason),
        Some(GateReason::AlreadyRunning)
    );

    let project = store
        .get_project("proj_a")
        .await?
        .ok_or_else(|| anyhow!("project missing"))?;
    assert_eq!(project.balance_cents, 2_000);

    assert!(matches!(
        service
            .credit_wallet(
                "proj_a",
                CreditWalletRequest {
                    payment_ref: "pi_bad".to_string(),
                    amount_cents: 0,
                },
            )
            .await,
        Err(OrchestratorError::InvalidRequest(_))
    ));
    Ok(())
}

#[derive(Clone, Default)]
struct GithubStubState {
    files: Arc<Mutex<HashMap<String, String>>>,
    puts: Arc<AtomicU64>,
    dispatches: Arc<Mutex<Vec<Value>>>,
}

struct GithubStubHandle {
    base_url: String,
    state: GithubStubState,
    shutdown: oneshot::Sender<()>,
}

async fn spawn_github_stub() -> Result<GithubStubHandle> {
    let state = GithubStubState::default();
    let app = Router::new()
        .route(
            "/repos/:owner/:repo/contents/*path",
            get(get_contents).put(put_contents),
        )
        .route(
            "/repos/:owner/:repo/actions/workflows/:workflow/dispatches",
            post(dispatch_workflow),
        )
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let _ = server.await;
    });

    Ok(GithubStubHandle {
        base_url: format!("http://{addr}"),
        state,
        shutdown: shutdown_tx,
    })
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == "Bearer gh-test-token")
}

async fn get_contents(
    headers: HeaderMap,
    State(state): State<GithubStubState>,
    Path((_owner, _repo, path)): Path<(String, String, String)>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "Bad credentials"})));
    }
    match state.files.lock().await.get(&path) {
        Some(content) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
            let wrapped = encoded
                .as_bytes()
                .chunks(60)
                .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                .collect::<Vec<_>>()
                .join("\n");
            (
                StatusCode::OK,
                Json(json!({"content": wrapped, "sha": format!("sha-{path}")})),
            )
        }
        None => (StatusCode::NOT_FOUND, Json(json!({"message": "Not Found"}))),
    }
}

async fn put_contents(
    headers: HeaderMap,
    State(state): State<GithubStubState>,
    Path((_owner, _repo, path)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "Bad credentials"})));
    }
    let decoded = body
        .get("content")
        .and_then(Value::as_str)
        .and_then(|content| base64::engine::general_purpose::STANDARD.decode(content).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok());
    let Some(decoded) = decoded else {
        return (StatusCode::BAD_REQUEST, Json(json!({"message": "bad content"})));
    };
    state.puts.fetch_add(1, Ordering::Relaxed);
    state.files.lock().await.insert(path, decoded);
    (StatusCode::CREATED, Json(json!({"content": {}})))
}

async fn dispatch_workflow(
    headers: HeaderMap,
    State(state): State<GithubStubState>,
    Path((owner, repo, workflow)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    state.dispatches.lock().await.push(json!({
        "owner": owner,
        "repo": repo,
        "workflow": workflow,
        "body": body,
    }));
    StatusCode::NO_CONTENT
}

#[tokio::test]
async fn github_dispatcher_syncs_files_once_and_triggers_workflow() -> Result<()> {
    let github = spawn_github_stub().await?;
    let dispatcher = GithubWorkflowDispatcher::new(GithubDispatchConfig {
        api_base_url: github.base_url.clone(),
        token: "gh-test-token".to_string(),
        org_name: "gitcorps".to_string(),
        workflow_ref: "main".to_string(),
        timeout_ms: 5_000,
    });
    let request = DispatchRequest {
        project_id: "proj_a".to_string(),
        run_id: "run_1".to_string(),
        repo_ref: "proj_a".to_string(),
        budget_cents: 1_000,
        runtime_minutes: 50,
        token_budget: 750_000,
        run_token: "secret-token".to_string(),
        backend_base_url: BACKEND_BASE_URL.to_string(),
        agent_runtime: "copilot_cli".to_string(),
    };

    dispatcher.dispatch(&request).await?;
    assert_eq!(github.state.puts.load(Ordering::Relaxed), 2);
    {
        let files = github.state.files.lock().await;
        assert!(files.contains_key(WORKFLOW_FILE_PATH));
        assert!(files.contains_key(RUNNER_FILE_PATH));
    }

    dispatcher.dispatch(&request).await?;
    assert_eq!(github.state.puts.load(Ordering::Relaxed), 2);

    let dispatches = github.state.dispatches.lock().await.clone();
    assert_eq!(dispatches.len(), 2);
    assert_eq!(dispatches[0]["owner"], "gitcorps");
    assert_eq!(dispatches[0]["repo"], "proj_a");
    assert_eq!(dispatches[0]["workflow"], "gitcorps-agent.yml");
    assert_eq!(dispatches[0]["body"]["ref"], "main");
    assert_eq!(dispatches[0]["body"]["inputs"]["runToken"], "secret-token");
    assert_eq!(dispatches[0]["body"]["inputs"]["budgetCents"], "1000");

    let unauthorized = GithubWorkflowDispatcher::new(GithubDispatchConfig {
        api_base_url: github.base_url.clone(),
        token: "wrong".to_string(),
        org_name: "gitcorps".to_string(),
        workflow_ref: "main".to_string(),
        timeout_ms: 5_000,
    });
    assert!(matches!(
        unauthorized.dispatch(&request).await,
        Err(DispatchError::Github { status: 401, .. })
    ));

    let _ = github.shutdown.send(());
    Ok(())
}
