use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::orchestrator::budget::usd_to_cents;
use crate::orchestrator::dispatch::{DispatchError, DispatchRequest, RunDispatcher};
use crate::orchestrator::gate::{GateInput, evaluate_gate};
use crate::orchestrator::run_token::{is_expired, issue_run_token, verify_run_token};
use crate::orchestrator::store::{
    AbandonCharge, AbandonRun, FinishRun, OrchestratorStore, RunLockClaim, RunLockOutcome,
    StoreError,
};
use crate::orchestrator::types::{
    CreditWalletRequest, CreditWalletResult, DISPATCH_FAILED_QUEUE_REASON, GateReason,
    HEARTBEAT_MESSAGE_MAX_CHARS, POST_FUNDING_QUEUE_REASON, QueueDrainSummary, RecoverySummary,
    RunAuthorization, RunCredentials, RunFinishedRequest, RunFinishedResponse,
    RunHeartbeatRequest, RunRow, RunStatus, STALE_QUEUED_QUEUE_REASON,
    STALE_RUNNING_QUEUE_REASON, SUMMARY_MD_MAX_CHARS, StaleRunSweepSummary, StartRunResult,
    StartRunState,
};

const MIN_ID_CHARS: usize = 3;
const MIGRATE_HINT: &str = "run `run-orchestrator migrate` to provision the orchestrator schema";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("schema not provisioned: {0}")]
    SchemaNotProvisioned(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::DependencyUnavailable(_) => "dependency_unavailable",
            Self::SchemaNotProvisioned(_) => "schema_not_provisioned",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidRequest(message)
            | Self::Unauthorized(message)
            | Self::NotFound(message)
            | Self::Conflict(message)
            | Self::DependencyUnavailable(message)
            | Self::SchemaNotProvisioned(message)
            | Self::Internal(message) => message.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorPolicy {
    pub min_run_cents: i64,
    pub max_run_cents: i64,
    pub global_max_concurrent_runs: u64,
    pub global_max_daily_spend_cents: i64,
    pub per_project_max_daily_spend_cents: i64,
    pub run_token_ttl_minutes: u64,
    pub run_queue_check_limit: usize,
    pub runtime_minutes_per_usd: f64,
    pub tokens_per_usd: f64,
    pub agent_runtime: String,
    pub stale_queued_minutes: u64,
    pub stale_running_minutes: u64,
}

impl Default for OrchestratorPolicy {
    fn default() -> Self {
        Self {
            min_run_cents: usd_to_cents(2.0),
            max_run_cents: usd_to_cents(10.0),
            global_max_concurrent_runs: 10,
            global_max_daily_spend_cents: usd_to_cents(500.0),
            per_project_max_daily_spend_cents: usd_to_cents(100.0),
            run_token_ttl_minutes: 120,
            run_queue_check_limit: 25,
            runtime_minutes_per_usd: 5.0,
            tokens_per_usd: 75_000.0,
            agent_runtime: "copilot_cli".to_string(),
            stale_queued_minutes: 15,
            stale_running_minutes: 90,
        }
    }
}

#[derive(Clone)]
pub struct OrchestratorService {
    store: Arc<dyn OrchestratorStore>,
    dispatcher: Arc<dyn RunDispatcher>,
    backend_base_url: Option<String>,
    policy: OrchestratorPolicy,
}

impl OrchestratorService {
    pub fn new(
        store: Arc<dyn OrchestratorStore>,
        dispatcher: Arc<dyn RunDispatcher>,
        backend_base_url: Option<String>,
    ) -> Self {
        Self::new_with_policy(
            store,
            dispatcher,
            backend_base_url,
            OrchestratorPolicy::default(),
        )
    }

    pub fn new_with_policy(
        store: Arc<dyn OrchestratorStore>,
        dispatcher: Arc<dyn RunDispatcher>,
        backend_base_url: Option<String>,
        policy: OrchestratorPolicy,
    ) -> Self {
        Self {
            store,
            dispatcher,
            backend_base_url: backend_base_url
                .map(|url| url.trim().trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            policy,
        }
    }

    pub fn policy(&self) -> &OrchestratorPolicy {
        &self.policy
    }

    pub fn store(&self) -> Arc<dyn OrchestratorStore> {
        self.store.clone()
    }

    pub async fn readiness(&self) -> Result<u64, OrchestratorError> {
        self.store
            .count_active_runs()
            .await
            .map_err(|error| match error {
                StoreError::Db(message) => OrchestratorError::DependencyUnavailable(message),
                other => map_store_error(other),
            })
    }

    /// Admission gate, atomic lock claim, then dispatch. Business outcomes are
    /// reported in the result; only infrastructure failures are errors.
    pub async fn maybe_start_run(
        &self,
        project_id: &str,
    ) -> Result<StartRunResult, OrchestratorError> {
        let project_id = project_id.trim();
        if project_id.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "projectId is required".to_string(),
            ));
        }

        let Some(project) = self
            .store
            .get_project(project_id)
            .await
            .map_err(map_store_error)?
        else {
            return Ok(StartRunResult::missing_project());
        };
        if !project.status.is_runnable() {
            return Ok(StartRunResult::skipped(
                None,
                Some(format!("project status is {}", project.status.as_str())),
            ));
        }

        let now = Utc::now();
        let day_start = start_of_utc_day(now);
        let global_active_runs = self
            .store
            .count_active_runs()
            .await
            .map_err(map_store_error)?;
        let global_daily_spend_cents = self
            .store
            .sum_charged_cents_since(None, day_start)
            .await
            .map_err(map_store_error)?;
        let project_daily_spend_cents = self
            .store
            .sum_charged_cents_since(Some(project_id), day_start)
            .await
            .map_err(map_store_error)?;

        let gate = evaluate_gate(&GateInput {
            has_current_run: project.current_run_id.is_some(),
            balance_cents: project.balance_cents,
            min_run_cents: self.policy.min_run_cents,
            global_active_runs,
            global_max_concurrent_runs: self.policy.global_max_concurrent_runs,
            global_daily_spend_cents,
            global_max_daily_spend_cents: self.policy.global_max_daily_spend_cents,
            project_daily_spend_cents,
            project_max_daily_spend_cents: self.policy.per_project_max_daily_spend_cents,
            max_run_cents: self.policy.max_run_cents,
        });

        if gate.is_transient_pressure() {
            self.store
                .enqueue_project(project_id, gate.as_str(), now)
                .await
                .map_err(map_store_error)?;
            tracing::info!(project_id, reason = gate.as_str(), "project enqueued for later start");
            return Ok(StartRunResult::queue_enqueued(gate));
        }
        if gate != GateReason::Ok {
            return Ok(StartRunResult::skipped(Some(gate), None));
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let token = issue_run_token(now, self.policy.run_token_ttl_minutes);
        let outcome = self
            .store
            .claim_run_lock(RunLockClaim {
                project_id: project_id.to_string(),
                run_id: run_id.clone(),
                min_run_cents: self.policy.min_run_cents,
                max_run_cents: self.policy.max_run_cents,
                runtime_minutes_per_usd: self.policy.runtime_minutes_per_usd,
                tokens_per_usd: self.policy.tokens_per_usd,
                agent_runtime: self.policy.agent_runtime.clone(),
                run_token_hash: token.hash.clone(),
                run_token_expires_at: token.expires_at,
                now,
            })
            .await
            .map_err(map_store_error)?;

        let run = match outcome {
            RunLockOutcome::Claimed(run) => run,
            RunLockOutcome::LockHeld { current_run_id } => {
                return Ok(StartRunResult::skipped(
                    Some(GateReason::AlreadyRunning),
                    Some(format!("run {current_run_id} holds the project lock")),
                ));
            }
            RunLockOutcome::InsufficientBalance { balance_cents } => {
                return Ok(StartRunResult::skipped(
                    Some(GateReason::AlreadyRunning),
                    Some(format!(
                        "balance {balance_cents} dropped below the minimum before the lock was claimed"
                    )),
                ));
            }
            RunLockOutcome::MissingProject => return Ok(StartRunResult::missing_project()),
        };

        tracing::info!(
            project_id,
            run_id = %run.run_id,
            budget_cents = run.budget_cents,
            runtime_minutes = run.budget_runtime_minutes,
            token_budget = run.budget_token_limit,
            "run lock claimed"
        );

        let dispatched = match self.backend_base_url.as_deref() {
            None => Err(DispatchError::NotConfigured(
                "BACKEND_BASE_URL is required to dispatch workflow runs.".to_string(),
            )),
            Some(backend_base_url) => {
                self.dispatcher
                    .dispatch(&DispatchRequest {
                        project_id: project_id.to_string(),
                        run_id: run.run_id.clone(),
                        repo_ref: project.repo_ref.clone(),
                        budget_cents: run.budget_cents,
                        runtime_minutes: run.budget_runtime_minutes,
                        token_budget: run.budget_token_limit,
                        run_token: token.token,
                        backend_base_url: backend_base_url.to_string(),
                        agent_runtime: run.agent_runtime.clone(),
                    })
                    .await
            }
        };

        match dispatched {
            Ok(()) => {
                if let Err(error) = self.store.dequeue_project(project_id).await {
                    tracing::warn!(
                        project_id,
                        run_id = %run.run_id,
                        reason = %error,
                        "failed to clear queue entry for started run"
                    );
                }
                tracing::info!(project_id, run_id = %run.run_id, "run started");
                Ok(StartRunResult::started(run.run_id))
            }
            Err(error) => self.fail_dispatch(project_id, run, error).await,
        }
    }

    async fn fail_dispatch(
        &self,
        project_id: &str,
        run: RunRow,
        error: DispatchError,
    ) -> Result<StartRunResult, OrchestratorError> {
        let reason = error.to_string();
        tracing::warn!(project_id, run_id = %run.run_id, reason = %reason, "run dispatch failed");
        self.store
            .abandon_run(AbandonRun {
                project_id: project_id.to_string(),
                run_id: run.run_id.clone(),
                expected_status: None,
                require_lock_match: false,
                charge: AbandonCharge::Nothing,
                summary_md: format!("Dispatch failed before run start: {reason}"),
                requeue_reason: DISPATCH_FAILED_QUEUE_REASON.to_string(),
                now: Utc::now(),
            })
            .await
            .map_err(map_store_error)?;
        Ok(StartRunResult::dispatch_failed(run.run_id, reason))
    }

    /// Retries backlogged projects oldest first; stops as soon as the global
    /// concurrency ceiling is hit.
    pub async fn process_run_queue_batch(
        &self,
        limit: usize,
    ) -> Result<QueueDrainSummary, OrchestratorError> {
        let mut summary = QueueDrainSummary::default();
        if limit == 0 {
            return Ok(summary);
        }

        let entries = self
            .store
            .list_queue(limit)
            .await
            .map_err(|error| sweep_error("process_run_queue_batch", error))?;

        for entry in entries {
            summary.scanned += 1;
            let result = match self.maybe_start_run(&entry.project_id).await {
                Ok(result) => result,
                Err(error) => {
                    summary.errors += 1;
                    tracing::error!(
                        project_id = %entry.project_id,
                        code = error.code(),
                        reason = %error.message(),
                        "maybe_start_run failed during queue processing"
                    );
                    continue;
                }
            };

            tracing::debug!(
                project_id = %entry.project_id,
                state = result.state.as_str(),
                gate_reason = result.gate_reason.map(GateReason::as_str),
                "queue entry processed"
            );
            match result.state {
                StartRunState::Started => summary.started += 1,
                StartRunState::DispatchFailed => summary.dispatch_failed += 1,
                StartRunState::Skipped => summary.skipped += 1,
                StartRunState::MissingProject => {
                    summary.skipped += 1;
                    if let Err(error) = self.store.dequeue_project(&entry.project_id).await {
                        tracing::warn!(project_id = %entry.project_id, reason = %error, "failed to drop queue entry for missing project");
                    }
                }
                StartRunState::QueueEnqueued => {
                    summary.re_enqueued += 1;
                    if result.gate_reason == Some(GateReason::GlobalConcurrency) {
                        summary.stopped_on_global_concurrency = true;
                        tracing::info!(
                            project_id = %entry.project_id,
                            scanned = summary.scanned,
                            "queue drain stopped at global concurrency limit"
                        );
                        break;
                    }
                }
            }
        }

        Ok(summary)
    }

    pub async fn recover_stale_queued_runs(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<RecoverySummary, OrchestratorError> {
        let runs = self
            .store
            .list_runs_by_status(RunStatus::Queued)
            .await
            .map_err(|error| sweep_error("recover_stale_queued_runs", error))?;
        let cutoff = now
            .checked_sub_signed(stale_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut summary = RecoverySummary::default();

        for run in runs {
            summary.scanned += 1;
            if run.created_at > cutoff {
                continue;
            }

            let holds_lock = match self.store.get_project(&run.project_id).await {
                Ok(project) => project
                    .and_then(|project| project.current_run_id)
                    .is_some_and(|current| current == run.run_id),
                Err(error) => {
                    sweep_item_error("recover_stale_queued_runs", &run, error)?;
                    continue;
                }
            };
            if !holds_lock {
                continue;
            }

            let outcome = self
                .store
                .abandon_run(AbandonRun {
                    project_id: run.project_id.clone(),
                    run_id: run.run_id.clone(),
                    expected_status: Some(RunStatus::Queued),
                    require_lock_match: true,
                    charge: AbandonCharge::Nothing,
                    summary_md: "Run did not start within the stale window. Marked failed and re-queued automatically.".to_string(),
                    requeue_reason: STALE_QUEUED_QUEUE_REASON.to_string(),
                    now,
                })
                .await;
            match outcome {
                Ok(outcome) if outcome.applied => {
                    summary.reaped += 1;
                    tracing::warn!(
                        project_id = %run.project_id,
                        run_id = %run.run_id,
                        created_at = %run.created_at,
                        "stale queued run marked failed"
                    );
                }
                Ok(_) => {}
                Err(error) => sweep_item_error("recover_stale_queued_runs", &run, error)?,
            }
        }

        Ok(summary)
    }

    /// Runs without a heartbeat inside the window are charged their full budget.
    pub async fn recover_stale_running_runs(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<RecoverySummary, OrchestratorError> {
        let runs = self
            .store
            .list_runs_by_status(RunStatus::Running)
            .await
            .map_err(|error| sweep_error("recover_stale_running_runs", error))?;
        let cutoff = now
            .checked_sub_signed(stale_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut summary = RecoverySummary::default();

        for run in runs {
            summary.scanned += 1;
            let last_seen = run.heartbeat_at.unwrap_or(run.created_at);
            if last_seen > cutoff {
                continue;
            }

            let outcome = self
                .store
                .abandon_run(AbandonRun {
                    project_id: run.project_id.clone(),
                    run_id: run.run_id.clone(),
                    expected_status: Some(RunStatus::Running),
                    require_lock_match: false,
                    charge: AbandonCharge::FullBudget,
                    summary_md: "Run heartbeat became stale and was auto-terminated. Charged full run budget to avoid unmetered compute.".to_string(),
                    requeue_reason: STALE_RUNNING_QUEUE_REASON.to_string(),
                    now,
                })
                .await;
            match outcome {
                Ok(outcome) if outcome.applied => {
                    summary.reaped += 1;
                    summary.charged_cents += outcome.charged_cents;
                    tracing::warn!(
                        project_id = %run.project_id,
                        run_id = %run.run_id,
                        last_heartbeat_at = %last_seen,
                        charged_cents = outcome.charged_cents,
                        "stale running run terminated"
                    );
                }
                Ok(_) => {}
                Err(error) => sweep_item_error("recover_stale_running_runs", &run, error)?,
            }
        }

        Ok(summary)
    }

    /// Both sweeps always run; the first failure is reported afterwards.
    pub async fn recover_stale_runs(
        &self,
        now: DateTime<Utc>,
    ) -> Result<StaleRunSweepSummary, OrchestratorError> {
        let queued = self
            .recover_stale_queued_runs(now, minutes(self.policy.stale_queued_minutes))
            .await;
        let running = self
            .recover_stale_running_runs(now, minutes(self.policy.stale_running_minutes))
            .await;
        Ok(StaleRunSweepSummary {
            queued: queued?,
            running: running?,
        })
    }

    pub async fn authorize_run(
        &self,
        credentials: &RunCredentials,
        now: DateTime<Utc>,
    ) -> Result<RunAuthorization, OrchestratorError> {
        let project_id = credentials.project_id.trim();
        let run_id = credentials.run_id.trim();
        let run_token = credentials.run_token.trim();
        if project_id.is_empty() || run_id.is_empty() || run_token.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "Missing run token, projectId, or runId".to_string(),
            ));
        }

        let run = self
            .store
            .get_run(project_id, run_id)
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| OrchestratorError::NotFound("Run not found".to_string()))?;

        let (Some(stored_hash), Some(expires_at)) =
            (run.run_token_hash.as_deref(), run.run_token_expires_at)
        else {
            return Err(OrchestratorError::Unauthorized(
                "Run token is not configured".to_string(),
            ));
        };
        if is_expired(expires_at, now) {
            return Err(OrchestratorError::Unauthorized(
                "Run token expired".to_string(),
            ));
        }
        if !verify_run_token(stored_hash, run_token) {
            return Err(OrchestratorError::Unauthorized(
                "Invalid run token".to_string(),
            ));
        }

        Ok(RunAuthorization {
            project_id: project_id.to_string(),
            run_id: run_id.to_string(),
        })
    }

    pub async fn run_started(
        &self,
        auth: &RunAuthorization,
        now: DateTime<Utc>,
    ) -> Result<RunRow, OrchestratorError> {
        let run = self
            .store
            .mark_run_started(&auth.project_id, &auth.run_id, now)
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| OrchestratorError::NotFound("Run not found".to_string()))?;
        tracing::info!(
            project_id = %auth.project_id,
            run_id = %auth.run_id,
            status = run.status.as_str(),
            "run started callback"
        );
        Ok(run)
    }

    pub async fn run_heartbeat(
        &self,
        auth: &RunAuthorization,
        request: RunHeartbeatRequest,
        now: DateTime<Utc>,
    ) -> Result<RunRow, OrchestratorError> {
        let phase = normalize_heartbeat_field(request.phase);
        let message = normalize_heartbeat_field(request.message);
        let run = self
            .store
            .record_heartbeat(&auth.project_id, &auth.run_id, phase, message, now)
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| OrchestratorError::NotFound("Run not found".to_string()))?;
        tracing::debug!(
            project_id = %auth.project_id,
            run_id = %auth.run_id,
            phase = run.heartbeat_phase.as_deref().unwrap_or(""),
            "run heartbeat"
        );
        Ok(run)
    }

    /// Settles the run and re-enters `maybe_start_run` for the project. A failed
    /// continuation is logged and left out of the response.
    pub async fn run_finished(
        &self,
        auth: &RunAuthorization,
        request: RunFinishedRequest,
        now: DateTime<Utc>,
    ) -> Result<RunFinishedResponse, OrchestratorError> {
        validate_run_finished(&request)?;
        if request.project_id.trim() != auth.project_id || request.run_id.trim() != auth.run_id {
            return Err(OrchestratorError::Unauthorized(
                "Run token does not match projectId/runId".to_string(),
            ));
        }

        let outcome = self
            .store
            .finish_run(FinishRun {
                project_id: auth.project_id.clone(),
                run_id: auth.run_id.clone(),
                status: request.status.into(),
                summary_md: request.summary_md,
                spent_cents: request.spent_cents,
                now,
            })
            .await
            .map_err(|error| match error {
                StoreError::NotFound(_) => OrchestratorError::NotFound("Run not found".to_string()),
                other => map_store_error(other),
            })?;

        if outcome.applied {
            tracing::info!(
                project_id = %auth.project_id,
                run_id = %auth.run_id,
                status = RunStatus::from(request.status).as_str(),
                charged_cents = outcome.charged_cents,
                lock_released = outcome.lock_released,
                "run finished"
            );
        } else {
            tracing::info!(
                project_id = %auth.project_id,
                run_id = %auth.run_id,
                "run already ended; finish ignored"
            );
        }

        let continuation = match self.maybe_start_run(&auth.project_id).await {
            Ok(result) => Some(result),
            Err(error) => {
                tracing::error!(
                    project_id = %auth.project_id,
                    code = error.code(),
                    reason = %error.message(),
                    "auto-continue maybe_start_run failed"
                );
                None
            }
        };

        Ok(RunFinishedResponse {
            applied: outcome.applied,
            charged_cents: outcome.charged_cents,
            continuation,
        })
    }

    /// Applies a confirmed payment once per reference, then attempts a start.
    pub async fn credit_wallet(
        &self,
        project_id: &str,
        request: CreditWalletRequest,
    ) -> Result<CreditWalletResult, OrchestratorError> {
        let project_id = project_id.trim();
        let payment_ref = request.payment_ref.trim();
        if project_id.is_empty() || payment_ref.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "projectId and paymentRef are required".to_string(),
            ));
        }
        if request.amount_cents <= 0 {
            return Err(OrchestratorError::InvalidRequest(
                "amountCents must be positive".to_string(),
            ));
        }

        let now = Utc::now();
        let credited = self
            .store
            .credit_wallet(project_id, payment_ref, request.amount_cents, now)
            .await
            .map_err(|error| match error {
                StoreError::NotFound(_) => {
                    OrchestratorError::NotFound("Project not found".to_string())
                }
                other => map_store_error(other),
            })?;
        if credited {
            tracing::info!(project_id, payment_ref, amount_cents = request.amount_cents, "wallet credited");
        } else {
            tracing::info!(project_id, payment_ref, "payment already applied");
        }

        let start = match self.maybe_start_run(project_id).await {
            Ok(result) => Some(result),
            Err(error) => {
                tracing::error!(
                    project_id,
                    payment_ref,
                    reason = %error.message(),
                    "maybe_start_run failed after funding; enqueueing fallback"
                );
                self.store
                    .enqueue_project(project_id, POST_FUNDING_QUEUE_REASON, now)
                    .await
                    .map_err(map_store_error)?;
                None
            }
        };

        Ok(CreditWalletResult { credited, start })
    }
}

fn validate_run_finished(request: &RunFinishedRequest) -> Result<(), OrchestratorError> {
    if request.project_id.trim().chars().count() < MIN_ID_CHARS {
        return Err(OrchestratorError::InvalidRequest(
            "projectId must be at least 3 characters".to_string(),
        ));
    }
    if request.run_id.trim().chars().count() < MIN_ID_CHARS {
        return Err(OrchestratorError::InvalidRequest(
            "runId must be at least 3 characters".to_string(),
        ));
    }
    let summary_chars = request.summary_md.chars().count();
    if summary_chars == 0 || summary_chars > SUMMARY_MD_MAX_CHARS {
        return Err(OrchestratorError::InvalidRequest(format!(
            "summaryMd must be between 1 and {SUMMARY_MD_MAX_CHARS} characters"
        )));
    }
    if request.spent_cents.is_some_and(|spent| spent < 0) {
        return Err(OrchestratorError::InvalidRequest(
            "spentCents must be a non-negative integer".to_string(),
        ));
    }
    Ok(())
}

fn normalize_heartbeat_field(value: Option<String>) -> Option<String> {
    value
        .map(|value| {
            value
                .trim()
                .chars()
                .take(HEARTBEAT_MESSAGE_MAX_CHARS)
                .collect::<String>()
        })
        .filter(|value| !value.is_empty())
}

fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

fn minutes(value: u64) -> Duration {
    Duration::minutes(i64::try_from(value).unwrap_or(i64::MAX / 60_000))
}

fn map_store_error(error: StoreError) -> OrchestratorError {
    match error {
        StoreError::Conflict(message) => OrchestratorError::Conflict(message),
        StoreError::NotFound(message) => OrchestratorError::NotFound(message),
        StoreError::SchemaNotProvisioned(message) => {
            OrchestratorError::SchemaNotProvisioned(format!("{message}; {MIGRATE_HINT}"))
        }
        StoreError::Db(message) => OrchestratorError::Internal(message),
    }
}

/// Cross-project queries surface a missing schema as a hard failure with a hint.
fn sweep_error(operation: &'static str, error: StoreError) -> OrchestratorError {
    if let StoreError::SchemaNotProvisioned(message) = &error {
        tracing::error!(operation, reason = %message, hint = MIGRATE_HINT, "orchestrator schema missing");
    }
    map_store_error(error)
}

/// Per-run failures are logged and skipped unless the schema itself is missing.
fn sweep_item_error(
    operation: &'static str,
    run: &RunRow,
    error: StoreError,
) -> Result<(), OrchestratorError> {
    if matches!(error, StoreError::SchemaNotProvisioned(_)) {
        return Err(sweep_error(operation, error));
    }
    tracing::error!(
        operation,
        project_id = %run.project_id,
        run_id = %run.run_id,
        reason = %error,
        "stale run recovery failed for run"
    );
    Ok(())
}
