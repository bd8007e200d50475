use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;

use crate::db::OrchestratorDb;
use crate::orchestrator::budget::{budget_buckets, charged_cents, run_budget_cents};
use crate::orchestrator::types::{
    ActiveRunMarkerRow, ProjectRow, QueueEntryRow, RunRow, RunStatus,
};

const MAX_TRANSACTION_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("schema not provisioned: {0}")]
    SchemaNotProvisioned(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Everything the atomic lock claim needs to create a queued run.
#[derive(Debug, Clone)]
pub struct RunLockClaim {
    pub project_id: String,
    pub run_id: String,
    pub min_run_cents: i64,
    pub max_run_cents: i64,
    pub runtime_minutes_per_usd: f64,
    pub tokens_per_usd: f64,
    pub agent_runtime: String,
    pub run_token_hash: String,
    pub run_token_expires_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunLockOutcome {
    Claimed(RunRow),
    /// Another run took the lock after the optimistic pre-check.
    LockHeld { current_run_id: String },
    InsufficientBalance { balance_cents: i64 },
    MissingProject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonCharge {
    Nothing,
    /// Charge and debit the run's full budget.
    FullBudget,
}

/// Force-terminates a non-terminal run as `failed` and re-queues its project.
#[derive(Debug, Clone)]
pub struct AbandonRun {
    pub project_id: String,
    pub run_id: String,
    /// `None` accepts any non-terminal status.
    pub expected_status: Option<RunStatus>,
    pub require_lock_match: bool,
    pub charge: AbandonCharge,
    pub summary_md: String,
    pub requeue_reason: String,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbandonOutcome {
    pub applied: bool,
    pub charged_cents: i64,
}

#[derive(Debug, Clone)]
pub struct FinishRun {
    pub project_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub summary_md: String,
    pub spent_cents: Option<i64>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishOutcome {
    /// `false` when the run had already ended.
    pub applied: bool,
    pub charged_cents: i64,
    pub lock_released: bool,
}

#[async_trait]
pub trait OrchestratorStore: Send + Sync {
    async fn put_project(&self, project: ProjectRow) -> Result<(), StoreError>;

    async fn get_project(&self, project_id: &str) -> Result<Option<ProjectRow>, StoreError>;

    async fn get_run(&self, project_id: &str, run_id: &str)
    -> Result<Option<RunRow>, StoreError>;

    async fn count_active_runs(&self) -> Result<u64, StoreError>;

    /// Sum of `charged_cents` over runs that ended at or after `since`,
    /// globally or for one project.
    async fn sum_charged_cents_since(
        &self,
        project_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    async fn claim_run_lock(&self, claim: RunLockClaim) -> Result<RunLockOutcome, StoreError>;

    async fn abandon_run(&self, request: AbandonRun) -> Result<AbandonOutcome, StoreError>;

    /// `queued -> running`; a running run only has its heartbeat refreshed and an
    /// ended run is returned untouched.
    async fn mark_run_started(
        &self,
        project_id: &str,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RunRow>, StoreError>;

    async fn record_heartbeat(
        &self,
        project_id: &str,
        run_id: &str,
        phase: Option<String>,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<RunRow>, StoreError>;

    async fn finish_run(&self, request: FinishRun) -> Result<FinishOutcome, StoreError>;

    /// Upsert keyed by project: keeps the original `enqueued_at`, refreshes `reason`.
    async fn enqueue_project(
        &self,
        project_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn dequeue_project(&self, project_id: &str) -> Result<(), StoreError>;

    /// Oldest `enqueued_at` first.
    async fn list_queue(&self, limit: usize) -> Result<Vec<QueueEntryRow>, StoreError>;

    async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<RunRow>, StoreError>;

    /// Returns `false` when `payment_ref` was already applied.
    async fn credit_wallet(
        &self,
        project_id: &str,
        payment_ref: &str,
        amount_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

pub fn memory() -> Arc<dyn OrchestratorStore> {
    Arc::new(MemoryOrchestratorStore::default())
}

pub fn postgres(db: Arc<OrchestratorDb>) -> Arc<dyn OrchestratorStore> {
    Arc::new(PostgresOrchestratorStore { db })
}

fn new_queued_run(claim: &RunLockClaim, balance_cents: i64) -> RunRow {
    let budget_cents = run_budget_cents(balance_cents, claim.max_run_cents);
    let buckets = budget_buckets(
        budget_cents,
        claim.runtime_minutes_per_usd,
        claim.tokens_per_usd,
    );
    RunRow {
        run_id: claim.run_id.clone(),
        project_id: claim.project_id.clone(),
        status: RunStatus::Queued,
        budget_cents,
        budget_runtime_minutes: buckets.runtime_minutes,
        budget_token_limit: buckets.token_budget,
        agent_runtime: claim.agent_runtime.clone(),
        spent_cents: None,
        charged_cents: None,
        summary_md: None,
        heartbeat_phase: None,
        heartbeat_message: None,
        created_at: claim.now,
        started_at: None,
        heartbeat_at: Some(claim.now),
        ended_at: None,
        run_token_hash: Some(claim.run_token_hash.clone()),
        run_token_expires_at: Some(claim.run_token_expires_at),
    }
}

#[derive(Default)]
struct MemoryOrchestratorStore {
    inner: Mutex<MemoryOrchestratorStoreInner>,
}

#[derive(Default)]
struct MemoryOrchestratorStoreInner {
    projects: HashMap<String, ProjectRow>,
    runs: HashMap<String, RunRow>,
    active_runs: HashMap<String, ActiveRunMarkerRow>,
    queue: HashMap<String, QueueEntryRow>,
    funding_events: HashMap<String, (String, i64)>,
}

impl MemoryOrchestratorStoreInner {
    fn run_mut(&mut self, project_id: &str, run_id: &str) -> Option<&mut RunRow> {
        self.runs
            .get_mut(run_id)
            .filter(|run| run.project_id == project_id)
    }

    fn upsert_queue(&mut self, project_id: &str, reason: &str, now: DateTime<Utc>) {
        self.queue
            .entry(project_id.to_string())
            .and_modify(|entry| {
                entry.reason = reason.to_string();
                entry.updated_at = now;
            })
            .or_insert_with(|| QueueEntryRow {
                project_id: project_id.to_string(),
                reason: reason.to_string(),
                enqueued_at: now,
                updated_at: now,
            });
    }

    fn remove_marker(&mut self, project_id: &str, run_id: &str) {
        if self
            .active_runs
            .get(project_id)
            .is_some_and(|marker| marker.run_id == run_id)
        {
            self.active_runs.remove(project_id);
        }
    }

    /// Clears the lock when it still points at `run_id`, debiting `debit_cents`
    /// floored at zero. Returns whether the lock was released.
    fn release_lock(
        &mut self,
        project_id: &str,
        run_id: &str,
        debit_cents: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(project) = self.projects.get_mut(project_id) else {
            return false;
        };
        if project.current_run_id.as_deref() != Some(run_id) {
            return false;
        }
        project.current_run_id = None;
        project.balance_cents = (project.balance_cents - debit_cents).max(0);
        project.updated_at = now;
        true
    }
}

#[async_trait]
impl OrchestratorStore for MemoryOrchestratorStore {
    async fn put_project(&self, project: ProjectRow) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.projects.insert(project.project_id.clone(), project);
        Ok(())
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<ProjectRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.projects.get(project_id).cloned())
    }

    async fn get_run(
        &self,
        project_id: &str,
        run_id: &str,
    ) -> Result<Option<RunRow>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .get(run_id)
            .filter(|run| run.project_id == project_id)
            .cloned())
    }

    async fn count_active_runs(&self) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.active_runs.len() as u64)
    }

    async fn sum_charged_cents_since(
        &self,
        project_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .values()
            .filter(|run| project_id.is_none_or(|project_id| run.project_id == project_id))
            .filter(|run| run.ended_at.is_some_and(|ended_at| ended_at >= since))
            .map(|run| run.charged_cents.unwrap_or(0))
            .sum())
    }

    async fn claim_run_lock(&self, claim: RunLockClaim) -> Result<RunLockOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(project) = inner.projects.get_mut(&claim.project_id) else {
            return Ok(RunLockOutcome::MissingProject);
        };
        if let Some(current_run_id) = project.current_run_id.clone() {
            return Ok(RunLockOutcome::LockHeld { current_run_id });
        }
        if project.balance_cents < claim.min_run_cents {
            return Ok(RunLockOutcome::InsufficientBalance {
                balance_cents: project.balance_cents,
            });
        }

        let run = new_queued_run(&claim, project.balance_cents);
        project.current_run_id = Some(run.run_id.clone());
        project.updated_at = claim.now;

        inner.runs.insert(run.run_id.clone(), run.clone());
        inner.active_runs.insert(
            claim.project_id.clone(),
            ActiveRunMarkerRow {
                project_id: claim.project_id.clone(),
                run_id: run.run_id.clone(),
                created_at: claim.now,
            },
        );
        inner.queue.remove(&claim.project_id);
        Ok(RunLockOutcome::Claimed(run))
    }

    async fn abandon_run(&self, request: AbandonRun) -> Result<AbandonOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let lock_matches = inner
            .projects
            .get(&request.project_id)
            .is_some_and(|project| project.current_run_id.as_deref() == Some(&request.run_id));
        if request.require_lock_match && !lock_matches {
            return Ok(AbandonOutcome::default());
        }

        let Some(run) = inner.run_mut(&request.project_id, &request.run_id) else {
            return Ok(AbandonOutcome::default());
        };
        if run.has_ended()
            || request
                .expected_status
                .is_some_and(|expected| run.status != expected)
        {
            return Ok(AbandonOutcome::default());
        }

        let charged = match request.charge {
            AbandonCharge::Nothing => 0,
            AbandonCharge::FullBudget => run.budget_cents,
        };
        run.status = RunStatus::Failed;
        if request.charge == AbandonCharge::FullBudget {
            run.spent_cents = Some(charged);
        }
        run.charged_cents = Some(charged);
        run.summary_md = Some(request.summary_md.clone());
        run.ended_at = Some(request.now);
        run.run_token_hash = None;
        run.run_token_expires_at = None;

        inner.release_lock(&request.project_id, &request.run_id, charged, request.now);
        inner.remove_marker(&request.project_id, &request.run_id);
        inner.upsert_queue(&request.project_id, &request.requeue_reason, request.now);

        Ok(AbandonOutcome {
            applied: true,
            charged_cents: charged,
        })
    }

    async fn mark_run_started(
        &self,
        project_id: &str,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RunRow>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner.run_mut(project_id, run_id) else {
            return Ok(None);
        };
        if !run.has_ended() {
            if run.status == RunStatus::Queued {
                run.status = RunStatus::Running;
                run.started_at = Some(now);
            }
            run.heartbeat_at = Some(now);
        }
        Ok(Some(run.clone()))
    }

    async fn record_heartbeat(
        &self,
        project_id: &str,
        run_id: &str,
        phase: Option<String>,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<RunRow>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner.run_mut(project_id, run_id) else {
            return Ok(None);
        };
        if !run.has_ended() {
            run.heartbeat_at = Some(now);
            run.heartbeat_phase = phase;
            run.heartbeat_message = message;
        }
        Ok(Some(run.clone()))
    }

    async fn finish_run(&self, request: FinishRun) -> Result<FinishOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner.run_mut(&request.project_id, &request.run_id) else {
            return Err(StoreError::NotFound("run".to_string()));
        };
        if run.has_ended() {
            return Ok(FinishOutcome {
                applied: false,
                charged_cents: run.charged_cents.unwrap_or(0),
                lock_released: false,
            });
        }

        let charged = charged_cents(request.spent_cents, run.budget_cents);
        run.status = request.status;
        run.spent_cents = Some(charged);
        run.charged_cents = Some(charged);
        run.ended_at = Some(request.now);
        run.heartbeat_at = Some(request.now);
        run.summary_md = Some(request.summary_md.clone());
        run.run_token_hash = None;
        run.run_token_expires_at = None;

        let lock_released =
            inner.release_lock(&request.project_id, &request.run_id, charged, request.now);
        inner.remove_marker(&request.project_id, &request.run_id);

        Ok(FinishOutcome {
            applied: true,
            charged_cents: charged,
            lock_released,
        })
    }

    async fn enqueue_project(
        &self,
        project_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.upsert_queue(project_id, reason, now);
        Ok(())
    }

    async fn dequeue_project(&self, project_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.queue.remove(project_id);
        Ok(())
    }

    async fn list_queue(&self, limit: usize) -> Result<Vec<QueueEntryRow>, StoreError> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<QueueEntryRow> = inner.queue.values().cloned().collect();
        entries.sort_by(|left, right| {
            left.enqueued_at
                .cmp(&right.enqueued_at)
                .then_with(|| left.project_id.cmp(&right.project_id))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<RunRow>, StoreError> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<RunRow> = inner
            .runs
            .values()
            .filter(|run| run.status == status)
            .cloned()
            .collect();
        runs.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.run_id.cmp(&right.run_id))
        });
        Ok(runs)
    }

    async fn credit_wallet(
        &self,
        project_id: &str,
        payment_ref: &str,
        amount_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some((existing_project, _)) = inner.funding_events.get(payment_ref) {
            if existing_project != project_id {
                return Err(StoreError::Conflict(
                    "payment_ref already applied to a different project".to_string(),
                ));
            }
            return Ok(false);
        }
        let Some(project) = inner.projects.get_mut(project_id) else {
            return Err(StoreError::NotFound("project".to_string()));
        };
        project.balance_cents = project.balance_cents.saturating_add(amount_cents);
        project.updated_at = now;
        inner.funding_events.insert(
            payment_ref.to_string(),
            (project_id.to_string(), amount_cents),
        );
        Ok(true)
    }
}

struct PostgresOrchestratorStore {
    db: Arc<OrchestratorDb>,
}

fn db_error(error: tokio_postgres::Error) -> StoreError {
    match error.code() {
        Some(code)
            if *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED =>
        {
            StoreError::Conflict(error.to_string())
        }
        Some(code) if *code == SqlState::UNDEFINED_TABLE || *code == SqlState::UNDEFINED_COLUMN => {
            StoreError::SchemaNotProvisioned(error.to_string())
        }
        _ => StoreError::Db(error.to_string()),
    }
}

/// Re-runs a transactional operation when Postgres reports a serialization
/// failure or deadlock.
async fn retry_on_conflict<T, F, Fut>(operation: &str, mut attempt: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Err(StoreError::Conflict(reason)) if attempts < MAX_TRANSACTION_ATTEMPTS => {
                tracing::warn!(operation, attempts, reason = %reason, "retrying orchestrator transaction");
            }
            other => return other,
        }
    }
}

const PROJECT_COLUMNS: &str =
    "project_id, status, balance_cents, current_run_id, repo_ref, created_at, updated_at";

const RUN_COLUMNS: &str = "run_id, project_id, status, budget_cents, budget_runtime_minutes, \
     budget_token_limit, agent_runtime, spent_cents, charged_cents, summary_md, heartbeat_phase, \
     heartbeat_message, created_at, started_at, heartbeat_at, ended_at, run_token_hash, \
     run_token_expires_at";

impl PostgresOrchestratorStore {
    async fn claim_run_lock_once(
        &self,
        claim: &RunLockClaim,
    ) -> Result<RunLockOutcome, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;

        let project = tx
            .query_opt(
                &format!(
                    "SELECT {PROJECT_COLUMNS} FROM orchestrator.projects WHERE project_id = $1 FOR UPDATE"
                ),
                &[&claim.project_id],
            )
            .await
            .map_err(db_error)?
            .as_ref()
            .map(map_project_row)
            .transpose()
            .map_err(StoreError::Db)?;

        let Some(project) = project else {
            return Ok(RunLockOutcome::MissingProject);
        };
        if let Some(current_run_id) = project.current_run_id {
            return Ok(RunLockOutcome::LockHeld { current_run_id });
        }
        if project.balance_cents < claim.min_run_cents {
            return Ok(RunLockOutcome::InsufficientBalance {
                balance_cents: project.balance_cents,
            });
        }

        let run = new_queued_run(claim, project.balance_cents);
        tx.execute(
            r#"
            INSERT INTO orchestrator.runs (
                run_id, project_id, status, budget_cents, budget_runtime_minutes,
                budget_token_limit, agent_runtime, created_at, heartbeat_at,
                run_token_hash, run_token_expires_at
            ) VALUES (
                $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11
            )
            "#,
            &[
                &run.run_id,
                &run.project_id,
                &run.status.as_str(),
                &run.budget_cents,
                &run.budget_runtime_minutes,
                &run.budget_token_limit,
                &run.agent_runtime,
                &run.created_at,
                &run.heartbeat_at,
                &run.run_token_hash,
                &run.run_token_expires_at,
            ],
        )
        .await
        .map_err(db_error)?;

        tx.execute(
            r#"
            UPDATE orchestrator.projects
               SET current_run_id = $2, updated_at = $3
             WHERE project_id = $1
            "#,
            &[&claim.project_id, &run.run_id, &claim.now],
        )
        .await
        .map_err(db_error)?;

        tx.execute(
            r#"
            INSERT INTO orchestrator.active_runs (project_id, run_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (project_id) DO UPDATE
               SET run_id = EXCLUDED.run_id, created_at = EXCLUDED.created_at
            "#,
            &[&claim.project_id, &run.run_id, &claim.now],
        )
        .await
        .map_err(db_error)?;

        tx.execute(
            "DELETE FROM orchestrator.run_queue WHERE project_id = $1",
            &[&claim.project_id],
        )
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(RunLockOutcome::Claimed(run))
    }

    async fn abandon_run_once(&self, request: &AbandonRun) -> Result<AbandonOutcome, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;

        let current_run_id: Option<Option<String>> = tx
            .query_opt(
                "SELECT current_run_id FROM orchestrator.projects WHERE project_id = $1 FOR UPDATE",
                &[&request.project_id],
            )
            .await
            .map_err(db_error)?
            .map(|row| row.try_get("current_run_id"))
            .transpose()
            .map_err(|error| StoreError::Db(error.to_string()))?;
        let lock_matches =
            current_run_id.flatten().as_deref() == Some(request.run_id.as_str());
        if request.require_lock_match && !lock_matches {
            return Ok(AbandonOutcome::default());
        }

        let run = tx
            .query_opt(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM orchestrator.runs WHERE run_id = $1 AND project_id = $2 FOR UPDATE"
                ),
                &[&request.run_id, &request.project_id],
            )
            .await
            .map_err(db_error)?
            .as_ref()
            .map(map_run_row)
            .transpose()
            .map_err(StoreError::Db)?;
        let Some(run) = run else {
            return Ok(AbandonOutcome::default());
        };
        if run.has_ended()
            || request
                .expected_status
                .is_some_and(|expected| run.status != expected)
        {
            return Ok(AbandonOutcome::default());
        }

        let (charged, spent) = match request.charge {
            AbandonCharge::Nothing => (0, run.spent_cents),
            AbandonCharge::FullBudget => (run.budget_cents, Some(run.budget_cents)),
        };
        tx.execute(
            r#"
            UPDATE orchestrator.runs
               SET status = $3, spent_cents = $4, charged_cents = $5, summary_md = $6,
                   ended_at = $7, run_token_hash = NULL, run_token_expires_at = NULL
             WHERE run_id = $1 AND project_id = $2
            "#,
            &[
                &request.run_id,
                &request.project_id,
                &RunStatus::Failed.as_str(),
                &spent,
                &charged,
                &request.summary_md,
                &request.now,
            ],
        )
        .await
        .map_err(db_error)?;

        if lock_matches {
            release_lock(&tx, &request.project_id, charged, request.now).await?;
        }
        delete_marker(&tx, &request.project_id, &request.run_id).await?;
        upsert_queue(&tx, &request.project_id, &request.requeue_reason, request.now).await?;

        tx.commit().await.map_err(db_error)?;
        Ok(AbandonOutcome {
            applied: true,
            charged_cents: charged,
        })
    }

    async fn finish_run_once(&self, request: &FinishRun) -> Result<FinishOutcome, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;

        let current_run_id: Option<Option<String>> = tx
            .query_opt(
                "SELECT current_run_id FROM orchestrator.projects WHERE project_id = $1 FOR UPDATE",
                &[&request.project_id],
            )
            .await
            .map_err(db_error)?
            .map(|row| row.try_get("current_run_id"))
            .transpose()
            .map_err(|error| StoreError::Db(error.to_string()))?;

        let run = tx
            .query_opt(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM orchestrator.runs WHERE run_id = $1 AND project_id = $2 FOR UPDATE"
                ),
                &[&request.run_id, &request.project_id],
            )
            .await
            .map_err(db_error)?
            .as_ref()
            .map(map_run_row)
            .transpose()
            .map_err(StoreError::Db)?
            .ok_or_else(|| StoreError::NotFound("run".to_string()))?;

        if run.has_ended() {
            tx.commit().await.map_err(db_error)?;
            return Ok(FinishOutcome {
                applied: false,
                charged_cents: run.charged_cents.unwrap_or(0),
                lock_released: false,
            });
        }

        let charged = charged_cents(request.spent_cents, run.budget_cents);
        tx.execute(
            r#"
            UPDATE orchestrator.runs
               SET status = $3, spent_cents = $4, charged_cents = $4, summary_md = $5,
                   ended_at = $6, heartbeat_at = $6,
                   run_token_hash = NULL, run_token_expires_at = NULL
             WHERE run_id = $1 AND project_id = $2
            "#,
            &[
                &request.run_id,
                &request.project_id,
                &request.status.as_str(),
                &charged,
                &request.summary_md,
                &request.now,
            ],
        )
        .await
        .map_err(db_error)?;

        let lock_released = current_run_id.flatten().as_deref() == Some(request.run_id.as_str());
        if lock_released {
            release_lock(&tx, &request.project_id, charged, request.now).await?;
        }
        delete_marker(&tx, &request.project_id, &request.run_id).await?;

        tx.commit().await.map_err(db_error)?;
        Ok(FinishOutcome {
            applied: true,
            charged_cents: charged,
            lock_released,
        })
    }

    async fn credit_wallet_once(
        &self,
        project_id: &str,
        payment_ref: &str,
        amount_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client.transaction().await.map_err(db_error)?;

        let existing = tx
            .query_opt(
                "SELECT project_id FROM orchestrator.funding_events WHERE payment_ref = $1",
                &[&payment_ref],
            )
            .await
            .map_err(db_error)?;
        if let Some(row) = existing {
            let existing_project: String = row
                .try_get("project_id")
                .map_err(|error| StoreError::Db(error.to_string()))?;
            if existing_project != project_id {
                return Err(StoreError::Conflict(
                    "payment_ref already applied to a different project".to_string(),
                ));
            }
            return Ok(false);
        }

        let updated = tx
            .execute(
                r#"
                UPDATE orchestrator.projects
                   SET balance_cents = balance_cents + $2, updated_at = $3
                 WHERE project_id = $1
                "#,
                &[&project_id, &amount_cents, &now],
            )
            .await
            .map_err(db_error)?;
        if updated == 0 {
            return Err(StoreError::NotFound("project".to_string()));
        }

        tx.execute(
            r#"
            INSERT INTO orchestrator.funding_events (payment_ref, project_id, amount_cents, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
            &[&payment_ref, &project_id, &amount_cents, &now],
        )
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(true)
    }
}

async fn release_lock(
    tx: &tokio_postgres::Transaction<'_>,
    project_id: &str,
    debit_cents: i64,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    tx.execute(
        r#"
        UPDATE orchestrator.projects
           SET current_run_id = NULL,
               balance_cents = GREATEST(balance_cents - $2, 0),
               updated_at = $3
         WHERE project_id = $1
        "#,
        &[&project_id, &debit_cents, &now],
    )
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn delete_marker(
    tx: &tokio_postgres::Transaction<'_>,
    project_id: &str,
    run_id: &str,
) -> Result<(), StoreError> {
    tx.execute(
        "DELETE FROM orchestrator.active_runs WHERE project_id = $1 AND run_id = $2",
        &[&project_id, &run_id],
    )
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn upsert_queue(
    tx: &tokio_postgres::Transaction<'_>,
    project_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    tx.execute(
        r#"
        INSERT INTO orchestrator.run_queue (project_id, reason, enqueued_at, updated_at)
        VALUES ($1, $2, $3, $3)
        ON CONFLICT (project_id) DO UPDATE
           SET reason = EXCLUDED.reason, updated_at = EXCLUDED.updated_at
        "#,
        &[&project_id, &reason, &now],
    )
    .await
    .map_err(db_error)?;
    Ok(())
}

#[async_trait]
impl OrchestratorStore for PostgresOrchestratorStore {
    async fn put_project(&self, project: ProjectRow) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO orchestrator.projects (
                    project_id, status, balance_cents, current_run_id, repo_ref, created_at, updated_at
                ) VALUES (
                    $1,$2,$3,$4,$5,$6,$7
                )
                ON CONFLICT (project_id) DO UPDATE
                   SET status = EXCLUDED.status,
                       balance_cents = EXCLUDED.balance_cents,
                       current_run_id = EXCLUDED.current_run_id,
                       repo_ref = EXCLUDED.repo_ref,
                       updated_at = EXCLUDED.updated_at
                "#,
                &[
                    &project.project_id,
                    &project.status.as_str(),
                    &project.balance_cents,
                    &project.current_run_id,
                    &project.repo_ref,
                    &project.created_at,
                    &project.updated_at,
                ],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<ProjectRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                &format!("SELECT {PROJECT_COLUMNS} FROM orchestrator.projects WHERE project_id = $1"),
                &[&project_id],
            )
            .await
            .map_err(db_error)?;
        row.as_ref()
            .map(map_project_row)
            .transpose()
            .map_err(StoreError::Db)
    }

    async fn get_run(
        &self,
        project_id: &str,
        run_id: &str,
    ) -> Result<Option<RunRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM orchestrator.runs WHERE run_id = $1 AND project_id = $2"
                ),
                &[&run_id, &project_id],
            )
            .await
            .map_err(db_error)?;
        row.as_ref().map(map_run_row).transpose().map_err(StoreError::Db)
    }

    async fn count_active_runs(&self) -> Result<u64, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one("SELECT COUNT(*) AS active FROM orchestrator.active_runs", &[])
            .await
            .map_err(db_error)?;
        let active: i64 = row
            .try_get("active")
            .map_err(|error| StoreError::Db(error.to_string()))?;
        Ok(u64::try_from(active).unwrap_or(0))
    }

    async fn sum_charged_cents_since(
        &self,
        project_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                SELECT COALESCE(SUM(charged_cents), 0)::BIGINT AS total
                  FROM orchestrator.runs
                 WHERE ended_at >= $1
                   AND ($2::TEXT IS NULL OR project_id = $2)
                "#,
                &[&since, &project_id],
            )
            .await
            .map_err(db_error)?;
        row.try_get("total")
            .map_err(|error| StoreError::Db(error.to_string()))
    }

    async fn claim_run_lock(&self, claim: RunLockClaim) -> Result<RunLockOutcome, StoreError> {
        retry_on_conflict("claim_run_lock", || self.claim_run_lock_once(&claim)).await
    }

    async fn abandon_run(&self, request: AbandonRun) -> Result<AbandonOutcome, StoreError> {
        retry_on_conflict("abandon_run", || self.abandon_run_once(&request)).await
    }

    async fn mark_run_started(
        &self,
        project_id: &str,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RunRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    r#"
                    UPDATE orchestrator.runs
                       SET status = CASE WHEN status = 'queued' THEN 'running' ELSE status END,
                           started_at = CASE WHEN status = 'queued' THEN $3::TIMESTAMPTZ ELSE started_at END,
                           heartbeat_at = CASE WHEN ended_at IS NULL THEN $3::TIMESTAMPTZ ELSE heartbeat_at END
                     WHERE run_id = $1 AND project_id = $2
                 RETURNING {RUN_COLUMNS}
                    "#
                ),
                &[&run_id, &project_id, &now],
            )
            .await
            .map_err(db_error)?;
        row.as_ref().map(map_run_row).transpose().map_err(StoreError::Db)
    }

    async fn record_heartbeat(
        &self,
        project_id: &str,
        run_id: &str,
        phase: Option<String>,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<RunRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    r#"
                    UPDATE orchestrator.runs
                       SET heartbeat_at = CASE WHEN ended_at IS NULL THEN $3::TIMESTAMPTZ ELSE heartbeat_at END,
                           heartbeat_phase = CASE WHEN ended_at IS NULL THEN $4::TEXT ELSE heartbeat_phase END,
                           heartbeat_message = CASE WHEN ended_at IS NULL THEN $5::TEXT ELSE heartbeat_message END
                     WHERE run_id = $1 AND project_id = $2
                 RETURNING {RUN_COLUMNS}
                    "#
                ),
                &[&run_id, &project_id, &now, &phase, &message],
            )
            .await
            .map_err(db_error)?;
        row.as_ref().map(map_run_row).transpose().map_err(StoreError::Db)
    }

    async fn finish_run(&self, request: FinishRun) -> Result<FinishOutcome, StoreError> {
        retry_on_conflict("finish_run", || self.finish_run_once(&request)).await
    }

    async fn enqueue_project(
        &self,
        project_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO orchestrator.run_queue (project_id, reason, enqueued_at, updated_at)
                VALUES ($1, $2, $3, $3)
                ON CONFLICT (project_id) DO UPDATE
                   SET reason = EXCLUDED.reason, updated_at = EXCLUDED.updated_at
                "#,
                &[&project_id, &reason, &now],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn dequeue_project(&self, project_id: &str) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                "DELETE FROM orchestrator.run_queue WHERE project_id = $1",
                &[&project_id],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn list_queue(&self, limit: usize) -> Result<Vec<QueueEntryRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = client
            .query(
                r#"
                SELECT project_id, reason, enqueued_at, updated_at
                  FROM orchestrator.run_queue
                 ORDER BY enqueued_at ASC, project_id ASC
                 LIMIT $1
                "#,
                &[&limit],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_queue_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)
    }

    async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<RunRow>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM orchestrator.runs WHERE status = $1 ORDER BY created_at ASC, run_id ASC"
                ),
                &[&status.as_str()],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(map_run_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)
    }

    async fn credit_wallet(
        &self,
        project_id: &str,
        payment_ref: &str,
        amount_cents: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        retry_on_conflict("credit_wallet", || {
            self.credit_wallet_once(project_id, payment_ref, amount_cents, now)
        })
        .await
    }
}

fn map_project_row(row: &tokio_postgres::Row) -> Result<ProjectRow, String> {
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    Ok(ProjectRow {
        project_id: row.try_get("project_id").map_err(|e| e.to_string())?,
        status: status.parse()?,
        balance_cents: row.try_get("balance_cents").map_err(|e| e.to_string())?,
        current_run_id: row.try_get("current_run_id").map_err(|e| e.to_string())?,
        repo_ref: row.try_get("repo_ref").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
    })
}

fn map_run_row(row: &tokio_postgres::Row) -> Result<RunRow, String> {
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    Ok(RunRow {
        run_id: row.try_get("run_id").map_err(|e| e.to_string())?,
        project_id: row.try_get("project_id").map_err(|e| e.to_string())?,
        status: status.parse()?,
        budget_cents: row.try_get("budget_cents").map_err(|e| e.to_string())?,
        budget_runtime_minutes: row
            .try_get("budget_runtime_minutes")
            .map_err(|e| e.to_string())?,
        budget_token_limit: row
            .try_get("budget_token_limit")
            .map_err(|e| e.to_string())?,
        agent_runtime: row.try_get("agent_runtime").map_err(|e| e.to_string())?,
        spent_cents: row.try_get("spent_cents").map_err(|e| e.to_string())?,
        charged_cents: row.try_get("charged_cents").map_err(|e| e.to_string())?,
        summary_md: row.try_get("summary_md").map_err(|e| e.to_string())?,
        heartbeat_phase: row.try_get("heartbeat_phase").map_err(|e| e.to_string())?,
        heartbeat_message: row
            .try_get("heartbeat_message")
            .map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        started_at: row.try_get("started_at").map_err(|e| e.to_string())?,
        heartbeat_at: row.try_get("heartbeat_at").map_err(|e| e.to_string())?,
        ended_at: row.try_get("ended_at").map_err(|e| e.to_string())?,
        run_token_hash: row.try_get("run_token_hash").map_err(|e| e.to_string())?,
        run_token_expires_at: row
            .try_get("run_token_expires_at")
            .map_err(|e| e.to_string())?,
    })
}

fn map_queue_row(row: &tokio_postgres::Row) -> Result<QueueEntryRow, String> {
    Ok(QueueEntryRow {
        project_id: row.try_get("project_id").map_err(|e| e.to_string())?,
        reason: row.try_get("reason").map_err(|e| e.to_string())?,
        enqueued_at: row.try_get("enqueued_at").map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
    })
}
