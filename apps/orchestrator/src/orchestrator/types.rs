use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const HEARTBEAT_MESSAGE_MAX_CHARS: usize = 500;
pub const SUMMARY_MD_MAX_CHARS: usize = 100_000;

pub const DISPATCH_FAILED_QUEUE_REASON: &str = "dispatch_failed";
pub const STALE_QUEUED_QUEUE_REASON: &str = "stale_queued_run";
pub const STALE_RUNNING_QUEUE_REASON: &str = "stale_running_run";
pub const POST_FUNDING_QUEUE_REASON: &str = "post_funding_start_failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Paused,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Failed => "failed",
        }
    }

    pub fn is_runnable(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown project status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    OutOfFunds,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::OutOfFunds => "out_of_funds",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "out_of_funds" => Ok(Self::OutOfFunds),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Terminal statuses an agent may report through `runFinished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishedRunStatus {
    Succeeded,
    Failed,
    OutOfFunds,
}

impl From<FinishedRunStatus> for RunStatus {
    fn from(value: FinishedRunStatus) -> Self {
        match value {
            FinishedRunStatus::Succeeded => Self::Succeeded,
            FinishedRunStatus::Failed => Self::Failed,
            FinishedRunStatus::OutOfFunds => Self::OutOfFunds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRow {
    pub project_id: String,
    pub status: ProjectStatus,
    pub balance_cents: i64,
    /// Execution lock: `Some` while a run owns the project.
    pub current_run_id: Option<String>,
    pub repo_ref: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRow {
    pub run_id: String,
    pub project_id: String,
    pub status: RunStatus,
    pub budget_cents: i64,
    pub budget_runtime_minutes: i64,
    pub budget_token_limit: i64,
    pub agent_runtime: String,
    pub spent_cents: Option<i64>,
    pub charged_cents: Option<i64>,
    pub summary_md: Option<String>,
    pub heartbeat_phase: Option<String>,
    pub heartbeat_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Presence marks the run terminal.
    pub ended_at: Option<DateTime<Utc>>,
    pub run_token_hash: Option<String>,
    pub run_token_expires_at: Option<DateTime<Utc>>,
}

impl RunRow {
    pub fn has_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRunMarkerRow {
    pub project_id: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntryRow {
    pub project_id: String,
    pub reason: String,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    Ok,
    AlreadyRunning,
    InsufficientBalance,
    GlobalConcurrency,
    GlobalDailyCap,
    ProjectDailyCap,
}

impl GateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::AlreadyRunning => "already_running",
            Self::InsufficientBalance => "insufficient_balance",
            Self::GlobalConcurrency => "global_concurrency",
            Self::GlobalDailyCap => "global_daily_cap",
            Self::ProjectDailyCap => "project_daily_cap",
        }
    }

    /// Resource pressure that is expected to clear on its own; these reasons
    /// park the project on the backlog instead of dropping the attempt.
    pub fn is_transient_pressure(self) -> bool {
        matches!(
            self,
            Self::GlobalConcurrency | Self::GlobalDailyCap | Self::ProjectDailyCap
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartRunState {
    Started,
    Skipped,
    MissingProject,
    DispatchFailed,
    QueueEnqueued,
}

impl StartRunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Skipped => "skipped",
            Self::MissingProject => "missing_project",
            Self::DispatchFailed => "dispatch_failed",
            Self::QueueEnqueued => "queue_enqueued",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunResult {
    pub state: StartRunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_reason: Option<GateReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StartRunResult {
    pub fn missing_project() -> Self {
        Self {
            state: StartRunState::MissingProject,
            run_id: None,
            gate_reason: None,
            message: None,
        }
    }

    pub fn skipped(gate_reason: Option<GateReason>, message: Option<String>) -> Self {
        Self {
            state: StartRunState::Skipped,
            run_id: None,
            gate_reason,
            message,
        }
    }

    pub fn queue_enqueued(gate_reason: GateReason) -> Self {
        Self {
            state: StartRunState::QueueEnqueued,
            run_id: None,
            gate_reason: Some(gate_reason),
            message: None,
        }
    }

    pub fn started(run_id: String) -> Self {
        Self {
            state: StartRunState::Started,
            run_id: Some(run_id),
            gate_reason: None,
            message: None,
        }
    }

    pub fn dispatch_failed(run_id: String, message: String) -> Self {
        Self {
            state: StartRunState::DispatchFailed,
            run_id: Some(run_id),
            gate_reason: None,
            message: Some(message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDrainSummary {
    pub scanned: u64,
    pub started: u64,
    pub re_enqueued: u64,
    pub skipped: u64,
    pub dispatch_failed: u64,
    pub errors: u64,
    pub stopped_on_global_concurrency: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySummary {
    pub scanned: u64,
    pub reaped: u64,
    pub charged_cents: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleRunSweepSummary {
    pub queued: RecoverySummary,
    pub running: RecoverySummary,
}

/// Credentials an agent presents on every callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCredentials {
    pub project_id: String,
    pub run_id: String,
    pub run_token: String,
}

/// Proof that a callback's token matched the `(project_id, run_id)` that minted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAuthorization {
    pub project_id: String,
    pub run_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHeartbeatRequest {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFinishedRequest {
    pub project_id: String,
    pub run_id: String,
    pub status: FinishedRunStatus,
    pub summary_md: String,
    #[serde(default)]
    pub spent_cents: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFinishedResponse {
    /// `false` when the run had already ended and the call was a no-op.
    pub applied: bool,
    pub charged_cents: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<StartRunResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditWalletRequest {
    pub payment_ref: String,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditWalletResult {
    /// `false` when the payment reference was already applied.
    pub credited: bool,
    /// `None` when the follow-up start attempt failed and the project was parked on the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<StartRunResult>,
}
