use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::Serialize;
use serde_json::{Value, json};

use crate::orchestrator::templates::{
    RUNNER_FILE_PATH, WORKFLOW_FILE_NAME, WORKFLOW_FILE_PATH, runner_script, workflow_yaml,
};

const GITHUB_API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = "run-orchestrator";

/// Everything the external execution environment needs to run and report back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub project_id: String,
    pub run_id: String,
    pub repo_ref: String,
    pub budget_cents: i64,
    pub runtime_minutes: i64,
    pub token_budget: i64,
    #[serde(skip_serializing)]
    pub run_token: String,
    pub backend_base_url: String,
    pub agent_runtime: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch not configured: {0}")]
    NotConfigured(String),
    #[error("invalid repository reference: {0}")]
    InvalidRepo(String),
    #[error("github api error ({status}): {message}")]
    Github { status: u16, message: String },
    #[error("github transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait RunDispatcher: Send + Sync {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), DispatchError>;
}

/// Wired when no GitHub credentials are configured; every dispatch fails.
pub struct UnconfiguredDispatcher;

#[async_trait]
impl RunDispatcher for UnconfiguredDispatcher {
    async fn dispatch(&self, _request: &DispatchRequest) -> Result<(), DispatchError> {
        Err(DispatchError::NotConfigured(
            "GITHUB_TOKEN is required to dispatch workflow runs.".to_string(),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct GithubDispatchConfig {
    pub api_base_url: String,
    pub token: String,
    pub org_name: String,
    pub workflow_ref: String,
    pub timeout_ms: u64,
}

pub struct GithubWorkflowDispatcher {
    client: reqwest::Client,
    config: GithubDispatchConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoCoordinates {
    pub owner: String,
    pub name: String,
}

/// Accepts `owner/name`, or a bare `name` that lives under `default_owner`.
pub fn parse_repo_ref(repo_ref: &str, default_owner: &str) -> Result<RepoCoordinates, DispatchError> {
    let trimmed = repo_ref.trim().trim_matches('/');
    let mut segments = trimmed.split('/');
    let (owner, name) = match (segments.next(), segments.next(), segments.next()) {
        (Some(name), None, None) => (default_owner, name),
        (Some(owner), Some(name), None) => (owner, name),
        _ => return Err(DispatchError::InvalidRepo(repo_ref.to_string())),
    };
    let valid = |segment: &str| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
    };
    if !valid(owner) || !valid(name) {
        return Err(DispatchError::InvalidRepo(repo_ref.to_string()));
    }
    Ok(RepoCoordinates {
        owner: owner.to_string(),
        name: name.to_string(),
    })
}

/// Workflow inputs are strings on the GitHub side.
pub fn workflow_inputs(request: &DispatchRequest) -> Value {
    json!({
        "projectId": request.project_id,
        "runId": request.run_id,
        "budgetCents": request.budget_cents.to_string(),
        "runtimeMinutes": request.runtime_minutes.to_string(),
        "tokenBudget": request.token_budget.to_string(),
        "runToken": request.run_token,
        "backendBaseUrl": request.backend_base_url,
        "agentRuntime": request.agent_runtime,
    })
}

impl GithubWorkflowDispatcher {
    pub fn new(config: GithubDispatchConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn repo_url(&self, repo: &RepoCoordinates, suffix: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.config.api_base_url.trim_end_matches('/'),
            repo.owner,
            repo.name,
            suffix.trim_start_matches('/')
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .header("authorization", format!("Bearer {}", self.config.token))
            .header("accept", "application/vnd.github+json")
            .header("x-github-api-version", GITHUB_API_VERSION)
            .header("user-agent", USER_AGENT)
    }

    /// Writes `path` on the workflow ref unless it already holds `desired`.
    async fn upsert_file(
        &self,
        repo: &RepoCoordinates,
        path: &str,
        desired: &str,
        message: &str,
    ) -> Result<(), DispatchError> {
        let url = self.repo_url(repo, &format!("contents/{path}"));
        let existing = self
            .request(reqwest::Method::GET, &url)
            .query(&[("ref", self.config.workflow_ref.as_str())])
            .send()
            .await
            .map_err(|error| DispatchError::Transport(error.to_string()))?;

        let status = existing.status();
        let mut sha = None;
        if status.is_success() {
            let body = existing.json::<Value>().await.unwrap_or(Value::Null);
            if decoded_content(&body).as_deref() == Some(desired) {
                tracing::debug!(repo = %repo.name, path, "automation file unchanged");
                return Ok(());
            }
            sha = body.get("sha").and_then(Value::as_str).map(str::to_string);
        } else if status != reqwest::StatusCode::NOT_FOUND {
            return Err(github_error(existing).await);
        }

        let mut payload = json!({
            "message": message,
            "content": base64::engine::general_purpose::STANDARD.encode(desired.as_bytes()),
            "branch": self.config.workflow_ref,
        });
        if let Some(sha) = sha {
            payload["sha"] = Value::String(sha);
        }

        let response = self
            .request(reqwest::Method::PUT, &url)
            .json(&payload)
            .send()
            .await
            .map_err(|error| DispatchError::Transport(error.to_string()))?;
        if response.status().is_success() {
            return Ok(());
        }
        match github_error(response).await {
            // GitHub answers 422 when the content is already identical.
            DispatchError::Github { status: 422, message }
                if message.to_ascii_lowercase().contains("content") =>
            {
                Ok(())
            }
            error => Err(error),
        }
    }

    async fn dispatch_workflow(
        &self,
        repo: &RepoCoordinates,
        request: &DispatchRequest,
    ) -> Result<(), DispatchError> {
        let url = self.repo_url(
            repo,
            &format!("actions/workflows/{WORKFLOW_FILE_NAME}/dispatches"),
        );
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(&json!({
                "ref": self.config.workflow_ref,
                "inputs": workflow_inputs(request),
            }))
            .send()
            .await
            .map_err(|error| DispatchError::Transport(error.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(github_error(response).await)
        }
    }
}

#[async_trait]
impl RunDispatcher for GithubWorkflowDispatcher {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<(), DispatchError> {
        let repo = parse_repo_ref(&request.repo_ref, &self.config.org_name)?;
        self.upsert_file(
            &repo,
            WORKFLOW_FILE_PATH,
            &workflow_yaml(&self.config.workflow_ref),
            "chore: sync agent workflow",
        )
        .await?;
        self.upsert_file(
            &repo,
            RUNNER_FILE_PATH,
            &runner_script(),
            "chore: sync agent runner",
        )
        .await?;
        self.dispatch_workflow(&repo, request).await?;
        tracing::info!(
            project_id = %request.project_id,
            run_id = %request.run_id,
            owner = %repo.owner,
            repo = %repo.name,
            "workflow dispatched"
        );
        Ok(())
    }
}

/// Contents API bodies carry base64 wrapped at 60 columns.
fn decoded_content(body: &Value) -> Option<String> {
    let encoded: String = body
        .get("content")
        .and_then(Value::as_str)?
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    String::from_utf8(bytes).ok()
}

async fn github_error(response: reqwest::Response) -> DispatchError {
    let status = response.status().as_u16();
    let body = response.json::<Value>().await.unwrap_or(Value::Null);
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("http_{status}"));
    DispatchError::Github { status, message }
}
