use std::{
    env,
    net::{AddrParseError, SocketAddr},
};

use thiserror::Error;

use crate::orchestrator::budget::usd_to_cents;
use crate::orchestrator::dispatch::GithubDispatchConfig;
use crate::orchestrator::service::OrchestratorPolicy;

const MAX_USD: f64 = 1_000_000.0;
const MAX_WINDOW_MINUTES: u64 = 7 * 24 * 60;

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub db_url: Option<String>,
    pub backend_base_url: Option<String>,
    pub admin_token: Option<String>,
    pub github: GithubSettings,
    pub policy: OrchestratorPolicy,
    pub workers: WorkerSettings,
}

#[derive(Clone, Debug)]
pub struct GithubSettings {
    pub token: Option<String>,
    pub org_name: String,
    pub api_base_url: String,
    pub workflow_ref: String,
    pub dispatch_timeout_ms: u64,
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            token: None,
            org_name: "gitcorps".to_string(),
            api_base_url: "https://api.github.com".to_string(),
            workflow_ref: "main".to_string(),
            dispatch_timeout_ms: 15_000,
        }
    }
}

impl GithubSettings {
    /// `None` when no token is configured.
    #[must_use]
    pub fn dispatch_config(&self) -> Option<GithubDispatchConfig> {
        self.token.as_ref().map(|token| GithubDispatchConfig {
            api_base_url: self.api_base_url.clone(),
            token: token.clone(),
            org_name: self.org_name.clone(),
            workflow_ref: self.workflow_ref.clone(),
            timeout_ms: self.dispatch_timeout_ms,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    pub enabled: bool,
    pub queue_drain_interval_seconds: u64,
    pub reaper_interval_seconds: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_drain_interval_seconds: 60,
            reaper_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid ORCHESTRATOR_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid orchestrator policy config: {0}")]
    InvalidPolicyConfig(String),
    #[error("invalid github dispatch config: {0}")]
    InvalidGithubConfig(String),
    #[error("invalid worker config: {0}")]
    InvalidWorkerConfig(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Every key is also read in its lowercase spelling; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| {
            lookup(key)
                .or_else(|| lookup(&key.to_ascii_lowercase()))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr = lookup("ORCHESTRATOR_BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:4200".to_string())
            .parse()?;
        let service_name =
            lookup("ORCHESTRATOR_SERVICE_NAME").unwrap_or_else(|| "run-orchestrator".to_string());
        let db_url = lookup("DB_URL").or_else(|| lookup("DATABASE_URL"));
        let backend_base_url = lookup("ORCHESTRATOR_BACKEND_BASE_URL")
            .or_else(|| lookup("BACKEND_BASE_URL"))
            .map(|value| value.trim_end_matches('/').to_string());
        let admin_token =
            lookup("ORCHESTRATOR_ADMIN_TOKEN").or_else(|| lookup("ADMIN_TOKEN"));

        Ok(Self {
            service_name,
            bind_addr,
            db_url,
            backend_base_url,
            admin_token,
            github: parse_github_settings_from_env(&lookup)?,
            policy: parse_policy_from_env(&lookup)?,
            workers: parse_worker_settings_from_env(&lookup)?,
        })
    }
}

fn parse_policy_from_env(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<OrchestratorPolicy, ConfigError> {
    let defaults = OrchestratorPolicy::default();
    let invalid = ConfigError::InvalidPolicyConfig;

    let min_run_usd =
        parse_f64_env_lookup(lookup, "ORCHESTRATOR_MIN_RUN_USD", 2.0, 0.01, MAX_USD, invalid)?;
    let max_run_usd =
        parse_f64_env_lookup(lookup, "ORCHESTRATOR_MAX_RUN_USD", 10.0, 0.01, MAX_USD, invalid)?;
    let global_max_daily_spend_usd = parse_f64_env_lookup(
        lookup,
        "ORCHESTRATOR_GLOBAL_MAX_DAILY_SPEND_USD",
        500.0,
        0.0,
        MAX_USD,
        invalid,
    )?;
    let per_project_max_daily_spend_usd = parse_f64_env_lookup(
        lookup,
        "ORCHESTRATOR_PER_PROJECT_MAX_DAILY_SPEND_USD",
        100.0,
        0.0,
        MAX_USD,
        invalid,
    )?;

    let min_run_cents = usd_to_cents(min_run_usd);
    let mut max_run_cents = usd_to_cents(max_run_usd);
    if max_run_cents < min_run_cents {
        max_run_cents = min_run_cents;
    }

    let global_max_concurrent_runs = parse_u64_env_lookup(
        lookup,
        "ORCHESTRATOR_GLOBAL_MAX_CONCURRENT_RUNS",
        defaults.global_max_concurrent_runs,
        1,
        10_000,
        invalid,
    )?;
    let run_token_ttl_minutes = parse_u64_env_lookup(
        lookup,
        "ORCHESTRATOR_RUN_TOKEN_TTL_MINUTES",
        defaults.run_token_ttl_minutes,
        1,
        MAX_WINDOW_MINUTES,
        invalid,
    )?;
    let run_queue_check_limit = parse_u64_env_lookup(
        lookup,
        "ORCHESTRATOR_RUN_QUEUE_CHECK_LIMIT",
        defaults.run_queue_check_limit as u64,
        1,
        500,
        invalid,
    )?;
    let runtime_minutes_per_usd = parse_f64_env_lookup(
        lookup,
        "ORCHESTRATOR_BUCKET_RUNTIME_MINUTES_PER_USD",
        defaults.runtime_minutes_per_usd,
        0.01,
        10_000.0,
        invalid,
    )?;
    let tokens_per_usd = parse_f64_env_lookup(
        lookup,
        "ORCHESTRATOR_BUCKET_TOKENS_PER_USD",
        defaults.tokens_per_usd,
        1.0,
        100_000_000.0,
        invalid,
    )?;
    let stale_queued_minutes = parse_u64_env_lookup(
        lookup,
        "ORCHESTRATOR_STALE_QUEUED_MINUTES",
        defaults.stale_queued_minutes,
        1,
        MAX_WINDOW_MINUTES,
        invalid,
    )?;
    let stale_running_minutes = parse_u64_env_lookup(
        lookup,
        "ORCHESTRATOR_STALE_RUNNING_MINUTES",
        defaults.stale_running_minutes,
        1,
        MAX_WINDOW_MINUTES,
        invalid,
    )?;
    let agent_runtime = lookup("ORCHESTRATOR_AGENT_RUNTIME").unwrap_or(defaults.agent_runtime);

    Ok(OrchestratorPolicy {
        min_run_cents,
        max_run_cents,
        global_max_concurrent_runs,
        global_max_daily_spend_cents: usd_to_cents(global_max_daily_spend_usd),
        per_project_max_daily_spend_cents: usd_to_cents(per_project_max_daily_spend_usd),
        run_token_ttl_minutes,
        run_queue_check_limit: usize::try_from(run_queue_check_limit)
            .unwrap_or(defaults.run_queue_check_limit),
        runtime_minutes_per_usd,
        tokens_per_usd,
        agent_runtime,
        stale_queued_minutes,
        stale_running_minutes,
    })
}

fn parse_github_settings_from_env(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<GithubSettings, ConfigError> {
    let defaults = GithubSettings::default();
    let api_base_url = lookup("ORCHESTRATOR_GITHUB_API_BASE_URL")
        .unwrap_or(defaults.api_base_url)
        .trim_end_matches('/')
        .to_string();
    if !api_base_url.starts_with("http://") && !api_base_url.starts_with("https://") {
        return Err(ConfigError::InvalidGithubConfig(format!(
            "ORCHESTRATOR_GITHUB_API_BASE_URL: expected an http(s) url, got {api_base_url}"
        )));
    }

    Ok(GithubSettings {
        token: lookup("ORCHESTRATOR_GITHUB_TOKEN").or_else(|| lookup("GITHUB_TOKEN")),
        org_name: lookup("ORCHESTRATOR_GITHUB_ORG_NAME").unwrap_or(defaults.org_name),
        api_base_url,
        workflow_ref: lookup("ORCHESTRATOR_GITHUB_WORKFLOW_REF").unwrap_or(defaults.workflow_ref),
        dispatch_timeout_ms: parse_u64_env_lookup(
            lookup,
            "ORCHESTRATOR_GITHUB_DISPATCH_TIMEOUT_MS",
            defaults.dispatch_timeout_ms,
            1_000,
            120_000,
            ConfigError::InvalidGithubConfig,
        )?,
    })
}

fn parse_worker_settings_from_env(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<WorkerSettings, ConfigError> {
    let defaults = WorkerSettings::default();
    let enabled = match lookup("ORCHESTRATOR_WORKERS_ENABLED") {
        Some(raw) => parse_bool(&raw).ok_or_else(|| {
            ConfigError::InvalidWorkerConfig(format!("ORCHESTRATOR_WORKERS_ENABLED: {raw}"))
        })?,
        None => defaults.enabled,
    };

    Ok(WorkerSettings {
        enabled,
        queue_drain_interval_seconds: parse_u64_env_lookup(
            lookup,
            "ORCHESTRATOR_QUEUE_DRAIN_INTERVAL_SECONDS",
            defaults.queue_drain_interval_seconds,
            1,
            86_400,
            ConfigError::InvalidWorkerConfig,
        )?,
        reaper_interval_seconds: parse_u64_env_lookup(
            lookup,
            "ORCHESTRATOR_REAPER_INTERVAL_SECONDS",
            defaults.reaper_interval_seconds,
            1,
            86_400,
            ConfigError::InvalidWorkerConfig,
        )?,
    })
}

fn parse_u64_env_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
    invalid: fn(String) -> ConfigError,
) -> Result<u64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        raw.parse::<u64>()
            .map_err(|error| invalid(format!("{key}: {error}")))
            .map(|value| value.clamp(min, max))
    })
}

fn parse_f64_env_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: f64,
    min: f64,
    max: f64,
    invalid: fn(String) -> ConfigError,
) -> Result<f64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        let value = raw
            .parse::<f64>()
            .map_err(|error| invalid(format!("{key}: {error}")))?;
        if !value.is_finite() {
            return Err(invalid(format!("{key}: must be a finite number")));
        }
        Ok(value.clamp(min, max))
    })
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
