#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    config::Config,
    db::OrchestratorDb,
    orchestrator::{
        dispatch::{GithubWorkflowDispatcher, RunDispatcher, UnconfiguredDispatcher},
        service::OrchestratorService,
        store,
        workers::{spawn_queue_drain_worker, spawn_stale_run_reaper},
    },
    server::{AppState, build_router},
};

pub mod config;
pub mod db;
pub mod orchestrator;
pub mod server;

/// Connects to Postgres when `DB_URL` is set, otherwise runs on the in-memory store.
pub async fn build_orchestrator_state(config: Config) -> Result<AppState> {
    let store = match config.db_url.as_deref() {
        Some(url) => {
            let db = Arc::new(OrchestratorDb::connect(url).await?);
            store::postgres(db)
        }
        None => {
            tracing::warn!("DB_URL not set; orchestrator state is in-memory only");
            store::memory()
        }
    };

    let dispatcher: Arc<dyn RunDispatcher> = match config.github.dispatch_config() {
        Some(github) => Arc::new(GithubWorkflowDispatcher::new(github)),
        None => {
            tracing::warn!("GITHUB_TOKEN not set; every dispatch will fail");
            Arc::new(UnconfiguredDispatcher)
        }
    };
    if config.backend_base_url.is_none() {
        tracing::warn!("BACKEND_BASE_URL not set; every dispatch will fail");
    }

    let service = OrchestratorService::new_with_policy(
        store,
        dispatcher,
        config.backend_base_url.clone(),
        config.policy.clone(),
    );
    Ok(AppState::new(config, service))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_orchestrator_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "run orchestrator listening"
    );

    let workers = config.workers.clone();
    let state = build_orchestrator_state(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    if workers.enabled {
        handles.push(spawn_queue_drain_worker(
            state.service().clone(),
            Duration::from_secs(workers.queue_drain_interval_seconds),
            shutdown_rx.clone(),
        ));
        handles.push(spawn_stale_run_reaper(
            state.service().clone(),
            Duration::from_secs(workers.reaper_interval_seconds),
            shutdown_rx,
        ));
    } else {
        info!("scheduled workers disabled");
    }

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown signal received"),
                Err(error) => {
                    tracing::error!(reason = %error, "failed to listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await?;

    stop_workers(&shutdown_tx, handles).await;
    Ok(())
}

/// Flips the shutdown signal and waits for every worker; returns how many ended abnormally.
async fn stop_workers(shutdown_tx: &watch::Sender<bool>, handles: Vec<JoinHandle<()>>) -> usize {
    if shutdown_tx.send(true).is_err() {
        tracing::debug!("scheduled workers already stopped");
    }
    let mut abnormal = 0;
    for handle in futures::future::join_all(handles).await {
        if let Err(error) = handle {
            abnormal += 1;
            tracing::error!(reason = %error, "worker task ended abnormally");
        }
    }
    abnormal
}
