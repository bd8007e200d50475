use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::orchestrator::service::OrchestratorService;

/// Drains the backlog every `interval`. Failures are logged and the loop keeps going.
pub fn spawn_queue_drain_worker(
    service: OrchestratorService,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let limit = service.policy().run_queue_check_limit;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match service.process_run_queue_batch(limit).await {
                Ok(summary) if summary.scanned > 0 => {
                    tracing::info!(
                        scanned = summary.scanned,
                        started = summary.started,
                        re_enqueued = summary.re_enqueued,
                        dispatch_failed = summary.dispatch_failed,
                        errors = summary.errors,
                        stopped_on_global_concurrency = summary.stopped_on_global_concurrency,
                        "queue drain pass complete"
                    );
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::error!(code = error.code(), reason = %error.message(), "queue drain pass failed");
                }
            }
        }
        tracing::info!("queue drain worker stopped");
    })
}

pub fn spawn_stale_run_reaper(
    service: OrchestratorService,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match service.recover_stale_runs(Utc::now()).await {
                Ok(summary) if summary.queued.reaped + summary.running.reaped > 0 => {
                    tracing::warn!(
                        queued_reaped = summary.queued.reaped,
                        running_reaped = summary.running.reaped,
                        charged_cents = summary.running.charged_cents,
                        "stale run sweep reaped runs"
                    );
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::error!(code = error.code(), reason = %error.message(), "stale run sweep failed");
                }
            }
        }
        tracing::info!("stale run reaper stopped");
    })
}
