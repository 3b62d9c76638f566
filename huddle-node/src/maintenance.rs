//! Background maintenance
//!
//! Every node runs the same loops; all of them are safe to run concurrently
//! on several nodes. Each stops when the shared shutdown token is cancelled.

use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use huddle_common::Result;

use crate::eventlog::LogTailer;
use crate::AppState;

/// Handles of the spawned loops
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Start every loop for this node
    pub fn spawn(state: &AppState) -> Self {
        let config = &state.config;
        let cancel = state.shutdown.clone();
        let mut handles = Vec::new();

        let tailer = LogTailer::new(state.events.clone(), &config.event_log);
        handles.push(tokio::spawn(tailer.run(cancel.child_token())));

        let stores = state.stores.clone();
        let limiter = state.poll_limiter.clone();
        handles.push(spawn_periodic(
            "TTL sweeper",
            Duration::from_secs(config.store.sweep_interval_secs.max(1)),
            cancel.child_token(),
            move || {
                let stores = stores.clone();
                let limiter = limiter.clone();
                async move {
                    let swept = stores.state.sweep_expired().await?;
                    limiter.retain_recent();
                    if swept > 0 {
                        debug!("Swept {} expired keys", swept);
                    }
                    Ok(())
                }
            },
        ));

        let conversations = state.conversations.clone();
        handles.push(spawn_periodic(
            "Conversation expiry",
            Duration::from_secs(config.sessions.expiry_sweep_interval_secs.max(1)),
            cancel.child_token(),
            move || {
                let conversations = conversations.clone();
                async move {
                    conversations.expire_overdue(Utc::now()).await?;
                    Ok(())
                }
            },
        ));

        let context = state.context.clone();
        handles.push(spawn_periodic(
            "Context eviction",
            Duration::from_secs(config.context.eviction_interval_secs.max(1)),
            cancel.child_token(),
            move || {
                let context = context.clone();
                async move {
                    let report = context.run_maintenance().await?;
                    if report.pruned > 0 || report.collected > 0 {
                        info!(
                            pruned = report.pruned,
                            collected = report.collected,
                            "Context maintenance pass"
                        );
                    }
                    Ok(())
                }
            },
        ));

        Self { handles }
    }

    /// Wait for every loop to stop (after the shutdown token is cancelled)
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Background task ended abnormally: {}", e);
            }
        }
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        info!("Starting {} (interval: {}s)", name, period.as_secs());
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        timer.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }
            if let Err(e) = job().await {
                error!("{}: pass failed: {}", name, e);
            }
        }
        info!("{} stopped", name);
    })
}
