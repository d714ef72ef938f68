use crate::orchestrator::{Orchestrator, SweepError};
use crate::transport::DeviceTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Sweeps immediately, then every `every`, until `cancel` fires
pub fn spawn_sweep_scheduler<T: DeviceTransport>(
    orchestrator: Arc<Orchestrator<T>>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    info!(interval_secs = every.as_secs(), "starting sweep scheduler");

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // a slow sweep pushes the next one back instead of bunching them up
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match orchestrator.sweep_with_cancel(&cancel).await {
                        Ok(summary) => debug!(devices = summary.devices, "scheduled sweep done"),
                        Err(SweepError::Cancelled { .. }) => break,
                    }
                }
            }
        }
        info!("sweep scheduler stopped");
    })
}

/// Runs a single sweep in the background
pub fn spawn_initial_sweep<T: DeviceTransport>(orchestrator: Arc<Orchestrator<T>>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = orchestrator.sweep_with_cancel(&cancel).await {
            info!(error = %e, "initial sweep did not complete");
        }
    })
}
