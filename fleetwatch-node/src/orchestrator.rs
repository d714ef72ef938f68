//! Sweep sequencing and the node's command entry points
//!
//! A sweep runs scan → refresh → backup on a private registry, each phase
//! fully joined before the next one starts, and publishes the result in one
//! step. Commands read the published snapshot only.

use crate::backup;
use crate::config::NodeConfig;
use crate::dispatch::{self, DeviceAction, DispatchError};
use crate::refresh;
use crate::registry::{RegistryHandle, Snapshot};
use crate::scanner;
use crate::transport::DeviceTransport;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SweepError {
    /// The sweep was aborted; the previously published registry is untouched
    #[error("sweep cancelled during {phase}")]
    Cancelled { phase: &'static str },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SweepSummary {
    pub sweep_id: String,
    pub discovered: usize,
    pub evicted: usize,
    pub devices: usize,
    pub with_backup: usize,
    pub duration_ms: u64,
    pub generation: u64,
}

pub struct Orchestrator<T> {
    transport: T,
    config: NodeConfig,
    local_ip: Ipv4Addr,
    registry: RegistryHandle,
    sweep_gate: Mutex<()>,
}

impl<T: DeviceTransport> Orchestrator<T> {
    pub fn new(transport: T, config: NodeConfig, local_ip: Ipv4Addr) -> Self {
        Self {
            transport,
            config,
            local_ip,
            registry: RegistryHandle::new(),
            sweep_gate: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn snapshot(&self) -> Snapshot {
        self.registry.snapshot()
    }

    pub async fn sweep(&self) -> Result<SweepSummary, SweepError> {
        self.sweep_with_cancel(&CancellationToken::new()).await
    }

    /// Runs one sweep. Cancelling `cancel` drops the running phase and its
    /// open device connections; nothing is published in that case.
    pub async fn sweep_with_cancel(&self, cancel: &CancellationToken) -> Result<SweepSummary, SweepError> {
        // one sweep at a time
        let _gate = self.sweep_gate.lock().await;
        let sweep_id = Uuid::new_v4().to_string();
        let span = info_span!("sweep", sweep_id = %sweep_id);

        async {
            let started = Instant::now();
            let scan_options = self.config.scan_options();
            let refresh_options = self.config.refresh_options();

            let registry = run_phase(
                cancel,
                "scan",
                scanner::scan(&self.transport, self.local_ip, &scan_options),
            )
            .await?;
            let discovered = registry.len();

            let registry = run_phase(
                cancel,
                "refresh",
                refresh::refresh(&self.transport, registry, &refresh_options),
            )
            .await?;
            let evicted = discovered - registry.len();

            let registry = run_phase(
                cancel,
                "backup",
                backup::annotate(registry, &self.config.backup.root, self.config.concurrency.backup),
            )
            .await?;
            let with_backup = registry.records().filter(|r| r.backup_path.is_some()).count();
            let devices = registry.len();

            let published = self.registry.publish(registry);
            let summary = SweepSummary {
                sweep_id: sweep_id.clone(),
                discovered,
                evicted,
                devices,
                with_backup,
                duration_ms: started.elapsed().as_millis() as u64,
                generation: published.generation,
            };
            info!(
                devices = summary.devices,
                evicted = summary.evicted,
                duration_ms = summary.duration_ms,
                generation = summary.generation,
                "sweep published"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    pub async fn dispatch(
        &self,
        id: &str,
        action: &DeviceAction,
        payload: Option<Value>,
    ) -> Result<Value, DispatchError> {
        dispatch::dispatch(
            &self.transport,
            &self.registry,
            id,
            action,
            payload,
            &self.config.dispatch_options(),
        )
        .await
    }

    pub async fn check_update(&self, id: &str, payload: Option<Value>) -> Result<Value, DispatchError> {
        dispatch::check_update(
            &self.transport,
            &self.registry,
            id,
            payload,
            &self.config.update_check_options(),
        )
        .await
    }
}

async fn run_phase<F: Future>(
    cancel: &CancellationToken,
    phase: &'static str,
    work: F,
) -> Result<F::Output, SweepError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!(phase, "sweep cancelled, dropping in-flight requests");
            Err(SweepError::Cancelled { phase })
        }
        output = work => Ok(output),
    }
}
