use anyhow::Context;
use fleetwatch_node::config::load_config;
use fleetwatch_node::http::{api_key_from_env, build_router, AppState};
use fleetwatch_node::self_update::{self, RestartRequested, SelfUpdater};
use fleetwatch_node::{logging, network, scheduler, HttpTransport, Orchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();
    logging::init();

    let config = load_config().await;
    config.validate().context("invalid configuration")?;

    let local_ip = network::resolve_node_address(&config.network).context("node self-identification failed")?;
    info!(%local_ip, prefix_len = config.network.prefix_len, "node address resolved");

    let transport = HttpTransport::new().context("failed to build HTTP client")?;
    let updater = SelfUpdater::new(&config.update);
    let bind = config.http.bind;
    let interval_secs = config.sweep.interval_secs;
    let orchestrator = Arc::new(Orchestrator::new(transport, config, local_ip));

    let cancel = CancellationToken::new();
    let sweeper = if interval_secs > 0 {
        scheduler::spawn_sweep_scheduler(orchestrator.clone(), Duration::from_secs(interval_secs), cancel.clone())
    } else {
        scheduler::spawn_initial_sweep(orchestrator.clone(), cancel.clone())
    };

    let (restart_tx, mut restart_rx) = mpsc::channel::<RestartRequested>(1);
    let api_key = api_key_from_env();
    if api_key.is_none() {
        warn!("FLEETWATCH_API_KEY not set, control surface is open");
    }
    let app = build_router(AppState {
        orchestrator,
        updater,
        restart_tx,
        api_key,
    });

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("cannot bind {bind}"))?;
    info!(%bind, "control surface listening");

    let pending_restart = Arc::new(parking_lot::Mutex::new(None::<RestartRequested>));
    let shutdown = {
        let pending_restart = pending_restart.clone();
        async move {
            tokio::select! {
                request = restart_rx.recv() => {
                    *pending_restart.lock() = request;
                }
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            }
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("control surface failed")?;

    cancel.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "sweep task ended abnormally");
    }

    let restart = pending_restart.lock().take();
    if let Some(request) = restart {
        self_update::restart(request);
    }
    info!("node stopped");
    Ok(())
}
