use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "fleetwatch_node=info";

/// Installs the global fmt subscriber; `RUST_LOG` overrides the default
/// filter. Safe to call more than once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
