//! Opt-in log output for demos, tests and benches.

/// Install a fmt subscriber filtered by `RUST_LOG`.
///
/// Demos and benches call `slotnet::dev_tracing::init_tracing()` so that
/// `RUST_LOG=slotnet_reactor=debug` shows channel lifecycle events. Does
/// nothing when `RUST_LOG` is unset or a global subscriber already exists.
pub fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_thread_names(true)
            .try_init();
    }
}
