mod app;
mod config;
mod metrics;

use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Builder;
use tracing::info;

fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config_path = env::var("COURIER_CONFIG").unwrap_or_else(|_| "courier.toml".to_string());
    let config = config::load_configuration(Path::new(&config_path)).expect("configuration");

    let runtime = Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async move {
        let state = app::init(config).await.expect("state");
        tokio::select! {
            result = app::serve(Arc::clone(&state)) => {
                result.expect("server");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                app::shutdown(&state).await;
            }
        }
    });
}
