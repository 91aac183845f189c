use std::path::PathBuf;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;

use taskgate_gateway::config;
use taskgate_gateway::routes::{self, AppState};
use taskgate_gateway::runtime::Runtime;
use taskgate_gateway::storage::{MemoryStorage, MemoryTaskTable};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Taskgate starting");

    // Load configuration — fail loudly on misconfiguration.
    let config_dir = std::env::var("TASKGATE_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"));

    let gateway_config = match config::load_config(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration — refusing to start");
            std::process::exit(1);
        }
    };
    let gateway_config = Arc::new(gateway_config);

    // Install Prometheus metrics recorder.
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    let http = reqwest::Client::builder()
        .user_agent("taskgate/0.1")
        .build()
        .expect("Failed to build HTTP client");

    let runtime = Runtime::new(
        Arc::clone(&gateway_config),
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryTaskTable::new()),
        http,
    );
    runtime.start_background_loops();

    let state = Arc::new(AppState {
        runtime,
        config: Arc::clone(&gateway_config),
        metrics_handle: Some(metrics_handle),
    });

    let app = routes::router(state);

    let listener =
        tokio::net::TcpListener::bind(format!("0.0.0.0:{}", gateway_config.listen_port))
            .await
            .expect("Failed to bind TCP listener");

    tracing::info!(port = gateway_config.listen_port, "Taskgate listening");

    axum::serve(listener, app).await.expect("HTTP server error");
}
