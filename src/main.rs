mod api;
mod audio;
mod config;
mod convert;
mod engine;
mod error;
mod jobs;
mod model;
mod probe;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::api::{build_router, AppState};
use crate::config::AppConfig;
use crate::engine::{Transcriber, TranscriptionEngine};
use crate::jobs::{spawn_sweeper, JobStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whisper_job_server=info,axum=info".into()),
        )
        .compact()
        .init();

    let cfg = AppConfig::from_env()?;
    tokio::fs::create_dir_all(&cfg.upload_dir).await?;

    let engine: Arc<dyn Transcriber> = Arc::new(TranscriptionEngine::new(&cfg));
    if cfg.model_preload {
        let report = engine.warm_up(cfg.default_model).await?;
        info!(
            model = %report.size,
            load_time_secs = report.load_time_secs,
            "preloaded default model"
        );
    }

    let jobs = Arc::new(JobStore::new());
    spawn_sweeper(
        Arc::clone(&jobs),
        Duration::from_secs(cfg.job_sweep_interval_secs),
        Duration::from_secs(cfg.job_max_age_secs),
    );

    let state = Arc::new(AppState::new(cfg.clone(), engine, jobs));
    let app = build_router(state);

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        host = %cfg.host,
        port = cfg.port,
        default_model = %cfg.default_model,
        inference_workers = cfg.inference_workers,
        "starting whisper-job-server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let _ = sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
