mod handlers;
mod schedule;
mod state;

use crate::state::AppState;
use anyhow::Context;
use common::PipelineConfig;
use std::env;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_LOG_FILTER: &str = "scheduler=debug,common=debug,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cfg = PipelineConfig::load_default().context("no se pudo cargar la configuración")?;
    info!(
        "pipeline {} cargado (max_parallel={}, estado={:?})",
        cfg.pipeline_id, cfg.runner.max_parallel, cfg.state_path
    );

    let state = AppState::from_config(&cfg).context("no se pudo construir el runner")?;

    // runs que quedaron a medias antes del arranque
    match schedule::resume_interrupted(&state.runner) {
        Ok(resumed) if !resumed.is_empty() => info!("{} runs retomados", resumed.len()),
        Ok(_) => {}
        Err(e) => warn!("no se pudieron retomar runs interrumpidos: {}", e),
    }

    if cfg.schedule.enabled {
        let runner = state.runner.clone();
        let schedule_cfg = cfg.schedule.clone();
        tokio::spawn(async move {
            schedule::schedule_loop(runner, schedule_cfg).await;
        });
    }

    // router HTTP
    let app = handlers::build_router(state);

    let addr = env::var("SCHEDULER_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {addr}"))?;
    info!("scheduler escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
