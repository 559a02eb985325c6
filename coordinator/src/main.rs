mod config;
mod error;
mod extract;
mod handlers;
mod limiter;
mod monitor;
mod state;
mod stats;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::time::SystemTime;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::state::{AppState, Coordinator};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coordinator=debug,tower_http=info")),
        )
        .init();

    let config = Config::parse();

    let auth_token = match config.auth_token.clone().filter(|t| !t.is_empty()) {
        Some(t) => t,
        None => {
            let generated = uuid::Uuid::new_v4().simple().to_string();
            warn!("COORDINATOR_TOKEN no definido, usando token generado: {}", generated);
            generated
        }
    };

    let settings = config.settings();
    info!(
        "task types aceptados: {:?}, timeout de workers {:?}",
        settings.task_types, settings.worker_timeout
    );
    let limits = config.limits();
    info!(
        "rate limit: {} requests cada {:?} por cliente",
        limits.capacity, limits.window
    );
    let state = AppState::new(
        Coordinator::new(settings, SystemTime::now()),
        auth_token,
        RateLimiter::new(limits),
    );

    // router HTTP
    let app = handlers::build_router(state.clone());

    // barrido de heartbeats y rollover de stats en segundo plano
    tokio::spawn(monitor::monitor_workers(state.clone(), config.sweep_interval()));
    tokio::spawn(monitor::roll_stats(state.clone()));

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", config.bind))?;
    info!("coordinador escuchando en {}", listener.local_addr()?);

    // la IP del peer es la clave del rate limit
    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, service)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("apagando coordinador");
        })
        .await?;

    Ok(())
}
