mod aggregator;
mod builder;
mod checkpoint;
mod config;
mod error;
mod handlers;
mod ledger;
mod media;
mod monitor;
mod registry;
mod scheduler;
mod state;
mod task;
mod tracker;

use crate::config::MasterConfig;
use crate::media::MediaTools;
use crate::state::AppState;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,tower_http=info")),
        )
        .init();

    let config = MasterConfig::from_env();
    info!("configuración del master: {:?}", config);

    let state = AppState::new(config, MediaTools::default());

    let restored = state.restore_checkpoints();
    if restored > 0 {
        info!("{} tareas restauradas desde checkpoint", restored);
    }

    // router HTTP
    let app = handlers::build_router(state.clone());

    // monitor de heartbeats y deadlines en segundo plano
    let monitor_state = state.clone();
    tokio::spawn(async move {
        monitor::monitor_workers(monitor_state).await;
    });

    let listener = TcpListener::bind(&state.config.bind).await?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
