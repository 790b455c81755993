use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use holodeck::config::Config;
use holodeck::store::postgres::PgStore;
use holodeck::store::{self, AgentStore, AppState, CommandStore, SessionStore};
use holodeck::{api, dispatch};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("HOLODECK_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Arc::new(Config::load());
    let pool = store::pool::connect(&config.database_url).await?;
    let pg = Arc::new(PgStore::new(pool));
    let agents: Arc<dyn AgentStore> = pg.clone();
    let sessions: Arc<dyn SessionStore> = pg.clone();
    let commands: Arc<dyn CommandStore> = pg.clone();

    let (state, hub_rx) = AppState::new(config.clone(), agents, sessions, commands);

    // Background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(dispatch::run_frame_router(
        hub_rx,
        state.dispatcher.clone(),
        state.proxy.clone(),
    ));
    tokio::spawn(state.hub.clone().run_stale_sweep(shutdown_rx.clone()));
    tokio::spawn(state.coordinator.clone().run_idle_sweep(shutdown_rx.clone()));
    tokio::spawn(state.dispatcher.clone().run_overdue_sweep(shutdown_rx.clone()));

    let app = api::router(state.clone());
    let addr: SocketAddr = config.listen.parse()?;
    tracing::info!(%addr, "starting control plane");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(());
    state.hub.shutdown_all().await;
    tracing::info!("control plane stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
