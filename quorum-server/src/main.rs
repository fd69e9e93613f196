use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use quorum_server::dispatch::{retention_loop, Dispatcher, LogSender};
use quorum_server::{router, AppState, Config, SqliteStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting quorum server");

    let config = Config::from_env().context("Failed to load configuration")?;

    let db_path = config.state_dir.join("quorum.db");
    let store = Arc::new(
        SqliteStore::new(&db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?,
    );
    info!("Database ready at {}", db_path.display());

    let dispatcher = Dispatcher::new(store.clone(), Arc::new(LogSender), &config);
    tokio::spawn(dispatcher.run(config.dispatch_poll_interval));
    tokio::spawn(retention_loop(store.clone(), config.outbox_retention_secs));

    let state = AppState::new(store, &config);
    let app = router(state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
