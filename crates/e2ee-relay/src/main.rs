use std::sync::Arc;

use e2ee_relay::{build_router, AppState, RelayDb, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env();
    tracing::info!(bind_addr = %config.bind_addr, db_path = %config.db_path, "e2ee-relay starting");

    let db = RelayDb::open(&config.db_path)?;
    let state: Arc<AppState> = Arc::new(AppState::new(db, config.clone()));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("e2ee-relay listening on http://{}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
