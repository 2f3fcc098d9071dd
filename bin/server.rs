// Bankgreen - Web Server
// Serves the catalog API with Axum

use anyhow::{Context, Result};
use bankgreen::api::{build_router, AppState};
use bankgreen::{config, logging, open_database, Settings};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "bankgreen-server", version, about = "Bank catalog API server")]
struct Args {
    /// Address to bind, overrides BANKGREEN_ADDR
    #[arg(long)]
    addr: Option<String>,

    /// SQLite database, overrides BANKGREEN_DB
    #[arg(long)]
    db: Option<std::path::PathBuf>,
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    config::load_dotenv();
    logging::init();
    let args = Args::parse();

    let mut settings = Settings::from_env().context("Failed to load settings")?;
    if let Some(addr) = args.addr {
        settings.bind_addr = addr;
    }
    if let Some(db) = args.db {
        settings.database_path = db;
    }
    if settings.token.is_none() {
        tracing::warn!("TOKEN is not set, admin endpoints will refuse every request");
    }

    let conn = open_database(&settings.database_path)
        .with_context(|| format!("Failed to open database {}", settings.database_path.display()))?;
    tracing::info!(path = %settings.database_path.display(), "database opened");

    let addr = settings.bind_addr.clone();
    let app = build_router(AppState::new(conn, settings));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!(%addr, "bankgreen API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
}
