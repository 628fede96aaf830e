use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cognit_api::{AppState, build_router};
use cognit_runtime::CognitConfig;

#[derive(Parser)]
#[command(name = "cognit-server", about = "Cognitive-loop runtime server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "cognit.toml")]
    config: PathBuf,

    /// Override the bind address from the config.
    #[arg(long)]
    bind: Option<String>,

    /// Override the storage database path from the config.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = CognitConfig::load_from(&args.config)?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(db) = args.db {
        config.db_path = db;
    }

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config)?;
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "cognit-server listening");
    axum::serve(listener, router).await?;
    Ok(())
}
