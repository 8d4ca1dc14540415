//! Lectern - session gateway for teacher-run classroom activities

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lectern::{
    config::Args,
    server,
    store::{MemoryBackend, SessionBackend, ValkeyBackend},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("lectern={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Lectern - Classroom Session Gateway");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!(
        "Mode: {}",
        if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" }
    );
    info!("Session TTL: {} ms", args.session_ttl_ms);
    info!(
        "Backend: {}",
        args.valkey_url.as_deref().unwrap_or("in-memory")
    );
    info!("======================================");

    let backend: Arc<dyn SessionBackend> = match &args.valkey_url {
        Some(url) => match ValkeyBackend::connect(url).await {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                error!("Valkey connection failed: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            info!("VALKEY_URL not set, sessions are instance-local");
            Arc::new(MemoryBackend::new(args.session_ttl()))
        }
    };

    let state = Arc::new(server::AppState::new(args, backend));

    if let Err(e) = server::run(state).await {
        error!("Server error: {:?}", e);
        std::process::exit(1);
    }

    Ok(())
}
