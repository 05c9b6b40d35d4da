use std::path::PathBuf;

use anyhow::Result;
use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use tracing::info;

use nanosession_core::config;
use nanosession_core::{Session, SessionLayer, SessionManager, SessionStoreHandle};

#[derive(Parser)]
#[command(
    name = "nanosession",
    about = "nanosession - cookie-backed server-side sessions",
    version = nanosession_core::VERSION,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo session server
    Serve {
        /// Listen address
        #[arg(short, long, default_value = "127.0.0.1:3000")]
        addr: String,
        /// Config file (JSON); NANOSESSION_* env vars override it
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate a config file and print the effective configuration
    CheckConfig {
        /// Config file (JSON)
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nanosession=info".parse()?)
                .add_directive("nanosession_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { addr, config } => cmd_serve(addr, config).await?,
        Commands::CheckConfig { path } => cmd_check_config(path)?,
    }

    Ok(())
}

// ====== Commands ======

async fn cmd_serve(addr: String, config_path: Option<PathBuf>) -> Result<()> {
    let cfg = config::load_config_from_env(config_path.as_deref())?;
    let store = cfg.store.build_memory()?;
    let manager = SessionManager::builder(cfg)
        .with_store(store.clone())
        .build()?;

    let router = create_router(SessionLayer::new(manager));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Session demo listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;

    store.shutdown();
    info!("Session store stopped");
    Ok(())
}

fn cmd_check_config(path: Option<PathBuf>) -> Result<()> {
    let cfg = config::load_config_from_env(path.as_deref())?;
    // Builds the generator and signer too, so every setup error shows up here.
    SessionManager::builder(cfg.clone())
        .with_store(nanosession_core::MemoryStore::without_sweeper(
            std::time::Duration::from_secs(cfg.store.default_ttl_secs),
        ))
        .build()?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

// ====== Demo app ======

fn create_router(layer: SessionLayer) -> Router {
    Router::new()
        .route("/", get(handle_show).post(handle_store).delete(handle_destroy))
        .route("/views", get(handle_views))
        .route("/regenerate", post(handle_regenerate))
        .route("/sessions", get(handle_sessions))
        .layer(layer)
}

type AppError = (StatusCode, String);

fn internal(e: nanosession_core::Error) -> AppError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// GET / — current stored value
async fn handle_show(session: Session) -> Result<String, AppError> {
    let value: Option<String> = session.get("value").map_err(internal)?;
    Ok(value.unwrap_or_default())
}

/// POST / — store the request body in the session
async fn handle_store(session: Session, body: String) -> Result<StatusCode, AppError> {
    session.insert("value", body).map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE / — destroy the session
async fn handle_destroy(session: Session) -> StatusCode {
    session.destroy();
    StatusCode::NO_CONTENT
}

/// GET /views — per-session view counter
async fn handle_views(session: Session) -> Result<String, AppError> {
    let views = session.get::<u64>("views").map_err(internal)?.unwrap_or(0) + 1;
    session.insert("views", views).map_err(internal)?;
    Ok(views.to_string())
}

/// POST /regenerate — new id, stored value carried over
async fn handle_regenerate(session: Session) -> Result<StatusCode, AppError> {
    let value: Option<String> = session.get("value").map_err(internal)?;
    session
        .regenerate()
        .map_err(|e| internal(e.into()))?;
    if let Some(value) = value {
        session.insert("value", value).map_err(internal)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// GET /sessions — number of live sessions in the store
async fn handle_sessions(store: SessionStoreHandle) -> impl IntoResponse {
    match store.len().await {
        Ok(count) => (StatusCode::OK, count.to_string()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
