//! Kiln API Server

use clap::Parser;
use kiln_api::{AppState, routes};
use kiln_core::builder::Settings;
use kiln_core::clock::{Clock, SystemClock};
use kiln_db::{InMemoryStore, PgStore, PgTaskQueue, Store, TaskQueue, create_pool, run_migrations};
use kiln_scheduler::{LoggingHandler, Scheduler, StatusEngine, Worker};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kiln-server", about = "Kiln build scheduler")]
struct Args {
    /// PostgreSQL URL. Without one, builds live in memory.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Settings file (KDL).
    #[arg(long, env = "KILN_SETTINGS")]
    settings: Option<PathBuf>,

    /// Builder definitions (KDL).
    #[arg(long, env = "KILN_BUILDERS")]
    builders: Option<PathBuf>,

    #[arg(long, env = "KILN_LISTEN", default_value = "0.0.0.0:3000")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let settings = match &args.settings {
        Some(path) => kiln_config::load_settings(path)?,
        None => Settings::default(),
    };

    let (store, queue): (Arc<dyn Store>, Arc<dyn TaskQueue>) = match &args.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            info!("Database connected");
            (
                Arc::new(PgStore::new(pool.clone())),
                Arc::new(PgTaskQueue::new(pool)),
            )
        }
        None => {
            info!("No database configured, using the in-memory store");
            let store = InMemoryStore::new();
            (Arc::new(store.clone()), Arc::new(store))
        }
    };

    if let Some(path) = &args.builders {
        let entries = kiln_config::load_builders(path)?;
        for entry in &entries {
            store.put_builder(entry).await?;
        }
        info!(count = entries.len(), "Loaded builders");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let scheduler = Arc::new(Scheduler::new(store.clone(), clock.clone(), settings));

    let worker = Worker::new(
        uuid::Uuid::now_v7().to_string(),
        queue,
        Arc::new(LoggingHandler),
        Arc::new(StatusEngine::new(store)),
        clock,
    );
    tokio::spawn(async move { worker.run().await });

    let app = routes::router(AppState::new(scheduler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", args.listen);
    let listener = TcpListener::bind(args.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
