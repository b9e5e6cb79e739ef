//! Persistence for Kiln.
//!
//! Provides the [`Store`], [`Transaction`] and [`TaskQueue`] traits with
//! PostgreSQL and in-memory implementations.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod queue;
pub mod store;

pub use error::{DbError, DbResult};
pub use memory::InMemoryStore;
pub use postgres::PgStore;
pub use queue::{PgTaskQueue, QueuedTask, TaskQueue};
pub use store::{BuildQuery, RequestIdRecord, Store, Transaction, sequence_name};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}
