//! PostgreSQL-backed `Storage` implementation for Cinch.
//!
//! Grounded on `buildit-db`'s `create_pool`/`run_migrations` shape,
//! but queries directly through `sqlx` (see `pg_storage`) instead of
//! the teacher's `tokio-postgres` + `clorinde`-generated
//! `buildit-db-queries` split — that split has no remaining purpose
//! once query-generation codegen is dropped; see `DESIGN.md`.

pub mod error;
mod pg_storage;
mod rows;

pub use error::{DbError, DbResult};
pub use pg_storage::PgStorage;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
