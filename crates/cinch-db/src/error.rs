//! Database error types and their mapping onto `cinch_core::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for cinch_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Database(sqlx::Error::RowNotFound) => {
                cinch_core::Error::NotFound("row not found".to_string())
            }
            other => cinch_core::Error::Internal(other.to_string()),
        }
    }
}
