//! Error types for the persistence layer.

/// Errors surfaced by the forensic, tree, and metrics stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("schema migration failed: {0}")]
    Migration(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("database busy after {attempts} attempts: {source}")]
    Busy {
        attempts: u32,
        source: rusqlite::Error,
    },

    #[error("invalid {field} value: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Whether an error belongs to the transient busy/locked class that a
/// write may retry. Constraint violations and everything else surface.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}
