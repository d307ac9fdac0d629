use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("core error: {0}")]
    Core(#[from] quiltdb_core::CoreError),
}
