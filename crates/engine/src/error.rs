use quiltdb_core::CoreError;
use quiltdb_storage::StorageError;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("migration has not been run")]
    MigrationRequired,

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("read-your-writes deadline exceeded")]
    ConsistencyTimeout,
}
