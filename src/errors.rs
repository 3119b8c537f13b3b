use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("ordering queue at capacity")]
    Backpressure,
    #[error("synchronization failed: {0}")]
    SyncFailed(String),
    #[error("transaction rejected: {0}")]
    Transaction(String),
    #[error("ledger inconsistency: {0}")]
    Consistency(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("world state error: {0}")]
    Wsv(#[from] rusqlite::Error),
    #[error("block index error: {0}")]
    Index(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;
