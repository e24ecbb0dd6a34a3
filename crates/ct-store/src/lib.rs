#![forbid(unsafe_code)]

//! Object-store contract for the log.
//!
//! The writer and monitor only ever need three verbs over a flat key
//! namespace: `get`, `set`, `exists`. Not-found is a distinguished error
//! so callers can treat missing index files as empty and fall back from
//! full to partial tile paths.

mod fs;
mod http;
mod mem;
mod s3;

use async_trait::async_trait;
use thiserror::Error;

pub use fs::FsStore;
pub use http::HttpStore;
pub use mem::MemStore;
pub use s3::{S3Config, S3Store};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// A flat key-value blob store.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    async fn set(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError>;
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// `get` that maps not-found to an empty file, the convention for index
/// prefix files.
pub async fn get_or_empty<S: Storage + ?Sized>(
    store: &S,
    key: &str,
) -> Result<Vec<u8>, StorageError> {
    match store.get(key).await {
        Ok(data) => Ok(data),
        Err(e) if e.is_not_found() => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}
