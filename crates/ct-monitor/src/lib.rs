#![forbid(unsafe_code)]

//! The stateless read path: RFC 6962 responses reconstructed from tiles
//! and the hash→index files, with no state shared between requests.

pub mod fetch;
pub mod handlers;
pub mod metrics;

use std::sync::Arc;

use thiserror::Error;

use ct_store::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt tile data: {0}")]
    CorruptTile(String),
    #[error("{0}")]
    Internal(String),
}

impl MonitorError {
    pub fn status(&self) -> u16 {
        match self {
            MonitorError::BadRequest(_) => 400,
            MonitorError::NotFound => 404,
            MonitorError::Unavailable(_) => 503,
            MonitorError::CorruptTile(_) | MonitorError::Internal(_) => 500,
        }
    }
}

impl From<StorageError> for MonitorError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(_) => MonitorError::NotFound,
            other => MonitorError::Unavailable(other.to_string()),
        }
    }
}

/// Monitor configuration; one instance serves every request.
#[derive(Clone)]
pub struct Monitor {
    pub store: Arc<dyn Storage>,
    /// Hex-character prefix length of the index files.
    pub mask: usize,
    /// Cap on entries per get-entries response.
    pub max_batch: u64,
    /// Cap on storage fetches a single get-entries request may spend;
    /// exhausting it truncates the response.
    pub fetch_budget: usize,
}

impl Monitor {
    pub fn new(store: Arc<dyn Storage>, mask: usize) -> Self {
        Self {
            store,
            mask,
            max_batch: 1000,
            fetch_budget: 2048,
        }
    }
}
