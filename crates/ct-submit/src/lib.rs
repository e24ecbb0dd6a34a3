#![forbid(unsafe_code)]

//! The write path of the log: chain validation, the three-stage sequencer
//! pipeline, boot recovery, and the leader lease that gates all of it.
//!
//! Stage 0 runs inside HTTP handlers and may run in parallel; stage 1 and
//! stage 2 are single serial tasks owning the sequence counter and the
//! store respectively, joined by bounded channels.

pub mod chain;
pub mod committer;
pub mod config;
pub mod lock;
pub mod metrics;
pub mod sequencer;
pub mod server;
pub mod setup;
pub mod stage0;
pub mod x509util;

use thiserror::Error;

use ct_store::StorageError;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid chain: {0}")]
    InvalidChain(#[from] chain::ChainError),
    #[error("expected {expected}, got {got}")]
    WrongEndpoint {
        expected: &'static str,
        got: &'static str,
    },
    #[error("sequencer busy")]
    SequencerBusy,
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Internal(String),
}

impl SubmitError {
    /// HTTP status for the stage-0 surface.
    pub fn status(&self) -> u16 {
        match self {
            SubmitError::InvalidRequest(_)
            | SubmitError::InvalidChain(_)
            | SubmitError::WrongEndpoint { .. } => 400,
            SubmitError::SequencerBusy => 503,
            SubmitError::Storage(_) | SubmitError::Internal(_) => 500,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    i64::try_from(millis).unwrap_or(i64::MAX)
}
