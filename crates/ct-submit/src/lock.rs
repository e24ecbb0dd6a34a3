//! Single-writer leader lease.
//!
//! The gate is a trait so deployments can plug a shared lock service; the
//! bundled implementation is a sled-backed CAS lease for single-host and
//! shared-volume setups. Loss of the lease is fatal: the watchdog
//! terminates the process rather than let two sequencers write one log.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend: {0}")]
    Backend(String),
    #[error("lease encoding: {0}")]
    Encoding(String),
}

impl From<sled::Error> for LockError {
    fn from(e: sled::Error) -> Self {
        LockError::Backend(e.to_string())
    }
}

/// Single-writer election seam.
pub trait LeaderGate: Send + Sync {
    /// Attempts to become (or confirm being) the leader.
    fn try_acquire(&self) -> Result<bool, LockError>;
    /// Extends the lease; `false` means leadership is gone.
    fn renew(&self) -> Result<bool, LockError>;
    /// Releases the lease if still held.
    fn release(&self) -> Result<(), LockError>;
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
        )
        .unwrap_or(u64::MAX)
    }
}

const LEASE_KEY: &[u8] = b"writer:leader_lease";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Lease {
    holder_id: String,
    acquired_at_ms: u64,
    renewed_at_ms: u64,
    expires_at_ms: u64,
}

impl Lease {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// CAS lease over a sled tree.
pub struct SledLease {
    tree: sled::Tree,
    holder_id: String,
    lease_ms: u64,
    clock: Arc<dyn Clock>,
}

impl SledLease {
    pub fn open(
        path: impl AsRef<std::path::Path>,
        holder_id: String,
        lease_ms: u64,
    ) -> Result<Self, LockError> {
        let db = sled::open(path)?;
        Self::new(db, holder_id, lease_ms, Arc::new(SystemClock))
    }

    pub fn new(
        db: sled::Db,
        holder_id: String,
        lease_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LockError> {
        Ok(Self {
            tree: db.open_tree("writer-election")?,
            holder_id,
            lease_ms: lease_ms.max(1),
            clock,
        })
    }

    fn read(&self) -> Result<Option<(sled::IVec, Lease)>, LockError> {
        let Some(raw) = self.tree.get(LEASE_KEY)? else {
            return Ok(None);
        };
        let lease = serde_json::from_slice(&raw)
            .map_err(|e| LockError::Encoding(e.to_string()))?;
        Ok(Some((raw, lease)))
    }

    fn encode(&self, lease: &Lease) -> Result<Vec<u8>, LockError> {
        serde_json::to_vec(lease).map_err(|e| LockError::Encoding(e.to_string()))
    }
}

impl LeaderGate for SledLease {
    fn try_acquire(&self) -> Result<bool, LockError> {
        let now = self.clock.now_ms();
        let current = self.read()?;
        match &current {
            Some((_, lease)) if lease.holder_id == self.holder_id && !lease.is_expired(now) => {
                return Ok(true);
            }
            Some((_, lease)) if !lease.is_expired(now) => return Ok(false),
            _ => {}
        }
        let acquired_at_ms = current
            .as_ref()
            .map(|(_, l)| l.acquired_at_ms)
            .unwrap_or(now);
        let next = Lease {
            holder_id: self.holder_id.clone(),
            acquired_at_ms,
            renewed_at_ms: now,
            expires_at_ms: now.saturating_add(self.lease_ms),
        };
        let expected = current.as_ref().map(|(raw, _)| raw.as_ref());
        let cas = self
            .tree
            .compare_and_swap(LEASE_KEY, expected, Some(self.encode(&next)?))?;
        Ok(cas.is_ok())
    }

    fn renew(&self) -> Result<bool, LockError> {
        let now = self.clock.now_ms();
        let Some((raw, lease)) = self.read()? else {
            return Ok(false);
        };
        if lease.holder_id != self.holder_id || lease.is_expired(now) {
            return Ok(false);
        }
        let next = Lease {
            renewed_at_ms: now,
            expires_at_ms: now.saturating_add(self.lease_ms),
            ..lease
        };
        let cas = self
            .tree
            .compare_and_swap(LEASE_KEY, Some(raw.as_ref()), Some(self.encode(&next)?))?;
        Ok(cas.is_ok())
    }

    fn release(&self) -> Result<(), LockError> {
        let Some((raw, lease)) = self.read()? else {
            return Ok(());
        };
        if lease.holder_id != self.holder_id {
            return Ok(());
        }
        let _ = self
            .tree
            .compare_and_swap(LEASE_KEY, Some(raw.as_ref()), None::<&[u8]>)?;
        Ok(())
    }
}

/// Blocks until the gate grants leadership.
pub async fn acquire_leadership(gate: &dyn LeaderGate, poll: Duration) -> Result<(), LockError> {
    loop {
        if gate.try_acquire()? {
            info!("leader lease acquired");
            return Ok(());
        }
        warn!("another writer holds the lease; waiting");
        tokio::time::sleep(poll).await;
    }
}

/// Renews the lease in the background and kills the process the moment
/// leadership is lost. There is no degraded read-only mode for a writer.
pub fn spawn_watchdog(gate: Arc<dyn LeaderGate>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match gate.renew() {
                Ok(true) => {}
                Ok(false) => {
                    error!("leader lease lost, exiting now");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "leader lease renewal failed, exiting now");
                    std::process::exit(1);
                }
            }
        }
    })
}
