//! Tile and index fetching for the monitor.
//!
//! The right edge of the tree lives at partial-width paths until a later
//! batch completes the tile, so a fetch tries the full-width object first
//! and falls back to the partial path computed from the request's tree
//! size. A 404 on the full path is an expected signal, not an error.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use ct_core::index::{lookup, RecordHashEntry, RECORD_HASH_RECORD_SIZE};
use ct_core::sth::GetSthResponse;
use ct_core::{index, keys, TILE_HEIGHT, TILE_WIDTH};
use ct_store::Storage;
use ct_tlog::{hash_from_tile, tile_for_index, HashReader, Tile, TlogError, TreeHash};

use crate::{Monitor, MonitorError};

/// Per-request storage-fetch allowance.
pub struct FetchBudget {
    remaining: AtomicUsize,
}

impl FetchBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(limit),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    /// Takes one unit; false once the allowance is gone.
    pub fn spend(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Monitor {
    pub(crate) async fn get_budgeted(
        &self,
        key: &str,
        budget: &FetchBudget,
    ) -> Result<Option<Vec<u8>>, MonitorError> {
        if !budget.spend() {
            return Ok(None);
        }
        Ok(Some(self.store.get(key).await?))
    }

    pub(crate) async fn read_sth(&self) -> Result<GetSthResponse, MonitorError> {
        let bytes = self.store.get(keys::STH).await.map_err(|e| {
            // A log without a head is not serving yet.
            MonitorError::Unavailable(e.to_string())
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| MonitorError::Internal(format!("persisted STH: {e}")))
    }

    /// Fetches a tile, preferring the full-width object and falling back
    /// to the partial right-edge path implied by `tree_size`. Returns the
    /// bytes and the width they cover.
    pub(crate) async fn fetch_tile(
        &self,
        tile: Tile,
        tree_size: u64,
        budget: &FetchBudget,
    ) -> Result<Option<(Vec<u8>, Tile)>, MonitorError> {
        let full = Tile {
            width: tile.full_width(),
            ..tile
        };
        if !budget.spend() {
            return Ok(None);
        }
        match self.store.get(&full.path()).await {
            Ok(bytes) => return Ok(Some((bytes, full))),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        // Count of hashes (or leaves) at this tile's level.
        let level_count = if tile.level < 0 {
            tree_size
        } else {
            let shift = u32::from(TILE_HEIGHT) * tile.level as u32;
            if shift >= 64 {
                0
            } else {
                tree_size >> shift
            }
        };
        let edge_n = level_count / u64::from(TILE_WIDTH);
        let edge_width = (level_count % u64::from(TILE_WIDTH)) as u32;
        if tile.n != edge_n || edge_width == 0 {
            return Err(MonitorError::NotFound);
        }
        let partial = Tile {
            width: edge_width,
            ..tile
        };
        if !budget.spend() {
            return Ok(None);
        }
        let bytes = self.store.get(&partial.path()).await?;
        Ok(Some((bytes, partial)))
    }

    /// Resolves a truncated RFC 6962 leaf hash to its leaf index.
    pub(crate) async fn index_for_hash(
        &self,
        truncated: &[u8; 16],
    ) -> Result<u64, MonitorError> {
        let path = format!(
            "{}{}",
            keys::RECORD_HASH_PREFIX,
            index::k_anon_hash_path(truncated, self.mask)
        );
        let file = self.store.get(&path).await?;
        let record = lookup(&file, RECORD_HASH_RECORD_SIZE, truncated)
            .map_err(|_| MonitorError::NotFound)?;
        Ok(RecordHashEntry::from_bytes(record.try_into().expect("record size")).leaf_index)
    }

    pub(crate) fn hash_reader(&self, tree_size: u64) -> MonitorHashReader<'_> {
        MonitorHashReader {
            monitor: self,
            tree_size,
        }
    }
}

/// Level-aware lazy hash reader over stored tiles. Structural validation
/// only: the signed head, not this reader, is the proof of correctness.
pub struct MonitorHashReader<'a> {
    monitor: &'a Monitor,
    tree_size: u64,
}

#[async_trait]
impl HashReader for MonitorHashReader<'_> {
    async fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<TreeHash>, TlogError> {
        let budget = FetchBudget::unlimited();
        let mut hashes = Vec::with_capacity(indexes.len());
        for &index in indexes {
            let tile = tile_for_index(TILE_HEIGHT, index);
            let (bytes, fetched) = self
                .monitor
                .fetch_tile(tile, self.tree_size, &budget)
                .await
                .map_err(|e| TlogError::Storage(e.to_string()))?
                .expect("unlimited budget");
            hashes.push(hash_from_tile(&fetched, &bytes, index)?);
        }
        Ok(hashes)
    }
}
