//! Stage 2: materializes each batch into tiles and index files, signs the
//! tree head, and acks the submitters.
//!
//! The committer is the only writer to the object store. Any failure here
//! is fatal by design: the caller releases the leader lease and exits, and
//! recovery is a cold boot that re-reads and re-verifies the right edge of
//! the tree.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use ct_core::checkpoint::{sign_checkpoint_note, Checkpoint};
use ct_core::index::{
    insert_sorted, k_anon_hash_path, DedupeEntry, RecordHashEntry, DEDUPE_RECORD_SIZE,
    RECORD_HASH_RECORD_SIZE,
};
use ct_core::signing::LogSigner;
use ct_core::sth::{GetSthResponse, SignedTreeHead};
use ct_core::tile_leaf::append_tile_leaf;
use ct_core::{issuer_key, keys, truncate_key, TILE_HEIGHT, TILE_WIDTH};
use ct_store::{get_or_empty, Storage, StorageError};
use ct_tlog::{
    hash_from_tile, new_tiles, read_tile_data, record_hash, stored_hash_index,
    stored_hashes_for_record_hash, tile_for_index, tree_hash, HashReader, Tile, TileHashReader,
    TileReader, TlogError, Tree, TreeHash,
};

use crate::metrics::Metrics;
use crate::now_ms;
use crate::sequencer::Batch;

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("merkle engine: {0}")]
    Tlog(#[from] TlogError),
    #[error("encoding: {0}")]
    Codec(#[from] ct_core::CodecError),
    #[error("signing: {0}")]
    Signing(#[from] ct_core::signing::SigningError),
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] ct_core::checkpoint::CheckpointError),
    #[error("batch out of order: expected first index {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("corrupt tile at boot: {0}")]
    CorruptTile(String),
}

/// The rightmost known tile of one level, with its bytes.
#[derive(Debug, Clone)]
pub struct EdgeTile {
    pub tile: Tile,
    pub bytes: Vec<u8>,
}

/// Serial owner of the store-side log state.
pub struct Committer {
    store: Arc<dyn Storage>,
    signer: LogSigner,
    origin: String,
    mask: usize,
    metrics: Metrics,
    tree_size: u64,
    /// Level -1 is the data tile; levels 0.. are hash tiles.
    edge_tiles: HashMap<i8, EdgeTile>,
}

/// Reads stored hashes from the batch overlay first, then from the edge
/// tiles. Scoped to a single batch.
struct OverlayReader<'a> {
    overlay: Mutex<HashMap<u64, TreeHash>>,
    edge_tiles: &'a HashMap<i8, EdgeTile>,
}

#[async_trait]
impl HashReader for OverlayReader<'_> {
    async fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<TreeHash>, TlogError> {
        let overlay = self.overlay.lock().expect("overlay lock");
        indexes
            .iter()
            .map(|&index| {
                if let Some(h) = overlay.get(&index) {
                    return Ok(*h);
                }
                let tile = tile_for_index(TILE_HEIGHT, index);
                let edge = self
                    .edge_tiles
                    .get(&tile.level)
                    .ok_or_else(|| TlogError::Storage(format!("no edge tile at level {}", tile.level)))?;
                hash_from_tile(&edge.tile, &edge.bytes, index)
            })
            .collect()
    }
}

impl Committer {
    pub fn tree_size(&self) -> u64 {
        self.tree_size
    }

    /// Processes batches until the channel closes; the first error is
    /// returned to the caller, which must treat it as fatal.
    pub async fn run(&mut self, mut batches: mpsc::Receiver<Batch>) -> Result<(), CommitError> {
        while let Some(batch) = batches.recv().await {
            self.commit_batch(batch).await?;
        }
        info!("committer channel closed");
        Ok(())
    }

    pub async fn commit_batch(&mut self, batch: Batch) -> Result<(), CommitError> {
        let old_size = self.tree_size;
        if batch.is_empty() {
            // Refresh the head so observers see a fresh timestamp even
            // with no new leaves.
            let reader = OverlayReader {
                overlay: Mutex::new(HashMap::new()),
                edge_tiles: &self.edge_tiles,
            };
            let root = tree_hash(old_size, &reader).await?;
            drop(reader);
            self.publish_tree_head(old_size, root).await?;
            return Ok(());
        }

        if batch[0].entry.leaf_index != old_size {
            return Err(CommitError::OutOfOrder {
                expected: old_size,
                got: batch[0].entry.leaf_index,
            });
        }
        let new_size = batch.last().expect("non-empty").entry.leaf_index + 1;
        debug!(old_size, new_size, "committing batch");

        // Data tiles: append each leaf, emitting full tiles as they close
        // and the trailing partial at the end.
        let mut data_edge = self
            .edge_tiles
            .get(&-1)
            .cloned()
            .unwrap_or_else(|| empty_data_tile(0));
        if data_edge.tile.width == TILE_WIDTH {
            data_edge = empty_data_tile(data_edge.tile.n + 1);
        }
        for sub in &batch {
            data_edge.bytes = append_tile_leaf(std::mem::take(&mut data_edge.bytes), &sub.entry)?;
            data_edge.tile.width += 1;
            if data_edge.tile.width == TILE_WIDTH {
                self.store
                    .set(&data_edge.tile.path(), data_edge.bytes.clone())
                    .await?;
                data_edge = empty_data_tile(data_edge.tile.n + 1);
            }
        }
        if data_edge.tile.width > 0 {
            self.store
                .set(&data_edge.tile.path(), data_edge.bytes.clone())
                .await?;
        }
        self.edge_tiles.insert(-1, data_edge);

        // Stored hashes for every new leaf, accumulated in the overlay.
        let reader = OverlayReader {
            overlay: Mutex::new(HashMap::new()),
            edge_tiles: &self.edge_tiles,
        };
        let mut record_hashes = Vec::with_capacity(batch.len());
        for sub in &batch {
            let leaf = sub.entry.merkle_tree_leaf()?;
            let rh = record_hash(&leaf);
            record_hashes.push((rh, sub.entry.leaf_index));
            let hashes =
                stored_hashes_for_record_hash(sub.entry.leaf_index, rh, &reader).await?;
            let base = stored_hash_index(0, sub.entry.leaf_index);
            let mut overlay = reader.overlay.lock().expect("overlay lock");
            for (i, h) in hashes.into_iter().enumerate() {
                overlay.insert(base + i as u64, h);
            }
        }

        // Hash tiles that changed.
        let mut written = Vec::new();
        for tile in new_tiles(TILE_HEIGHT, old_size, new_size) {
            let data = read_tile_data(&tile, &reader).await?;
            self.store.set(&tile.path(), data.clone()).await?;
            written.push(EdgeTile { tile, bytes: data });
        }

        // Record-hash index files, grouped by prefix, written in parallel.
        let records: Vec<([u8; 16], Vec<u8>)> = record_hashes
            .iter()
            .map(|(rh, leaf_index)| {
                let key = truncate_key(rh.as_bytes());
                let entry = RecordHashEntry {
                    key,
                    leaf_index: *leaf_index,
                };
                (key, entry.to_bytes().to_vec())
            })
            .collect();
        self.update_index_files(keys::RECORD_HASH_PREFIX, RECORD_HASH_RECORD_SIZE, records)
            .await?;

        // Issuer blobs are content-addressed; write only the missing ones.
        let mut seen = std::collections::HashSet::new();
        for sub in &batch {
            for (fp, der) in sub
                .entry
                .chain_fingerprints
                .iter()
                .zip(sub.entry.chain.iter())
            {
                if !seen.insert(*fp) {
                    continue;
                }
                let key = issuer_key(fp);
                if !self.store.exists(&key).await? {
                    self.store.set(&key, der.clone()).await?;
                }
            }
        }

        // New head, then its two published representations.
        let root = tree_hash(new_size, &reader).await?;
        drop(reader);
        for edge in written {
            self.edge_tiles.insert(edge.tile.level, edge);
        }
        self.publish_tree_head(new_size, root).await?;

        // Dedupe index, after the head: a dedupe hit must only ever serve
        // coordinates that are already provable.
        let records: Vec<([u8; 16], Vec<u8>)> = batch
            .iter()
            .map(|sub| {
                let key = sub.entry.dedupe_key();
                let entry = DedupeEntry {
                    key,
                    leaf_index: sub.entry.leaf_index,
                    timestamp: sub.entry.timestamp,
                };
                (key, entry.to_bytes().to_vec())
            })
            .collect();
        self.update_index_files(keys::DEDUPE_PREFIX, DEDUPE_RECORD_SIZE, records)
            .await?;

        self.tree_size = new_size;
        self.metrics.batches_committed.inc();
        self.metrics
            .entries_sequenced
            .inc_by(new_size - old_size);
        self.metrics.tree_size.set(new_size as i64);

        // Ack every submitter with its final entry.
        for sub in batch {
            let entry = sub.entry.clone();
            let _ = sub.done.send(entry);
        }
        info!(tree_size = new_size, "batch committed");
        Ok(())
    }

    /// Merge-inserts records into their k-anonymous prefix files and
    /// writes the files back concurrently.
    async fn update_index_files(
        &self,
        prefix: &'static str,
        record_size: usize,
        records: Vec<([u8; 16], Vec<u8>)>,
    ) -> Result<(), CommitError> {
        let mut files: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
        for (key, record) in records {
            files
                .entry(k_anon_hash_path(&key, self.mask))
                .or_default()
                .push(record);
        }

        let mut writes = JoinSet::new();
        for (path, records) in files {
            let store = Arc::clone(&self.store);
            writes.spawn(async move {
                let full_path = format!("{prefix}{path}");
                let mut file = get_or_empty(store.as_ref(), &full_path).await?;
                let mut changed = false;
                for record in &records {
                    changed |= insert_sorted(&mut file, record_size, record)
                        .map_err(|e| StorageError::Backend(e.to_string()))?;
                }
                if changed {
                    store.set(&full_path, file).await?;
                }
                Ok::<(), StorageError>(())
            });
        }
        while let Some(result) = writes.join_next().await {
            result.map_err(|e| StorageError::Backend(e.to_string()))??;
        }
        Ok(())
    }

    /// Signs the head once and publishes the JSON STH and the checkpoint
    /// note from that single signature.
    async fn publish_tree_head(&self, tree_size: u64, root: TreeHash) -> Result<(), CommitError> {
        let timestamp = now_ms() as u64;
        let sth = SignedTreeHead {
            tree_size,
            timestamp,
            sha256_root_hash: *root.as_bytes(),
        };
        let tree_head_signature = self.signer.digitally_sign(&sth.signature_input())?;

        let json = serde_json::to_vec(&GetSthResponse {
            tree_size,
            timestamp,
            sha256_root_hash: root.as_bytes().to_vec(),
            tree_head_signature: tree_head_signature.clone(),
        })
        .map_err(|e| CommitError::Storage(StorageError::Backend(e.to_string())))?;
        self.store.set(keys::STH, json).await?;

        let note = sign_checkpoint_note(
            &Checkpoint {
                origin: self.origin.clone(),
                tree_size,
                root_hash: *root.as_bytes(),
            },
            self.signer.spki_der(),
            timestamp,
            &tree_head_signature,
        )?;
        self.store.set(keys::CHECKPOINT, note).await?;
        Ok(())
    }
}

fn empty_data_tile(n: u64) -> EdgeTile {
    EdgeTile {
        tile: Tile {
            height: TILE_HEIGHT,
            level: -1,
            n,
            width: 0,
        },
        bytes: Vec::new(),
    }
}

/// Boot-time tile source: fetches exact tile paths, falling back to the
/// full-width object when a partial has been superseded, and captures
/// verified tiles for the edge map.
struct BootTileReader {
    store: Arc<dyn Storage>,
    captured: Mutex<HashMap<i8, EdgeTile>>,
}

#[async_trait]
impl TileReader for BootTileReader {
    async fn read_tiles(&self, tiles: &[Tile]) -> Result<Vec<Vec<u8>>, TlogError> {
        let mut out = Vec::with_capacity(tiles.len());
        for tile in tiles {
            let data = match self.store.get(&tile.path()).await {
                Ok(data) => data,
                Err(e) if e.is_not_found() && !tile.is_full() && tile.level >= 0 => {
                    // A later batch may have completed this tile.
                    let full = Tile {
                        width: tile.full_width(),
                        ..*tile
                    };
                    let data = self
                        .store
                        .get(&full.path())
                        .await
                        .map_err(|e| TlogError::Storage(e.to_string()))?;
                    data[..tile.width as usize * ct_tlog::HASH_SIZE].to_vec()
                }
                Err(e) => return Err(TlogError::Storage(e.to_string())),
            };
            out.push(data);
        }
        Ok(out)
    }

    fn save_tiles(&self, tiles: &[Tile], data: &[Vec<u8>]) {
        let mut captured = self.captured.lock().expect("capture lock");
        for (tile, bytes) in tiles.iter().zip(data.iter()) {
            let replace = captured
                .get(&tile.level)
                .map(|e| (tile.n, tile.width) > (e.tile.n, e.tile.width))
                .unwrap_or(true);
            if replace {
                captured.insert(
                    tile.level,
                    EdgeTile {
                        tile: *tile,
                        bytes: bytes.clone(),
                    },
                );
            }
        }
    }
}

/// Loads (or initializes) the writer state: reads the persisted head,
/// fetches and verifies every edge tile against its root, and seeds the
/// committer.
pub async fn boot(
    store: Arc<dyn Storage>,
    signer: LogSigner,
    origin: String,
    mask: usize,
    metrics: Metrics,
) -> Result<Committer, CommitError> {
    let sth = match store.get(keys::STH).await {
        Ok(bytes) => Some(
            serde_json::from_slice::<GetSthResponse>(&bytes)
                .map_err(|e| CommitError::CorruptTile(format!("persisted STH: {e}")))?,
        ),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };

    let mut edge_tiles = HashMap::new();
    let tree_size = match sth {
        None => 0,
        Some(sth) if sth.tree_size == 0 => 0,
        Some(sth) => {
            let root = sth
                .root_hash()
                .map_err(|e| CommitError::CorruptTile(format!("persisted STH: {e}")))?;
            let tree = Tree {
                size: sth.tree_size,
                root: TreeHash(root),
            };
            let boot_reader = BootTileReader {
                store: Arc::clone(&store),
                captured: Mutex::new(HashMap::new()),
            };
            let verifier = TileHashReader::new(TILE_HEIGHT, tree, &boot_reader);
            // Walking to the last leaf pulls in and verifies every tile
            // on the right edge.
            verifier
                .read_hashes(&[stored_hash_index(0, sth.tree_size - 1)])
                .await
                .map_err(|e| CommitError::CorruptTile(e.to_string()))?;
            edge_tiles = boot_reader.captured.into_inner().expect("capture lock");

            // The data tile is not part of the hash tree; load it directly.
            let n = (sth.tree_size - 1) / u64::from(TILE_WIDTH);
            let width = (sth.tree_size - n * u64::from(TILE_WIDTH)) as u32;
            let tile = Tile {
                height: TILE_HEIGHT,
                level: -1,
                n,
                width,
            };
            let reader = BootTileReader {
                store: Arc::clone(&store),
                captured: Mutex::new(HashMap::new()),
            };
            let bytes = reader
                .read_tiles(std::slice::from_ref(&tile))
                .await
                .map_err(|e| CommitError::CorruptTile(e.to_string()))?
                .remove(0);
            edge_tiles.insert(-1, EdgeTile { tile, bytes });
            sth.tree_size
        }
    };
    if tree_size == 0 {
        edge_tiles.insert(-1, empty_data_tile(0));
    }

    info!(tree_size, "writer state loaded");
    metrics.tree_size.set(tree_size as i64);
    Ok(Committer {
        store,
        signer,
        origin,
        mask,
        metrics,
        tree_size,
        edge_tiles,
    })
}
