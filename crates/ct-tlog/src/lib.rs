#![forbid(unsafe_code)]

//! Tiled Merkle tree engine for the log.
//!
//! The tree is stored as a flat sequence of hashes: appending record `n`
//! stores its leaf hash plus one interior hash for every trailing one bit
//! of `n`. Everything else (tree heads, inclusion and consistency proofs,
//! tile contents) is derived from that sequence through a [`HashReader`].
//!
//! Hashing follows RFC 6962 §2.1: SHA-256 with a `0x00` prefix for leaves
//! and a `0x01` prefix for interior nodes.

pub mod tile;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use tile::{
    hash_from_tile, new_tiles, read_tile_data, tile_for_index, Tile, TileHashReader, TileReader,
    Tree,
};

/// Size of a stored hash in bytes.
pub const HASH_SIZE: usize = 32;

/// A node or record hash in the tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TreeHash(pub [u8; HASH_SIZE]);

impl TreeHash {
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for TreeHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TreeHash({})", hex::encode(self.0))
    }
}

#[derive(Debug, Error)]
pub enum TlogError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("invalid tile {0}")]
    InvalidTile(String),
    #[error("downloaded inconsistent tile {0}")]
    InconsistentTile(String),
    #[error("indexes not in tree")]
    IndexesNotInTree,
    #[error("proof verification failed")]
    ProofFailed,
    #[error("reader returned {got} hashes, want {want}")]
    ShortRead { got: usize, want: usize },
    #[error("storage: {0}")]
    Storage(String),
}

/// Source of previously stored hashes, addressed by stored-hash index.
///
/// Every engine operation plans its full index set up front and issues a
/// single `read_hashes` call, so implementations are free to batch.
#[async_trait]
pub trait HashReader: Send + Sync {
    async fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<TreeHash>, TlogError>;
}

/// RFC 6962 leaf hash: SHA-256(0x00 || record).
pub fn record_hash(record: &[u8]) -> TreeHash {
    let mut h = Sha256::new();
    h.update([0x00]);
    h.update(record);
    TreeHash(h.finalize().into())
}

/// RFC 6962 interior hash: SHA-256(0x01 || left || right).
pub fn node_hash(left: TreeHash, right: TreeHash) -> TreeHash {
    let mut h = Sha256::new();
    h.update([0x01]);
    h.update(left.0);
    h.update(right.0);
    TreeHash(h.finalize().into())
}

/// Root hash of the empty tree: SHA-256 of the empty string.
pub fn empty_tree_hash() -> TreeHash {
    TreeHash(Sha256::digest([]).into())
}

/// Index in the stored-hash sequence of the `n`th hash at `level`.
///
/// Level `l`'s `n`th hash is stored right after level `l+1`'s `2n+1`th.
pub fn stored_hash_index(level: usize, mut n: u64) -> u64 {
    for _ in 0..level {
        n = 2 * n + 1;
    }
    let mut i = 0u64;
    let mut m = n;
    while m > 0 {
        i += m;
        m >>= 1;
    }
    i + level as u64
}

/// Inverse of [`stored_hash_index`].
pub fn split_stored_hash_index(index: u64) -> (usize, u64) {
    // Find the record n whose append wrote this index, then the level is
    // the offset past that record's level-0 slot.
    let mut n = index / 2;
    let mut index_n = stored_hash_index(0, n);
    debug_assert!(index_n <= index);
    loop {
        // Appending record n+1 stores 1 + trailing_ones(n+1) hashes.
        let x = index_n + 1 + u64::from((n + 1).trailing_zeros());
        if x > index {
            break;
        }
        n += 1;
        index_n = x;
    }
    let level = (index - index_n) as usize;
    (level, n >> level)
}

/// Number of stored hashes for a tree with `n` records.
pub fn stored_hash_count(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let mut count = stored_hash_index(0, n - 1) + 1;
    let mut i = n - 1;
    while i & 1 != 0 {
        count += 1;
        i >>= 1;
    }
    count
}

/// Hashes that must be stored when appending record `n` whose RFC 6962
/// leaf hash is `h`: the leaf hash itself, then one interior hash for
/// every complete subtree the append closes.
pub async fn stored_hashes_for_record_hash<R: HashReader + ?Sized>(
    n: u64,
    h: TreeHash,
    reader: &R,
) -> Result<Vec<TreeHash>, TlogError> {
    // Left siblings along the path to the root, one per trailing one bit.
    let mut indexes = Vec::new();
    let mut i = 0usize;
    while (n >> i) & 1 == 1 {
        indexes.push(stored_hash_index(i, (n >> i) - 1));
        i += 1;
    }

    let old = reader.read_hashes(&indexes).await?;
    if old.len() != indexes.len() {
        return Err(TlogError::ShortRead {
            got: old.len(),
            want: indexes.len(),
        });
    }

    let mut hashes = Vec::with_capacity(1 + indexes.len());
    let mut acc = h;
    hashes.push(acc);
    for left in old {
        acc = node_hash(left, acc);
        hashes.push(acc);
    }
    Ok(hashes)
}

/// Largest power of two `k <= n` together with `log2 k`. Requires `n >= 1`.
pub(crate) fn maxpow2(n: u64) -> (u64, usize) {
    debug_assert!(n >= 1);
    let l = 63 - n.leading_zeros() as usize;
    (1 << l, l)
}

/// Stored-hash indexes of the maximal complete subtrees covering `[lo, hi)`.
pub(crate) fn sub_tree_index(mut lo: u64, hi: u64, need: &mut Vec<u64>) {
    while lo < hi {
        let (k, level) = maxpow2(hi - lo);
        debug_assert_eq!(lo & (k - 1), 0, "bad math in sub_tree_index");
        need.push(stored_hash_index(level, lo >> level));
        lo += k;
    }
}

/// Folds the hashes planned by [`sub_tree_index`] into the hash of the
/// subtree covering `[lo, hi)`. Returns leftover hashes.
pub(crate) fn sub_tree_hash(
    mut lo: u64,
    hi: u64,
    mut hashes: &[TreeHash],
) -> (TreeHash, &[TreeHash]) {
    let mut seen = Vec::new();
    while lo < hi {
        let (k, _) = maxpow2(hi - lo);
        seen.push(hashes[0]);
        hashes = &hashes[1..];
        lo += k;
    }
    // Fold right to left: the fringe accumulates under its left neighbors.
    let mut h = seen[seen.len() - 1];
    for &left in seen[..seen.len() - 1].iter().rev() {
        h = node_hash(left, h);
    }
    (h, hashes)
}

/// Root hash of the tree with `size` records.
pub async fn tree_hash<R: HashReader + ?Sized>(
    size: u64,
    reader: &R,
) -> Result<TreeHash, TlogError> {
    if size == 0 {
        return Ok(empty_tree_hash());
    }
    let mut indexes = Vec::new();
    sub_tree_index(0, size, &mut indexes);
    let hashes = reader.read_hashes(&indexes).await?;
    if hashes.len() != indexes.len() {
        return Err(TlogError::ShortRead {
            got: hashes.len(),
            want: indexes.len(),
        });
    }
    let (hash, rest) = sub_tree_hash(0, size, &hashes);
    debug_assert!(rest.is_empty(), "bad math in tree_hash");
    Ok(hash)
}

fn leaf_proof_index(lo: u64, hi: u64, n: u64, need: &mut Vec<u64>) {
    debug_assert!(lo <= n && n < hi, "bad math in leaf_proof_index");
    if lo + 1 == hi {
        return;
    }
    let (k, _) = maxpow2(hi - lo);
    if n < lo + k {
        leaf_proof_index(lo, lo + k, n, need);
        sub_tree_index(lo + k, hi, need);
    } else {
        sub_tree_index(lo, lo + k, need);
        leaf_proof_index(lo + k, hi, n, need);
    }
}

fn leaf_proof<'a>(
    lo: u64,
    hi: u64,
    n: u64,
    hashes: &'a [TreeHash],
) -> (Vec<TreeHash>, &'a [TreeHash]) {
    if lo + 1 == hi {
        return (Vec::new(), hashes);
    }
    let (k, _) = maxpow2(hi - lo);
    let (mut p, th, rest) = if n < lo + k {
        let (p, rest) = leaf_proof(lo, lo + k, n, hashes);
        let (th, rest) = sub_tree_hash(lo + k, hi, rest);
        (p, th, rest)
    } else {
        let (th, rest) = sub_tree_hash(lo, lo + k, hashes);
        let (p, rest) = leaf_proof(lo + k, hi, n, rest);
        (p, th, rest)
    };
    p.push(th);
    (p, rest)
}

/// RFC 6962 inclusion proof that the tree of size `size` contains record
/// `n`, ordered from the leaf's sibling up to the root.
pub async fn prove_record<R: HashReader + ?Sized>(
    size: u64,
    n: u64,
    reader: &R,
) -> Result<Vec<TreeHash>, TlogError> {
    if n >= size {
        return Err(TlogError::InvalidInput("record index past tree size"));
    }
    let mut indexes = Vec::new();
    leaf_proof_index(0, size, n, &mut indexes);
    if indexes.is_empty() {
        return Ok(Vec::new());
    }
    let hashes = reader.read_hashes(&indexes).await?;
    if hashes.len() != indexes.len() {
        return Err(TlogError::ShortRead {
            got: hashes.len(),
            want: indexes.len(),
        });
    }
    let (p, rest) = leaf_proof(0, size, n, &hashes);
    debug_assert!(rest.is_empty(), "bad math in prove_record");
    Ok(p)
}

fn tree_proof_index(lo: u64, hi: u64, n: u64, need: &mut Vec<u64>) {
    debug_assert!(lo < n && n <= hi, "bad math in tree_proof_index");
    if n == hi {
        if lo != 0 {
            sub_tree_index(lo, hi, need);
        }
        return;
    }
    let (k, _) = maxpow2(hi - lo);
    if n <= lo + k {
        tree_proof_index(lo, lo + k, n, need);
        sub_tree_index(lo + k, hi, need);
    } else {
        sub_tree_index(lo, lo + k, need);
        tree_proof_index(lo + k, hi, n, need);
    }
}

fn tree_proof<'a>(
    lo: u64,
    hi: u64,
    n: u64,
    hashes: &'a [TreeHash],
) -> (Vec<TreeHash>, &'a [TreeHash]) {
    if n == hi {
        if lo == 0 {
            return (Vec::new(), hashes);
        }
        let (th, rest) = sub_tree_hash(lo, hi, hashes);
        return (vec![th], rest);
    }
    let (k, _) = maxpow2(hi - lo);
    let (mut p, th, rest) = if n <= lo + k {
        let (p, rest) = tree_proof(lo, lo + k, n, hashes);
        let (th, rest) = sub_tree_hash(lo + k, hi, rest);
        (p, th, rest)
    } else {
        let (th, rest) = sub_tree_hash(lo, lo + k, hashes);
        let (p, rest) = tree_proof(lo + k, hi, n, rest);
        (p, th, rest)
    };
    p.push(th);
    (p, rest)
}

/// RFC 6962 consistency proof from the tree of size `old_size` to the tree
/// of size `size`. A proof from the empty tree is empty by definition.
pub async fn prove_tree<R: HashReader + ?Sized>(
    size: u64,
    old_size: u64,
    reader: &R,
) -> Result<Vec<TreeHash>, TlogError> {
    if old_size > size {
        return Err(TlogError::InvalidInput("invalid consistency bounds"));
    }
    if old_size == 0 {
        return Ok(Vec::new());
    }
    let mut indexes = Vec::new();
    tree_proof_index(0, size, old_size, &mut indexes);
    if indexes.is_empty() {
        return Ok(Vec::new());
    }
    let hashes = reader.read_hashes(&indexes).await?;
    if hashes.len() != indexes.len() {
        return Err(TlogError::ShortRead {
            got: hashes.len(),
            want: indexes.len(),
        });
    }
    let (p, rest) = tree_proof(0, size, old_size, &hashes);
    debug_assert!(rest.is_empty(), "bad math in prove_tree");
    Ok(p)
}

fn run_record_proof(
    p: &[TreeHash],
    lo: u64,
    hi: u64,
    n: u64,
    leaf_hash: TreeHash,
) -> Result<TreeHash, TlogError> {
    if lo + 1 == hi {
        if !p.is_empty() {
            return Err(TlogError::ProofFailed);
        }
        return Ok(leaf_hash);
    }
    let Some((&sibling, p)) = p.split_last() else {
        return Err(TlogError::ProofFailed);
    };
    let (k, _) = maxpow2(hi - lo);
    if n < lo + k {
        let th = run_record_proof(p, lo, lo + k, n, leaf_hash)?;
        Ok(node_hash(th, sibling))
    } else {
        let th = run_record_proof(p, lo + k, hi, n, leaf_hash)?;
        Ok(node_hash(sibling, th))
    }
}

/// Verifies an inclusion proof against a tree head.
pub fn check_record(
    proof: &[TreeHash],
    size: u64,
    root: TreeHash,
    n: u64,
    leaf_hash: TreeHash,
) -> Result<(), TlogError> {
    if n >= size {
        return Err(TlogError::InvalidInput("record index past tree size"));
    }
    let th = run_record_proof(proof, 0, size, n, leaf_hash)?;
    if th == root {
        Ok(())
    } else {
        Err(TlogError::ProofFailed)
    }
}

fn run_tree_proof(
    p: &[TreeHash],
    lo: u64,
    hi: u64,
    n: u64,
    old: TreeHash,
) -> Result<(TreeHash, TreeHash), TlogError> {
    if n == hi {
        if lo == 0 {
            if !p.is_empty() {
                return Err(TlogError::ProofFailed);
            }
            return Ok((old, old));
        }
        if p.len() != 1 {
            return Err(TlogError::ProofFailed);
        }
        return Ok((p[0], p[0]));
    }
    let Some((&sibling, p)) = p.split_last() else {
        return Err(TlogError::ProofFailed);
    };
    let (k, _) = maxpow2(hi - lo);
    if n <= lo + k {
        let (oh, th) = run_tree_proof(p, lo, lo + k, n, old)?;
        Ok((oh, node_hash(th, sibling)))
    } else {
        let (oh, th) = run_tree_proof(p, lo + k, hi, n, old)?;
        Ok((node_hash(sibling, oh), node_hash(sibling, th)))
    }
}

/// Verifies a consistency proof between two tree heads.
pub fn check_tree(
    proof: &[TreeHash],
    size: u64,
    root: TreeHash,
    old_size: u64,
    old_root: TreeHash,
) -> Result<(), TlogError> {
    if old_size < 1 || old_size > size {
        return Err(TlogError::InvalidInput("invalid consistency bounds"));
    }
    let (oh, th) = run_tree_proof(proof, 0, size, old_size, old_root)?;
    if th == root && oh == old_root {
        Ok(())
    } else {
        Err(TlogError::ProofFailed)
    }
}
