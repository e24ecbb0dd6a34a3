//! Tile coordinates, tile paths, and the verifying tile-backed hash reader.
//!
//! A tile of height `H` at level `L` holds up to `2^H` hashes of tree level
//! `L*H`. Data tiles live at level -1 in the path namespace only; the hash
//! engine never addresses them.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    node_hash, split_stored_hash_index, stored_hash_index, sub_tree_index, HashReader, TlogError,
    TreeHash, HASH_SIZE,
};

const PATH_BASE: u64 = 1000;

/// A tile coordinate. `width == 1 << height` is a complete tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    pub height: u8,
    /// Tile level; -1 denotes the data tile namespace.
    pub level: i8,
    /// Number within the level.
    pub n: u64,
    /// Width, `1..=1 << height`.
    pub width: u32,
}

impl Tile {
    pub fn full_width(&self) -> u32 {
        1u32 << self.height
    }

    pub fn is_full(&self) -> bool {
        self.width == self.full_width()
    }

    /// Canonical tlog path, e.g. `tile/8/0/x001/x234/067.p/128` or
    /// `tile/8/data/005`.
    pub fn path(&self) -> String {
        let level = if self.level == -1 {
            "data".to_string()
        } else {
            self.level.to_string()
        };
        let partial = if self.is_full() {
            String::new()
        } else {
            format!(".p/{}", self.width)
        };
        format!("tile/{}/{}/{}{}", self.height, level, n_path(self.n), partial)
    }
}

fn n_path(mut n: u64) -> String {
    let mut out = format!("{:03}", n % PATH_BASE);
    while n >= PATH_BASE {
        n /= PATH_BASE;
        out = format!("x{:03}/{}", n % PATH_BASE, out);
    }
    out
}

/// The tile of height `h` and least width containing stored-hash `index`.
pub fn tile_for_index(h: u8, index: u64) -> Tile {
    let (tile, _, _) = tile_for_index_bounds(h, index);
    tile
}

/// As [`tile_for_index`], also returning the byte range of the hash within
/// the tile data.
pub(crate) fn tile_for_index_bounds(h: u8, index: u64) -> (Tile, usize, usize) {
    let (level, n) = split_stored_hash_index(index);
    let tile_level = (level / h as usize) as i8;
    let level_in = level - tile_level as usize * h as usize;
    let tile_n = (n << level_in) >> h;
    let m = n - ((tile_n << h) >> level_in);
    let width = ((m + 1) << level_in) as u32;
    let tile = Tile {
        height: h,
        level: tile_level,
        n: tile_n,
        width,
    };
    let start = (m << level_in) as usize * HASH_SIZE;
    let end = ((m + 1) << level_in) as usize * HASH_SIZE;
    (tile, start, end)
}

/// Extracts the hash at stored-hash `index` from `data`, which must be the
/// contents of `tile` (or a wider tile at the same coordinates).
pub fn hash_from_tile(tile: &Tile, data: &[u8], index: u64) -> Result<TreeHash, TlogError> {
    if tile.height < 1
        || tile.height > 30
        || tile.level < 0
        || tile.width < 1
        || tile.width > tile.full_width()
    {
        return Err(TlogError::InvalidTile(tile.path()));
    }
    if data.len() < tile.width as usize * HASH_SIZE {
        return Err(TlogError::InvalidTile(format!(
            "{} (data len {})",
            tile.path(),
            data.len()
        )));
    }
    let (t1, start, end) = tile_for_index_bounds(tile.height, index);
    if t1.level != tile.level || t1.n != tile.n || t1.width > tile.width {
        return Err(TlogError::InvalidTile(format!(
            "index {index} is in {} not {}",
            t1.path(),
            tile.path()
        )));
    }
    Ok(tile_hash(&data[start..end]))
}

/// Subtree hash of a power-of-two run of stored hashes.
fn tile_hash(data: &[u8]) -> TreeHash {
    debug_assert!(!data.is_empty() && data.len() % HASH_SIZE == 0);
    if data.len() == HASH_SIZE {
        let mut h = [0u8; HASH_SIZE];
        h.copy_from_slice(data);
        return TreeHash(h);
    }
    let half = data.len() / 2;
    node_hash(tile_hash(&data[..half]), tile_hash(&data[half..]))
}

/// Hash tiles that must be written (or rewritten) when the tree grows from
/// `old_size` to `new_size`: full tiles newly completed at each level, plus
/// the trailing partial on the right edge.
pub fn new_tiles(h: u8, old_size: u64, new_size: u64) -> Vec<Tile> {
    debug_assert!(h >= 1 && old_size <= new_size);
    let mut tiles = Vec::new();
    let mut level = 0u32;
    loop {
        let shift = u32::from(h) * level;
        if shift >= 64 || new_size >> shift == 0 {
            break;
        }
        let old_n = old_size >> shift;
        let new_n = new_size >> shift;
        if old_n != new_n {
            for n in (old_n >> h)..(new_n >> h) {
                tiles.push(Tile {
                    height: h,
                    level: level as i8,
                    n,
                    width: 1 << h,
                });
            }
            let n = new_n >> h;
            let width = (new_n - (n << h)) as u32;
            if width > 0 {
                tiles.push(Tile {
                    height: h,
                    level: level as i8,
                    n,
                    width,
                });
            }
        }
        level += 1;
    }
    tiles
}

/// Materializes the byte contents of `tile` from stored hashes.
pub async fn read_tile_data<R: HashReader + ?Sized>(
    tile: &Tile,
    reader: &R,
) -> Result<Vec<u8>, TlogError> {
    let size = if tile.width == 0 {
        tile.full_width()
    } else {
        tile.width
    } as u64;
    let start = tile.n << tile.height;
    let level = tile.level.max(0) as usize * tile.height as usize;
    let indexes: Vec<u64> = (0..size)
        .map(|i| stored_hash_index(level, start + i))
        .collect();
    let hashes = reader.read_hashes(&indexes).await?;
    if hashes.len() != indexes.len() {
        return Err(TlogError::ShortRead {
            got: hashes.len(),
            want: indexes.len(),
        });
    }
    let mut data = Vec::with_capacity(size as usize * HASH_SIZE);
    for h in hashes {
        data.extend_from_slice(&h.0);
    }
    Ok(data)
}

/// A trusted tree head: size plus root hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tree {
    pub size: u64,
    pub root: TreeHash,
}

/// Source of tile contents by coordinate, with a save hook invoked once a
/// batch of tiles has been authenticated.
#[async_trait]
pub trait TileReader: Send + Sync {
    async fn read_tiles(&self, tiles: &[Tile]) -> Result<Vec<Vec<u8>>, TlogError>;
    fn save_tiles(&self, tiles: &[Tile], data: &[Vec<u8>]);
}

/// A [`HashReader`] that loads tiles through `reader` and verifies every
/// fetched tile against `tree` before returning hashes from it.
pub struct TileHashReader<'a, T: TileReader + ?Sized> {
    height: u8,
    tree: Tree,
    reader: &'a T,
}

impl<'a, T: TileReader + ?Sized> TileHashReader<'a, T> {
    pub fn new(height: u8, tree: Tree, reader: &'a T) -> Self {
        Self {
            height,
            tree,
            reader,
        }
    }
}

/// `tile`'s `k`th tile parent in a tree with `size` records, clipped to the
/// tree's right edge. Returns None past the top.
fn tile_parent(mut tile: Tile, k: usize, size: u64) -> Option<Tile> {
    tile.level += k as i8;
    tile.n >>= k as u32 * u32::from(tile.height);
    tile.width = tile.full_width();
    let shift = tile.level as u32 * u32::from(tile.height);
    let max = if shift >= 64 { 0 } else { size >> shift };
    let lo = tile.n << tile.height;
    if lo + u64::from(tile.width) >= max {
        if lo >= max {
            return None;
        }
        tile.width = (max - lo) as u32;
    }
    Some(tile)
}

#[async_trait]
impl<T: TileReader + ?Sized> HashReader for TileHashReader<'_, T> {
    async fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<TreeHash>, TlogError> {
        let h = self.height;
        if self.tree.size == 0 {
            return if indexes.is_empty() {
                Ok(Vec::new())
            } else {
                Err(TlogError::IndexesNotInTree)
            };
        }

        let mut tile_order: HashMap<Tile, usize> = HashMap::new();
        let mut tiles: Vec<Tile> = Vec::new();

        // Tiles proving the tree hash itself; fetching them first
        // authenticates the right edge in one pass.
        let mut stx = Vec::new();
        sub_tree_index(0, self.tree.size, &mut stx);
        let mut stx_tile_order = vec![0usize; stx.len()];
        for (i, &x) in stx.iter().enumerate() {
            let (tile, _, _) = tile_for_index_bounds(h, x);
            let tile = tile_parent(tile, 0, self.tree.size)
                .ok_or(TlogError::IndexesNotInTree)?;
            if let Some(&j) = tile_order.get(&tile) {
                stx_tile_order[i] = j;
                continue;
            }
            stx_tile_order[i] = tiles.len();
            tile_order.insert(tile, tiles.len());
            tiles.push(tile);
        }

        // Tiles containing the requested indexes, parents recorded before
        // children so authentication cascades downward.
        let mut index_tile_order = vec![0usize; indexes.len()];
        for (i, &x) in indexes.iter().enumerate() {
            if x >= stored_hash_index(0, self.tree.size) {
                return Err(TlogError::IndexesNotInTree);
            }
            let (tile, _, _) = tile_for_index_bounds(h, x);
            let mut k = 0usize;
            loop {
                let p = tile_parent(tile, k, self.tree.size)
                    .ok_or(TlogError::IndexesNotInTree)?;
                if let Some(&j) = tile_order.get(&p) {
                    if k == 0 {
                        index_tile_order[i] = j;
                    }
                    break;
                }
                k += 1;
            }
            while k > 0 {
                k -= 1;
                let p = tile_parent(tile, k, self.tree.size)
                    .ok_or(TlogError::IndexesNotInTree)?;
                if !p.is_full() {
                    // Only full tiles have parents; a partial here means
                    // the coordinates are wrong.
                    return Err(TlogError::InvalidTile(p.path()));
                }
                tile_order.insert(p, tiles.len());
                if k == 0 {
                    index_tile_order[i] = tiles.len();
                }
                tiles.push(p);
            }
        }

        let data = self.reader.read_tiles(&tiles).await?;
        if data.len() != tiles.len() {
            return Err(TlogError::ShortRead {
                got: data.len(),
                want: tiles.len(),
            });
        }

        // Authenticate the right-edge tiles against the tree hash.
        let last = stx.len() - 1;
        let mut th = hash_from_tile(
            &tiles[stx_tile_order[last]],
            &data[stx_tile_order[last]],
            stx[last],
        )?;
        for i in (0..last).rev() {
            let hh = hash_from_tile(&tiles[stx_tile_order[i]], &data[stx_tile_order[i]], stx[i])?;
            th = node_hash(hh, th);
        }
        if th != self.tree.root {
            return Err(TlogError::InconsistentTile("tree hash mismatch".to_string()));
        }

        // Authenticate the remaining tiles against their parents.
        for i in stx.len()..tiles.len() {
            let tile = tiles[i];
            let p = tile_parent(tile, 1, self.tree.size)
                .ok_or_else(|| TlogError::InvalidTile(tile.path()))?;
            let Some(&j) = tile_order.get(&p) else {
                return Err(TlogError::InvalidTile(p.path()));
            };
            let expect = hash_from_tile(
                &tiles[j],
                &data[j],
                stored_hash_index(p.level as usize * p.height as usize, tile.n),
            )?;
            if expect != tile_hash(&data[i]) {
                return Err(TlogError::InconsistentTile(tile.path()));
            }
        }

        // Every fetched tile is now authenticated.
        self.reader.save_tiles(&tiles, &data);

        let mut hashes = Vec::with_capacity(indexes.len());
        for (i, &x) in indexes.iter().enumerate() {
            let j = index_tile_order[i];
            hashes.push(hash_from_tile(&tiles[j], &data[j], x)?);
        }
        Ok(hashes)
    }
}
