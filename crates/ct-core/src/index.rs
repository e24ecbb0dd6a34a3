//! K-anonymous packed index files.
//!
//! Two fixed-width record shapes share one engine: the record-hash index
//! (`truncated RFC 6962 leaf hash → leaf index`, 21 bytes) and the dedupe
//! index (`truncated leaf fingerprint → leaf index + timestamp`, 29
//! bytes). Files are strictly sorted by the 16-byte key, so binary search
//! is the lookup and sorted insert keeps the invariant. Inserting a key
//! that is already present is a no-op.

use thiserror::Error;

/// Truncated key width. 128 bits bound the birthday collision risk at
/// roughly 2^-32 for 2^48 entries, well past the 2^40 index space.
pub const INDEX_KEY_SIZE: usize = 16;
/// Leaf indexes are 40-bit, stored little-endian in 5 bytes.
pub const LEAF_INDEX_SIZE: usize = 5;

pub const RECORD_HASH_RECORD_SIZE: usize = INDEX_KEY_SIZE + LEAF_INDEX_SIZE;
pub const DEDUPE_RECORD_SIZE: usize = INDEX_KEY_SIZE + LEAF_INDEX_SIZE + 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("index file length {0} is not a multiple of the record size")]
    Misaligned(usize),
    #[error("record not found")]
    NotFound,
}

/// `u128 truncated_leaf_hash || u40-le leaf_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHashEntry {
    pub key: [u8; INDEX_KEY_SIZE],
    pub leaf_index: u64,
}

/// `u128 truncated_cert_fp || u40-le leaf_index || u64-le timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupeEntry {
    pub key: [u8; INDEX_KEY_SIZE],
    pub leaf_index: u64,
    pub timestamp: i64,
}

fn put_u40_le(buf: &mut [u8], v: u64) {
    debug_assert!(v < 1 << 40);
    buf.copy_from_slice(&v.to_le_bytes()[..LEAF_INDEX_SIZE]);
}

fn get_u40_le(buf: &[u8]) -> u64 {
    let mut full = [0u8; 8];
    full[..LEAF_INDEX_SIZE].copy_from_slice(&buf[..LEAF_INDEX_SIZE]);
    u64::from_le_bytes(full)
}

impl RecordHashEntry {
    pub fn to_bytes(&self) -> [u8; RECORD_HASH_RECORD_SIZE] {
        let mut out = [0u8; RECORD_HASH_RECORD_SIZE];
        out[..INDEX_KEY_SIZE].copy_from_slice(&self.key);
        put_u40_le(&mut out[INDEX_KEY_SIZE..], self.leaf_index);
        out
    }

    pub fn from_bytes(b: &[u8; RECORD_HASH_RECORD_SIZE]) -> Self {
        Self {
            key: b[..INDEX_KEY_SIZE].try_into().expect("key"),
            leaf_index: get_u40_le(&b[INDEX_KEY_SIZE..]),
        }
    }
}

impl DedupeEntry {
    pub fn to_bytes(&self) -> [u8; DEDUPE_RECORD_SIZE] {
        let mut out = [0u8; DEDUPE_RECORD_SIZE];
        out[..INDEX_KEY_SIZE].copy_from_slice(&self.key);
        put_u40_le(&mut out[INDEX_KEY_SIZE..INDEX_KEY_SIZE + LEAF_INDEX_SIZE], self.leaf_index);
        out[INDEX_KEY_SIZE + LEAF_INDEX_SIZE..]
            .copy_from_slice(&(self.timestamp as u64).to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8; DEDUPE_RECORD_SIZE]) -> Self {
        let ts = u64::from_le_bytes(
            b[INDEX_KEY_SIZE + LEAF_INDEX_SIZE..]
                .try_into()
                .expect("timestamp"),
        );
        Self {
            key: b[..INDEX_KEY_SIZE].try_into().expect("key"),
            leaf_index: get_u40_le(&b[INDEX_KEY_SIZE..]),
            timestamp: ts as i64,
        }
    }
}

/// Truncates `key` to the first `mask` hex characters and groups them into
/// 2-character directory segments: `mask=6` maps `ab34f9…` to `ab/34/f9`.
pub fn k_anon_hash_path(key: &[u8], mask: usize) -> String {
    let hex = hex::encode(key);
    let prefix = &hex[..mask.min(hex.len())];
    prefix
        .as_bytes()
        .chunks(2)
        .map(|c| std::str::from_utf8(c).expect("hex is ascii"))
        .collect::<Vec<_>>()
        .join("/")
}

/// Binary-searches a packed file for `key`, returning the record slot.
pub fn lookup<'a>(
    file: &'a [u8],
    record_size: usize,
    key: &[u8; INDEX_KEY_SIZE],
) -> Result<&'a [u8], IndexError> {
    if file.len() % record_size != 0 {
        return Err(IndexError::Misaligned(file.len()));
    }
    let count = file.len() / record_size;
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let rec = &file[mid * record_size..(mid + 1) * record_size];
        match rec[..INDEX_KEY_SIZE].cmp(key.as_slice()) {
            std::cmp::Ordering::Equal => return Ok(rec),
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
        }
    }
    Err(IndexError::NotFound)
}

/// Inserts `record` (whose first 16 bytes are its key) into a sorted packed
/// file. Returns false without modifying the file when the key is already
/// present.
pub fn insert_sorted(
    file: &mut Vec<u8>,
    record_size: usize,
    record: &[u8],
) -> Result<bool, IndexError> {
    debug_assert_eq!(record.len(), record_size);
    if file.len() % record_size != 0 {
        return Err(IndexError::Misaligned(file.len()));
    }
    let key = &record[..INDEX_KEY_SIZE];
    let count = file.len() / record_size;
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let rec_key = &file[mid * record_size..mid * record_size + INDEX_KEY_SIZE];
        match rec_key.cmp(key) {
            std::cmp::Ordering::Equal => return Ok(false),
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
        }
    }
    let at = lo * record_size;
    file.splice(at..at, record.iter().copied());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_are_locked() {
        assert_eq!(RECORD_HASH_RECORD_SIZE, 21);
        assert_eq!(DEDUPE_RECORD_SIZE, 29);
    }

    #[test]
    fn record_hash_entry_round_trip() {
        let e = RecordHashEntry {
            key: *b"0123456789abcdef",
            leaf_index: (1 << 40) - 1,
        };
        let b = e.to_bytes();
        assert_eq!(&b[..16], b"0123456789abcdef");
        assert_eq!(&b[16..], &[0xff; 5]);
        assert_eq!(RecordHashEntry::from_bytes(&b), e);
    }

    #[test]
    fn dedupe_entry_round_trip() {
        let e = DedupeEntry {
            key: [7; 16],
            leaf_index: 0x01_0203_0405,
            timestamp: 1_700_000_000_123,
        };
        let b = e.to_bytes();
        // u40 little-endian
        assert_eq!(&b[16..21], &[0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(DedupeEntry::from_bytes(&b), e);
    }

    #[test]
    fn k_anon_paths() {
        let key = [
            0xab, 0x34, 0xf9, 0xaa, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ];
        assert_eq!(k_anon_hash_path(&key, 2), "ab");
        assert_eq!(k_anon_hash_path(&key, 4), "ab/34");
        assert_eq!(k_anon_hash_path(&key, 6), "ab/34/f9");
    }

    #[test]
    fn insert_keeps_files_sorted_and_idempotent() {
        let mut file = Vec::new();
        let mut keys: Vec<[u8; 16]> = (0..50u8)
            .map(|i| {
                let mut k = [0u8; 16];
                k[0] = i.wrapping_mul(37); // scrambled order
                k[1] = i;
                k
            })
            .collect();

        for (i, k) in keys.iter().enumerate() {
            let rec = RecordHashEntry {
                key: *k,
                leaf_index: i as u64,
            };
            assert!(insert_sorted(&mut file, RECORD_HASH_RECORD_SIZE, &rec.to_bytes()).unwrap());
        }
        assert_eq!(file.len(), 50 * RECORD_HASH_RECORD_SIZE);

        // Strictly sorted.
        let records: Vec<&[u8]> = file.chunks(RECORD_HASH_RECORD_SIZE).collect();
        for pair in records.windows(2) {
            assert!(pair[0][..16] < pair[1][..16]);
        }

        // Re-inserting any key is a no-op.
        for (i, k) in keys.iter().enumerate() {
            let rec = RecordHashEntry {
                key: *k,
                leaf_index: 999 + i as u64,
            };
            assert!(!insert_sorted(&mut file, RECORD_HASH_RECORD_SIZE, &rec.to_bytes()).unwrap());
        }
        assert_eq!(file.len(), 50 * RECORD_HASH_RECORD_SIZE);

        // Every key resolves to its original record.
        keys.sort();
        for k in &keys {
            let rec = lookup(&file, RECORD_HASH_RECORD_SIZE, k).unwrap();
            assert_eq!(&rec[..16], k);
        }
        assert_eq!(
            lookup(&file, RECORD_HASH_RECORD_SIZE, &[0xfe; 16]),
            Err(IndexError::NotFound)
        );
    }

    #[test]
    fn misaligned_files_are_rejected() {
        let mut file = vec![0u8; 20];
        assert_eq!(
            insert_sorted(&mut file, RECORD_HASH_RECORD_SIZE, &[0u8; 21]),
            Err(IndexError::Misaligned(20))
        );
        assert_eq!(
            lookup(&file, RECORD_HASH_RECORD_SIZE, &[0; 16]),
            Err(IndexError::Misaligned(20))
        );
    }
}
