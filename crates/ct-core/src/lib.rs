#![forbid(unsafe_code)]

//! Core types and wire formats for the log.
//!
//! Everything with an on-disk or on-the-wire byte layout lives here: the
//! TileLeaf record, the RFC 6962 MerkleTreeLeaf and signed structs, the
//! checkpoint note, the packed k-anonymous index records, and the ECDSA
//! signing key that ties them together.

pub mod checkpoint;
pub mod codec;
pub mod index;
pub mod signing;
pub mod sth;
pub mod tile_leaf;

use sha2::{Digest, Sha256};

pub use codec::CodecError;

/// Fixed tile height of the log.
pub const TILE_HEIGHT: u8 = 8;
/// Width of a complete tile.
pub const TILE_WIDTH: u32 = 1 << TILE_HEIGHT;

/// TLS `LogEntryType.x509_entry`.
pub const ENTRY_TYPE_X509: u16 = 0;
/// TLS `LogEntryType.precert_entry`.
pub const ENTRY_TYPE_PRECERT: u16 = 1;

/// A validated submission that has not been assigned a sequence number.
///
/// `certificate` is the leaf DER for x509 entries and the rebuilt TBS for
/// precerts; the submitted leaf DER of a precert lives in
/// `pre_certificate`. Chain fields cover every element after the leaf, in
/// submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsequencedEntry {
    pub certificate: Vec<u8>,
    pub is_precert: bool,
    pub issuer_key_hash: [u8; 32],
    pub pre_certificate: Vec<u8>,
    /// SHA-256 of the submitted leaf DER.
    pub leaf_fingerprint: [u8; 32],
    pub chain_fingerprints: Vec<[u8; 32]>,
    /// Chain DER; present only on the submission path.
    pub chain: Vec<Vec<u8>>,
}

impl UnsequencedEntry {
    pub fn sequence(self, leaf_index: u64, timestamp: i64) -> LogEntry {
        LogEntry {
            certificate: self.certificate,
            is_precert: self.is_precert,
            issuer_key_hash: self.issuer_key_hash,
            pre_certificate: self.pre_certificate,
            leaf_fingerprint: self.leaf_fingerprint,
            chain_fingerprints: self.chain_fingerprints,
            chain: self.chain,
            timestamp,
            leaf_index,
        }
    }
}

/// An [`UnsequencedEntry`] with its permanent position in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEntry {
    pub certificate: Vec<u8>,
    pub is_precert: bool,
    pub issuer_key_hash: [u8; 32],
    pub pre_certificate: Vec<u8>,
    pub leaf_fingerprint: [u8; 32],
    pub chain_fingerprints: Vec<[u8; 32]>,
    /// Chain DER; empty on entries decoded from tiles.
    pub chain: Vec<Vec<u8>>,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    /// Dense zero-based position, below 2^40.
    pub leaf_index: u64,
}

impl LogEntry {
    /// Key into the dedupe index: the truncated leaf fingerprint.
    pub fn dedupe_key(&self) -> [u8; index::INDEX_KEY_SIZE] {
        truncate_key(&self.leaf_fingerprint)
    }
}

/// First 16 bytes of a 32-byte hash, the truncated index key.
pub fn truncate_key(hash: &[u8; 32]) -> [u8; index::INDEX_KEY_SIZE] {
    hash[..index::INDEX_KEY_SIZE].try_into().expect("16 bytes")
}

/// SHA-256 fingerprint of a DER certificate.
pub fn fingerprint(der: &[u8]) -> [u8; 32] {
    Sha256::digest(der).into()
}

/// Object-store key of a content-addressed issuer certificate.
pub fn issuer_key(fp: &[u8; 32]) -> String {
    format!("issuer/{}", hex::encode(fp))
}

/// Well-known object-store keys shared by the writer and the monitor.
pub mod keys {
    pub const STH: &str = "ct/v1/get-sth";
    pub const ROOTS: &str = "ct/v1/get-roots";
    pub const CHECKPOINT: &str = "checkpoint";
    pub const RECORD_HASH_PREFIX: &str = "int/hashes/";
    pub const DEDUPE_PREFIX: &str = "int/dedupe/";
}
