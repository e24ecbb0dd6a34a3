//! The TileLeaf record stored in data tiles, the RFC 6962 MerkleTreeLeaf
//! it hashes to, and the `extra_data` chain encodings.
//!
//! ```text
//! struct {
//!     TimestampedEntry timestamped_entry;
//!     select (entry_type) {
//!         case x509_entry: Empty;
//!         case precert_entry: ASN.1Cert pre_certificate;
//!     };
//!     Fingerprint chain<0..2^16-1>;
//! } TileLeaf;
//! ```

use sha2::{Digest, Sha256};

use crate::codec::{Builder, CodecError, Reader};
use crate::{LogEntry, ENTRY_TYPE_PRECERT, ENTRY_TYPE_X509};

/// Extension type 0 carries the u40 leaf index.
const EXTENSION_LEAF_INDEX: u8 = 0;

/// Maximum leaf index: indexes are 40-bit on the wire.
pub const MAX_LEAF_INDEX: u64 = (1 << 40) - 1;

/// Serializes the CT extensions block: `u8 type || u16-len (u40 index)`.
pub fn marshal_extensions(leaf_index: u64) -> Result<Vec<u8>, CodecError> {
    if leaf_index > MAX_LEAF_INDEX {
        return Err(CodecError::OutOfRange("leaf index"));
    }
    let mut b = Builder::new();
    b.add_u8(EXTENSION_LEAF_INDEX);
    b.add_u16_length_prefixed(|b| b.add_u40(leaf_index));
    b.take()
}

/// Parses the extensions block back to a leaf index; any residue or
/// unknown extension type is an error.
pub fn parse_extensions(data: &[u8]) -> Result<u64, CodecError> {
    let mut r = Reader::new(data);
    if r.read_u8()? != EXTENSION_LEAF_INDEX {
        return Err(CodecError::Invalid("extension type"));
    }
    let mut inner = r.read_u16_length_prefixed()?;
    let leaf_index = inner.read_u40()?;
    if !inner.is_empty() || !r.is_empty() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(leaf_index)
}

impl LogEntry {
    /// RFC 6962 MerkleTreeLeaf bytes. These double as the digitally-signed
    /// struct for the SCT, since `version`/`leaf_type` coincide with
    /// `sct_version`/`signature_type`.
    pub fn merkle_tree_leaf(&self) -> Result<Vec<u8>, CodecError> {
        let mut b = Builder::new();
        b.add_u8(0); // version = v1
        b.add_u8(0); // leaf_type = timestamped_entry
        b.add_u64(self.timestamp as u64);
        if !self.is_precert {
            b.add_u16(ENTRY_TYPE_X509);
            b.add_u24_length_prefixed(|b| b.add_bytes(&self.certificate));
        } else {
            b.add_u16(ENTRY_TYPE_PRECERT);
            b.add_bytes(&self.issuer_key_hash);
            b.add_u24_length_prefixed(|b| b.add_bytes(&self.certificate));
        }
        let ext = marshal_extensions(self.leaf_index)?;
        b.add_u16_length_prefixed(|b| b.add_bytes(&ext));
        b.take()
    }
}

/// Appends the TileLeaf encoding of `entry` to a data tile buffer.
pub fn append_tile_leaf(tile: Vec<u8>, entry: &LogEntry) -> Result<Vec<u8>, CodecError> {
    if entry.chain_fingerprints.len() > u16::MAX as usize {
        return Err(CodecError::OutOfRange("fingerprint count"));
    }
    let mut b = Builder::append_to(tile);
    b.add_u64(entry.timestamp as u64);
    if !entry.is_precert {
        b.add_u16(ENTRY_TYPE_X509);
        b.add_u24_length_prefixed(|b| b.add_bytes(&entry.certificate));
    } else {
        b.add_u16(ENTRY_TYPE_PRECERT);
        b.add_bytes(&entry.issuer_key_hash);
        b.add_u24_length_prefixed(|b| b.add_bytes(&entry.certificate));
    }
    let ext = marshal_extensions(entry.leaf_index)?;
    b.add_u16_length_prefixed(|b| b.add_bytes(&ext));
    if entry.is_precert {
        b.add_u24_length_prefixed(|b| b.add_bytes(&entry.pre_certificate));
    }
    b.add_u16(entry.chain_fingerprints.len() as u16);
    for fp in &entry.chain_fingerprints {
        b.add_bytes(fp);
    }
    b.take()
}

/// Reads one TileLeaf from the front of `tile`, returning the entry and the
/// remaining bytes. The decoded entry carries no chain DER; its leaf
/// fingerprint is recomputed from the stored bytes.
pub fn read_tile_leaf(tile: &[u8]) -> Result<(LogEntry, &[u8]), CodecError> {
    let mut r = Reader::new(tile);
    let timestamp = r.read_u64()?;
    if timestamp > i64::MAX as u64 {
        return Err(CodecError::OutOfRange("timestamp"));
    }
    let entry_type = r.read_u16()?;

    let mut entry = LogEntry {
        timestamp: timestamp as i64,
        ..LogEntry::default()
    };

    match entry_type {
        ENTRY_TYPE_X509 => {
            entry.certificate = r.read_u24_length_prefixed()?.rest().to_vec();
            let ext = r.read_u16_length_prefixed()?;
            entry.leaf_index = parse_extensions(ext.rest())?;
        }
        ENTRY_TYPE_PRECERT => {
            entry.is_precert = true;
            entry.issuer_key_hash = r.read_array()?;
            entry.certificate = r.read_u24_length_prefixed()?.rest().to_vec();
            let ext = r.read_u16_length_prefixed()?;
            entry.leaf_index = parse_extensions(ext.rest())?;
            entry.pre_certificate = r.read_u24_length_prefixed()?.rest().to_vec();
        }
        _ => return Err(CodecError::Invalid("entry type")),
    }

    let count = r.read_u16()?;
    entry.chain_fingerprints = (0..count)
        .map(|_| r.read_array())
        .collect::<Result<_, _>>()?;

    // The submitted leaf DER is the pre-certificate for precerts and the
    // certificate itself otherwise, so the fingerprint is recoverable.
    let leaf_der = if entry.is_precert {
        &entry.pre_certificate
    } else {
        &entry.certificate
    };
    entry.leaf_fingerprint = Sha256::digest(leaf_der).into();

    Ok((entry, r.rest()))
}

/// Lazily decodes the TileLeaf records of a data tile in order.
pub fn decode_data_tile(tile: &[u8]) -> TileLeafIter<'_> {
    TileLeafIter { rest: tile }
}

pub struct TileLeafIter<'a> {
    rest: &'a [u8],
}

impl Iterator for TileLeafIter<'_> {
    type Item = Result<LogEntry, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match read_tile_leaf(self.rest) {
            Ok((entry, rest)) => {
                self.rest = rest;
                Some(Ok(entry))
            }
            Err(e) => {
                // Poison the iterator; a torn record ends the tile.
                self.rest = &[];
                Some(Err(e))
            }
        }
    }
}

/// TLS encoding of RFC 6962 `CertificateChain` (get-entries extra_data for
/// x509 entries).
pub fn encode_certificate_chain(chain: &[Vec<u8>]) -> Result<Vec<u8>, CodecError> {
    let mut b = Builder::new();
    b.add_u24_length_prefixed(|b| {
        for cert in chain {
            b.add_u24_length_prefixed(|b| b.add_bytes(cert));
        }
    });
    b.take()
}

/// TLS encoding of RFC 6962 `PrecertChainEntry`.
pub fn encode_precert_chain_entry(
    pre_certificate: &[u8],
    chain: &[Vec<u8>],
) -> Result<Vec<u8>, CodecError> {
    let mut b = Builder::new();
    b.add_u24_length_prefixed(|b| b.add_bytes(pre_certificate));
    b.add_u24_length_prefixed(|b| {
        for cert in chain {
            b.add_u24_length_prefixed(|b| b.add_bytes(cert));
        }
    });
    b.take()
}
