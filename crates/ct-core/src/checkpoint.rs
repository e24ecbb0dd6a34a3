//! c2sp.org/checkpoint text form of the tree head, carried in a signed
//! note whose signature payload embeds the RFC 6962 TreeHeadSignature.
//!
//! A checkpoint note looks like:
//!
//! ```text
//! example.com/origin
//! 923748
//! nND/nri/U0xuHUrYSy0HtMeal2vzD9V4k/BO79C+QeI=
//!
//! — example.com/origin AAAAB...
//! ```
//!
//! The signature bytes are `u32 key-hash || u64 timestamp ||
//! DigitallySigned(TreeHeadSignature)`, so the one ECDSA signature serves
//! both the JSON STH and the checkpoint.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::codec::{Builder, CodecError, Reader};
use crate::sth::{decode_digitally_signed, SignedTreeHead};

const MAX_CHECKPOINT_SIZE: usize = 1_000_000;

/// Separator between a note's text and its signature lines.
const SIG_PREFIX: &str = "— ";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("malformed checkpoint")]
    Malformed,
    #[error("invalid origin name")]
    InvalidOrigin,
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("unknown signature for origin")]
    UnknownSignature,
}

/// The unsigned text body of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub origin: String,
    pub tree_size: u64,
    pub root_hash: [u8; 32],
}

impl Checkpoint {
    /// `"<origin>\n<size>\n<base64 root>\n"`.
    pub fn format(&self) -> String {
        format!(
            "{}\n{}\n{}\n",
            self.origin,
            self.tree_size,
            STANDARD.encode(self.root_hash)
        )
    }

    pub fn parse(text: &str) -> Result<Self, CheckpointError> {
        if text.len() > MAX_CHECKPOINT_SIZE || !text.ends_with('\n') {
            return Err(CheckpointError::Malformed);
        }
        let mut lines = text.split('\n');
        let origin = lines.next().ok_or(CheckpointError::Malformed)?;
        let size_line = lines.next().ok_or(CheckpointError::Malformed)?;
        let hash_line = lines.next().ok_or(CheckpointError::Malformed)?;
        if origin.is_empty() {
            return Err(CheckpointError::Malformed);
        }
        let tree_size: u64 = size_line
            .parse()
            .map_err(|_| CheckpointError::Malformed)?;
        // Reject non-canonical integers such as leading zeros.
        if size_line != tree_size.to_string() {
            return Err(CheckpointError::Malformed);
        }
        let hash = STANDARD
            .decode(hash_line)
            .map_err(|_| CheckpointError::Malformed)?;
        let root_hash: [u8; 32] = hash
            .try_into()
            .map_err(|_| CheckpointError::Malformed)?;
        // Remaining extension lines must each be non-empty and terminated.
        let rest: Vec<&str> = lines.collect();
        if let Some((last, body)) = rest.split_last() {
            if !last.is_empty() || body.iter().any(|l| l.is_empty()) {
                return Err(CheckpointError::Malformed);
            }
        }
        Ok(Self {
            origin: origin.to_string(),
            tree_size,
            root_hash,
        })
    }
}

/// Note key hash for an RFC 6962 checkpoint signer: first four bytes of
/// SHA-256(origin || "\n" || 0x05 || SHA-256(SPKI)), big-endian.
pub fn rfc6962_key_hash(origin: &str, spki_der: &[u8]) -> u32 {
    let key_id: [u8; 32] = Sha256::digest(spki_der).into();
    let mut h = Sha256::new();
    h.update(origin.as_bytes());
    h.update(b"\n");
    h.update([0x05]);
    h.update(key_id);
    let sum: [u8; 32] = h.finalize().into();
    u32::from_be_bytes([sum[0], sum[1], sum[2], sum[3]])
}

fn is_valid_origin(name: &str) -> bool {
    !name.is_empty() && !name.contains('+') && !name.chars().any(char::is_whitespace)
}

/// Assembles the signed checkpoint note. `tree_head_signature` is the
/// already-encoded `DigitallySigned` TreeHeadSignature; it is injected
/// rather than re-signed so the note and the JSON STH share one signature
/// and one timestamp.
pub fn sign_checkpoint_note(
    checkpoint: &Checkpoint,
    spki_der: &[u8],
    timestamp: u64,
    tree_head_signature: &[u8],
) -> Result<Vec<u8>, CheckpointError> {
    if !is_valid_origin(&checkpoint.origin) {
        return Err(CheckpointError::InvalidOrigin);
    }
    let mut sig = Builder::new();
    sig.add_u64(timestamp);
    sig.add_bytes(tree_head_signature);
    let sig = sig.take()?;

    let key_hash = rfc6962_key_hash(&checkpoint.origin, spki_der);
    let mut wire = Vec::with_capacity(4 + sig.len());
    wire.extend_from_slice(&key_hash.to_be_bytes());
    wire.extend_from_slice(&sig);

    let note = format!(
        "{}\n{}{} {}\n",
        checkpoint.format(),
        SIG_PREFIX,
        checkpoint.origin,
        STANDARD.encode(&wire)
    );
    Ok(note.into_bytes())
}

/// A parsed checkpoint signature: the embedded timestamp and the raw ASN.1
/// ECDSA signature over the STH signature input.
#[derive(Debug, Clone)]
pub struct NoteSignature {
    pub timestamp: u64,
    pub signature_der: Vec<u8>,
}

/// Splits a checkpoint note into its body and the signature matching
/// `origin` and `spki_der`, decoding the RFC6962NoteSignature payload.
/// The caller verifies `signature_der` over the reconstructed
/// [`SignedTreeHead`] input.
pub fn open_checkpoint_note(
    note: &[u8],
    origin: &str,
    spki_der: &[u8],
) -> Result<(Checkpoint, NoteSignature), CheckpointError> {
    let text = std::str::from_utf8(note).map_err(|_| CheckpointError::Malformed)?;
    let sep = text.find("\n\n").ok_or(CheckpointError::Malformed)?;
    let (body, sigs) = text.split_at(sep + 1);
    let checkpoint = Checkpoint::parse(body)?;
    if checkpoint.origin != origin {
        return Err(CheckpointError::UnknownSignature);
    }

    let want_hash = rfc6962_key_hash(origin, spki_der);
    for line in sigs[1..].lines() {
        let Some(rest) = line.strip_prefix(SIG_PREFIX) else {
            continue;
        };
        let Some((name, b64)) = rest.split_once(' ') else {
            return Err(CheckpointError::Malformed);
        };
        if name != origin {
            continue;
        }
        let wire = STANDARD
            .decode(b64)
            .map_err(|_| CheckpointError::Malformed)?;
        if wire.len() < 4 {
            return Err(CheckpointError::Malformed);
        }
        let key_hash = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]);
        if key_hash != want_hash {
            continue;
        }
        let mut r = Reader::new(&wire[4..]);
        let timestamp = r.read_u64()?;
        let signature_der = decode_digitally_signed(r.rest())?;
        return Ok((checkpoint, NoteSignature {
            timestamp,
            signature_der,
        }));
    }
    Err(CheckpointError::UnknownSignature)
}

impl Checkpoint {
    /// The STH whose signature a checkpoint note carries.
    pub fn to_signed_tree_head(&self, timestamp: u64) -> SignedTreeHead {
        SignedTreeHead {
            tree_size: self.tree_size,
            timestamp,
            sha256_root_hash: self.root_hash,
        }
    }
}
