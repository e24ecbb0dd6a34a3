//! Signed tree heads, SCTs, and the RFC 6962 JSON response bodies.
//!
//! The signature inputs here are bit-exact: a `DigitallySigned` wrapper
//! (SHA-256 + ECDSA algorithm bytes, u16-prefixed ASN.1 signature) around
//! either the tree-head struct or the MerkleTreeLeaf bytes.

use serde::{Deserialize, Serialize};

use crate::codec::{Builder, CodecError, Reader};

/// TLS HashAlgorithm.sha256.
pub const HASH_ALG_SHA256: u8 = 4;
/// TLS SignatureAlgorithm.ecdsa.
pub const SIG_ALG_ECDSA: u8 = 3;

/// Signature type for tree heads in the digitally-signed struct.
const SIGNATURE_TYPE_TREE_HASH: u8 = 1;

/// A signed tree head as the writer tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedTreeHead {
    pub tree_size: u64,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
    pub sha256_root_hash: [u8; 32],
}

impl SignedTreeHead {
    /// RFC 6962 §3.5 signature input: `v1 || tree_hash || timestamp ||
    /// tree_size || root`.
    pub fn signature_input(&self) -> Vec<u8> {
        let mut b = Builder::new();
        b.add_u8(0); // version = v1
        b.add_u8(SIGNATURE_TYPE_TREE_HASH);
        b.add_u64(self.timestamp);
        b.add_u64(self.tree_size);
        b.add_bytes(&self.sha256_root_hash);
        b.take().expect("fixed-size struct")
    }
}

/// Encodes a TLS `DigitallySigned` wrapper for an ECDSA/SHA-256 signature.
pub fn encode_digitally_signed(signature_der: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut b = Builder::new();
    b.add_u8(HASH_ALG_SHA256);
    b.add_u8(SIG_ALG_ECDSA);
    b.add_u16_length_prefixed(|b| b.add_bytes(signature_der));
    b.take()
}

/// Splits a TLS `DigitallySigned` wrapper back into the raw ASN.1 signature,
/// rejecting non-SHA-256/ECDSA algorithms and residue.
pub fn decode_digitally_signed(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut r = Reader::new(data);
    if r.read_u8()? != HASH_ALG_SHA256 {
        return Err(CodecError::Invalid("hash algorithm"));
    }
    if r.read_u8()? != SIG_ALG_ECDSA {
        return Err(CodecError::Invalid("signature algorithm"));
    }
    let sig = r.read_u16_length_prefixed()?.rest().to_vec();
    if !r.is_empty() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(sig)
}

/// Base64 bytes in JSON, the way every RFC 6962 response encodes blobs.
pub mod b64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// A list of base64 blobs in JSON.
pub mod b64_list {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(v.iter().map(|b| STANDARD.encode(b)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let strings = Vec::<String>::deserialize(d)?;
        strings
            .into_iter()
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// `GET /ct/v1/get-sth` body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetSthResponse {
    pub tree_size: u64,
    pub timestamp: u64,
    #[serde(with = "b64_bytes")]
    pub sha256_root_hash: Vec<u8>,
    #[serde(with = "b64_bytes")]
    pub tree_head_signature: Vec<u8>,
}

impl GetSthResponse {
    pub fn root_hash(&self) -> Result<[u8; 32], CodecError> {
        self.sha256_root_hash
            .as_slice()
            .try_into()
            .map_err(|_| CodecError::Invalid("root hash length"))
    }
}

/// `POST /ct/v1/add-chain` and `add-pre-chain` body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddChainResponse {
    pub sct_version: u8,
    #[serde(with = "b64_bytes")]
    pub id: Vec<u8>,
    pub timestamp: u64,
    /// base64 of the CT extensions block (leaf index).
    pub extensions: String,
    #[serde(with = "b64_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddChainRequest {
    #[serde(with = "b64_list")]
    pub chain: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSthConsistencyResponse {
    #[serde(with = "b64_list")]
    pub consistency: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetProofByHashResponse {
    pub leaf_index: u64,
    #[serde(with = "b64_list")]
    pub audit_path: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafEntry {
    #[serde(with = "b64_bytes")]
    pub leaf_input: Vec<u8>,
    #[serde(with = "b64_bytes")]
    pub extra_data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEntriesResponse {
    pub entries: Vec<LeafEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEntryAndProofResponse {
    #[serde(with = "b64_bytes")]
    pub leaf_input: Vec<u8>,
    #[serde(with = "b64_bytes")]
    pub extra_data: Vec<u8>,
    #[serde(with = "b64_list")]
    pub audit_path: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRootsResponse {
    #[serde(with = "b64_list")]
    pub certificates: Vec<Vec<u8>>,
}
