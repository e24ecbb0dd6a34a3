//! One-time log initialization: seeds the accepted roots, the config
//! blob, and the size-zero tree head.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use ct_core::checkpoint::{sign_checkpoint_note, Checkpoint};
use ct_core::signing::LogSigner;
use ct_core::sth::{GetRootsResponse, GetSthResponse, SignedTreeHead};
use ct_core::keys;
use ct_store::Storage;
use ct_tlog::empty_tree_hash;

use crate::config::{ConfigError, GlobalConfig, KvDir};
use crate::now_ms;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("storage: {0}")]
    Storage(#[from] ct_store::StorageError),
    #[error("roots file: {0}")]
    Roots(String),
    #[error("signing: {0}")]
    Signing(#[from] ct_core::signing::SigningError),
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] ct_core::checkpoint::CheckpointError),
    #[error("encoding: {0}")]
    Encoding(String),
}

/// Parses a PEM bundle into DER certificates.
pub fn roots_from_pem(pem: &[u8]) -> Result<Vec<Vec<u8>>, SetupError> {
    let mut certs = Vec::new();
    for item in x509_parser::pem::Pem::iter_from_buffer(pem) {
        let pem = item.map_err(|e| SetupError::Roots(e.to_string()))?;
        if pem.label != "CERTIFICATE" {
            continue;
        }
        certs.push(pem.contents);
    }
    if certs.is_empty() {
        return Err(SetupError::Roots("no certificates in bundle".to_string()));
    }
    Ok(certs)
}

/// Seeds a fresh log: accepted roots, persisted config, and the empty
/// tree head in both representations.
pub async fn run(
    kv: &KvDir,
    config: &GlobalConfig,
    roots_pem_path: &Path,
    store: Arc<dyn Storage>,
) -> Result<(), SetupError> {
    config.validate()?;
    let signer = config.load_signer()?;

    let pem = std::fs::read(roots_pem_path).map_err(|e| SetupError::Roots(e.to_string()))?;
    let certificates = roots_from_pem(&pem)?;
    info!(roots = certificates.len(), "uploading accepted roots");
    let roots_json = serde_json::to_vec(&GetRootsResponse { certificates })
        .map_err(|e| SetupError::Encoding(e.to_string()))?;
    store.set(keys::ROOTS, roots_json).await?;

    kv.store_config(config)?;

    publish_empty_head(&signer, &config.name, store).await?;
    info!("log initialized");
    Ok(())
}

async fn publish_empty_head(
    signer: &LogSigner,
    origin: &str,
    store: Arc<dyn Storage>,
) -> Result<(), SetupError> {
    let timestamp = now_ms() as u64;
    let root = empty_tree_hash();
    let sth = SignedTreeHead {
        tree_size: 0,
        timestamp,
        sha256_root_hash: *root.as_bytes(),
    };
    let signature = signer.digitally_sign(&sth.signature_input())?;

    let json = serde_json::to_vec(&GetSthResponse {
        tree_size: 0,
        timestamp,
        sha256_root_hash: root.as_bytes().to_vec(),
        tree_head_signature: signature.clone(),
    })
    .map_err(|e| SetupError::Encoding(e.to_string()))?;
    store.set(keys::STH, json).await?;

    let note = sign_checkpoint_note(
        &Checkpoint {
            origin: origin.to_string(),
            tree_size: 0,
            root_hash: *root.as_bytes(),
        },
        signer.spki_der(),
        timestamp,
        &signature,
    )?;
    store.set(keys::CHECKPOINT, note).await?;
    Ok(())
}
