//! Stage 0: validate a submission, consult the dedupe index, and either
//! synthesize the SCT from the cached coordinates or hand the entry to the
//! sequencer and wait for its batch to commit.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use ct_core::index::{lookup, DedupeEntry, DEDUPE_RECORD_SIZE};
use ct_core::signing::LogSigner;
use ct_core::sth::{AddChainRequest, AddChainResponse};
use ct_core::tile_leaf::marshal_extensions;
use ct_core::{fingerprint, index, keys, truncate_key, LogEntry, UnsequencedEntry};
use ct_store::{get_or_empty, Storage};

use crate::chain::{validate_chain, AcceptancePolicy, RootPool};
use crate::metrics::Metrics;
use crate::sequencer::Submission;
use crate::x509util;
use crate::SubmitError;

/// How long a submitter waits for its entry to be sequenced and committed.
const SEQUENCE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct StageZero {
    pub roots: RootPool,
    pub policy: AcceptancePolicy,
    pub signer: LogSigner,
    pub store: Arc<dyn Storage>,
    pub mask: usize,
    pub to_sequencer: mpsc::Sender<Submission>,
    pub metrics: Metrics,
}

impl StageZero {
    /// Handles `add-chain` (`precert_endpoint == false`) and
    /// `add-pre-chain` (`true`).
    pub async fn add_chain(
        &self,
        body: &[u8],
        precert_endpoint: bool,
    ) -> Result<AddChainResponse, SubmitError> {
        let req: AddChainRequest = serde_json::from_slice(body)
            .map_err(|e| SubmitError::InvalidRequest(format!("unable to parse chain: {e}")))?;
        if req.chain.is_empty() {
            return Err(SubmitError::InvalidRequest("chain is empty".to_string()));
        }

        let full_chain = validate_chain(&req.chain, &self.roots, &self.policy)?;
        let entry = build_unsequenced_entry(&full_chain, precert_endpoint)?;

        // Dedupe: a resubmitted leaf gets its original index and timestamp.
        let dedupe_key = truncate_key(&entry.leaf_fingerprint);
        let path = format!(
            "{}{}",
            keys::DEDUPE_PREFIX,
            index::k_anon_hash_path(&dedupe_key, self.mask)
        );
        let file = get_or_empty(self.store.as_ref(), &path).await?;
        let complete = match lookup(&file, DEDUPE_RECORD_SIZE, &dedupe_key) {
            Ok(rec) => {
                let cached = DedupeEntry::from_bytes(rec.try_into().expect("record size"));
                debug!(leaf_index = cached.leaf_index, "dedupe hit");
                self.metrics.dedupe_hits.inc();
                entry.sequence(cached.leaf_index, cached.timestamp)
            }
            Err(_) => self.sequence(entry).await?,
        };

        self.sign_sct(&complete)
    }

    /// Hands the entry to stage 1 and waits for the commit ack.
    async fn sequence(&self, entry: UnsequencedEntry) -> Result<LogEntry, SubmitError> {
        let (done, ready) = oneshot::channel();
        self.to_sequencer
            .send(Submission { entry, done })
            .await
            .map_err(|_| SubmitError::SequencerBusy)?;
        match tokio::time::timeout(SEQUENCE_TIMEOUT, ready).await {
            Ok(Ok(entry)) => Ok(entry),
            // Closed return channel or timeout: the writer is wedged or
            // overloaded; tell the client to come back later.
            Ok(Err(_)) | Err(_) => Err(SubmitError::SequencerBusy),
        }
    }

    fn sign_sct(&self, entry: &LogEntry) -> Result<AddChainResponse, SubmitError> {
        let extensions = marshal_extensions(entry.leaf_index)
            .map_err(|e| SubmitError::Internal(format!("extensions: {e}")))?;
        let leaf = entry
            .merkle_tree_leaf()
            .map_err(|e| SubmitError::Internal(format!("leaf encoding: {e}")))?;
        let signature = self
            .signer
            .digitally_sign(&leaf)
            .map_err(|e| SubmitError::Internal(format!("sct signature: {e}")))?;
        Ok(AddChainResponse {
            sct_version: 0,
            id: self.signer.log_id().to_vec(),
            timestamp: entry.timestamp as u64,
            extensions: BASE64.encode(extensions),
            signature,
        })
    }
}

/// Builds the unsequenced entry from a validated chain, enforcing the
/// endpoint/leaf-kind match and the precert TBS rebuild.
pub fn build_unsequenced_entry(
    chain: &[Vec<u8>],
    precert_endpoint: bool,
) -> Result<UnsequencedEntry, SubmitError> {
    let leaf = x509util::parse(&chain[0])
        .map_err(|e| SubmitError::InvalidRequest(format!("invalid leaf certificate: {e}")))?;
    let is_precert = x509util::is_precert(&leaf);
    if is_precert != precert_endpoint {
        let (expected, got) = if precert_endpoint {
            ("precertificate", "certificate")
        } else {
            ("certificate", "precertificate")
        };
        return Err(SubmitError::WrongEndpoint { expected, got });
    }

    let mut entry = UnsequencedEntry {
        is_precert,
        leaf_fingerprint: fingerprint(&chain[0]),
        chain_fingerprints: chain[1..].iter().map(|c| fingerprint(c)).collect(),
        chain: chain[1..].to_vec(),
        ..UnsequencedEntry::default()
    };

    if !is_precert {
        entry.certificate = chain[0].clone();
        return Ok(entry);
    }

    entry.pre_certificate = chain[0].clone();

    // A pre-issuer intermediate is only valid for signing precerts; the
    // entry is attributed to the certificate above it.
    if chain.len() < 2 {
        return Err(SubmitError::InvalidRequest(
            "precert chain is missing its issuer".to_string(),
        ));
    }
    let first = x509util::parse(&chain[1])
        .map_err(|e| SubmitError::InvalidRequest(format!("invalid issuer: {e}")))?;
    let (issuer_der, pre_issuer_tbs) = if x509util::is_preissuer(&first) {
        if chain.len() < 3 {
            return Err(SubmitError::InvalidRequest(
                "pre-issuer chain is missing the issuing CA".to_string(),
            ));
        }
        (
            &chain[2],
            Some(first.tbs_certificate.as_ref().to_vec()),
        )
    } else {
        (&chain[1], None)
    };

    let issuer = x509util::parse(issuer_der)
        .map_err(|e| SubmitError::InvalidRequest(format!("invalid issuer: {e}")))?;
    entry.issuer_key_hash = x509util::spki_hash(&issuer);
    entry.certificate =
        x509util::build_precert_tbs(leaf.tbs_certificate.as_ref(), pre_issuer_tbs.as_deref())
            .map_err(|e| SubmitError::InvalidRequest(format!("unable to build precert TBS: {e}")))?;

    Ok(entry)
}
