//! End-to-end read-path tests: a writer seeds a store in memory, then the
//! monitor's HTTP surface reconstructs RFC 6962 responses from it.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use p256::SecretKey;
use tokio::sync::oneshot;
use tower::ServiceExt;

use ct_core::signing::LogSigner;
use ct_core::sth::{
    GetEntriesResponse, GetEntryAndProofResponse, GetProofByHashResponse,
    GetSthConsistencyResponse, GetSthResponse,
};
use ct_core::{fingerprint, LogEntry, UnsequencedEntry};
use ct_monitor::handlers::{router, AppState};
use ct_monitor::metrics::Metrics;
use ct_monitor::Monitor;
use ct_store::{MemStore, Storage};
use ct_submit::committer::boot;
use ct_submit::sequencer::{Batch, SequencedSubmission};
use ct_tlog::{
    check_record, check_tree, record_hash, stored_hash_index, stored_hashes_for_record_hash,
    tree_hash, HashReader, TlogError, TreeHash,
};

const ORIGIN: &str = "log.test.example/2025";
const MASK: usize = 2;

fn entry(leaf_index: u64) -> LogEntry {
    let certificate = format!("synthetic-leaf-{leaf_index}").into_bytes();
    UnsequencedEntry {
        leaf_fingerprint: fingerprint(&certificate),
        certificate,
        ..UnsequencedEntry::default()
    }
    .sequence(leaf_index, 1_700_000_000_000)
}

fn batch(start: u64, count: u64) -> Batch {
    (start..start + count)
        .map(|i| {
            let (done, _ready) = oneshot::channel();
            SequencedSubmission {
                entry: entry(i),
                done,
            }
        })
        .collect()
}

/// Seeds a 300-leaf log and returns the monitor state over its store.
async fn seeded_state(size: u64) -> AppState {
    let store = Arc::new(MemStore::new());
    let signer = LogSigner::new(SecretKey::random(&mut rand::rngs::OsRng)).unwrap();
    let mut committer = boot(
        store.clone() as Arc<dyn Storage>,
        signer,
        ORIGIN.to_string(),
        MASK,
        ct_submit::metrics::Metrics::new(),
    )
    .await
    .unwrap();
    committer.commit_batch(batch(0, size)).await.unwrap();

    AppState {
        monitor: Monitor::new(store, MASK),
        metrics: Metrics::new(),
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(state: &AppState, uri: &str) -> T {
    let resp = router(state.clone())
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK, "{uri}");
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn get_status(state: &AppState, uri: &str) -> StatusCode {
    router(state.clone())
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
        .status()
}

/// Rebuilds the tree the log committed, for independent verification.
struct Replay(Vec<TreeHash>);

#[async_trait::async_trait]
impl HashReader for Replay {
    async fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<TreeHash>, TlogError> {
        indexes
            .iter()
            .map(|&i| {
                self.0
                    .get(i as usize)
                    .copied()
                    .ok_or_else(|| TlogError::Storage(format!("missing index {i}")))
            })
            .collect()
    }
}

async fn replay(size: u64) -> Replay {
    let mut replay = Replay(Vec::new());
    for i in 0..size {
        let leaf = entry(i).merkle_tree_leaf().unwrap();
        let new = stored_hashes_for_record_hash(i, record_hash(&leaf), &replay)
            .await
            .unwrap();
        assert_eq!(replay.0.len() as u64, stored_hash_index(0, i));
        replay.0.extend(new);
    }
    replay
}

#[tokio::test]
async fn sth_matches_independent_tree_hash() {
    let state = seeded_state(300).await;
    let sth: GetSthResponse = get_json(&state, "/ct/v1/get-sth").await;
    assert_eq!(sth.tree_size, 300);

    let replay = replay(300).await;
    let root = tree_hash(300, &replay).await.unwrap();
    assert_eq!(sth.sha256_root_hash, root.0.to_vec());
}

#[tokio::test]
async fn consistency_proofs_verify_between_any_heads() {
    let state = seeded_state(300).await;
    let replay = replay(300).await;

    // first == 0 is the defined empty proof.
    let resp: GetSthConsistencyResponse =
        get_json(&state, "/ct/v1/get-sth-consistency?first=0&second=0").await;
    assert!(resp.consistency.is_empty());
    let resp: GetSthConsistencyResponse =
        get_json(&state, "/ct/v1/get-sth-consistency?first=0&second=300").await;
    assert!(resp.consistency.is_empty());

    for (first, second) in [(1u64, 300u64), (100, 300), (256, 300), (300, 300)] {
        let uri = format!("/ct/v1/get-sth-consistency?first={first}&second={second}");
        let resp: GetSthConsistencyResponse = get_json(&state, &uri).await;
        let proof: Vec<TreeHash> = resp
            .consistency
            .iter()
            .map(|h| TreeHash(h.as_slice().try_into().unwrap()))
            .collect();
        let old_root = tree_hash(first, &replay).await.unwrap();
        let new_root = tree_hash(second, &replay).await.unwrap();
        check_tree(&proof, second, new_root, first, old_root).expect("proof verifies");
    }

    assert_eq!(
        get_status(&state, "/ct/v1/get-sth-consistency?first=5&second=2").await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        get_status(&state, "/ct/v1/get-sth-consistency?first=1&second=301").await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn proof_by_hash_resolves_and_verifies() {
    let state = seeded_state(300).await;
    let replay = replay(300).await;
    let root = tree_hash(300, &replay).await.unwrap();

    for index in [0u64, 123, 255, 256, 299] {
        let leaf = entry(index).merkle_tree_leaf().unwrap();
        let leaf_hash = record_hash(&leaf);
        let uri = format!(
            "/ct/v1/get-proof-by-hash?hash={}&tree_size=300",
            urlencoding_b64(&leaf_hash.0)
        );
        let resp: GetProofByHashResponse = get_json(&state, &uri).await;
        assert_eq!(resp.leaf_index, index);
        let proof: Vec<TreeHash> = resp
            .audit_path
            .iter()
            .map(|h| TreeHash(h.as_slice().try_into().unwrap()))
            .collect();
        check_record(&proof, 300, root, index, leaf_hash).expect("audit path verifies");
    }

    // Unknown hashes 404; malformed hashes 400.
    let uri = format!(
        "/ct/v1/get-proof-by-hash?hash={}&tree_size=300",
        urlencoding_b64(&[0xee; 32])
    );
    assert_eq!(get_status(&state, &uri).await, StatusCode::NOT_FOUND);
    assert_eq!(
        get_status(&state, "/ct/v1/get-proof-by-hash?hash=oops&tree_size=300").await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn entries_are_clamped_to_tree_and_cap() {
    let state = seeded_state(300).await;

    // Clamped by tree size (S5).
    let resp: GetEntriesResponse = get_json(&state, "/ct/v1/get-entries?start=0&end=5000").await;
    assert_eq!(resp.entries.len(), 300);
    let want = entry(0).merkle_tree_leaf().unwrap();
    assert_eq!(resp.entries[0].leaf_input, want);

    // Clamped by the per-request cap.
    let mut capped = seeded_state(300).await;
    capped.monitor.max_batch = 10;
    let resp: GetEntriesResponse = get_json(&capped, "/ct/v1/get-entries?start=5&end=5000").await;
    assert_eq!(resp.entries.len(), 10);

    // A tight fetch budget truncates at a tile boundary instead of failing.
    let mut tight = seeded_state(300).await;
    tight.monitor.fetch_budget = 1;
    let resp: GetEntriesResponse = get_json(&tight, "/ct/v1/get-entries?start=0&end=299").await;
    assert_eq!(resp.entries.len(), 256);

    assert_eq!(
        get_status(&state, "/ct/v1/get-entries?start=300&end=301").await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        get_status(&state, "/ct/v1/get-entries?start=9&end=3").await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn entry_and_proof_returns_both() {
    let state = seeded_state(300).await;
    let replay = replay(300).await;
    let root = tree_hash(300, &replay).await.unwrap();

    let resp: GetEntryAndProofResponse =
        get_json(&state, "/ct/v1/get-entry-and-proof?leaf_index=42&tree_size=300").await;
    let want = entry(42).merkle_tree_leaf().unwrap();
    assert_eq!(resp.leaf_input, want);
    let proof: Vec<TreeHash> = resp
        .audit_path
        .iter()
        .map(|h| TreeHash(h.as_slice().try_into().unwrap()))
        .collect();
    check_record(&proof, 300, root, 42, record_hash(&want)).expect("audit path verifies");

    assert_eq!(
        get_status(&state, "/ct/v1/get-entry-and-proof?leaf_index=300&tree_size=300").await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn passthrough_blobs_are_served() {
    let state = seeded_state(3).await;
    let resp = router(state.clone())
        .oneshot(Request::get("/checkpoint").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.starts_with(&format!("{ORIGIN}\n3\n")));
}

fn urlencoding_b64(bytes: &[u8]) -> String {
    // Standard base64 in a query string: '+' and '=' must be escaped.
    BASE64
        .encode(bytes)
        .replace('+', "%2B")
        .replace('/', "%2F")
        .replace('=', "%3D")
}
