mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use common::TestCa;
use p256::SecretKey;
use time::macros::datetime;
use tokio::sync::{oneshot, watch};

use ct_core::checkpoint::open_checkpoint_note;
use ct_core::index::{DEDUPE_RECORD_SIZE, RECORD_HASH_RECORD_SIZE};
use ct_core::signing::{verify_asn1, LogSigner};
use ct_core::sth::{decode_digitally_signed, GetSthResponse, SignedTreeHead};
use ct_core::tile_leaf::decode_data_tile;
use ct_core::{fingerprint, keys, LogEntry, UnsequencedEntry};
use ct_store::{MemStore, Storage};
use ct_submit::chain::{AcceptancePolicy, RootPool};
use ct_submit::committer::boot;
use ct_submit::metrics::Metrics;
use ct_submit::sequencer::{self, Batch, SequencedSubmission, SequencerConfig};
use ct_submit::stage0::StageZero;

fn test_signer() -> LogSigner {
    LogSigner::new(SecretKey::random(&mut rand::rngs::OsRng)).unwrap()
}

fn test_policy() -> AcceptancePolicy {
    AcceptancePolicy {
        not_after_start: datetime!(2024-01-01 00:00:00 UTC),
        not_after_limit: datetime!(2026-01-01 00:00:00 UTC),
        require_server_auth_eku: true,
    }
}

const ORIGIN: &str = "log.test.example/2025";
const MASK: usize = 2;

/// Spawns the full stage-1 + stage-2 pipeline over a fresh store.
async fn spawn_pipeline(
    store: Arc<MemStore>,
    signer: LogSigner,
    ca: &TestCa,
) -> (Arc<StageZero>, watch::Sender<bool>) {
    let mut committer = boot(
        store.clone() as Arc<dyn Storage>,
        signer.clone(),
        ORIGIN.to_string(),
        MASK,
        Metrics::new(),
    )
    .await
    .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (submit_tx, batch_rx, _seq_handle) = sequencer::spawn(
        committer.tree_size(),
        SequencerConfig {
            flush_interval: Duration::from_millis(20),
        },
        shutdown_rx,
    );
    tokio::spawn(async move {
        committer.run(batch_rx).await.expect("commit");
    });

    let stage0 = Arc::new(StageZero {
        roots: RootPool::new(vec![ca.root_der.clone()]).unwrap(),
        policy: test_policy(),
        signer,
        store,
        mask: MASK,
        to_sequencer: submit_tx,
        metrics: Metrics::new(),
    });
    (stage0, shutdown_tx)
}

fn chain_body(chain: &[&[u8]]) -> Vec<u8> {
    let chain: Vec<String> = chain.iter().map(|c| BASE64.encode(c)).collect();
    serde_json::to_vec(&serde_json::json!({ "chain": chain })).unwrap()
}

async fn read_sth(store: &MemStore) -> GetSthResponse {
    serde_json::from_slice(&store.get(keys::STH).await.unwrap()).unwrap()
}

#[tokio::test]
async fn empty_log_publishes_a_valid_size_zero_head() {
    // S1: even with no submissions the flush timer publishes a head.
    let store = Arc::new(MemStore::new());
    let signer = test_signer();
    let ca = TestCa::new();
    let (_stage0, _shutdown) = spawn_pipeline(store.clone(), signer.clone(), &ca).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let sth = read_sth(&store).await;
    assert_eq!(sth.tree_size, 0);
    assert_eq!(
        hex::encode(&sth.sha256_root_hash),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    let input = SignedTreeHead {
        tree_size: 0,
        timestamp: sth.timestamp,
        sha256_root_hash: sth.root_hash().unwrap(),
    }
    .signature_input();
    let raw = decode_digitally_signed(&sth.tree_head_signature).unwrap();
    verify_asn1(signer.spki_der(), &input, &raw).unwrap();

    // The checkpoint carries the same signature and timestamp.
    let note = store.get(keys::CHECKPOINT).await.unwrap();
    let (checkpoint, sig) = open_checkpoint_note(&note, ORIGIN, signer.spki_der()).unwrap();
    assert_eq!(checkpoint.tree_size, 0);
    assert_eq!(sig.timestamp, sth.timestamp);
    assert_eq!(sig.signature_der, raw);
}

#[tokio::test]
async fn single_submission_lands_at_index_zero() {
    // S2: one leaf, SCT index 0, tree grows to 1.
    let store = Arc::new(MemStore::new());
    let signer = test_signer();
    let ca = TestCa::new();
    let (stage0, _shutdown) = spawn_pipeline(store.clone(), signer.clone(), &ca).await;

    let leaf = ca.leaf("one.example.org", 2);
    let sct = stage0
        .add_chain(&chain_body(&[&leaf]), false)
        .await
        .unwrap();
    assert_eq!(sct.sct_version, 0);
    assert_eq!(sct.id, signer.log_id().to_vec());
    // extensions carry leaf index 0
    let ext = BASE64.decode(&sct.extensions).unwrap();
    assert_eq!(ct_core::tile_leaf::parse_extensions(&ext).unwrap(), 0);

    let sth = read_sth(&store).await;
    assert_eq!(sth.tree_size, 1);

    // The SCT signature verifies over the reconstructed leaf.
    let tile = store.get("tile/8/data/000.p/1").await.unwrap();
    let entries: Vec<LogEntry> = decode_data_tile(&tile).collect::<Result<_, _>>().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].leaf_index, 0);
    assert_eq!(entries[0].timestamp as u64, sct.timestamp);
    let leaf_bytes = entries[0].merkle_tree_leaf().unwrap();
    let raw = decode_digitally_signed(&sct.signature).unwrap();
    verify_asn1(signer.spki_der(), &leaf_bytes, &raw).unwrap();

    // The issuer blob is content-addressed next to the tiles.
    let issuer = store
        .get(&ct_core::issuer_key(&fingerprint(&ca.root_der)))
        .await
        .unwrap();
    assert_eq!(issuer, ca.root_der);
}

#[tokio::test]
async fn resubmission_returns_the_original_sct() {
    // S4: dedupe returns the first index and timestamp.
    let store = Arc::new(MemStore::new());
    let signer = test_signer();
    let ca = TestCa::new();
    let (stage0, _shutdown) = spawn_pipeline(store.clone(), signer.clone(), &ca).await;

    let leaf = ca.leaf("dup.example.org", 3);
    let body = chain_body(&[&leaf]);
    let first = stage0.add_chain(&body, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = stage0.add_chain(&body, false).await.unwrap();

    assert_eq!(first.timestamp, second.timestamp);
    assert_eq!(first.extensions, second.extensions);
    let sth = read_sth(&store).await;
    assert_eq!(sth.tree_size, 1);
}

fn synthetic_batch(start: u64, count: u64, now: i64) -> Batch {
    (start..start + count)
        .map(|leaf_index| {
            let certificate = format!("synthetic-leaf-{leaf_index}").into_bytes();
            let entry = UnsequencedEntry {
                leaf_fingerprint: fingerprint(&certificate),
                certificate,
                ..UnsequencedEntry::default()
            }
            .sequence(leaf_index, now);
            let (done, _ready) = oneshot::channel();
            SequencedSubmission { entry, done }
        })
        .collect()
}

#[tokio::test]
async fn tile_boundary_layout_and_recovery() {
    // S3 + S7: 300 leaves in batches of 200 and 100, then a cold boot.
    let store = Arc::new(MemStore::new());
    let signer = test_signer();
    let mut committer = boot(
        store.clone() as Arc<dyn Storage>,
        signer.clone(),
        ORIGIN.to_string(),
        MASK,
        Metrics::new(),
    )
    .await
    .unwrap();

    let now = 1_700_000_000_000i64;
    committer.commit_batch(synthetic_batch(0, 200, now)).await.unwrap();
    committer.commit_batch(synthetic_batch(200, 100, now)).await.unwrap();
    assert_eq!(committer.tree_size(), 300);

    // Exactly one full data tile, one partial of 44, and matching level-0
    // hash tiles.
    let keys = store.keys();
    assert!(keys.contains(&"tile/8/data/000".to_string()));
    assert!(keys.contains(&"tile/8/data/001.p/44".to_string()));
    assert!(keys.contains(&"tile/8/0/000".to_string()));
    assert!(keys.contains(&"tile/8/0/001.p/44".to_string()));
    assert!(keys.contains(&"tile/8/1/000.p/1".to_string()));

    // Every leaf decodes with its own index (invariant 4).
    let full = store.get("tile/8/data/000").await.unwrap();
    for (i, entry) in decode_data_tile(&full).enumerate() {
        assert_eq!(entry.unwrap().leaf_index, i as u64);
    }
    let partial = store.get("tile/8/data/001.p/44").await.unwrap();
    let tail: Vec<LogEntry> = decode_data_tile(&partial).collect::<Result<_, _>>().unwrap();
    assert_eq!(tail.len(), 44);
    assert_eq!(tail[0].leaf_index, 256);

    // Index files are aligned packed records.
    for key in &keys {
        if let Some(rest) = key.strip_prefix(keys::RECORD_HASH_PREFIX) {
            let file = store.get(key).await.unwrap();
            assert_eq!(file.len() % RECORD_HASH_RECORD_SIZE, 0, "{rest}");
        }
        if key.starts_with(keys::DEDUPE_PREFIX) {
            let file = store.get(key).await.unwrap();
            assert_eq!(file.len() % DEDUPE_RECORD_SIZE, 0);
        }
    }

    let sth_before = read_sth(&store).await;
    assert_eq!(sth_before.tree_size, 300);

    // Cold restart: next_index picks up exactly at the stored tree size,
    // and the rebooted writer extends the same tree.
    let mut rebooted = boot(
        store.clone() as Arc<dyn Storage>,
        signer.clone(),
        ORIGIN.to_string(),
        MASK,
        Metrics::new(),
    )
    .await
    .unwrap();
    assert_eq!(rebooted.tree_size(), 300);

    rebooted.commit_batch(synthetic_batch(300, 5, now)).await.unwrap();
    let sth_after = read_sth(&store).await;
    assert_eq!(sth_after.tree_size, 305);
    assert!(store.keys().contains(&"tile/8/data/001.p/49".to_string()));
}

#[tokio::test]
async fn oversized_batches_split_across_data_tiles() {
    // A single 300-entry batch crosses the tile boundary in one commit.
    let store = Arc::new(MemStore::new());
    let signer = test_signer();
    let mut committer = boot(
        store.clone() as Arc<dyn Storage>,
        signer,
        ORIGIN.to_string(),
        MASK,
        Metrics::new(),
    )
    .await
    .unwrap();
    committer
        .commit_batch(synthetic_batch(0, 300, 1_700_000_000_000))
        .await
        .unwrap();
    assert!(store.keys().contains(&"tile/8/data/000".to_string()));
    assert!(store.keys().contains(&"tile/8/data/001.p/44".to_string()));
}

#[tokio::test]
async fn precert_submission_round_trips() {
    // S6 at the pipeline level: a pre-issuer chain commits and decodes.
    let store = Arc::new(MemStore::new());
    let signer = test_signer();
    let ca = TestCa::new();
    let (stage0, _shutdown) = spawn_pipeline(store.clone(), signer.clone(), &ca).await;

    let (precert, preissuer) = ca.preissuer_chain("pre.example.org");
    let sct = stage0
        .add_chain(&chain_body(&[&precert, &preissuer]), true)
        .await
        .unwrap();
    assert_eq!(sct.sct_version, 0);

    let tile = store.get("tile/8/data/000.p/1").await.unwrap();
    let entries: Vec<LogEntry> = decode_data_tile(&tile).collect::<Result<_, _>>().unwrap();
    assert!(entries[0].is_precert);
    assert_eq!(entries[0].pre_certificate, precert);
    let root = ct_submit::x509util::parse(&ca.root_der).unwrap();
    assert_eq!(
        entries[0].issuer_key_hash,
        ct_submit::x509util::spki_hash(&root)
    );
    // Both chain elements are stored as issuers.
    assert!(store
        .exists(&ct_core::issuer_key(&fingerprint(&preissuer)))
        .await
        .unwrap());
    assert!(store
        .exists(&ct_core::issuer_key(&fingerprint(&ca.root_der)))
        .await
        .unwrap());
}
