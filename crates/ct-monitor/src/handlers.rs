//! The RFC 6962 §4 read endpoints.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::Rng;
use serde::Deserialize;
use tracing::warn;

use ct_core::sth::{
    GetEntriesResponse, GetEntryAndProofResponse, GetProofByHashResponse,
    GetSthConsistencyResponse, LeafEntry,
};
use ct_core::tile_leaf::{decode_data_tile, encode_certificate_chain, encode_precert_chain_entry};
use ct_core::{issuer_key, keys, LogEntry, TILE_HEIGHT, TILE_WIDTH};
use ct_tlog::{prove_record, prove_tree, stored_hash_index, tile_for_index, Tile};

use crate::fetch::FetchBudget;
use crate::metrics::Metrics;
use crate::{Monitor, MonitorError};

#[derive(Clone)]
pub struct AppState {
    pub monitor: Monitor,
    pub metrics: Metrics,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ct/v1/get-sth", get(get_sth))
        .route("/ct/v1/get-sth-consistency", get(get_sth_consistency))
        .route("/ct/v1/get-proof-by-hash", get(get_proof_by_hash))
        .route("/ct/v1/get-entries", get(get_entries))
        .route("/ct/v1/get-roots", get(get_roots))
        .route("/ct/v1/get-entry-and-proof", get(get_entry_and_proof))
        .route("/checkpoint", get(get_checkpoint))
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    "ok"
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.gather_text(),
    )
}

fn json_response(body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn error_response(endpoint: &'static str, err: MonitorError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status != StatusCode::NOT_FOUND {
        warn!(endpoint, error = %err, "request failed");
    }
    if status == StatusCode::SERVICE_UNAVAILABLE {
        let retry_after = rand::thread_rng().gen_range(30..=90);
        return (
            status,
            [(header::RETRY_AFTER, retry_after.to_string())],
            format!("{err}\n"),
        )
            .into_response();
    }
    (status, format!("{err}\n")).into_response()
}

macro_rules! endpoint {
    ($state:expr, $name:literal, $result:expr) => {{
        let outcome = match $result {
            Ok(resp) => {
                $state
                    .metrics
                    .requests
                    .with_label_values(&[$name, "ok"])
                    .inc();
                resp
            }
            Err(err) => {
                $state
                    .metrics
                    .requests
                    .with_label_values(&[$name, "error"])
                    .inc();
                error_response($name, err)
            }
        };
        outcome
    }};
}

async fn get_sth(State(state): State<AppState>) -> Response {
    endpoint!(state, "get-sth", passthrough(&state.monitor, keys::STH).await)
}

async fn get_roots(State(state): State<AppState>) -> Response {
    endpoint!(state, "get-roots", passthrough(&state.monitor, keys::ROOTS).await)
}

async fn get_checkpoint(State(state): State<AppState>) -> Response {
    let result = match state.monitor.store.get(keys::CHECKPOINT).await {
        Ok(bytes) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            bytes,
        )
            .into_response()),
        Err(e) => Err(MonitorError::Unavailable(e.to_string())),
    };
    endpoint!(state, "checkpoint", result)
}

async fn passthrough(monitor: &Monitor, key: &str) -> Result<Response, MonitorError> {
    let bytes = monitor
        .store
        .get(key)
        .await
        .map_err(|e| MonitorError::Unavailable(e.to_string()))?;
    Ok(json_response(bytes))
}

#[derive(Deserialize)]
struct ConsistencyParams {
    first: u64,
    second: u64,
}

async fn get_sth_consistency(
    State(state): State<AppState>,
    params: Option<Query<ConsistencyParams>>,
) -> Response {
    endpoint!(state, "get-sth-consistency", consistency(&state.monitor, params).await)
}

async fn consistency(
    monitor: &Monitor,
    params: Option<Query<ConsistencyParams>>,
) -> Result<Response, MonitorError> {
    let Query(params) =
        params.ok_or_else(|| MonitorError::BadRequest("missing first/second".to_string()))?;
    if params.first > params.second {
        return Err(MonitorError::BadRequest(
            "first must be less than or equal to second".to_string(),
        ));
    }
    let sth = monitor.read_sth().await?;
    if params.second > sth.tree_size {
        return Err(MonitorError::BadRequest("tree size out of range".to_string()));
    }

    // A proof from the empty tree is empty by definition.
    let proof = if params.first == 0 {
        Vec::new()
    } else {
        prove_tree(params.second, params.first, &monitor.hash_reader(params.second))
            .await
            .map_err(|e| MonitorError::CorruptTile(e.to_string()))?
    };

    let body = serde_json::to_vec(&GetSthConsistencyResponse {
        consistency: proof.iter().map(|h| h.0.to_vec()).collect(),
    })
    .map_err(|e| MonitorError::Internal(e.to_string()))?;
    Ok(json_response(body))
}

#[derive(Deserialize)]
struct ProofByHashParams {
    hash: String,
    tree_size: u64,
}

async fn get_proof_by_hash(
    State(state): State<AppState>,
    params: Option<Query<ProofByHashParams>>,
) -> Response {
    endpoint!(state, "get-proof-by-hash", proof_by_hash(&state.monitor, params).await)
}

async fn proof_by_hash(
    monitor: &Monitor,
    params: Option<Query<ProofByHashParams>>,
) -> Result<Response, MonitorError> {
    let Query(params) =
        params.ok_or_else(|| MonitorError::BadRequest("missing hash/tree_size".to_string()))?;
    let hash = BASE64
        .decode(&params.hash)
        .map_err(|e| MonitorError::BadRequest(format!("invalid hash: {e}")))?;
    let hash: [u8; 32] = hash
        .try_into()
        .map_err(|_| MonitorError::BadRequest("hash must be 32 bytes".to_string()))?;

    let sth = monitor.read_sth().await?;
    if params.tree_size == 0 || params.tree_size > sth.tree_size {
        return Err(MonitorError::BadRequest("tree size out of range".to_string()));
    }

    let truncated = ct_core::truncate_key(&hash);
    let leaf_index = monitor.index_for_hash(&truncated).await?;
    if leaf_index >= params.tree_size {
        return Err(MonitorError::BadRequest("index out of range".to_string()));
    }

    let proof = prove_record(
        params.tree_size,
        leaf_index,
        &monitor.hash_reader(params.tree_size),
    )
    .await
    .map_err(|e| MonitorError::CorruptTile(e.to_string()))?;

    let body = serde_json::to_vec(&GetProofByHashResponse {
        leaf_index,
        audit_path: proof.iter().map(|h| h.0.to_vec()).collect(),
    })
    .map_err(|e| MonitorError::Internal(e.to_string()))?;
    Ok(json_response(body))
}

#[derive(Deserialize)]
struct EntriesParams {
    start: u64,
    end: u64,
}

async fn get_entries(
    State(state): State<AppState>,
    params: Option<Query<EntriesParams>>,
) -> Response {
    endpoint!(state, "get-entries", entries(&state.monitor, params).await)
}

async fn entries(
    monitor: &Monitor,
    params: Option<Query<EntriesParams>>,
) -> Result<Response, MonitorError> {
    let Query(params) =
        params.ok_or_else(|| MonitorError::BadRequest("missing start/end".to_string()))?;
    if params.start > params.end {
        return Err(MonitorError::BadRequest(
            "start must be less than or equal to end".to_string(),
        ));
    }
    let sth = monitor.read_sth().await?;
    if params.start >= sth.tree_size {
        return Err(MonitorError::BadRequest("start past tree size".to_string()));
    }
    // Clamp to the tree and to the per-request cap.
    let end = params
        .end
        .min(sth.tree_size - 1)
        .min(params.start + monitor.max_batch - 1);

    let budget = FetchBudget::new(monitor.fetch_budget);
    let decoded = read_entry_range(monitor, params.start, end, sth.tree_size, &budget).await?;

    let mut out = Vec::with_capacity(decoded.len());
    for entry in &decoded {
        let Some(extra_data) = extra_data(monitor, entry, &budget).await? else {
            // Budget exhausted: return the prefix we assembled.
            break;
        };
        let leaf_input = entry
            .merkle_tree_leaf()
            .map_err(|e| MonitorError::CorruptTile(e.to_string()))?;
        out.push(LeafEntry {
            leaf_input,
            extra_data,
        });
    }
    if out.is_empty() {
        return Err(MonitorError::Unavailable("fetch budget exhausted".to_string()));
    }

    let body = serde_json::to_vec(&GetEntriesResponse { entries: out })
        .map_err(|e| MonitorError::Internal(e.to_string()))?;
    Ok(json_response(body))
}

/// Fetches and decodes the data tiles covering `[start, end]`, returning
/// the entries in range. Stops early when the budget runs dry.
async fn read_entry_range(
    monitor: &Monitor,
    start: u64,
    end: u64,
    tree_size: u64,
    budget: &FetchBudget,
) -> Result<Vec<LogEntry>, MonitorError> {
    let first_n = start / u64::from(TILE_WIDTH);
    let last_n = end / u64::from(TILE_WIDTH);

    let mut entries = Vec::new();
    for n in first_n..=last_n {
        let tile = Tile {
            height: TILE_HEIGHT,
            level: -1,
            n,
            width: TILE_WIDTH,
        };
        let Some((bytes, _)) = monitor.fetch_tile(tile, tree_size, budget).await? else {
            break;
        };
        for entry in decode_data_tile(&bytes) {
            let entry = entry.map_err(|e| MonitorError::CorruptTile(e.to_string()))?;
            if entry.leaf_index >= start && entry.leaf_index <= end {
                entries.push(entry);
            }
        }
    }
    if entries.is_empty() {
        return Err(MonitorError::Unavailable("fetch budget exhausted".to_string()));
    }
    Ok(entries)
}

/// Reassembles the RFC 6962 extra_data for an entry by fetching its chain
/// certificates. `None` means the budget ran out.
async fn extra_data(
    monitor: &Monitor,
    entry: &LogEntry,
    budget: &FetchBudget,
) -> Result<Option<Vec<u8>>, MonitorError> {
    let mut chain = Vec::with_capacity(entry.chain_fingerprints.len());
    for fp in &entry.chain_fingerprints {
        let Some(der) = monitor.get_budgeted(&issuer_key(fp), budget).await? else {
            return Ok(None);
        };
        chain.push(der);
    }
    let encoded = if entry.is_precert {
        encode_precert_chain_entry(&entry.pre_certificate, &chain)
    } else {
        encode_certificate_chain(&chain)
    }
    .map_err(|e| MonitorError::Internal(e.to_string()))?;
    Ok(Some(encoded))
}

#[derive(Deserialize)]
struct EntryAndProofParams {
    leaf_index: u64,
    tree_size: u64,
}

async fn get_entry_and_proof(
    State(state): State<AppState>,
    params: Option<Query<EntryAndProofParams>>,
) -> Response {
    endpoint!(state, "get-entry-and-proof", entry_and_proof(&state.monitor, params).await)
}

async fn entry_and_proof(
    monitor: &Monitor,
    params: Option<Query<EntryAndProofParams>>,
) -> Result<Response, MonitorError> {
    let Query(params) = params
        .ok_or_else(|| MonitorError::BadRequest("missing leaf_index/tree_size".to_string()))?;
    let sth = monitor.read_sth().await?;
    if params.tree_size == 0 || params.tree_size > sth.tree_size {
        return Err(MonitorError::BadRequest("tree size out of range".to_string()));
    }
    if params.leaf_index >= params.tree_size {
        return Err(MonitorError::BadRequest("index out of range".to_string()));
    }

    // The containing data tile shares coordinates with the level-0 hash
    // tile of the same leaf.
    let hash_tile = tile_for_index(TILE_HEIGHT, stored_hash_index(0, params.leaf_index));
    let tile = Tile {
        level: -1,
        ..hash_tile
    };
    let budget = FetchBudget::unlimited();
    let (bytes, _) = monitor
        .fetch_tile(tile, sth.tree_size, &budget)
        .await?
        .expect("unlimited budget");

    let mut found = None;
    for entry in decode_data_tile(&bytes) {
        let entry = entry.map_err(|e| MonitorError::CorruptTile(e.to_string()))?;
        if entry.leaf_index == params.leaf_index {
            found = Some(entry);
            break;
        }
    }
    let entry = found.ok_or(MonitorError::NotFound)?;

    let extra_data = extra_data(monitor, &entry, &budget)
        .await?
        .expect("unlimited budget");
    let leaf_input = entry
        .merkle_tree_leaf()
        .map_err(|e| MonitorError::CorruptTile(e.to_string()))?;

    let proof = prove_record(
        params.tree_size,
        params.leaf_index,
        &monitor.hash_reader(params.tree_size),
    )
    .await
    .map_err(|e| MonitorError::CorruptTile(e.to_string()))?;

    let body = serde_json::to_vec(&GetEntryAndProofResponse {
        leaf_input,
        extra_data,
        audit_path: proof.iter().map(|h| h.0.to_vec()).collect(),
    })
    .map_err(|e| MonitorError::Internal(e.to_string()))?;
    Ok(json_response(body))
}
