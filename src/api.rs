//! Read-only HTTP interface
//!
//! Endpoints:
//! - `GET /events/{chain}/{event_type}/{nonce}` - one record
//! - `GET /events?state=&chain=&from=&to=&limit=&offset=` - records, newest first
//! - `GET /stats` - record counts and validator set
//! - `GET /health` - relayer health (503 when unhealthy)
//! - `GET /healthz` - liveness
//! - `GET /metrics` - Prometheus metrics
//!
//! There are no mutation routes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::is_fatal;
use crate::ledger::{Ledger, RecordFilter};
use crate::status::{ChainStatus, StatusBoard};
use crate::types::{ChainSide, EventKey, EventRecord, EventState, EventType};

const MAX_PAGE_SIZE: i64 = 1000;

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn Ledger>,
    pub status: StatusBoard,
    pub validator_count: usize,
    pub quorum_threshold: usize,
}

/// API error rendered as `{"error": "..."}`
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl From<eyre::Report> for ApiError {
    fn from(report: eyre::Report) -> Self {
        if is_fatal(&report) {
            ApiError::Unavailable(format!("{:#}", report))
        } else {
            ApiError::Internal(format!("{:#}", report))
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        if status.is_server_error() {
            warn!(status = %status, error = %message, "API request failed");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// JSON shape of an event record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecordView {
    pub source_chain: ChainSide,
    pub event_type: EventType,
    pub nonce: u64,
    pub state: EventState,
    pub sender: String,
    pub recipient: String,
    /// Decimal string; amounts exceed JSON number precision
    pub amount: String,
    pub source_tx_hash: String,
    pub source_block_height: u64,
    pub observed_at: DateTime<Utc>,
    /// Validators whose signatures are attached
    pub signers: Vec<String>,
    pub dest_tx_hash: Option<String>,
    pub attempts: u32,
    pub signature_cycles: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub checkpoint_block: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&EventRecord> for EventRecordView {
    fn from(record: &EventRecord) -> Self {
        let event = &record.event;
        Self {
            source_chain: event.source_chain,
            event_type: event.event_type,
            nonce: event.nonce,
            state: record.state,
            sender: event.sender.to_string(),
            recipient: event.recipient.to_string(),
            amount: event.amount.to_string(),
            source_tx_hash: event.source_tx_hash.to_string(),
            source_block_height: event.source_block_height,
            observed_at: event.observed_at,
            signers: record
                .signatures
                .validators()
                .map(|v| v.to_string())
                .collect(),
            dest_tx_hash: record.dest_tx_hash.map(|h| h.to_string()),
            attempts: record.attempts,
            signature_cycles: record.signature_cycles,
            last_attempt_at: record.last_attempt_at,
            retry_after: record.retry_after,
            last_error: record.last_error.clone(),
            checkpoint_block: record.checkpoint_block,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Query string of `GET /events`
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub state: Option<String>,
    pub chain: Option<String>,
    /// RFC 3339, inclusive
    pub from: Option<String>,
    /// RFC 3339, exclusive
    pub to: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn parse_time(name: &str, raw: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ApiError::BadRequest(format!("{} must be RFC 3339: {}", name, e)))
}

impl EventsQuery {
    pub fn to_filter(&self) -> Result<RecordFilter, ApiError> {
        let state = self
            .state
            .as_deref()
            .map(str::parse::<EventState>)
            .transpose()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let source_chain = self
            .chain
            .as_deref()
            .map(str::parse::<ChainSide>)
            .transpose()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let observed_from = self
            .from
            .as_deref()
            .map(|raw| parse_time("from", raw))
            .transpose()?;
        let observed_to = self
            .to
            .as_deref()
            .map(|raw| parse_time("to", raw))
            .transpose()?;

        let limit = self.limit.unwrap_or(RecordFilter::default().limit);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(ApiError::BadRequest(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        let offset = self.offset.unwrap_or(0);
        if offset < 0 {
            return Err(ApiError::BadRequest("offset cannot be negative".into()));
        }

        Ok(RecordFilter {
            state,
            source_chain,
            observed_from,
            observed_to,
            limit,
            offset,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub records: Vec<EventRecordView>,
    pub count: usize,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub records_by_state: BTreeMap<EventState, i64>,
    pub total_records: i64,
    pub validators: usize,
    pub quorum_threshold: usize,
    pub checkpoints: BTreeMap<ChainSide, Option<u64>>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub fatal: Option<String>,
    pub validator_set_sufficient: bool,
    pub chains: BTreeMap<ChainSide, ChainStatus>,
    pub stuck_records: usize,
    pub uptime_secs: i64,
}

async fn get_event(
    State(state): State<AppState>,
    Path((chain, event_type, nonce)): Path<(String, String, u64)>,
) -> Result<Json<EventRecordView>, ApiError> {
    let chain: ChainSide = chain
        .parse()
        .map_err(|e: eyre::Report| ApiError::BadRequest(e.to_string()))?;
    let event_type: EventType = event_type
        .parse()
        .map_err(|e: eyre::Report| ApiError::BadRequest(e.to_string()))?;
    let key = EventKey::new(chain, event_type, nonce);

    match state.ledger.get(&key).await? {
        Some(record) => Ok(Json(EventRecordView::from(&record))),
        None => Err(ApiError::NotFound(format!("no record for {}", key))),
    }
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let filter = query.to_filter()?;
    let records: Vec<EventRecordView> = state
        .ledger
        .query(&filter)
        .await?
        .iter()
        .map(EventRecordView::from)
        .collect();
    Ok(Json(EventsResponse {
        count: records.len(),
        records,
        limit: filter.limit,
        offset: filter.offset,
    }))
}

async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let records_by_state = state.ledger.count_by_state().await?;
    let total_records = records_by_state.values().sum();
    let mut checkpoints = BTreeMap::new();
    for side in ChainSide::ALL {
        let checkpoint = state.ledger.checkpoint(side).await?;
        checkpoints.insert(side, checkpoint.map(|cp| cp.height));
    }
    Ok(Json(StatsResponse {
        records_by_state,
        total_records,
        validators: state.validator_count,
        quorum_threshold: state.quorum_threshold,
        checkpoints,
    }))
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state.status.snapshot().await;
    let validator_set_sufficient =
        state.quorum_threshold >= 1 && state.validator_count >= state.quorum_threshold;
    let chains_polled = ChainSide::ALL.iter().all(|side| {
        snapshot
            .chains
            .get(side)
            .is_some_and(|c| c.last_successful_poll.is_some())
    });
    let healthy = snapshot.fatal.is_none() && validator_set_sufficient && chains_polled;

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            healthy,
            fatal: snapshot.fatal,
            validator_set_sufficient,
            chains: snapshot.chains,
            stuck_records: snapshot.stuck_records,
            uptime_secs: (Utc::now() - snapshot.started_at).num_seconds(),
        }),
    )
}

/// Liveness probe (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

/// Prometheus metrics endpoint
async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", get(list_events))
        .route("/events/{chain}/{event_type}/{nonce}", get(get_event))
        .route("/stats", get(stats))
        .route("/health", get(health))
        .route("/healthz", get(liveness))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Serve the API on an already bound listener until shutdown
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> eyre::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

/// Bind `bind_address` and serve the API until shutdown
pub async fn start_server(
    bind_address: &str,
    state: AppState,
    shutdown: watch::Receiver<bool>,
) -> eyre::Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}: {}", bind_address, e))?;
    let listener = TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);
    info!("  /events  - Event records (JSON)");
    info!("  /health  - Full health status (JSON)");
    info!("  /metrics - Prometheus metrics");
    serve(listener, state, shutdown).await
}
