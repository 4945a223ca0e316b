use crate::proxy::AppState;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use postgrest_cache::{cache_key, HeaderValues, QueryParams};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const REQUESTS_TOTAL: &str = "proxy_requests_total";
const STORE_ERRORS_TOTAL: &str = "cache_store_errors_total";
const HIT_BYTES: &str = "cache_hit_bytes";

/// How a proxied request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    PassThrough,
    Hit,
    Populate,
    /// Miss whose client left mid-body; nothing stored.
    Abandoned,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::PassThrough => "pass_through",
            Outcome::Hit => "hit",
            Outcome::Populate => "populate",
            Outcome::Abandoned => "abandoned",
        }
    }
}

/// Process-local counters backing `/api/stats`. Every record call also
/// feeds the Prometheus recorder.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pass_through: AtomicU64,
    hits: AtomicU64,
    populates: AtomicU64,
    abandoned: AtomicU64,
    store_errors: AtomicU64,
    bytes_served: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub pass_through: u64,
    pub hits: u64,
    pub populates: u64,
    pub abandoned: u64,
    pub store_errors: u64,
    #[serde(rename = "bytes_served_from_cache")]
    pub bytes_served: u64,
}

impl ProxyStats {
    pub fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::PassThrough => &self.pass_through,
            Outcome::Hit => &self.hits,
            Outcome::Populate => &self.populates,
            Outcome::Abandoned => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(REQUESTS_TOTAL, "outcome" => outcome.as_str()).increment(1);
    }

    pub fn record_hit(&self, bytes: usize) {
        self.record(Outcome::Hit);
        self.bytes_served.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::histogram!(HIT_BYTES).record(bytes as f64);
    }

    pub fn record_store_error(&self, op: &'static str) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(STORE_ERRORS_TOTAL, "op" => op).increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pass_through: self.pass_through.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            populates: self.populates.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
    pub prometheus: PrometheusHandle,
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/invalidate", post(invalidate_handler))
        .with_state(state)
}

/// GET /metrics: Prometheus text exposition.
async fn metrics_handler(State(state): State<AdminState>) -> String {
    state.prometheus.render()
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    counters: StatsSnapshot,
    backend: &'static str,
    ttl_seconds: u64,
}

/// GET /api/stats
async fn stats_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let store = &state.app.store;
    Json(StatsResponse {
        counters: state.app.stats.snapshot(),
        backend: store.backend_name(),
        ttl_seconds: store.ttl().as_secs(),
    })
}

/// Identifies a cached response the same way the proxy keys it.
#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub path: String,
    #[serde(default)]
    pub query: QueryParams,
    #[serde(default)]
    pub headers: HeaderValues,
}

fn header_map(headers: &HeaderValues) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| format!("invalid header name: {name}"))?;
        for value in values {
            let value = HeaderValue::from_str(value)
                .map_err(|_| format!("invalid value for header {name}"))?;
            map.append(name.clone(), value);
        }
    }
    Ok(map)
}

/// POST /api/invalidate: drop one entry ahead of its TTL.
async fn invalidate_handler(
    State(state): State<AdminState>,
    Json(body): Json<InvalidateRequest>,
) -> impl IntoResponse {
    let headers = match header_map(&body.headers) {
        Ok(h) => h,
        Err(reason) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": reason })),
            )
        }
    };
    let key = cache_key(&body.path, &body.query, &headers);

    match state.app.store.delete(&key).await {
        Ok(deleted) => {
            tracing::info!(path = %body.path, %key, deleted, "cache entry invalidated");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "key": key, "deleted": deleted })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, path = %body.path, outcome = "store_error", op = "delete", "invalidate failed");
            state.app.stats.record_store_error("delete");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    }
}
