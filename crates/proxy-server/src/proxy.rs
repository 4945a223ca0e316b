use crate::client::client_channel;
use crate::config::TableRules;
use crate::forward::{Forwarded, UpstreamForwarder};
use crate::admin::{Outcome, ProxyStats};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{Method, Request, Response};
use axum::routing::any;
use axum::Router;
use postgrest_cache::{cache_key, group_query, CachedResponse, CaptureSink, Lookup, ResponseStore};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub rules: TableRules,
    pub path_prefix: String,
    pub store: ResponseStore,
    pub forwarder: UpstreamForwarder,
    pub stats: ProxyStats,
}

/// Why a request skips the cache entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bypass {
    /// No tables configured.
    Disabled,
    OutsidePrefix,
    Method,
    TableNotAllowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    PassThrough(Bypass),
    Cacheable,
}

/// Decide whether a request may be served from or written to the cache.
pub fn classify(method: &Method, path: &str, prefix: &str, rules: &TableRules) -> Route {
    if !rules.is_enabled() {
        return Route::PassThrough(Bypass::Disabled);
    }
    if !path.starts_with(prefix) {
        return Route::PassThrough(Bypass::OutsidePrefix);
    }
    if method != Method::GET {
        return Route::PassThrough(Bypass::Method);
    }
    let table = path.rsplit('/').next().unwrap_or_default();
    if !rules.allows(table) {
        return Route::PassThrough(Bypass::TableNotAllowed);
    }
    Route::Cacheable
}

pub fn proxy_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{*path}", any(proxy_handler))
        .route("/", any(proxy_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Main proxy handler. Serves eligible GETs from the store, otherwise
/// forwards upstream, capturing the response on a miss.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    if let Route::PassThrough(reason) = classify(&method, &path, &state.path_prefix, &state.rules) {
        tracing::debug!(%path, %method, outcome = Outcome::PassThrough.as_str(), ?reason, "bypassing cache");
        state.stats.record(Outcome::PassThrough);
        return pass_through(state, req).await;
    }

    let query = match Query::<Vec<(String, String)>>::try_from_uri(req.uri()) {
        Ok(Query(pairs)) => group_query(pairs),
        Err(e) => {
            tracing::debug!(error = %e, %path, "unparsable query string, bypassing cache");
            state.stats.record(Outcome::PassThrough);
            return pass_through(state, req).await;
        }
    };
    let key = cache_key(&path, &query, req.headers());

    match state.store.get(&key).await {
        Ok(Lookup::Hit { response, size }) => {
            tracing::info!(%path, %method, outcome = Outcome::Hit.as_str(), bytes = size, "cache HIT");
            state.stats.record_hit(size);
            return replay(&response).await;
        }
        Ok(Lookup::Miss) => {
            tracing::debug!(%path, %key, "cache MISS");
        }
        Err(e) => {
            // treated as a miss
            tracing::warn!(error = %e, %path, %method, outcome = "store_error", op = "get", "cache lookup failed");
            state.stats.record_store_error("get");
        }
    }

    populate(state, req, key).await
}

/// Forward with no cache interaction.
async fn pass_through(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    let (mut sink, pending) = client_channel();
    tokio::spawn(
        async move {
            state.forwarder.forward(req, &mut sink).await;
        }
        .in_current_span(),
    );
    pending.into_response().await
}

/// Write a stored response to the client without touching upstream.
async fn replay(response: &CachedResponse) -> Response<Body> {
    let (mut sink, pending) = client_channel();
    if let Err(e) = response.write_to(&mut sink).await {
        tracing::debug!(error = %e, "client left during replay");
    }
    drop(sink);
    pending.into_response().await
}

/// Forward through a capturing sink, then store what the client received.
/// The store write happens after the client's body has ended, and is
/// skipped when the client left before the body was complete.
async fn populate(state: Arc<AppState>, req: Request<Body>, key: String) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let (sink, pending) = client_channel();

    tokio::spawn(
        async move {
            let mut capture = CaptureSink::new(sink);
            if state.forwarder.forward(req, &mut capture).await == Forwarded::ClientGone {
                // the capture is a client-side truncation, not the upstream's answer
                tracing::info!(
                    %path,
                    %method,
                    outcome = Outcome::Abandoned.as_str(),
                    bytes = capture.captured_len(),
                    "client left before the response completed, not caching"
                );
                state.stats.record(Outcome::Abandoned);
                return;
            }
            let (response, client) = capture.finalize();
            drop(client);

            match state.store.set(&key, &response).await {
                Ok(size) => {
                    tracing::info!(
                        %path,
                        %method,
                        outcome = Outcome::Populate.as_str(),
                        status = response.status().as_u16(),
                        bytes = size,
                        "cache POPULATE"
                    );
                    state.stats.record(Outcome::Populate);
                }
                Err(e) => {
                    tracing::warn!(error = %e, %path, %method, outcome = "store_error", op = "set", "cache write failed");
                    state.stats.record_store_error("set");
                }
            }
        }
        .in_current_span(),
    );

    pending.into_response().await
}
