//! HTTP surface — thin handlers that parse, validate, and publish; the
//! actual session/layout/script mutation lives in the durable consumers.
//! Cookie signing, TLS termination, and HTML templating are collaborators'
//! concerns and are not implemented here.

pub mod middleware;
pub mod routes;

use std::sync::Arc;

use axum::http::HeaderMap;
use tower_http::trace::TraceLayer;
use tracing::field::Empty;

use crate::bus::client::BrokerClient;
use crate::presets::PresetRegistry;
use crate::session::SessionStore;
use crate::sse::SseEngine;

#[derive(Clone)]
pub struct AppState {
    pub broker: BrokerClient,
    pub store: Arc<dyn SessionStore>,
    pub presets: Arc<PresetRegistry>,
    pub sse: Arc<SseEngine>,
}

pub(crate) const SESSION_COOKIE: &str = "sid";

pub(crate) fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|kv| {
        let kv = kv.trim();
        let (k, v) = kv.split_once('=')?;
        (k == SESSION_COOKIE).then(|| v.to_string())
    })
}

/// Declares the fields `middleware::enrich_current_span_middleware` records
/// into; without this the `Span::record` calls there are silent no-ops
/// because the span they run in never named those fields at creation time.
pub fn router(state: AppState) -> axum::Router {
    routes::router(state)
        .layer(axum::middleware::from_fn(
            middleware::enrich_current_span_middleware,
        ))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::extract::Request| {
                tracing::info_span!(
                    "http_request",
                    "http.method" = %request.method(),
                    "http.uri" = Empty,
                    "http.host" = Empty,
                    "http.query" = Empty,
                    "session_id" = Empty,
                )
            }),
        )
}
