use axum::body::Body;
use axum::http::{Request, Uri};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Span;

use super::session_id_from_headers;

/// Runs inside the span `http::router`'s `TraceLayer` creates, so these
/// fields were already declared there and `record` actually sticks.
pub async fn enrich_current_span_middleware(req: Request<Body>, next: Next) -> Response {
    let uri: &Uri = req.uri();

    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("UNKNOWN");

    let session_id = session_id_from_headers(req.headers());

    let current_span = Span::current();
    current_span.record("http.uri", uri.path());
    current_span.record("http.host", host);
    if let Some(query) = uri.query() {
        current_span.record("http.query", query);
    }
    if let Some(session_id) = &session_id {
        current_span.record("session_id", session_id.as_str());
    }

    next.run(req).await
}
