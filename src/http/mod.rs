//! HTTP Service (C9): axum router, request/response shaping, and the
//! `AppError` → JSON error-body mapping (§4.9). Grounded on the
//! `parallax-labs/context-harness` axum server retrieved alongside the
//! teacher: `AppState`/`CorsLayer`/`IntoResponse`-for-error shape carried
//! over directly, generalized to this crate's own routes and error type.

mod handlers;
mod state;

pub use state::AppState;

use axum::http::{HeaderName, HeaderValue, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/v1/chunks", post(handlers::create_chunk))
        .route("/api/v1/chunks/batch", post(handlers::batch_create_chunks))
        .route("/api/v1/chunks/tags/batch", post(handlers::batch_tag_ops))
        .route("/api/v1/chunks/:id", get(handlers::get_chunk))
        .route("/api/v1/chunks/:id", put(handlers::update_chunk))
        .route("/api/v1/chunks/:id", delete(handlers::delete_chunk))
        .route("/api/v1/search/semantic", post(handlers::search_semantic))
        .route("/api/v1/search/tags", post(handlers::search_tags))
        .route("/api/v1/search/graph", post(handlers::search_graph))
        .route("/api/v1/search/hybrid", post(handlers::search_hybrid))
        .route("/api/v1/cache/stats", get(handlers::cache_stats))
        .route("/api/v1/cache/clear", post(handlers::cache_clear))
        .route("/health", get(handlers::health))
        .layer(middleware::from_fn(correlation_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Attaches a `correlation_id` (caller-supplied `X-Correlation-Id` or a fresh
/// UUID v4) to the request's tracing span and echoes it in the response
/// header, per §4.9.
async fn correlation_id_middleware(request: Request<axum::body::Body>, next: Next) -> Response {
    use tracing::Instrument;

    let header_name = HeaderName::from_static(CORRELATION_ID_HEADER);
    let correlation_id = request
        .headers()
        .get(&header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = tracing::info_span!("http_request", %correlation_id, method = %request.method(), path = %request.uri().path());
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(header_name, value);
    }
    response
}
