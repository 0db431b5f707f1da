use crate::handlers;
use crate::state::AppState;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post, put};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .cors_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::HeaderName::from_static("x-request-id"),
        ]);

    let attempt = "/api/v1/attempts/:exam_id/:learner_id";
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/exams", post(handlers::register_exam))
        .route("/api/v1/exams/:exam_id/outline", get(handlers::exam_outline))
        .route("/api/v1/attempts", post(handlers::start_attempt))
        .route(attempt, get(handlers::get_attempt))
        .route(&format!("{attempt}/navigate"), post(handlers::navigate))
        .route(
            &format!("{attempt}/responses/:item_id"),
            put(handlers::put_response).delete(handlers::delete_response),
        )
        .route(&format!("{attempt}/bookmark"), post(handlers::toggle_bookmark))
        .route(&format!("{attempt}/notes/:item_id"), put(handlers::put_note))
        .route(&format!("{attempt}/review-panel"), post(handlers::toggle_review_panel))
        .route(&format!("{attempt}/review"), get(handlers::review))
        .route(&format!("{attempt}/submit"), post(handlers::submit_attempt))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
}
