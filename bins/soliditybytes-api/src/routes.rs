// Router assembly for the Soliditybytes API

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{auth, handlers, stream, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/exercises", get(handlers::list_exercises))
        .route("/exercises/:id", get(handlers::get_exercise))
        .route("/exercises/:id/solution", get(handlers::get_solution))
        .route("/submissions", post(handlers::create_submission))
        .route("/submissions/:id", get(handlers::get_submission))
        .route("/submissions/:id/stream", get(stream::stream_submission))
        .route("/progress", get(handlers::device_progress))
        .route("/me/progress", get(handlers::my_progress))
        .route("/auth/me", get(auth::me))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/dev-login", post(auth::dev_login))
}

/// Any origin when the allowlist is empty; otherwise only listed origins,
/// with credentials so the session cookie travels.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

pub fn app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.frontend_origins);
    Router::new()
        .merge(routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
