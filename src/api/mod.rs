pub mod agents;
pub mod framebuffer;
pub mod sessions;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::store::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .merge(sessions::router())
        .merge(agents::router())
        .merge(framebuffer::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
