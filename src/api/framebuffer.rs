use axum::Router;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use uuid::Uuid;

use crate::error::ApiError;
use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/framebuffer/{session_id}", get(framebuffer_ws))
}

/// Browser endpoint of the framebuffer relay. The caller arrives already
/// authenticated by the outer HTTP layer; session validity is checked when
/// the tunnel opens.
async fn framebuffer_ws(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let proxy = state.proxy.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        proxy.serve(session_id, socket).await;
    }))
}
