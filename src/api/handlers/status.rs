use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

use crate::AppState;
use crate::api::extract::ActiveSession;

#[utoipa::path(
    get,
    path = "/socket",
    responses(
        (status = 101, description = "Upgraded; JSON progress snapshots are pushed on a fixed interval"),
        (status = 400, description = "Missing or unknown session")
    ),
    tag = "convert"
)]
pub async fn progress_socket(
    State(state): State<AppState>,
    ActiveSession(session): ActiveSession,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        state.notifier.serve(socket, session.token).await;
    })
}
