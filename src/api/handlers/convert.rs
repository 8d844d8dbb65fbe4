use axum::{
    Json,
    extract::{Multipart, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::AppState;
use crate::api::error::AppError;
use crate::api::extract::{SessionCookie, session_cookie};

#[derive(Serialize, ToSchema)]
pub struct SessionResponse {
    pub session: String,
}

#[utoipa::path(
    post,
    path = "/session",
    responses(
        (status = 201, description = "Session issued; token also set as the `txid` cookie", body = SessionResponse)
    ),
    tag = "convert"
)]
pub async fn create_session(State(state): State<AppState>) -> Response {
    let session = state.sessions.issue();
    let cookie = session_cookie(
        &session.token,
        state.config.session_ttl(),
        state.config.secure_cookie,
    );

    (
        StatusCode::CREATED,
        [(header::SET_COOKIE, cookie)],
        Json(SessionResponse {
            session: session.token.to_string(),
        }),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/convert",
    request_body(content = String, description = "multipart/form-data with one or more `uploadfile` parts", content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Batch ingested and converted", body = crate::services::pipeline::PipelineSummary),
        (status = 400, description = "Malformed upload stream"),
        (status = 409, description = "A batch is already running for this session"),
        (status = 413, description = "Upload too large"),
        (status = 500, description = "Session storage failure")
    ),
    tag = "convert"
)]
pub async fn convert_files(
    State(state): State<AppState>,
    SessionCookie(token): SessionCookie,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let session = state.sessions.resolve_or_issue(token.as_ref());
    let cookie = session_cookie(
        &session.token,
        state.config.session_ttl(),
        state.config.secure_cookie,
    );

    // If the client disconnects this future is dropped and the guard cancels
    // whatever ingestion or conversion work is still in flight
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let summary = state.pipeline.run(&session, multipart, cancel).await?;
    tracing::info!(
        session = %session.token,
        ingested = summary.ingested,
        converted = summary.converted,
        failed = summary.failed,
        "Batch finished"
    );

    Ok(([(header::SET_COOKIE, cookie)], Json(summary)).into_response())
}
