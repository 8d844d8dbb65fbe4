use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::api::error::AppError;
use crate::api::extract::ActiveSession;
use crate::services::archive::ARCHIVE_NAME;

#[utoipa::path(
    get,
    path = "/download",
    responses(
        (status = 200, description = "Zip archive of the session's converted files", content_type = "application/zip"),
        (status = 400, description = "Missing or unknown session, or nothing converted yet")
    ),
    tag = "convert"
)]
pub async fn download_archive(
    State(state): State<AppState>,
    ActiveSession(session): ActiveSession,
) -> Result<Response, AppError> {
    let bytes = state.archive.build_async(session.dir.clone()).await?;
    tracing::info!(session = %session.token, "📤 Sending {} ({} bytes)", ARCHIVE_NAME, bytes.len());

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", ARCHIVE_NAME),
            ),
        ],
        Body::from(bytes),
    )
        .into_response())
}
