use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{HeaderMap, HeaderValue, header, request::Parts},
};
use chrono::Utc;
use std::convert::Infallible;
use std::time::Duration;

use crate::AppState;
use crate::api::error::AppError;
use crate::services::session::{SESSION_COOKIE, Session, SessionToken};

/// Reads the session token from the `Cookie` header, if it is well formed.
pub fn session_token_from_headers(headers: &HeaderMap) -> Option<SessionToken> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .and_then(|(_, value)| SessionToken::parse(value))
}

/// `Set-Cookie` value handing `token` to the browser for `ttl`.
pub fn session_cookie(token: &SessionToken, ttl: Duration, secure: bool) -> HeaderValue {
    let expires = chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or_else(Utc::now);
    let cookie = format!(
        "{}={}; Path=/; Max-Age={}; Expires={}; HttpOnly; SameSite=Lax{}",
        SESSION_COOKIE,
        token,
        ttl.as_secs(),
        expires.format("%a, %d %b %Y %H:%M:%S GMT"),
        if secure { "; Secure" } else { "" }
    );
    // Token is a hex UUID and the rest is ASCII
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static("txid=; Path=/"))
}

/// The session token the client sent, whether or not it is still known.
pub struct SessionCookie(pub Option<SessionToken>);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for SessionCookie {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(SessionCookie(session_token_from_headers(&parts.headers)))
    }
}

/// A session the registry knows about. Missing, malformed and unknown
/// tokens are rejected with [`AppError::SessionNotFound`] before the handler
/// (or a websocket upgrade) runs.
pub struct ActiveSession(pub Session);

#[async_trait]
impl FromRequestParts<AppState> for ActiveSession {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = session_token_from_headers(&parts.headers).ok_or_else(|| {
            tracing::debug!("Request without a usable session cookie");
            AppError::SessionNotFound
        })?;
        state.sessions.get(&token).map(ActiveSession).ok_or_else(|| {
            tracing::debug!(session = %token, "Unknown session");
            AppError::SessionNotFound
        })
    }
}
