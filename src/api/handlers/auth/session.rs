//! Server-side sessions: cookie plumbing and the web login/logout endpoints.

use axum::{
    Json,
    extract::Extension,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{InvalidHeaderValue, SET_COOKIE},
    },
    response::IntoResponse,
};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use super::login::{CredentialFailure, check_credentials};
use super::state::AuthState;
use super::storage::{UserRecord, delete_session, insert_session, lookup_session_user};
use super::types::LoginRequest;
use super::utils::hash_token;

pub(crate) const SESSION_COOKIE_NAME: &str = "elevategs_session";

/// Credential login for the web client: creates a session row and responds
/// with the cookie plus a role-based redirect target.
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session created"),
        (status = 401, description = "Invalid credentials"),
        (status = 403, description = "Account inactive or email unverified"),
        (status = 422, description = "Validation failed")
    ),
    tag = "auth"
)]
pub async fn web_login(
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<LoginRequest>>,
) -> impl IntoResponse {
    let request: LoginRequest = match payload {
        Some(Json(payload)) => payload,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "message": "Missing payload"})),
            )
                .into_response();
        }
    };

    let user = match check_credentials(&pool, &request).await {
        Ok(user) => user,
        Err(failure) => return failure.into_response(),
    };

    let token = match insert_session(&pool, user.id, auth_state.config().session_ttl_seconds()).await
    {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to create session: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": "Login failed"})),
            )
                .into_response();
        }
    };

    let mut response_headers = HeaderMap::new();
    match session_cookie(&auth_state, &token) {
        Ok(cookie) => {
            response_headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => {
            error!("Failed to build session cookie: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": "Login failed"})),
            )
                .into_response();
        }
    }

    (
        StatusCode::OK,
        response_headers,
        Json(json!({
            "success": true,
            "redirect": user.role.dashboard_path(),
            "user": user.to_response(),
        })),
    )
        .into_response()
}

/// Web logout: drop the session row and clear the cookie.
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Session cleared")
    ),
    tag = "auth"
)]
pub async fn web_logout(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    if let Some(token) = extract_session_token(&headers) {
        let token_hash = hash_token(&token);
        if let Err(err) = delete_session(&pool, &token_hash).await {
            error!("Failed to delete session: {err}");
        }
    }

    // Always clear the cookie, even if the session record was missing.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(&auth_state) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (
        StatusCode::OK,
        response_headers,
        Json(json!({"success": true, "redirect": "/login"})),
    )
        .into_response()
}

/// Resolve the session cookie into a user, if present and unexpired.
///
/// Returns `Ok(None)` when the cookie is missing or does not match a live
/// session; lookup failures surface as 500 so the guard fails closed.
pub(crate) async fn authenticate_session(
    headers: &HeaderMap,
    pool: &PgPool,
) -> Result<Option<UserRecord>, StatusCode> {
    let Some(token) = extract_session_token(headers) else {
        return Ok(None);
    };
    // Only the hash is stored; never compare raw tokens against the database.
    let token_hash = hash_token(&token);
    match lookup_session_user(pool, &token_hash).await {
        Ok(record) => Ok(record),
        Err(err) => {
            error!("Failed to lookup session: {err}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Create a session row for the user and return the Set-Cookie value.
/// Shared by the web login and the Google callback.
pub(super) async fn start_session(
    pool: &PgPool,
    auth_state: &AuthState,
    user_id: uuid::Uuid,
) -> anyhow::Result<HeaderValue> {
    let token = insert_session(pool, user_id, auth_state.config().session_ttl_seconds()).await?;
    session_cookie(auth_state, &token).map_err(|err| anyhow::anyhow!("invalid cookie value: {err}"))
}

/// Build a secure `HttpOnly` cookie for the session token.
pub(super) fn session_cookie(
    auth_state: &AuthState,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let ttl_seconds = auth_state.config().session_ttl_seconds();
    // Only mark cookies secure when the frontend is served over HTTPS.
    let secure = auth_state.config().session_cookie_secure();
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn clear_session_cookie(auth_state: &AuthState) -> Result<HeaderValue, InvalidHeaderValue> {
    let secure = auth_state.config().session_cookie_secure();
    let mut cookie = format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    cookie_value(headers, SESSION_COOKIE_NAME)
}

/// Pull a named cookie out of the Cookie header.
pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(axum::http::header::COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == name && !val.is_empty() {
            return Some(val.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::auth::state::AuthConfig;
    use anyhow::Result;
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;

    fn auth_state(frontend: &str) -> Arc<AuthState> {
        let config = AuthConfig::new(SecretString::from("secret"), frontend.to_string());
        Arc::new(AuthState::new(config))
    }

    #[test]
    fn session_cookie_is_http_only_and_lax() {
        let state = auth_state("https://elevategs.test");
        let cookie = session_cookie(&state, "tok").unwrap();
        let value = cookie.to_str().unwrap();
        assert!(value.starts_with("elevategs_session=tok; "));
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("SameSite=Lax"));
        assert!(value.contains("Secure"));
    }

    #[test]
    fn session_cookie_not_secure_over_http() {
        let state = auth_state("http://localhost:8080");
        let cookie = session_cookie(&state, "tok").unwrap();
        assert!(!cookie.to_str().unwrap().contains("Secure"));
    }

    #[test]
    fn clear_cookie_zeroes_max_age() {
        let state = auth_state("https://elevategs.test");
        let cookie = clear_session_cookie(&state).unwrap();
        assert!(cookie.to_str().unwrap().contains("Max-Age=0"));
    }

    #[test]
    fn cookie_value_parses_multiple_pairs() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("other=1; elevategs_session=abc; tail=2"),
        );
        assert_eq!(extract_session_token(&headers), Some("abc".to_string()));
    }

    #[test]
    fn cookie_value_ignores_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("elevategs_session="),
        );
        assert_eq!(extract_session_token(&headers), None);
    }

    #[tokio::test]
    async fn web_login_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = web_login(
            Extension(pool),
            Extension(auth_state("https://elevategs.test")),
            None,
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn web_logout_without_cookie_still_clears() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = web_logout(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state("https://elevategs.test")),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(SET_COOKIE));
        Ok(())
    }
}
