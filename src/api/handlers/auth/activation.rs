//! Account activation: consuming emailed links and resending them.

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use super::state::AuthState;
use super::storage::{
    ResendActivationOutcome, activate_user, find_user_by_activation_hash,
    reissue_activation_token,
};
use super::tokens::{issue_token, validate_activation_token};
use super::types::ResendActivationRequest;
use super::utils::{hash_token, normalize_email, valid_email};

/// Consume an activation link.
///
/// Unknown tokens and expired tokens get distinct messages: an expired link
/// still identifies the account, so the client can offer a resend.
#[utoipa::path(
    get,
    path = "/activate/{token}",
    params(
        ("token" = String, Path, description = "Raw activation token from the email link")
    ),
    responses(
        (status = 200, description = "Account activated"),
        (status = 400, description = "Invalid or already-used link"),
        (status = 410, description = "Expired link, resend possible")
    ),
    tag = "auth"
)]
pub async fn activate(
    pool: Extension<PgPool>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    let token = token.trim();
    if token.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "message": "Activation link is invalid or has already been used.",
            })),
        )
            .into_response();
    }

    // Lookup is by hash; raw tokens are never stored.
    let token_hash = hash_token(token);
    let user = match find_user_by_activation_hash(&pool, &token_hash).await {
        Ok(user) => user,
        Err(err) => {
            error!("Failed to lookup activation token: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": "Activation failed"})),
            )
                .into_response();
        }
    };

    let Some(user) = user else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "message": "Activation link is invalid or has already been used.",
            })),
        )
            .into_response();
    };

    if !validate_activation_token(
        user.activation_token_hash.as_deref(),
        user.activation_token_expires_at,
        token,
    ) {
        // Matched the hash but failed validation, so the link is expired.
        return (
            StatusCode::GONE,
            Json(json!({
                "success": false,
                "message": "Activation link has expired or is invalid.",
                "canResend": true,
                "email": user.email,
            })),
        )
            .into_response();
    }

    if let Err(err) = activate_user(&pool, user.id).await {
        error!("Failed to activate user: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "message": "Activation failed"})),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Your account has been activated. You can now log in.",
            "redirect": "/login",
        })),
    )
        .into_response()
}

/// Issue a fresh activation link for an inactive account. Overwriting the
/// stored hash is what invalidates the previous link.
#[utoipa::path(
    post,
    path = "/activate/resend",
    request_body = ResendActivationRequest,
    responses(
        (status = 200, description = "New link queued"),
        (status = 400, description = "Account already active"),
        (status = 404, description = "No matching account")
    ),
    tag = "auth"
)]
pub async fn resend_activation(
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ResendActivationRequest>>,
) -> impl IntoResponse {
    let request: ResendActivationRequest = match payload {
        Some(Json(payload)) => payload,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "message": "Missing payload"})),
            )
                .into_response();
        }
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "success": false,
                "message": "The given data was invalid.",
                "errors": {"email": ["The email must be a valid email address."]},
            })),
        )
            .into_response();
    }

    let token = match issue_token(auth_state.config().activation_token_ttl_seconds()) {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to issue activation token: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": "Resend failed"})),
            )
                .into_response();
        }
    };

    match reissue_activation_token(&pool, &email, &token, auth_state.config()).await {
        Ok(ResendActivationOutcome::Queued) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "A new activation link has been sent to your email.",
            })),
        )
            .into_response(),
        Ok(ResendActivationOutcome::AlreadyActive) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "message": "This account is already active. Please log in.",
            })),
        )
            .into_response(),
        Ok(ResendActivationOutcome::Unknown) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "message": "We could not find an account with that email address.",
            })),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to resend activation: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": "Resend failed"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::auth::state::AuthConfig;
    use anyhow::Result;
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;

    fn auth_state() -> Arc<AuthState> {
        let config = AuthConfig::new(
            SecretString::from("secret"),
            "https://elevategs.test".to_string(),
        );
        Arc::new(AuthState::new(config))
    }

    #[tokio::test]
    async fn activate_empty_token_is_invalid() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = activate(Extension(pool), Path(" ".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn resend_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = resend_activation(Extension(pool), Extension(auth_state()), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn resend_rejects_malformed_email_before_db() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = resend_activation(
            Extension(pool),
            Extension(auth_state()),
            Some(Json(ResendActivationRequest {
                email: "not-an-email".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        Ok(())
    }
}
