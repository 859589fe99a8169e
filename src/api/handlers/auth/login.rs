//! Bearer-token login for the API client, plus `/me` and `/refresh`.

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

use crate::api::middleware::AuthContext;

use super::state::AuthState;
use super::storage::{UserRecord, find_user_by_email};
use super::tokens::mint_jwt;
use super::types::{LoginRequest, LoginResponse};
use super::utils::{normalize_email, valid_email, verify_password};

/// Why a credential check failed. Ordering matters: the inactive check runs
/// before password verification so the client can offer an activation resend
/// without a valid password.
pub(super) enum CredentialFailure {
    Validation(BTreeMap<&'static str, Vec<String>>),
    Invalid,
    Inactive(String),
    Unverified,
    Server,
}

impl IntoResponse for CredentialFailure {
    fn into_response(self) -> Response {
        match self {
            CredentialFailure::Validation(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "success": false,
                    "message": "The given data was invalid.",
                    "errors": errors,
                })),
            )
                .into_response(),
            CredentialFailure::Invalid => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"success": false, "message": "Invalid credentials"})),
            )
                .into_response(),
            CredentialFailure::Inactive(email) => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "success": false,
                    "message": "Your account is not activated. Please check your email for the activation link.",
                    "code": "ACCOUNT_INACTIVE",
                    "email": email,
                })),
            )
                .into_response(),
            CredentialFailure::Unverified => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "success": false,
                    "message": "Please verify your email address before logging in.",
                })),
            )
                .into_response(),
            CredentialFailure::Server => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": "Login failed"})),
            )
                .into_response(),
        }
    }
}

/// Shared credential check for the bearer and session login paths.
pub(super) async fn check_credentials(
    pool: &PgPool,
    request: &LoginRequest,
) -> Result<UserRecord, CredentialFailure> {
    let mut errors: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    let email = normalize_email(&request.email);
    if email.is_empty() {
        errors.insert("email", vec!["The email field is required.".to_string()]);
    } else if !valid_email(&email) {
        errors.insert(
            "email",
            vec!["The email must be a valid email address.".to_string()],
        );
    }
    if request.password.is_empty() {
        errors.insert(
            "password",
            vec!["The password field is required.".to_string()],
        );
    }
    if !errors.is_empty() {
        return Err(CredentialFailure::Validation(errors));
    }

    let user = match find_user_by_email(pool, &email).await {
        Ok(user) => user,
        Err(err) => {
            error!("Failed to lookup user for login: {err}");
            return Err(CredentialFailure::Server);
        }
    };
    let Some(user) = user else {
        return Err(CredentialFailure::Invalid);
    };

    // Inactive accounts are rejected before the password is checked so the
    // client can surface the resend-activation action.
    if !user.is_active {
        return Err(CredentialFailure::Inactive(user.email));
    }
    if user.email_verified_at.is_none() {
        return Err(CredentialFailure::Unverified);
    }
    if !verify_password(&request.password, &user.password_hash) {
        return Err(CredentialFailure::Invalid);
    }

    Ok(user)
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated", body = LoginResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 403, description = "Account inactive or email unverified"),
        (status = 422, description = "Validation failed")
    ),
    tag = "auth"
)]
pub async fn login(
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

    match mint_jwt(
        auth_state.config().jwt_secret(),
        user.id,
        user.role.as_str(),
        request.remember,
    ) {
        Ok((token, expires_in)) => (
            StatusCode::OK,
            Json(LoginResponse {
                success: true,
                token,
                token_type: "bearer".to_string(),
                expires_in,
                remember: request.remember,
                user: user.to_response(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to mint bearer token: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": "Login failed"})),
            )
                .into_response()
        }
    }
}

/// Current authenticated user (session or bearer).
#[utoipa::path(
    get,
    path = "/api/auth/me",
    responses(
        (status = 200, description = "Current user"),
        (status = 401, description = "Unauthenticated")
    ),
    tag = "auth"
)]
pub async fn me(Extension(auth): Extension<AuthContext>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({"success": true, "user": auth.user.to_response()})),
    )
}

/// Re-issue a bearer token with a fresh TTL.
#[utoipa::path(
    post,
    path = "/api/auth/refresh",
    responses(
        (status = 200, description = "Fresh token", body = LoginResponse),
        (status = 401, description = "Unauthenticated")
    ),
    tag = "auth"
)]
pub async fn refresh(
    auth_state: Extension<Arc<AuthState>>,
    Extension(auth): Extension<AuthContext>,
) -> impl IntoResponse {
    match mint_jwt(
        auth_state.config().jwt_secret(),
        auth.user.id,
        auth.user.role.as_str(),
        false,
    ) {
        Ok((token, expires_in)) => (
            StatusCode::OK,
            Json(LoginResponse {
                success: true,
                token,
                token_type: "bearer".to_string(),
                expires_in,
                remember: false,
                user: auth.user.to_response(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to refresh bearer token: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": "Refresh failed"})),
            )
                .into_response()
        }
    }
}
