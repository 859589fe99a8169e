//! Pre-registration email verification funnel for the web client.
//!
//! The address is verified before the account exists: a short-lived link is
//! emailed, the click marks the record verified, and web registration consumes
//! the record at account creation.

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use super::register::{email_taken, validate_registration, validation_failed};
use super::state::AuthState;
use super::storage::{
    NewActiveUser, SignupOutcome, create_active_user, delete_verification_by_hash,
    find_user_by_email, find_verification_by_hash, is_email_verified, mark_verification_verified,
    replace_verification,
};
use super::tokens::issue_token;
use super::types::{CheckVerifiedRequest, CheckVerifiedResponse, RegisterRequest, Role, VerificationLinkRequest};
use super::utils::{hash_password, hash_token, is_disposable_email, normalize_email, valid_email};

fn server_error(message: &str) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "message": message})),
    )
        .into_response()
}

/// Send (or replace) a verification link for an address that does not have an
/// account yet.
#[utoipa::path(
    post,
    path = "/email/verification-link",
    request_body = VerificationLinkRequest,
    responses(
        (status = 200, description = "Verification link queued"),
        (status = 422, description = "Validation failed")
    ),
    tag = "email"
)]
pub async fn verification_link(
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<VerificationLinkRequest>>,
) -> impl IntoResponse {
    let request: VerificationLinkRequest = match payload {
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
    let first_name = request.first_name.trim();
    let mut errors = serde_json::Map::new();
    if first_name.is_empty() {
        errors.insert(
            "first_name".to_string(),
            json!(["The first name field is required."]),
        );
    }
    if !valid_email(&email) {
        errors.insert(
            "email".to_string(),
            json!(["The email must be a valid email address."]),
        );
    } else if is_disposable_email(&email) {
        errors.insert(
            "email".to_string(),
            json!(["Disposable email addresses are not allowed."]),
        );
    }
    if !errors.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "success": false,
                "message": "The given data was invalid.",
                "errors": errors,
            })),
        )
            .into_response();
    }

    // An existing account means the caller should log in instead.
    match find_user_by_email(&pool, &email).await {
        Ok(Some(_)) => return email_taken(),
        Ok(None) => {}
        Err(err) => {
            error!("Failed to check existing account: {err}");
            return server_error("Could not send verification link");
        }
    }

    let token = match issue_token(auth_state.config().verification_token_ttl_seconds()) {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to issue verification token: {err}");
            return server_error("Could not send verification link");
        }
    };

    match replace_verification(&pool, &email, first_name, &token, auth_state.config()).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "A verification link has been sent to your email.",
            })),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to store verification record: {err}");
            server_error("Could not send verification link")
        }
    }
}

/// Consume a verification link click. Expired records are deleted here; there
/// is no background sweep.
#[utoipa::path(
    get,
    path = "/email/verify/{token}",
    params(
        ("token" = String, Path, description = "Raw verification token from the email link")
    ),
    responses(
        (status = 200, description = "Email marked verified"),
        (status = 400, description = "Invalid or used link"),
        (status = 410, description = "Expired link")
    ),
    tag = "email"
)]
pub async fn verify_email(pool: Extension<PgPool>, Path(token): Path<String>) -> impl IntoResponse {
    let token = token.trim();
    if token.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "message": "Verification link is invalid or has already been used.",
            })),
        )
            .into_response();
    }

    let token_hash = hash_token(token);
    let record = match find_verification_by_hash(&pool, &token_hash).await {
        Ok(record) => record,
        Err(err) => {
            error!("Failed to lookup verification record: {err}");
            return server_error("Verification failed");
        }
    };

    let Some(record) = record else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "message": "Verification link is invalid or has already been used.",
            })),
        )
            .into_response();
    };

    if record.expires_at <= Utc::now() {
        if let Err(err) = delete_verification_by_hash(&pool, &token_hash).await {
            error!("Failed to delete expired verification record: {err}");
        }
        return (
            StatusCode::GONE,
            Json(json!({
                "success": false,
                "message": "Verification link has expired. Please request a new one.",
                "email": record.email,
            })),
        )
            .into_response();
    }

    if let Err(err) = mark_verification_verified(&pool, &token_hash).await {
        error!("Failed to mark email verified: {err}");
        return server_error("Verification failed");
    }

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Email verified. You can now continue your registration.",
            "email": record.email,
        })),
    )
        .into_response()
}

/// Polling endpoint for the registration form.
#[utoipa::path(
    post,
    path = "/email/check-verified",
    request_body = CheckVerifiedRequest,
    responses(
        (status = 200, description = "Verification status", body = CheckVerifiedResponse)
    ),
    tag = "email"
)]
pub async fn check_verified(
    pool: Extension<PgPool>,
    payload: Option<Json<CheckVerifiedRequest>>,
) -> impl IntoResponse {
    let request: CheckVerifiedRequest = match payload {
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
        return (StatusCode::OK, Json(CheckVerifiedResponse { verified: false })).into_response();
    }

    match is_email_verified(&pool, &email).await {
        Ok(verified) => (StatusCode::OK, Json(CheckVerifiedResponse { verified })).into_response(),
        Err(err) => {
            error!("Failed to check verification status: {err}");
            server_error("Could not check verification status")
        }
    }
}

/// Web registration: requires a verified record for the address and creates
/// the account already active.
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created and active"),
        (status = 422, description = "Validation failed or email unverified")
    ),
    tag = "auth"
)]
pub async fn web_register(
    pool: Extension<PgPool>,
    payload: Option<Json<RegisterRequest>>,
) -> impl IntoResponse {
    let request: RegisterRequest = match payload {
        Some(Json(payload)) => payload,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "message": "Missing payload"})),
            )
                .into_response();
        }
    };

    let errors = validate_registration(&request);
    if !errors.is_empty() {
        return validation_failed(errors);
    }

    let email = normalize_email(&request.email);
    let Some(role) = Role::parse(&request.role) else {
        return validation_failed(std::collections::BTreeMap::new());
    };

    // The funnel invariant: no verified record, no account.
    match is_email_verified(&pool, &email).await {
        Ok(true) => {}
        Ok(false) => {
            let mut errors = std::collections::BTreeMap::new();
            errors.insert(
                "email",
                vec!["Please verify your email address first.".to_string()],
            );
            return validation_failed(errors);
        }
        Err(err) => {
            error!("Failed to check verification status: {err}");
            return server_error("Registration failed");
        }
    }

    let password_hash = match hash_password(&request.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to hash password: {err}");
            return server_error("Registration failed");
        }
    };

    let first_name = request.first_name.trim();
    let last_name = request.last_name.trim();
    let new_user = NewActiveUser {
        first_name,
        last_name,
        email: &email,
        password_hash: &password_hash,
        role,
        email_verified: true,
        google_id: None,
        profile_picture: None,
    };

    match create_active_user(&pool, &new_user).await {
        Ok(SignupOutcome::Created(user_id)) => (
            StatusCode::CREATED,
            Json(json!({
                "success": true,
                "message": "Registration successful. You can now log in.",
                "redirect": "/login",
                "user": {
                    "id": user_id,
                    "name": format!("{first_name} {last_name}"),
                    "email": email,
                    "role": role,
                    "is_active": true,
                    "email_verified": true,
                },
            })),
        )
            .into_response(),
        Ok(SignupOutcome::Conflict) => email_taken(),
        Err(err) => {
            error!("Failed to create account: {err}");
            server_error("Registration failed")
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
    async fn verification_link_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = verification_link(Extension(pool), Extension(auth_state()), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn verification_link_rejects_disposable_domain() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = verification_link(
            Extension(pool),
            Extension(auth_state()),
            Some(Json(VerificationLinkRequest {
                email: "alice@yopmail.com".to_string(),
                first_name: "Alice".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        Ok(())
    }

    #[tokio::test]
    async fn verify_email_empty_token() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = verify_email(Extension(pool), Path(" ".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn check_verified_malformed_email_is_false() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = check_verified(
            Extension(pool),
            Some(Json(CheckVerifiedRequest {
                email: "not-an-email".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }

    fn register_request(email: &str) -> RegisterRequest {
        RegisterRequest {
            first_name: "Alice".to_string(),
            last_name: "Doe".to_string(),
            email: email.to_string(),
            password: "password123".to_string(),
            password_confirmation: "password123".to_string(),
            role: "student".to_string(),
        }
    }

    #[sqlx::test]
    async fn web_register_rejects_unverified_address(pool: PgPool) -> Result<()> {
        let response = web_register(
            Extension(pool.clone()),
            Some(Json(register_request("alice@example.com"))),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let accounts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE email = $1")
            .bind("alice@example.com")
            .fetch_one(&pool)
            .await?;
        assert_eq!(accounts, 0);
        Ok(())
    }

    #[sqlx::test]
    async fn web_register_consumes_verified_record_into_active_account(
        pool: PgPool,
    ) -> Result<()> {
        use sqlx::Row;

        let token_hash = hash_token("raw-token");
        sqlx::query(
            "INSERT INTO email_verifications (email, token_hash, verified, expires_at)
             VALUES ($1, $2, TRUE, NOW() + INTERVAL '30 minutes')",
        )
        .bind("alice@example.com")
        .bind(&token_hash)
        .execute(&pool)
        .await?;

        let response = web_register(
            Extension(pool.clone()),
            Some(Json(register_request("alice@example.com"))),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);

        let row = sqlx::query(
            "SELECT is_active, email_verified_at IS NOT NULL AS verified
             FROM users WHERE email = $1",
        )
        .bind("alice@example.com")
        .fetch_one(&pool)
        .await?;
        assert!(row.get::<bool, _>("is_active"));
        assert!(row.get::<bool, _>("verified"));

        // The verification record goes away with the account creation.
        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM email_verifications WHERE email = $1")
                .bind("alice@example.com")
                .fetch_one(&pool)
                .await?;
        assert_eq!(remaining, 0);
        Ok(())
    }

    #[tokio::test]
    async fn web_register_validation_fails_before_db() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = web_register(
            Extension(pool),
            Some(Json(RegisterRequest {
                first_name: "Alice".to_string(),
                last_name: "Doe".to_string(),
                email: "alice@example.com".to_string(),
                password: "short".to_string(),
                password_confirmation: "short".to_string(),
                role: "student".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        Ok(())
    }
}
