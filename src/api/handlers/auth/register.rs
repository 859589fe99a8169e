//! API registration funnel: creates an inactive account and emails an
//! activation link.

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use serde_json::json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

use super::state::AuthState;
use super::storage::{NewPendingUser, SignupOutcome, create_pending_user};
use super::tokens::issue_token;
use super::types::{RegisterRequest, Role, UserResponse};
use super::utils::{hash_password, is_disposable_email, normalize_email, valid_email};

const MAX_NAME_LEN: usize = 255;
const MIN_PASSWORD_LEN: usize = 8;

/// Field-level validation shared by both registration funnels.
pub(super) fn validate_registration(
    request: &RegisterRequest,
) -> BTreeMap<&'static str, Vec<String>> {
    let mut errors: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();

    if request.first_name.trim().is_empty() {
        errors.insert(
            "first_name",
            vec!["The first name field is required.".to_string()],
        );
    } else if request.first_name.len() > MAX_NAME_LEN {
        errors.insert(
            "first_name",
            vec!["The first name may not be greater than 255 characters.".to_string()],
        );
    }

    if request.last_name.trim().is_empty() {
        errors.insert(
            "last_name",
            vec!["The last name field is required.".to_string()],
        );
    } else if request.last_name.len() > MAX_NAME_LEN {
        errors.insert(
            "last_name",
            vec!["The last name may not be greater than 255 characters.".to_string()],
        );
    }

    let email = normalize_email(&request.email);
    if email.is_empty() {
        errors.insert("email", vec!["The email field is required.".to_string()]);
    } else if !valid_email(&email) || email.len() > MAX_NAME_LEN {
        errors.insert(
            "email",
            vec!["The email must be a valid email address.".to_string()],
        );
    } else if is_disposable_email(&email) {
        errors.insert(
            "email",
            vec!["Disposable email addresses are not allowed.".to_string()],
        );
    }

    if request.password.len() < MIN_PASSWORD_LEN {
        errors.insert(
            "password",
            vec!["The password must be at least 8 characters.".to_string()],
        );
    } else if request.password != request.password_confirmation {
        errors.insert(
            "password",
            vec!["The password confirmation does not match.".to_string()],
        );
    }

    match Role::parse(&request.role) {
        Some(role) if role.self_assignable() => {}
        _ => {
            errors.insert("role", vec!["The selected role is invalid.".to_string()]);
        }
    }

    errors
}

pub(super) fn validation_failed(errors: BTreeMap<&'static str, Vec<String>>) -> axum::response::Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({
            "success": false,
            "message": "The given data was invalid.",
            "errors": errors,
        })),
    )
        .into_response()
}

pub(super) fn email_taken() -> axum::response::Response {
    let mut errors: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    errors.insert("email", vec!["The email has already been taken.".to_string()]);
    validation_failed(errors)
}

#[utoipa::path(
    post,
    path = "/api/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created, activation email queued"),
        (status = 422, description = "Validation failed")
    ),
    tag = "auth"
)]
pub async fn register(
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
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
    // validate_registration already guaranteed a self-assignable role
    let Some(role) = Role::parse(&request.role) else {
        return validation_failed(BTreeMap::new());
    };

    let password_hash = match hash_password(&request.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to hash password: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": "Registration failed"})),
            )
                .into_response();
        }
    };

    let token = match issue_token(auth_state.config().activation_token_ttl_seconds()) {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to issue activation token: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": "Registration failed"})),
            )
                .into_response();
        }
    };

    let first_name = request.first_name.trim();
    let last_name = request.last_name.trim();
    let new_user = NewPendingUser {
        first_name,
        last_name,
        email: &email,
        password_hash: &password_hash,
        role,
    };

    match create_pending_user(&pool, &new_user, &token, auth_state.config()).await {
        Ok(SignupOutcome::Created(user_id)) => {
            let user = UserResponse {
                id: user_id,
                first_name: first_name.to_string(),
                last_name: last_name.to_string(),
                name: format!("{first_name} {last_name}"),
                email,
                role,
                is_active: false,
                email_verified: false,
                profile_picture: None,
            };
            (
                StatusCode::CREATED,
                Json(json!({
                    "success": true,
                    "message": "Registration successful. Please check your email to activate your account.",
                    "user": user,
                })),
            )
                .into_response()
        }
        Ok(SignupOutcome::Conflict) => email_taken(),
        Err(err) => {
            error!("Failed to register user: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": "Registration failed"})),
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

    fn valid_request() -> RegisterRequest {
        RegisterRequest {
            first_name: "Alice".to_string(),
            last_name: "Doe".to_string(),
            email: "alice@example.com".to_string(),
            password: "password123".to_string(),
            password_confirmation: "password123".to_string(),
            role: "teacher".to_string(),
        }
    }

    #[test]
    fn valid_request_passes_validation() {
        assert!(validate_registration(&valid_request()).is_empty());
    }

    #[test]
    fn missing_names_reported_per_field() {
        let mut request = valid_request();
        request.first_name = "  ".to_string();
        request.last_name = String::new();
        let errors = validate_registration(&request);
        assert!(errors.contains_key("first_name"));
        assert!(errors.contains_key("last_name"));
    }

    #[test]
    fn disposable_email_rejected() {
        let mut request = valid_request();
        request.email = "alice@mailinator.com".to_string();
        let errors = validate_registration(&request);
        assert_eq!(
            errors.get("email").map(|msgs| msgs[0].as_str()),
            Some("Disposable email addresses are not allowed.")
        );
    }

    #[test]
    fn short_password_rejected() {
        let mut request = valid_request();
        request.password = "short".to_string();
        request.password_confirmation = "short".to_string();
        assert!(validate_registration(&request).contains_key("password"));
    }

    #[test]
    fn mismatched_confirmation_rejected() {
        let mut request = valid_request();
        request.password_confirmation = "different-password".to_string();
        assert!(validate_registration(&request).contains_key("password"));
    }

    #[test]
    fn admin_role_not_self_assignable() {
        let mut request = valid_request();
        request.role = "admin".to_string();
        assert!(validate_registration(&request).contains_key("role"));
    }

    #[test]
    fn unknown_role_rejected() {
        let mut request = valid_request();
        request.role = "principal".to_string();
        assert!(validate_registration(&request).contains_key("role"));
    }

    #[tokio::test]
    async fn register_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = register(Extension(pool), Extension(auth_state()), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn register_validation_fails_before_db() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let mut request = valid_request();
        request.role = "admin".to_string();
        let response = register(
            Extension(pool),
            Extension(auth_state()),
            Some(Json(request)),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        Ok(())
    }
}
