//! Google sign-in bridge.
//!
//! The round trip is guarded by a transient `state` nonce; new users who
//! arrive without a role are parked behind a short-lived selection cookie
//! until they pick one. Provider failures are never retried, they degrade to
//! a login-page redirect with a human-readable message.

use anyhow::{Context, Result};
use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::{HeaderMap, HeaderValue, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Redirect, Response},
};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use super::session::{cookie_value, start_session};
use super::state::{AuthState, GoogleConfig, GoogleProfile};
use super::storage::{
    NewActiveUser, SignupOutcome, backfill_google_profile, create_active_user, find_user_by_email,
};
use super::types::{CompleteGoogleRequest, Role};
use super::utils::{generate_token, normalize_email, random_password_placeholder};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

const SELECTION_COOKIE_NAME: &str = "elevategs_oauth_selection";
const SELECTION_COOKIE_MAX_AGE: u32 = 600;

const MSG_SESSION_EXPIRED: &str = "Authentication session expired. Please try again.";
const MSG_PROVIDER_ERROR: &str = "Unable to sign in with Google. Please try again later.";
const MSG_ALREADY_REGISTERED: &str =
    "This email is already registered. Please use the login page instead.";

/// Build a frontend redirect with optional flash-style query params.
fn frontend_redirect(auth_state: &AuthState, path: &str, params: &[(&str, &str)]) -> Redirect {
    let base = auth_state.config().frontend_base_url().trim_end_matches('/');
    let raw = format!("{base}{path}");
    match url::Url::parse(&raw) {
        Ok(mut parsed) => {
            if !params.is_empty() {
                let mut pairs = parsed.query_pairs_mut();
                for (key, value) in params {
                    pairs.append_pair(key, value);
                }
            }
            Redirect::to(parsed.as_str())
        }
        Err(_) => Redirect::to(&raw),
    }
}

fn login_redirect(auth_state: &AuthState, message: &str) -> Redirect {
    frontend_redirect(auth_state, "/login", &[("error", message)])
}

/// Start the Google round trip without a pre-selected role (login entry).
#[utoipa::path(
    get,
    path = "/auth/google/redirect",
    responses(
        (status = 303, description = "Redirect to Google")
    ),
    tag = "oauth"
)]
pub async fn google_redirect(auth_state: Extension<Arc<AuthState>>) -> impl IntoResponse {
    begin_google_flow(&auth_state, None).await
}

/// Start the Google round trip from the registration page with a role already
/// chosen.
#[utoipa::path(
    get,
    path = "/auth/google/redirect/{role}",
    params(
        ("role" = String, Path, description = "Pre-selected role: teacher or student")
    ),
    responses(
        (status = 303, description = "Redirect to Google"),
        (status = 404, description = "Unknown role")
    ),
    tag = "oauth"
)]
pub async fn google_redirect_with_role(
    auth_state: Extension<Arc<AuthState>>,
    Path(role): Path<String>,
) -> Response {
    match Role::parse(&role) {
        Some(role) if role.self_assignable() => {
            begin_google_flow(&auth_state, Some(role)).await.into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn begin_google_flow(auth_state: &AuthState, role: Option<Role>) -> Response {
    let Some(google) = auth_state.config().google() else {
        return login_redirect(
            auth_state,
            "Google sign-in is not configured. Please use your email and password.",
        )
        .into_response();
    };

    let state_nonce = match generate_token() {
        Ok(nonce) => nonce,
        Err(err) => {
            error!("Failed to generate oauth state: {err}");
            return login_redirect(auth_state, MSG_PROVIDER_ERROR).into_response();
        }
    };
    auth_state.oauth().store_round(state_nonce.clone(), role).await;

    match authorization_url(google, &state_nonce) {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(err) => {
            error!("Failed to build authorization url: {err}");
            login_redirect(auth_state, MSG_PROVIDER_ERROR).into_response()
        }
    }
}

fn authorization_url(google: &GoogleConfig, state_nonce: &str) -> Result<String> {
    let mut url = url::Url::parse(GOOGLE_AUTH_URL).context("invalid authorization endpoint")?;
    url.query_pairs_mut()
        .append_pair("client_id", &google.client_id)
        .append_pair("redirect_uri", &google.redirect_url)
        .append_pair("response_type", "code")
        .append_pair("scope", "openid email profile")
        .append_pair("state", state_nonce);
    Ok(url.into())
}

#[derive(Deserialize, Debug)]
pub struct CallbackQuery {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct GoogleUserInfo {
    sub: String,
    email: String,
    #[serde(default)]
    given_name: String,
    #[serde(default)]
    family_name: String,
    #[serde(default)]
    name: String,
    picture: Option<String>,
}

async fn fetch_profile(
    auth_state: &AuthState,
    google: &GoogleConfig,
    code: &str,
) -> Result<GoogleProfile> {
    let token: GoogleTokenResponse = auth_state
        .http()
        .post(GOOGLE_TOKEN_URL)
        .form(&[
            ("code", code),
            ("client_id", &google.client_id),
            ("client_secret", google.client_secret.expose_secret()),
            ("redirect_uri", &google.redirect_url),
            ("grant_type", "authorization_code"),
        ])
        .send()
        .await
        .context("token exchange request failed")?
        .error_for_status()
        .context("token exchange rejected")?
        .json()
        .await
        .context("malformed token response")?;

    let info: GoogleUserInfo = auth_state
        .http()
        .get(GOOGLE_USERINFO_URL)
        .bearer_auth(&token.access_token)
        .send()
        .await
        .context("userinfo request failed")?
        .error_for_status()
        .context("userinfo rejected")?
        .json()
        .await
        .context("malformed userinfo response")?;

    let email = normalize_email(&info.email);
    let name = if info.name.trim().is_empty() {
        format!("{} {}", info.given_name, info.family_name)
            .trim()
            .to_string()
    } else {
        info.name
    };
    Ok(GoogleProfile {
        google_id: info.sub,
        email,
        first_name: info.given_name,
        last_name: info.family_name,
        name,
        picture: info.picture,
    })
}

/// Google redirects back here with `code` and our `state` nonce.
#[utoipa::path(
    get,
    path = "/auth/google/callback",
    responses(
        (status = 303, description = "Redirect into the app or back to login")
    ),
    tag = "oauth"
)]
pub async fn google_callback(
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(google) = auth_state.config().google().cloned() else {
        return login_redirect(&auth_state, MSG_PROVIDER_ERROR).into_response();
    };

    // The nonce is single use; a miss means replay, expiry, or forgery.
    let round = match &query.state {
        Some(state_nonce) => auth_state.oauth().take_round(state_nonce).await,
        None => None,
    };
    let Some(round) = round else {
        return login_redirect(&auth_state, MSG_SESSION_EXPIRED).into_response();
    };

    if let Some(provider_error) = &query.error {
        warn!("Google sign-in returned an error: {provider_error}");
        return login_redirect(&auth_state, MSG_PROVIDER_ERROR).into_response();
    }
    let Some(code) = query.code.as_deref() else {
        return login_redirect(&auth_state, MSG_PROVIDER_ERROR).into_response();
    };

    let profile = match fetch_profile(&auth_state, &google, code).await {
        Ok(profile) => profile,
        Err(err) => {
            error!("Google profile fetch failed: {err:#}");
            return login_redirect(&auth_state, MSG_PROVIDER_ERROR).into_response();
        }
    };

    let existing = match find_user_by_email(&pool, &profile.email).await {
        Ok(existing) => existing,
        Err(err) => {
            error!("Failed to lookup account for google callback: {err}");
            return login_redirect(&auth_state, MSG_PROVIDER_ERROR).into_response();
        }
    };

    if let Some(user) = existing {
        // A pre-chosen role means the flow started on the registration page.
        if round.role.is_some() {
            return frontend_redirect(
                &auth_state,
                "/register",
                &[("error", MSG_ALREADY_REGISTERED)],
            )
            .into_response();
        }

        if user.google_id.is_none() || user.profile_picture.is_none() {
            if let Err(err) = backfill_google_profile(&pool, user.id, &profile).await {
                error!("Failed to backfill google profile: {err}");
            }
        }

        return match start_session(&pool, &auth_state, user.id).await {
            Ok(cookie) => {
                let mut headers = HeaderMap::new();
                headers.insert(SET_COOKIE, cookie);
                let target = if user.email_verified_at.is_some() {
                    user.role.dashboard_path()
                } else {
                    "/email/verification-notice"
                };
                (headers, frontend_redirect(&auth_state, target, &[])).into_response()
            }
            Err(err) => {
                error!("Failed to create session after google login: {err}");
                login_redirect(&auth_state, MSG_PROVIDER_ERROR).into_response()
            }
        };
    }

    match round.role {
        Some(role) => create_google_account(&pool, &auth_state, profile, role)
            .await
            .into_response(),
        None => {
            // Park the profile until the user picks a role.
            let selection_id = auth_state.oauth().store_selection(profile).await;
            let mut headers = HeaderMap::new();
            match selection_cookie(&auth_state, selection_id) {
                Ok(cookie) => {
                    headers.insert(SET_COOKIE, cookie);
                }
                Err(err) => {
                    error!("Failed to build selection cookie: {err}");
                    return login_redirect(&auth_state, MSG_PROVIDER_ERROR).into_response();
                }
            }
            (
                headers,
                frontend_redirect(&auth_state, "/register/select-role", &[]),
            )
                .into_response()
        }
    }
}

/// Create the local account for a Google profile. The password placeholder is
/// random and unusable; the email starts unverified.
async fn create_google_account(
    pool: &PgPool,
    auth_state: &AuthState,
    profile: GoogleProfile,
    role: Role,
) -> Response {
    let password_hash = match random_password_placeholder() {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to generate placeholder password: {err}");
            return login_redirect(auth_state, MSG_PROVIDER_ERROR).into_response();
        }
    };

    let new_user = NewActiveUser {
        first_name: &profile.first_name,
        last_name: &profile.last_name,
        email: &profile.email,
        password_hash: &password_hash,
        role,
        email_verified: false,
        google_id: Some(&profile.google_id),
        profile_picture: profile.picture.as_deref(),
    };

    match create_active_user(pool, &new_user).await {
        Ok(SignupOutcome::Created(user_id)) => {
            match start_session(pool, auth_state, user_id).await {
                Ok(cookie) => {
                    let mut headers = HeaderMap::new();
                    headers.insert(SET_COOKIE, cookie);
                    (
                        headers,
                        frontend_redirect(auth_state, "/email/verification-notice", &[]),
                    )
                        .into_response()
                }
                Err(err) => {
                    error!("Failed to create session for new google account: {err}");
                    login_redirect(auth_state, MSG_PROVIDER_ERROR).into_response()
                }
            }
        }
        Ok(SignupOutcome::Conflict) => {
            frontend_redirect(auth_state, "/register", &[("error", MSG_ALREADY_REGISTERED)])
                .into_response()
        }
        Err(err) => {
            error!("Failed to create google account: {err}");
            login_redirect(auth_state, MSG_PROVIDER_ERROR).into_response()
        }
    }
}

fn selection_cookie(
    auth_state: &AuthState,
    selection_id: Uuid,
) -> Result<HeaderValue, axum::http::header::InvalidHeaderValue> {
    let secure = auth_state.config().session_cookie_secure();
    let mut cookie = format!(
        "{SELECTION_COOKIE_NAME}={selection_id}; Path=/; HttpOnly; SameSite=Lax; Max-Age={SELECTION_COOKIE_MAX_AGE}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

fn clear_selection_cookie(
    auth_state: &AuthState,
) -> Result<HeaderValue, axum::http::header::InvalidHeaderValue> {
    let secure = auth_state.config().session_cookie_secure();
    let mut cookie =
        format!("{SELECTION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// Role submission for a parked Google profile.
#[utoipa::path(
    post,
    path = "/auth/google/complete",
    request_body = CompleteGoogleRequest,
    responses(
        (status = 200, description = "Account created, session started"),
        (status = 409, description = "Email already registered"),
        (status = 410, description = "Selection expired"),
        (status = 422, description = "Invalid role")
    ),
    tag = "oauth"
)]
pub async fn google_complete(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<CompleteGoogleRequest>>,
) -> Response {
    let request: CompleteGoogleRequest = match payload {
        Some(Json(payload)) => payload,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "message": "Missing payload"})),
            )
                .into_response();
        }
    };

    let role = match Role::parse(&request.role) {
        Some(role) if role.self_assignable() => role,
        _ => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "success": false,
                    "message": "The given data was invalid.",
                    "errors": {"role": ["The selected role is invalid."]},
                })),
            )
                .into_response();
        }
    };

    let selection_id = cookie_value(&headers, SELECTION_COOKIE_NAME)
        .and_then(|value| Uuid::parse_str(&value).ok());
    let profile = match selection_id {
        Some(id) => auth_state.oauth().take_selection(id).await,
        None => None,
    };
    let Some(profile) = profile else {
        return (
            StatusCode::GONE,
            Json(json!({
                "success": false,
                "message": "Session expired. Please try again.",
                "redirect": "/login",
            })),
        )
            .into_response();
    };

    let password_hash = match random_password_placeholder() {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to generate placeholder password: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": "Sign-in failed"})),
            )
                .into_response();
        }
    };

    let new_user = NewActiveUser {
        first_name: &profile.first_name,
        last_name: &profile.last_name,
        email: &profile.email,
        password_hash: &password_hash,
        role,
        email_verified: false,
        google_id: Some(&profile.google_id),
        profile_picture: profile.picture.as_deref(),
    };

    match create_active_user(&pool, &new_user).await {
        Ok(SignupOutcome::Created(user_id)) => {
            match start_session(&pool, &auth_state, user_id).await {
                Ok(session_cookie) => {
                    let mut response_headers = HeaderMap::new();
                    response_headers.append(SET_COOKIE, session_cookie);
                    if let Ok(cleared) = clear_selection_cookie(&auth_state) {
                        response_headers.append(SET_COOKIE, cleared);
                    }
                    (
                        StatusCode::OK,
                        response_headers,
                        Json(json!({
                            "success": true,
                            "redirect": "/email/verification-notice",
                        })),
                    )
                        .into_response()
                }
                Err(err) => {
                    error!("Failed to create session: {err}");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"success": false, "message": "Sign-in failed"})),
                    )
                        .into_response()
                }
            }
        }
        Ok(SignupOutcome::Conflict) => (
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "message": MSG_ALREADY_REGISTERED,
            })),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to create google account: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": "Sign-in failed"})),
            )
                .into_response()
        }
    }
}
