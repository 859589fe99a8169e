use crate::api::handlers::{auth, health, notifications, push, uploads};
use utoipa::OpenApi;
use utoipa::openapi::{Contact, InfoBuilder, License, Tag};

/// Documented routes. Add new endpoints here so the generated spec stays in
/// sync with the router in `api/mod.rs`.
#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        auth::register::register,
        auth::activation::activate,
        auth::activation::resend_activation,
        auth::login::login,
        auth::login::me,
        auth::login::refresh,
        auth::session::web_login,
        auth::session::web_logout,
        auth::verification::verification_link,
        auth::verification::verify_email,
        auth::verification::check_verified,
        auth::verification::web_register,
        auth::oauth::google_redirect,
        auth::oauth::google_redirect_with_role,
        auth::oauth::google_callback,
        auth::oauth::google_complete,
        notifications::list,
        notifications::mark_read,
        notifications::mark_all_read,
        push::public_key,
        push::subscribe,
        push::unsubscribe,
        push::send_test,
        uploads::upload,
        uploads::upload_multiple,
        uploads::upload_config,
        uploads::list,
        uploads::get,
        uploads::delete,
    ),
    components(schemas(
        health::Health,
        auth::types::Role,
        auth::types::UserResponse,
        auth::types::RegisterRequest,
        auth::types::LoginRequest,
        auth::types::LoginResponse,
        auth::types::ResendActivationRequest,
        auth::types::VerificationLinkRequest,
        auth::types::CheckVerifiedRequest,
        auth::types::CheckVerifiedResponse,
        auth::types::CompleteGoogleRequest,
        notifications::Notification,
        push::SubscriptionKeys,
        push::SubscribeRequest,
        push::UnsubscribeRequest,
        uploads::FileUploadResponse,
    ))
)]
struct ApiDoc;

/// Serve the generated document, mounted at `/openapi.json`.
pub async fn json_spec() -> axum::Json<utoipa::openapi::OpenApi> {
    axum::Json(openapi())
}

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let mut spec = ApiDoc::openapi();

    // Use Cargo.toml metadata instead of the derive defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();
    info.contact = cargo_contact();
    info.license = cargo_license();
    spec.info = info;

    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Registration, activation, login, and Google sign-in".to_string());
    let mut email_tag = Tag::new("email");
    email_tag.description = Some("Pre-registration email verification".to_string());
    let mut push_tag = Tag::new("push");
    push_tag.description = Some("Web-push subscriptions".to_string());
    let mut notifications_tag = Tag::new("notifications");
    notifications_tag.description = Some("In-app notifications".to_string());
    let mut files_tag = Tag::new("files");
    files_tag.description = Some("Validated file attachments".to_string());
    let mut health_tag = Tag::new("health");
    health_tag.description = Some("Service and database health".to_string());
    spec.tags = Some(vec![
        auth_tag,
        email_tag,
        push_tag,
        notifications_tag,
        files_tag,
        health_tag,
    ]);

    spec
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(';').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    if let Some(start) = author.find('<') {
        let name = author[..start].trim();
        let email = author[start + 1..].trim_end_matches('>').trim();
        let name = if name.is_empty() { None } else { Some(name) };
        let email = if email.is_empty() { None } else { Some(email) };
        (name, email)
    } else {
        let name = author.trim();
        (if name.is_empty() { None } else { Some(name) }, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_info_from_cargo() {
        let spec = openapi();
        assert_eq!(spec.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(
            spec.info.description.as_deref(),
            Some(env!("CARGO_PKG_DESCRIPTION"))
        );

        let contact = spec.info.contact;
        assert!(contact.is_some());
        if let Some(contact) = contact {
            assert_eq!(contact.name.as_deref(), Some("ElevateGS Team"));
            assert_eq!(contact.email, None);
        }

        let license = spec.info.license;
        assert!(license.is_some());
        if let Some(license) = license {
            assert_eq!(license.name, "BSD-3-Clause");
            assert_eq!(license.identifier.as_deref(), Some("BSD-3-Clause"));
        }
    }

    #[test]
    fn openapi_covers_both_login_surfaces() {
        let spec = openapi();
        assert!(spec.paths.paths.contains_key("/api/auth/login"));
        assert!(spec.paths.paths.contains_key("/auth/login"));
        assert!(spec.paths.paths.contains_key("/activate/{token}"));
        assert!(spec.paths.paths.contains_key("/api/push/subscribe"));
        assert!(spec.paths.paths.contains_key("/api/files/upload"));
    }

    #[tokio::test]
    async fn json_spec_serves_document() {
        use axum::response::IntoResponse;

        let response = json_spec().await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value["paths"]["/health"].is_object());
        assert_eq!(value["info"]["title"], env!("CARGO_PKG_NAME"));
    }

    #[test]
    fn openapi_tags_present() {
        let spec = openapi();
        let tags = spec.tags.clone().unwrap_or_default();
        assert!(tags.iter().any(|tag| tag.name == "auth"));
        assert!(tags.iter().any(|tag| tag.name == "files"));
    }
}
