use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Router,
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath},
    http::{
        HeaderName, HeaderValue, Method, Request,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    middleware as axum_middleware,
    routing::{get, post},
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use url::Url;

use crate::api::handlers::auth;

pub mod email;
pub mod handlers;
pub mod middleware;
mod openapi;
pub mod push;
pub mod uploads;

pub use openapi::openapi;

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(
    port: u16,
    dsn: String,
    auth_config: auth::AuthConfig,
    email_config: email::EmailWorkerConfig,
    push_config: push::PushConfig,
    upload_config: uploads::UploadConfig,
) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    let frontend_origin = frontend_origin(auth_config.frontend_base_url())?;
    let auth_state = Arc::new(auth::AuthState::new(auth_config));
    let push_state = Arc::new(push::PushState::new(
        push_config,
        Arc::new(push::LogPushSender),
    ));
    let upload_config = Arc::new(upload_config);

    // Background worker polls email_outbox (DB-backed queue) for pending rows,
    // delivers/logs them, and retries failures with exponential backoff.
    email::spawn_outbox_worker(pool.clone(), Arc::new(email::LogEmailSender), email_config);

    let cors = CorsLayer::new()
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static("x-resource-version"),
            HeaderName::from_static("x-resource-table"),
            HeaderName::from_static("x-resource-id"),
        ])
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_origin(AllowOrigin::exact(frontend_origin))
        .allow_credentials(true);

    let public = Router::new()
        .route(
            "/health",
            get(handlers::health::health).options(handlers::health::health),
        )
        .route("/openapi.json", get(openapi::json_spec))
        // Token-based API surface.
        .route("/api/auth/register", post(auth::register::register))
        .route("/api/auth/login", post(auth::login::login))
        .route("/activate/:token", get(auth::activation::activate))
        .route("/activate/resend", post(auth::activation::resend_activation))
        // Cookie-based web surface.
        .route("/auth/login", post(auth::session::web_login))
        .route("/auth/logout", post(auth::session::web_logout))
        .route("/auth/register", post(auth::verification::web_register))
        .route(
            "/email/verification-link",
            post(auth::verification::verification_link),
        )
        .route("/email/verify/:token", get(auth::verification::verify_email))
        .route(
            "/email/check-verified",
            post(auth::verification::check_verified),
        )
        // Google sign-in bridge.
        .route("/auth/google/redirect", get(auth::oauth::google_redirect))
        .route(
            "/auth/google/redirect/:role",
            get(auth::oauth::google_redirect_with_role),
        )
        .route("/auth/google/callback", get(auth::oauth::google_callback))
        .route("/auth/google/complete", post(auth::oauth::google_complete));

    let guarded = Router::new()
        .route("/api/auth/me", get(auth::login::me))
        .route("/api/auth/refresh", post(auth::login::refresh))
        .route("/api/auth/logout", post(auth::session::web_logout))
        .route("/api/notifications", get(handlers::notifications::list))
        .route(
            "/api/notifications/:id/read",
            post(handlers::notifications::mark_read),
        )
        .route(
            "/api/notifications/read-all",
            post(handlers::notifications::mark_all_read),
        )
        .route("/api/push/public-key", get(handlers::push::public_key))
        .route("/api/push/subscribe", post(handlers::push::subscribe))
        .route("/api/push/unsubscribe", post(handlers::push::unsubscribe))
        .route("/api/push/test", post(handlers::push::send_test))
        .route("/api/files/upload", post(handlers::uploads::upload))
        .route(
            "/api/files/upload-multiple",
            post(handlers::uploads::upload_multiple),
        )
        .route("/api/files/config", get(handlers::uploads::upload_config))
        .route("/api/files", get(handlers::uploads::list))
        .route(
            "/api/files/:id",
            get(handlers::uploads::get).delete(handlers::uploads::delete),
        )
        .route_layer(axum_middleware::from_fn(middleware::require_auth));

    let app = public
        .merge(guarded)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(auth_state))
                .layer(Extension(push_state))
                .layer(Extension(upload_config))
                .layer(Extension(pool))
                .layer(axum_middleware::from_fn(middleware::version_guard)),
        )
        // Video uploads can reach 100 MB; leave headroom for multipart framing.
        .layer(DefaultBodyLimit::max(110 * 1024 * 1024));

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
    let host = parsed.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontend_origin_strips_path_and_keeps_port() -> Result<()> {
        let origin = frontend_origin("http://localhost:5173/app/")?;
        assert_eq!(origin, HeaderValue::from_static("http://localhost:5173"));

        let origin = frontend_origin("https://elevategs.example/dashboard")?;
        assert_eq!(origin, HeaderValue::from_static("https://elevategs.example"));
        Ok(())
    }

    #[test]
    fn frontend_origin_rejects_garbage() {
        assert!(frontend_origin("not a url").is_err());
        assert!(frontend_origin("mailto:team@elevategs.example").is_err());
    }
}
