//! Web-push subscription endpoints. All routes sit behind the dual guard, so
//! the caller is always a known user.

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{Instrument, error, info_span, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::middleware::AuthContext;
use crate::api::push::{PushPayload, PushState, PushTarget};

#[derive(Deserialize, Serialize, Debug, ToSchema)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

#[derive(Deserialize, Serialize, Debug, ToSchema)]
pub struct SubscribeRequest {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
    #[serde(default, rename = "contentEncoding")]
    pub content_encoding: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, ToSchema)]
pub struct UnsubscribeRequest {
    pub endpoint: String,
}

fn missing_payload() -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "message": "Missing payload"})),
    )
        .into_response()
}

fn server_error(message: &str) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "message": message})),
    )
        .into_response()
}

/// Expose the VAPID public key so browsers can create a subscription.
#[utoipa::path(
    get,
    path = "/api/push/public-key",
    responses(
        (status = 200, description = "VAPID public key"),
        (status = 404, description = "Push is not configured")
    ),
    tag = "push"
)]
pub async fn public_key(push_state: Extension<Arc<PushState>>) -> impl IntoResponse {
    match push_state.config().public_key() {
        Some(key) => (StatusCode::OK, Json(json!({"publicKey": key}))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "message": "Push notifications are not configured.",
            })),
        )
            .into_response(),
    }
}

/// Store or refresh the caller's subscription for one browser endpoint.
#[utoipa::path(
    post,
    path = "/api/push/subscribe",
    request_body = SubscribeRequest,
    responses(
        (status = 200, description = "Subscription stored"),
        (status = 422, description = "Validation failed")
    ),
    tag = "push"
)]
pub async fn subscribe(
    pool: Extension<PgPool>,
    auth: Extension<AuthContext>,
    payload: Option<Json<SubscribeRequest>>,
) -> impl IntoResponse {
    let request: SubscribeRequest = match payload {
        Some(Json(payload)) => payload,
        None => return missing_payload(),
    };

    let endpoint = request.endpoint.trim();
    let p256dh = request.keys.p256dh.trim();
    let auth_key = request.keys.auth.trim();
    if endpoint.is_empty() || p256dh.is_empty() || auth_key.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "success": false,
                "message": "The given data was invalid.",
                "errors": {
                    "subscription": ["The endpoint and keys fields are required."],
                },
            })),
        )
            .into_response();
    }
    let content_encoding = request
        .content_encoding
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("aesgcm");

    let query = r"
        INSERT INTO push_subscriptions (user_id, endpoint, p256dh_key, auth_key, content_encoding)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (user_id, endpoint) DO UPDATE
        SET p256dh_key = EXCLUDED.p256dh_key,
            auth_key = EXCLUDED.auth_key,
            content_encoding = EXCLUDED.content_encoding,
            updated_at = NOW()
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(auth.user.id)
        .bind(endpoint)
        .bind(p256dh)
        .bind(auth_key)
        .bind(content_encoding)
        .execute(&pool.0)
        .instrument(span)
        .await;

    match result {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({"success": true, "message": "Subscribed to push notifications."})),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to store push subscription: {err}");
            server_error("Could not store subscription")
        }
    }
}

/// Remove the caller's subscription for one endpoint. Deleting a subscription
/// that does not exist is a success.
#[utoipa::path(
    post,
    path = "/api/push/unsubscribe",
    request_body = UnsubscribeRequest,
    responses(
        (status = 200, description = "Subscription removed (or never existed)")
    ),
    tag = "push"
)]
pub async fn unsubscribe(
    pool: Extension<PgPool>,
    auth: Extension<AuthContext>,
    payload: Option<Json<UnsubscribeRequest>>,
) -> impl IntoResponse {
    let request: UnsubscribeRequest = match payload {
        Some(Json(payload)) => payload,
        None => return missing_payload(),
    };

    let query = "DELETE FROM push_subscriptions WHERE user_id = $1 AND endpoint = $2";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(auth.user.id)
        .bind(request.endpoint.trim())
        .execute(&pool.0)
        .instrument(span)
        .await;

    match result {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({"success": true, "message": "Unsubscribed from push notifications."})),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to delete push subscription: {err}");
            server_error("Could not remove subscription")
        }
    }
}

async fn subscriptions_for(pool: &PgPool, user_id: Uuid) -> anyhow::Result<Vec<PushTarget>> {
    let query = r"
        SELECT endpoint, p256dh_key, auth_key, content_encoding
        FROM push_subscriptions
        WHERE user_id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(user_id)
        .fetch_all(pool)
        .instrument(span)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| PushTarget {
            endpoint: row.get("endpoint"),
            p256dh_key: row.get("p256dh_key"),
            auth_key: row.get("auth_key"),
            content_encoding: row.get("content_encoding"),
        })
        .collect())
}

/// Send a test payload to every subscription the caller has. A subscription
/// that fails is logged and skipped; the request still succeeds.
#[utoipa::path(
    post,
    path = "/api/push/test",
    responses(
        (status = 200, description = "Test payload dispatched")
    ),
    tag = "push"
)]
pub async fn send_test(
    pool: Extension<PgPool>,
    push_state: Extension<Arc<PushState>>,
    auth: Extension<AuthContext>,
) -> impl IntoResponse {
    let targets = match subscriptions_for(&pool.0, auth.user.id).await {
        Ok(targets) => targets,
        Err(err) => {
            error!("Failed to load push subscriptions: {err}");
            return server_error("Could not load subscriptions");
        }
    };

    let payload = PushPayload::test();
    let mut sent = 0usize;
    for target in &targets {
        match push_state.sender().send(target, &payload) {
            Ok(()) => sent += 1,
            Err(err) => {
                warn!(endpoint = %target.endpoint, "push delivery failed: {err}");
            }
        }
    }

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "sent": sent,
            "total": targets.len(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::push::{LogPushSender, PushConfig};
    use anyhow::Result;

    fn push_state(config: PushConfig) -> Extension<Arc<PushState>> {
        Extension(Arc::new(PushState::new(config, Arc::new(LogPushSender))))
    }

    #[tokio::test]
    async fn public_key_unconfigured_is_not_found() {
        let response = public_key(push_state(PushConfig::new())).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn public_key_configured_is_ok() {
        let config = PushConfig::new().with_vapid(
            "public-key".to_string(),
            secrecy::SecretString::from("private-key"),
        );
        let response = public_key(push_state(config)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn subscribe_request_accepts_content_encoding_alias() -> Result<()> {
        let request: SubscribeRequest = serde_json::from_value(serde_json::json!({
            "endpoint": "https://push.example/sub/abc",
            "keys": {"p256dh": "p", "auth": "a"},
            "contentEncoding": "aes128gcm",
        }))?;
        assert_eq!(request.content_encoding.as_deref(), Some("aes128gcm"));

        let request: SubscribeRequest = serde_json::from_value(serde_json::json!({
            "endpoint": "https://push.example/sub/abc",
            "keys": {"p256dh": "p", "auth": "a"},
        }))?;
        assert!(request.content_encoding.is_none());
        Ok(())
    }
}
