//! In-app notifications. Other handlers call [`notify_user`] to write a row;
//! the endpoints here let the owner read and acknowledge them.

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::{Instrument, error, info_span};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::middleware::AuthContext;

#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct Notification {
    pub id: Uuid,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Write a notification row for one user. Callers treat failures as
/// non-fatal; the triggering action has already happened.
pub async fn notify_user(
    pool: &PgPool,
    user_id: Uuid,
    kind: &str,
    title: &str,
    message: &str,
    data: serde_json::Value,
) -> anyhow::Result<Uuid> {
    let query = r"
        INSERT INTO notifications (user_id, kind, title, message, data)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(kind)
        .bind(title)
        .bind(message)
        .bind(data)
        .fetch_one(pool)
        .instrument(span)
        .await?;
    Ok(row.get("id"))
}

fn server_error(message: &str) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "message": message})),
    )
        .into_response()
}

/// The caller's notifications, most recent first, with the unread count.
#[utoipa::path(
    get,
    path = "/api/notifications",
    responses(
        (status = 200, description = "Notifications for the caller")
    ),
    tag = "notifications"
)]
pub async fn list(pool: Extension<PgPool>, auth: Extension<AuthContext>) -> impl IntoResponse {
    let query = r"
        SELECT id, kind, title, message, data, read_at, created_at
        FROM notifications
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT 100
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(auth.user.id)
        .fetch_all(&pool.0)
        .instrument(span)
        .await;

    let rows = match rows {
        Ok(rows) => rows,
        Err(err) => {
            error!("Failed to list notifications: {err}");
            return server_error("Could not load notifications");
        }
    };

    let notifications: Vec<Notification> = rows
        .into_iter()
        .map(|row| Notification {
            id: row.get("id"),
            kind: row.get("kind"),
            title: row.get("title"),
            message: row.get("message"),
            data: row.get("data"),
            read_at: row.get("read_at"),
            created_at: row.get("created_at"),
        })
        .collect();
    let unread = notifications
        .iter()
        .filter(|notification| notification.read_at.is_none())
        .count();

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "notifications": notifications,
            "unread_count": unread,
        })),
    )
        .into_response()
}

/// Mark one notification read. Only the owner's rows are touched, so a
/// foreign id is indistinguishable from an unknown one.
#[utoipa::path(
    post,
    path = "/api/notifications/{id}/read",
    params(
        ("id" = Uuid, Path, description = "Notification id")
    ),
    responses(
        (status = 200, description = "Marked read"),
        (status = 404, description = "Unknown notification")
    ),
    tag = "notifications"
)]
pub async fn mark_read(
    pool: Extension<PgPool>,
    auth: Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let query = r"
        UPDATE notifications
        SET read_at = COALESCE(read_at, NOW())
        WHERE id = $1 AND user_id = $2
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(id)
        .bind(auth.user.id)
        .execute(&pool.0)
        .instrument(span)
        .await;

    match result {
        Ok(done) if done.rows_affected() > 0 => {
            (StatusCode::OK, Json(json!({"success": true}))).into_response()
        }
        Ok(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "message": "Notification not found."})),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to mark notification read: {err}");
            server_error("Could not update notification")
        }
    }
}

/// Mark everything read for the caller.
#[utoipa::path(
    post,
    path = "/api/notifications/read-all",
    responses(
        (status = 200, description = "All notifications marked read")
    ),
    tag = "notifications"
)]
pub async fn mark_all_read(
    pool: Extension<PgPool>,
    auth: Extension<AuthContext>,
) -> impl IntoResponse {
    let query = r"
        UPDATE notifications
        SET read_at = NOW()
        WHERE user_id = $1 AND read_at IS NULL
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(auth.user.id)
        .execute(&pool.0)
        .instrument(span)
        .await;

    match result {
        Ok(done) => (
            StatusCode::OK,
            Json(json!({"success": true, "updated": done.rows_affected()})),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to mark notifications read: {err}");
            server_error("Could not update notifications")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_serializes_without_null_read_at() {
        let notification = Notification {
            id: Uuid::new_v4(),
            kind: "classwork_posted".to_string(),
            title: "New assignment".to_string(),
            message: "Algebra homework is due Friday.".to_string(),
            data: serde_json::json!({"classwork_id": Uuid::new_v4()}),
            read_at: None,
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&notification).unwrap();
        assert!(value.get("read_at").is_none());
        assert_eq!(value["kind"], "classwork_posted");
    }
}
