//! Request guards: dual-mode authentication, role gates, and the optimistic
//! version-conflict check for offline edits.

use axum::{
    Json,
    extract::{Extension, Request},
    http::{HeaderMap, Method, StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{Instrument, error, warn};
use uuid::Uuid;

use crate::api::handlers::auth::{
    AuthState,
    session::authenticate_session,
    storage::{UserRecord, find_user_by_id},
    tokens::verify_jwt,
    types::Role,
};

/// Which guard authenticated the request. Logout uses this to know whether a
/// session row exists to delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Session,
    Token,
}

/// The authenticated caller, inserted as a request extension by
/// [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: UserRecord,
    pub guard: Guard,
}

fn unauthenticated() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "success": false,
            "message": "Unauthenticated. Please log in.",
        })),
    )
        .into_response()
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

async fn authenticate_bearer(
    headers: &HeaderMap,
    pool: &PgPool,
    auth_state: &AuthState,
) -> Option<UserRecord> {
    let token = extract_bearer_token(headers)?;
    let claims = verify_jwt(auth_state.config().jwt_secret(), &token)?;
    match find_user_by_id(pool, claims.sub).await {
        Ok(Some(user)) if user.is_active => Some(user),
        Ok(_) => None,
        Err(err) => {
            error!("Failed to load bearer user: {err}");
            None
        }
    }
}

/// Dual-guard authentication: the session cookie wins when both credentials
/// are present, the bearer token is the fallback.
pub async fn require_auth(
    Extension(pool): Extension<PgPool>,
    Extension(auth_state): Extension<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let headers = request.headers().clone();

    match authenticate_session(&headers, &pool).await {
        Ok(Some(user)) => {
            request.extensions_mut().insert(AuthContext {
                user,
                guard: Guard::Session,
            });
            return next.run(request).await;
        }
        Ok(None) => {}
        Err(status) => return status.into_response(),
    }

    if let Some(user) = authenticate_bearer(&headers, &pool, &auth_state).await {
        request.extensions_mut().insert(AuthContext {
            user,
            guard: Guard::Token,
        });
        return next.run(request).await;
    }

    unauthenticated()
}

fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({
            "success": false,
            "message": "You do not have permission to access this resource.",
        })),
    )
        .into_response()
}

async fn require_role(request: Request, next: Next, role: Role) -> Response {
    match request.extensions().get::<AuthContext>() {
        Some(auth) if auth.user.role == role => next.run(request).await,
        Some(_) => forbidden(),
        // Must run inside require_auth; a missing context is a wiring bug.
        None => unauthenticated(),
    }
}

pub async fn require_admin(request: Request, next: Next) -> Response {
    require_role(request, next, Role::Admin).await
}

pub async fn require_teacher(request: Request, next: Next) -> Response {
    require_role(request, next, Role::Teacher).await
}

pub async fn require_student(request: Request, next: Next) -> Response {
    require_role(request, next, Role::Student).await
}

/// Tables that carry a `version` column and participate in conflict checks.
const VERSIONED_TABLES: &[&str] = &[
    "courses",
    "classwork",
    "classwork_submissions",
    "events",
    "programs",
];

#[derive(Debug, PartialEq, Eq)]
struct VersionCheck {
    client_version: i64,
    table: String,
    resource_id: Uuid,
}

impl VersionCheck {
    /// All three headers must parse; anything missing or malformed means the
    /// client did not opt in and the request passes through.
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let client_version = headers
            .get("x-resource-version")?
            .to_str()
            .ok()?
            .trim()
            .parse::<i64>()
            .ok()?;
        let table = headers.get("x-resource-table")?.to_str().ok()?.trim();
        let resource_id = headers
            .get("x-resource-id")?
            .to_str()
            .ok()?
            .trim()
            .parse::<Uuid>()
            .ok()?;
        if table.is_empty() {
            return None;
        }
        Some(Self {
            client_version,
            table: table.to_string(),
            resource_id,
        })
    }
}

async fn current_row_version(
    pool: &PgPool,
    table: &str,
    resource_id: Uuid,
) -> anyhow::Result<Option<(i64, serde_json::Value)>> {
    // `table` comes from VERSIONED_TABLES only; never from the client directly.
    let query =
        format!("SELECT version::bigint AS version, row_to_json(t)::text AS current_data FROM {table} AS t WHERE id = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = %query
    );
    let row = sqlx::query(&query)
        .bind(resource_id)
        .fetch_optional(pool)
        .instrument(span)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let version: i64 = row.get("version");
    let data: String = row.get("current_data");
    let current_data = serde_json::from_str(&data)?;
    Ok(Some((version, current_data)))
}

/// Optimistic concurrency check for offline-capable clients.
///
/// Applies only to mutating methods and only when the client sends all three
/// `X-Resource-*` headers. Every failure mode passes through: the middleware
/// blocks a request only on a confirmed version mismatch.
pub async fn version_guard(
    Extension(pool): Extension<PgPool>,
    request: Request,
    next: Next,
) -> Response {
    if !matches!(
        *request.method(),
        Method::PUT | Method::PATCH | Method::DELETE
    ) {
        return next.run(request).await;
    }

    let Some(check) = VersionCheck::from_headers(request.headers()) else {
        return next.run(request).await;
    };
    if !VERSIONED_TABLES.contains(&check.table.as_str()) {
        return next.run(request).await;
    }

    match current_row_version(&pool, &check.table, check.resource_id).await {
        Ok(Some((server_version, current_data))) => {
            if server_version != check.client_version {
                return (
                    StatusCode::CONFLICT,
                    Json(json!({
                        "error": "Conflict",
                        "message": "This record was modified by someone else. Please review the changes.",
                        "conflict": true,
                        "client_version": check.client_version,
                        "server_version": server_version,
                        "current_data": current_data,
                    })),
                )
                    .into_response();
            }
            next.run(request).await
        }
        // Missing rows are the controller's problem (it will 404 properly).
        Ok(None) => next.run(request).await,
        Err(err) => {
            warn!("Version check lookup failed, passing through: {err}");
            next.run(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        body::Body,
        extract::Path,
        http::{HeaderValue, Request as HttpRequest},
        routing::patch,
    };
    use tower::ServiceExt;

    fn headers(version: &str, table: &str, id: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("x-resource-version", HeaderValue::from_str(version).unwrap());
        map.insert("x-resource-table", HeaderValue::from_str(table).unwrap());
        map.insert("x-resource-id", HeaderValue::from_str(id).unwrap());
        map
    }

    #[test]
    fn version_check_parses_complete_headers() {
        let id = Uuid::new_v4();
        let check =
            VersionCheck::from_headers(&headers("3", "courses", &id.to_string())).unwrap();
        assert_eq!(check.client_version, 3);
        assert_eq!(check.table, "courses");
        assert_eq!(check.resource_id, id);
    }

    #[test]
    fn version_check_requires_all_headers() {
        let id = Uuid::new_v4().to_string();
        let mut partial = HeaderMap::new();
        partial.insert("x-resource-version", HeaderValue::from_static("3"));
        partial.insert("x-resource-id", HeaderValue::from_str(&id).unwrap());
        assert!(VersionCheck::from_headers(&partial).is_none());
        assert!(VersionCheck::from_headers(&HeaderMap::new()).is_none());
    }

    #[test]
    fn version_check_rejects_malformed_values() {
        let id = Uuid::new_v4().to_string();
        assert!(VersionCheck::from_headers(&headers("three", "courses", &id)).is_none());
        assert!(VersionCheck::from_headers(&headers("3", "courses", "not-a-uuid")).is_none());
    }

    #[test]
    fn allowlist_covers_versioned_tables_only() {
        assert!(VERSIONED_TABLES.contains(&"courses"));
        assert!(VERSIONED_TABLES.contains(&"classwork_submissions"));
        assert!(!VERSIONED_TABLES.contains(&"users"));
        assert!(!VERSIONED_TABLES.contains(&"notifications"));
    }

    async fn rename_course(
        Extension(pool): Extension<PgPool>,
        Path(id): Path<Uuid>,
    ) -> StatusCode {
        let result =
            sqlx::query("UPDATE courses SET title = 'Renamed', version = version + 1 WHERE id = $1")
                .bind(id)
                .execute(&pool)
                .await;
        match result {
            Ok(_) => StatusCode::OK,
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn course_app(pool: PgPool) -> Router {
        Router::new()
            .route("/courses/:id", patch(rename_course))
            .layer(axum::middleware::from_fn(version_guard))
            .layer(Extension(pool))
    }

    async fn seed_course(pool: &PgPool) -> anyhow::Result<Uuid> {
        sqlx::query(
            "CREATE TABLE courses (id UUID PRIMARY KEY, title TEXT NOT NULL, version BIGINT NOT NULL)",
        )
        .execute(pool)
        .await?;
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO courses (id, title, version) VALUES ($1, 'Algebra', 3)")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(id)
    }

    fn patch_request(id: Uuid, client_version: &str) -> anyhow::Result<HttpRequest<Body>> {
        Ok(HttpRequest::builder()
            .method("PATCH")
            .uri(format!("/courses/{id}"))
            .header("x-resource-version", client_version)
            .header("x-resource-table", "courses")
            .header("x-resource-id", id.to_string())
            .body(Body::empty())?)
    }

    #[sqlx::test]
    async fn version_guard_blocks_stale_edit_with_current_row(pool: PgPool) -> anyhow::Result<()> {
        let id = seed_course(&pool).await?;

        let response = course_app(pool.clone())
            .oneshot(patch_request(id, "2")?)
            .await?;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(value["conflict"], true);
        assert_eq!(value["client_version"], 2);
        assert_eq!(value["server_version"], 3);
        assert_eq!(value["current_data"]["title"], "Algebra");

        // The handler never ran, so the row is untouched.
        let row = sqlx::query("SELECT title, version FROM courses WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await?;
        assert_eq!(row.get::<String, _>("title"), "Algebra");
        assert_eq!(row.get::<i64, _>("version"), 3);
        Ok(())
    }

    #[sqlx::test]
    async fn version_guard_passes_matching_version(pool: PgPool) -> anyhow::Result<()> {
        let id = seed_course(&pool).await?;

        let response = course_app(pool.clone())
            .oneshot(patch_request(id, "3")?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);

        let row = sqlx::query("SELECT title, version FROM courses WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await?;
        assert_eq!(row.get::<String, _>("title"), "Renamed");
        assert_eq!(row.get::<i64, _>("version"), 4);
        Ok(())
    }

    #[test]
    fn bearer_extraction_requires_prefix() {
        let mut map = HeaderMap::new();
        map.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_bearer_token(&map), Some("abc".to_string()));

        let mut map = HeaderMap::new();
        map.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&map), None);

        let mut map = HeaderMap::new();
        map.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_bearer_token(&map), None);
    }
}
