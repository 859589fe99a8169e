//! Attachment endpoints. Files are validated, written through the storage
//! provider, then recorded in `file_uploads` with an explicit tagged owner
//! pair (`owner_type`, `owner_id`), so any table can carry attachments
//! without schema changes.

use axum::{
    Json,
    extract::{Extension, Multipart, Path, Query},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Row, postgres::PgRow};
use std::sync::Arc;
use tracing::{Instrument, error, info_span, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::middleware::AuthContext;
use crate::api::uploads::{
    DEFAULT_MAX_BYTES, DOCUMENT_MAX_BYTES, DOCUMENT_TYPES, IMAGE_MAX_BYTES, IMAGE_TYPES,
    StorageProvider, UploadConfig, UploadError, VIDEO_MAX_BYTES, VIDEO_TYPES, file_extension,
    remove_file, store_file, validate_upload,
};
use crate::api::handlers::auth::types::Role;

#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct FileUploadResponse {
    pub id: Uuid,
    pub owner_type: String,
    pub owner_id: Uuid,
    pub user_id: Uuid,
    pub original_name: String,
    pub stored_name: String,
    pub file_path: String,
    pub mime_type: String,
    pub extension: String,
    pub size_bytes: i64,
    pub storage_provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn upload_from_row(row: &PgRow) -> FileUploadResponse {
    FileUploadResponse {
        id: row.get("id"),
        owner_type: row.get("owner_type"),
        owner_id: row.get("owner_id"),
        user_id: row.get("user_id"),
        original_name: row.get("original_name"),
        stored_name: row.get("stored_name"),
        file_path: row.get("file_path"),
        mime_type: row.get("mime_type"),
        extension: row.get("extension"),
        size_bytes: row.get("size_bytes"),
        storage_provider: row.get("storage_provider"),
        thumbnail_path: row.get("thumbnail_path"),
        created_at: row.get("created_at"),
    }
}

const UPLOAD_SELECT: &str = r"
    SELECT id, owner_type, owner_id, user_id, original_name, stored_name,
           file_path, mime_type, extension, size_bytes, storage_provider,
           thumbnail_path, created_at
    FROM file_uploads
";

fn validation_error(err: &UploadError) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "message": err.to_string()})),
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

/// One file part pulled out of the multipart body.
struct IncomingFile {
    file_name: String,
    mime_type: String,
    bytes: Vec<u8>,
}

/// Everything the upload endpoints need from a multipart body: the owner
/// pair plus the file parts, in whatever order the client sent them.
struct UploadForm {
    owner_type: Option<String>,
    owner_id: Option<Uuid>,
    files: Vec<IncomingFile>,
}

async fn read_multipart(mut multipart: Multipart) -> anyhow::Result<UploadForm> {
    let mut form = UploadForm {
        owner_type: None,
        owner_id: None,
        files: Vec::new(),
    };
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "owner_type" => {
                form.owner_type = Some(field.text().await?.trim().to_string());
            }
            "owner_id" => {
                form.owner_id = field.text().await?.trim().parse::<Uuid>().ok();
            }
            _ => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await?.to_vec();
                form.files.push(IncomingFile {
                    file_name,
                    mime_type,
                    bytes,
                });
            }
        }
    }
    Ok(form)
}

async fn insert_upload(
    pool: &PgPool,
    owner_type: &str,
    owner_id: Uuid,
    user_id: Uuid,
    incoming: &IncomingFile,
    stored_name: &str,
    file_path: &str,
    extension: &str,
    provider: StorageProvider,
) -> anyhow::Result<FileUploadResponse> {
    let query = r"
        INSERT INTO file_uploads (owner_type, owner_id, user_id, original_name, stored_name,
                                  file_path, mime_type, extension, size_bytes, storage_provider,
                                  thumbnail_path)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NULL)
        RETURNING id, owner_type, owner_id, user_id, original_name, stored_name,
                  file_path, mime_type, extension, size_bytes, storage_provider,
                  thumbnail_path, created_at
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(owner_type)
        .bind(owner_id)
        .bind(user_id)
        .bind(&incoming.file_name)
        .bind(stored_name)
        .bind(file_path)
        .bind(&incoming.mime_type)
        .bind(extension)
        .bind(i64::try_from(incoming.bytes.len()).unwrap_or(i64::MAX))
        .bind(provider.as_str())
        .fetch_one(pool)
        .instrument(span)
        .await?;
    Ok(upload_from_row(&row))
}

async fn process_one(
    pool: &PgPool,
    config: &UploadConfig,
    owner_type: &str,
    owner_id: Uuid,
    user_id: Uuid,
    incoming: &IncomingFile,
) -> Result<FileUploadResponse, axum::response::Response> {
    let size = u64::try_from(incoming.bytes.len()).unwrap_or(u64::MAX);
    if let Err(err) = validate_upload(Some(&incoming.file_name), &incoming.mime_type, size) {
        return Err(validation_error(&err));
    }

    let extension = file_extension(&incoming.file_name);
    let stored = store_file(
        config,
        StorageProvider::Local,
        owner_type,
        owner_id,
        &extension,
        &incoming.bytes,
    )
    .await
    .map_err(|err| {
        error!("Failed to store uploaded file: {err}");
        server_error("Could not store file")
    })?;

    insert_upload(
        pool,
        owner_type,
        owner_id,
        user_id,
        incoming,
        &stored.stored_name,
        &stored.file_path,
        &extension,
        stored.provider,
    )
    .await
    .map_err(|err| {
        error!("Failed to record uploaded file: {err}");
        server_error("Could not record file")
    })
}

fn owner_pair(form: &UploadForm) -> Result<(String, Uuid), axum::response::Response> {
    let owner_type = form
        .owner_type
        .as_deref()
        .filter(|value| !value.is_empty());
    match (owner_type, form.owner_id) {
        (Some(owner_type), Some(owner_id)) => Ok((owner_type.to_string(), owner_id)),
        _ => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "message": "The owner_type and owner_id fields are required.",
            })),
        )
            .into_response()),
    }
}

/// Single-file upload: any validation or storage failure fails the request.
#[utoipa::path(
    post,
    path = "/api/files/upload",
    responses(
        (status = 201, description = "File stored", body = FileUploadResponse),
        (status = 400, description = "Validation failed")
    ),
    tag = "files"
)]
pub async fn upload(
    pool: Extension<PgPool>,
    config: Extension<Arc<UploadConfig>>,
    auth: Extension<AuthContext>,
    multipart: Multipart,
) -> impl IntoResponse {
    let form = match read_multipart(multipart).await {
        Ok(form) => form,
        Err(err) => {
            warn!("Failed to read multipart body: {err}");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "message": "Malformed upload body"})),
            )
                .into_response();
        }
    };
    let (owner_type, owner_id) = match owner_pair(&form) {
        Ok(pair) => pair,
        Err(response) => return response,
    };
    let Some(incoming) = form.files.first() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "message": "No file was uploaded."})),
        )
            .into_response();
    };

    match process_one(&pool.0, &config, &owner_type, owner_id, auth.user.id, incoming).await {
        Ok(file) => (StatusCode::CREATED, Json(json!({"success": true, "file": file})))
            .into_response(),
        Err(response) => response,
    }
}

/// Multi-file upload: each file is validated and stored independently, and
/// the response carries only the ones that made it.
#[utoipa::path(
    post,
    path = "/api/files/upload-multiple",
    responses(
        (status = 201, description = "Files stored; failures skipped")
    ),
    tag = "files"
)]
pub async fn upload_multiple(
    pool: Extension<PgPool>,
    config: Extension<Arc<UploadConfig>>,
    auth: Extension<AuthContext>,
    multipart: Multipart,
) -> impl IntoResponse {
    let form = match read_multipart(multipart).await {
        Ok(form) => form,
        Err(err) => {
            warn!("Failed to read multipart body: {err}");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "message": "Malformed upload body"})),
            )
                .into_response();
        }
    };
    let (owner_type, owner_id) = match owner_pair(&form) {
        Ok(pair) => pair,
        Err(response) => return response,
    };

    let mut stored = Vec::new();
    for incoming in &form.files {
        match process_one(&pool.0, &config, &owner_type, owner_id, auth.user.id, incoming).await {
            Ok(file) => stored.push(file),
            Err(_) => {
                warn!(
                    file_name = %incoming.file_name,
                    mime_type = %incoming.mime_type,
                    "skipping file that failed validation or storage"
                );
            }
        }
    }

    (
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "files": stored,
            "uploaded": stored.len(),
            "total": form.files.len(),
        })),
    )
        .into_response()
}

/// Limits and allowed types, for clients to validate before uploading.
#[utoipa::path(
    get,
    path = "/api/files/config",
    responses(
        (status = 200, description = "Upload limits and allowed MIME types")
    ),
    tag = "files"
)]
pub async fn upload_config() -> impl IntoResponse {
    Json(json!({
        "max_bytes": {
            "image": IMAGE_MAX_BYTES,
            "video": VIDEO_MAX_BYTES,
            "document": DOCUMENT_MAX_BYTES,
            "default": DEFAULT_MAX_BYTES,
        },
        "allowed_types": {
            "image": IMAGE_TYPES,
            "video": VIDEO_TYPES,
            "document": DOCUMENT_TYPES,
        },
    }))
}

#[derive(Deserialize, Debug)]
pub struct ListQuery {
    pub owner_type: String,
    pub owner_id: Uuid,
}

/// List attachments for one owner.
#[utoipa::path(
    get,
    path = "/api/files",
    params(
        ("owner_type" = String, Query, description = "Owning table tag"),
        ("owner_id" = Uuid, Query, description = "Owning row id")
    ),
    responses(
        (status = 200, description = "Attachments for the owner")
    ),
    tag = "files"
)]
pub async fn list(pool: Extension<PgPool>, query: Query<ListQuery>) -> impl IntoResponse {
    let sql = format!("{UPLOAD_SELECT} WHERE owner_type = $1 AND owner_id = $2 ORDER BY created_at DESC");
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = %sql
    );
    let rows = sqlx::query(&sql)
        .bind(&query.owner_type)
        .bind(query.owner_id)
        .fetch_all(&pool.0)
        .instrument(span)
        .await;

    match rows {
        Ok(rows) => {
            let files: Vec<FileUploadResponse> = rows.iter().map(upload_from_row).collect();
            (StatusCode::OK, Json(json!({"success": true, "files": files}))).into_response()
        }
        Err(err) => {
            error!("Failed to list uploads: {err}");
            server_error("Could not list files")
        }
    }
}

async fn find_upload(pool: &PgPool, id: Uuid) -> anyhow::Result<Option<FileUploadResponse>> {
    let sql = format!("{UPLOAD_SELECT} WHERE id = $1");
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = %sql
    );
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(pool)
        .instrument(span)
        .await?;
    Ok(row.as_ref().map(upload_from_row))
}

fn not_found() -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"success": false, "message": "File not found."})),
    )
        .into_response()
}

/// Fetch one attachment record.
#[utoipa::path(
    get,
    path = "/api/files/{id}",
    params(
        ("id" = Uuid, Path, description = "Attachment id")
    ),
    responses(
        (status = 200, description = "Attachment record", body = FileUploadResponse),
        (status = 404, description = "Unknown id")
    ),
    tag = "files"
)]
pub async fn get(pool: Extension<PgPool>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match find_upload(&pool.0, id).await {
        Ok(Some(file)) => {
            (StatusCode::OK, Json(json!({"success": true, "file": file}))).into_response()
        }
        Ok(None) => not_found(),
        Err(err) => {
            error!("Failed to load upload: {err}");
            server_error("Could not load file")
        }
    }
}

/// Delete an attachment. Only the uploader or an admin may delete; the stored
/// file is removed best-effort before the row goes away.
#[utoipa::path(
    delete,
    path = "/api/files/{id}",
    params(
        ("id" = Uuid, Path, description = "Attachment id")
    ),
    responses(
        (status = 200, description = "Attachment deleted"),
        (status = 403, description = "Caller is not the uploader or an admin"),
        (status = 404, description = "Unknown id")
    ),
    tag = "files"
)]
pub async fn delete(
    pool: Extension<PgPool>,
    config: Extension<Arc<UploadConfig>>,
    auth: Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let file = match find_upload(&pool.0, id).await {
        Ok(Some(file)) => file,
        Ok(None) => return not_found(),
        Err(err) => {
            error!("Failed to load upload: {err}");
            return server_error("Could not delete file");
        }
    };

    if file.user_id != auth.user.id && auth.user.role != Role::Admin {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "success": false,
                "message": "You do not have permission to delete this file.",
            })),
        )
            .into_response();
    }

    if let Err(err) = remove_file(&config, &file.storage_provider, &file.file_path).await {
        warn!("Failed to remove stored file, deleting record anyway: {err}");
    }

    let query = "DELETE FROM file_uploads WHERE id = $1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(id)
        .execute(&pool.0)
        .instrument(span)
        .await;

    match result {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({"success": true, "message": "File deleted."})),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to delete upload record: {err}");
            server_error("Could not delete file")
        }
    }
}
