//! Database helpers for accounts, activation, verification, and sessions.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::Instrument;
use uuid::Uuid;

use super::state::{AuthConfig, GoogleProfile};
use super::tokens::IssuedToken;
use super::types::{Role, UserResponse};
use super::utils::{
    build_activation_url, build_verification_url, generate_token, hash_token, is_unique_violation,
};

/// Outcome when attempting to create a user row.
#[derive(Debug)]
pub(super) enum SignupOutcome {
    Created(Uuid),
    Conflict,
}

/// Outcome for an activation resend request.
#[derive(Debug)]
pub(super) enum ResendActivationOutcome {
    Queued,
    AlreadyActive,
    Unknown,
}

/// Full user row minus secrets we never read back.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub(crate) id: Uuid,
    pub(crate) first_name: String,
    pub(crate) last_name: String,
    pub(crate) name: String,
    pub(crate) email: String,
    pub(crate) password_hash: String,
    pub(crate) role: Role,
    pub(crate) is_active: bool,
    pub(crate) email_verified_at: Option<DateTime<Utc>>,
    pub(crate) activation_token_hash: Option<Vec<u8>>,
    pub(crate) activation_token_expires_at: Option<DateTime<Utc>>,
    pub(crate) google_id: Option<String>,
    pub(crate) profile_picture: Option<String>,
}

impl UserRecord {
    pub(crate) fn to_response(&self) -> UserResponse {
        UserResponse {
            id: self.id,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            role: self.role,
            is_active: self.is_active,
            email_verified: self.email_verified_at.is_some(),
            profile_picture: self.profile_picture.clone(),
        }
    }
}

/// Live pre-registration verification record.
#[derive(Debug)]
pub(super) struct VerificationRecord {
    pub(super) email: String,
    pub(super) verified: bool,
    pub(super) expires_at: DateTime<Utc>,
}

const USER_SELECT: &str = r"
    SELECT id, first_name, last_name, name, email, password_hash,
           role::text AS role, is_active, email_verified_at,
           activation_token_hash, activation_token_expires_at,
           google_id, profile_picture
    FROM users
";

fn user_from_row(row: &PgRow) -> Result<UserRecord> {
    let role: String = row.get("role");
    let role = Role::parse(&role).ok_or_else(|| anyhow!("unknown role in users row: {role}"))?;
    Ok(UserRecord {
        id: row.get("id"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        name: row.get("name"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        role,
        is_active: row.get("is_active"),
        email_verified_at: row.get("email_verified_at"),
        activation_token_hash: row.get("activation_token_hash"),
        activation_token_expires_at: row.get("activation_token_expires_at"),
        google_id: row.get("google_id"),
        profile_picture: row.get("profile_picture"),
    })
}

async fn find_user_where(
    pool: &PgPool,
    predicate: &str,
    bind: UserLookup<'_>,
) -> Result<Option<UserRecord>> {
    let query = format!("{USER_SELECT} WHERE {predicate} LIMIT 1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = %query
    );
    let mut builder = sqlx::query(&query);
    builder = match bind {
        UserLookup::Email(email) => builder.bind(email),
        UserLookup::Id(id) => builder.bind(id),
        UserLookup::TokenHash(hash) => builder.bind(hash),
    };
    let row = builder
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user")?;
    row.as_ref().map(user_from_row).transpose()
}

enum UserLookup<'a> {
    Email(&'a str),
    Id(Uuid),
    TokenHash(&'a [u8]),
}

pub(crate) async fn find_user_by_email(pool: &PgPool, email: &str) -> Result<Option<UserRecord>> {
    find_user_where(pool, "email = $1", UserLookup::Email(email)).await
}

pub(crate) async fn find_user_by_id(pool: &PgPool, id: Uuid) -> Result<Option<UserRecord>> {
    find_user_where(pool, "id = $1", UserLookup::Id(id)).await
}

pub(super) async fn find_user_by_activation_hash(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<Option<UserRecord>> {
    find_user_where(
        pool,
        "activation_token_hash = $1",
        UserLookup::TokenHash(token_hash),
    )
    .await
}

/// Insert an email outbox row inside the caller's transaction so delivery is
/// enqueued atomically with the state change that warrants it.
pub(crate) async fn enqueue_email(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    to_email: &str,
    template: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    let payload_text = serde_json::to_string(payload).context("failed to serialize email payload")?;
    let query = r"
        INSERT INTO email_outbox (to_email, template, payload_json)
        VALUES ($1, $2, $3::jsonb)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(to_email)
        .bind(template)
        .bind(payload_text)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert email outbox row")?;
    Ok(())
}

/// Fields for a user created through the API registration funnel: inactive
/// until the activation link is clicked.
pub(super) struct NewPendingUser<'a> {
    pub(super) first_name: &'a str,
    pub(super) last_name: &'a str,
    pub(super) email: &'a str,
    pub(super) password_hash: &'a str,
    pub(super) role: Role,
}

pub(super) async fn create_pending_user(
    pool: &PgPool,
    user: &NewPendingUser<'_>,
    token: &IssuedToken,
    config: &AuthConfig,
) -> Result<SignupOutcome> {
    // Transaction keeps the user row and the activation email consistent.
    let mut tx = pool.begin().await.context("begin register transaction")?;

    let name = format!("{} {}", user.first_name, user.last_name);
    let query = r"
        INSERT INTO users
            (first_name, last_name, name, email, password_hash, role,
             is_active, activation_token_hash, activation_token_expires_at)
        VALUES ($1, $2, $3, $4, $5, $6::user_role, FALSE, $7, $8)
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user.first_name)
        .bind(user.last_name)
        .bind(&name)
        .bind(user.email)
        .bind(user.password_hash)
        .bind(user.role.as_str())
        .bind(&token.hash)
        .bind(token.expires_at)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await;

    let user_id: Uuid = match row {
        Ok(row) => row.get("id"),
        Err(err) => {
            if is_unique_violation(&err) {
                let _ = tx.rollback().await;
                return Ok(SignupOutcome::Conflict);
            }
            return Err(err).context("failed to insert user");
        }
    };

    let activation_url = build_activation_url(config.frontend_base_url(), &token.raw);
    enqueue_email(
        &mut tx,
        user.email,
        "account_activation",
        &json!({
            "first_name": user.first_name,
            "email": user.email,
            "activation_url": activation_url,
        }),
    )
    .await?;

    tx.commit().await.context("commit register transaction")?;
    Ok(SignupOutcome::Created(user_id))
}

/// Overwrite the activation token for an inactive account and enqueue a fresh
/// email. Overwriting is what invalidates the previous link.
pub(super) async fn reissue_activation_token(
    pool: &PgPool,
    email: &str,
    token: &IssuedToken,
    config: &AuthConfig,
) -> Result<ResendActivationOutcome> {
    let Some(user) = find_user_by_email(pool, email).await? else {
        return Ok(ResendActivationOutcome::Unknown);
    };
    if user.is_active {
        return Ok(ResendActivationOutcome::AlreadyActive);
    }

    let mut tx = pool.begin().await.context("begin resend transaction")?;

    let query = r"
        UPDATE users
        SET activation_token_hash = $1,
            activation_token_expires_at = $2,
            updated_at = NOW()
        WHERE id = $3
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(&token.hash)
        .bind(token.expires_at)
        .bind(user.id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to update activation token")?;

    let activation_url = build_activation_url(config.frontend_base_url(), &token.raw);
    enqueue_email(
        &mut tx,
        &user.email,
        "account_activation",
        &json!({
            "first_name": user.first_name,
            "email": user.email,
            "activation_url": activation_url,
        }),
    )
    .await?;

    tx.commit().await.context("commit resend transaction")?;
    Ok(ResendActivationOutcome::Queued)
}

/// Activate the account and clear the consumed token fields.
pub(super) async fn activate_user(pool: &PgPool, user_id: Uuid) -> Result<()> {
    let query = r"
        UPDATE users
        SET is_active = TRUE,
            email_verified_at = COALESCE(email_verified_at, NOW()),
            activation_token_hash = NULL,
            activation_token_expires_at = NULL,
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to activate user")?;
    Ok(())
}

/// Replace any live verification record for the email and enqueue the link.
pub(super) async fn replace_verification(
    pool: &PgPool,
    email: &str,
    first_name: &str,
    token: &IssuedToken,
    config: &AuthConfig,
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin verification transaction")?;

    let query = "DELETE FROM email_verifications WHERE email = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(email)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to delete prior verification")?;

    let query = r"
        INSERT INTO email_verifications (email, token_hash, expires_at)
        VALUES ($1, $2, $3)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(email)
        .bind(&token.hash)
        .bind(token.expires_at)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert verification record")?;

    let verification_url = build_verification_url(config.frontend_base_url(), &token.raw);
    enqueue_email(
        &mut tx,
        email,
        "verify_email",
        &json!({
            "first_name": first_name,
            "email": email,
            "verification_url": verification_url,
        }),
    )
    .await?;

    tx.commit().await.context("commit verification transaction")?;
    Ok(())
}

pub(super) async fn find_verification_by_hash(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<Option<VerificationRecord>> {
    let query = r"
        SELECT email, verified, expires_at
        FROM email_verifications
        WHERE token_hash = $1
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup verification record")?;
    Ok(row.map(|row| VerificationRecord {
        email: row.get("email"),
        verified: row.get("verified"),
        expires_at: row.get("expires_at"),
    }))
}

pub(super) async fn mark_verification_verified(pool: &PgPool, token_hash: &[u8]) -> Result<()> {
    let query = r"
        UPDATE email_verifications
        SET verified = TRUE
        WHERE token_hash = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to mark verification verified")?;
    Ok(())
}

/// Expired records are dropped at read time; there is no background sweep.
pub(super) async fn delete_verification_by_hash(pool: &PgPool, token_hash: &[u8]) -> Result<()> {
    let query = "DELETE FROM email_verifications WHERE token_hash = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete verification record")?;
    Ok(())
}

pub(super) async fn is_email_verified(pool: &PgPool, email: &str) -> Result<bool> {
    let query = r"
        SELECT 1
        FROM email_verifications
        WHERE email = $1 AND verified = TRUE
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to check verified email")?;
    Ok(row.is_some())
}

/// Fields for a user created after email pre-verification or Google sign-in.
pub(super) struct NewActiveUser<'a> {
    pub(super) first_name: &'a str,
    pub(super) last_name: &'a str,
    pub(super) email: &'a str,
    pub(super) password_hash: &'a str,
    pub(super) role: Role,
    pub(super) email_verified: bool,
    pub(super) google_id: Option<&'a str>,
    pub(super) profile_picture: Option<&'a str>,
}

/// Create an active account, consuming the verification record when present.
pub(super) async fn create_active_user(
    pool: &PgPool,
    user: &NewActiveUser<'_>,
) -> Result<SignupOutcome> {
    let mut tx = pool.begin().await.context("begin create transaction")?;

    let name = format!("{} {}", user.first_name, user.last_name);
    let query = r"
        INSERT INTO users
            (first_name, last_name, name, email, password_hash, role,
             is_active, email_verified_at, google_id, profile_picture)
        VALUES ($1, $2, $3, $4, $5, $6::user_role, TRUE,
                CASE WHEN $7 THEN NOW() ELSE NULL END, $8, $9)
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user.first_name)
        .bind(user.last_name)
        .bind(&name)
        .bind(user.email)
        .bind(user.password_hash)
        .bind(user.role.as_str())
        .bind(user.email_verified)
        .bind(user.google_id)
        .bind(user.profile_picture)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await;

    let user_id: Uuid = match row {
        Ok(row) => row.get("id"),
        Err(err) => {
            if is_unique_violation(&err) {
                let _ = tx.rollback().await;
                return Ok(SignupOutcome::Conflict);
            }
            return Err(err).context("failed to insert user");
        }
    };

    let query = "DELETE FROM email_verifications WHERE email = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user.email)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to consume verification record")?;

    tx.commit().await.context("commit create transaction")?;
    Ok(SignupOutcome::Created(user_id))
}

/// Attach Google identity details to an existing account when absent.
pub(super) async fn backfill_google_profile(
    pool: &PgPool,
    user_id: Uuid,
    profile: &GoogleProfile,
) -> Result<()> {
    let query = r"
        UPDATE users
        SET google_id = COALESCE(google_id, $1),
            profile_picture = COALESCE(profile_picture, $2),
            updated_at = NOW()
        WHERE id = $3
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(&profile.google_id)
        .bind(&profile.picture)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to backfill google profile")?;
    Ok(())
}

pub(super) async fn insert_session(
    pool: &PgPool,
    user_id: Uuid,
    ttl_seconds: i64,
) -> Result<String> {
    // Generate a random token, store only its hash, and return the raw value
    // so the caller can set the session cookie.
    let query = r"
        INSERT INTO user_sessions (user_id, session_hash, expires_at)
        VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );

    for _ in 0..3 {
        let token = generate_token()?;
        let token_hash = hash_token(&token);
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(token_hash)
            .bind(ttl_seconds)
            .execute(pool)
            .instrument(span.clone())
            .await;

        match result {
            Ok(_) => return Ok(token),
            Err(err) if is_unique_violation(&err) => {}
            Err(err) => return Err(err).context("failed to insert session"),
        }
    }

    Err(anyhow!("failed to generate unique session token"))
}

pub(crate) async fn lookup_session_user(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<Option<UserRecord>> {
    // Only accept active users and unexpired sessions.
    let query = r"
        SELECT users.id, users.first_name, users.last_name, users.name,
               users.email, users.password_hash, users.role::text AS role,
               users.is_active, users.email_verified_at,
               users.activation_token_hash, users.activation_token_expires_at,
               users.google_id, users.profile_picture
        FROM user_sessions
        JOIN users ON users.id = user_sessions.user_id
        WHERE user_sessions.session_hash = $1
          AND user_sessions.expires_at > NOW()
          AND users.is_active = TRUE
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup session")?;

    let Some(row) = row else {
        return Ok(None);
    };

    // Record activity for audit/visibility without extending the session TTL.
    let query = r"
        UPDATE user_sessions
        SET last_seen_at = NOW()
        WHERE session_hash = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update session last_seen_at")?;

    user_from_row(&row).map(Some)
}

pub(crate) async fn delete_session(pool: &PgPool, token_hash: &[u8]) -> Result<()> {
    // Logout is idempotent; it's fine if no rows are deleted.
    let query = "DELETE FROM user_sessions WHERE session_hash = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete session")?;
    Ok(())
}
