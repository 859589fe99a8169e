//! Transactional email outbox and delivery worker.
//!
//! Registration and verification handlers never talk to a mail provider
//! directly: they enqueue a row in `email_outbox` inside the same transaction
//! that creates or updates the user, so the account and its email are atomic.
//! A background task polls the table, locks a batch with
//! `FOR UPDATE SKIP LOCKED`, and hands each row to an [`EmailSender`].
//!
//! Failed rows are retried with exponential backoff and jitter until
//! `max_attempts`, then marked `failed`. Multiple workers can run against the
//! same table without double-sending.
//!
//! The default sender is [`LogEmailSender`], which logs the rendered message
//! and returns `Ok(())`. Real delivery (SMTP, provider API) is a drop-in
//! `EmailSender` implementation.

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

/// Templates the handlers enqueue. Anything else in the outbox is a bug in
/// the enqueuing code, not the worker; it is delivered with a generic subject.
const TEMPLATE_ACCOUNT_ACTIVATION: &str = "account_activation";
const TEMPLATE_VERIFY_EMAIL: &str = "verify_email";

#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: String,
}

impl EmailMessage {
    #[must_use]
    pub fn subject(&self) -> &'static str {
        match self.template.as_str() {
            TEMPLATE_ACCOUNT_ACTIVATION => "Activate your ElevateGS account",
            TEMPLATE_VERIFY_EMAIL => "Verify your email address",
            _ => "ElevateGS notification",
        }
    }

    /// Render the plain-text body for the template from the queued payload.
    ///
    /// Unknown templates fall back to the raw payload so a bad enqueue is
    /// still delivered somewhere visible instead of silently dropped.
    #[must_use]
    pub fn render_body(&self) -> String {
        let payload: serde_json::Value =
            serde_json::from_str(&self.payload_json).unwrap_or(serde_json::Value::Null);
        let first_name = payload["first_name"].as_str().unwrap_or("there");
        match self.template.as_str() {
            TEMPLATE_ACCOUNT_ACTIVATION => {
                let url = payload["activation_url"].as_str().unwrap_or_default();
                format!(
                    "Hi {first_name},\n\n\
                     Welcome to ElevateGS. Activate your account by opening the link below:\n\n\
                     {url}\n\n\
                     If you did not sign up, you can ignore this email.\n"
                )
            }
            TEMPLATE_VERIFY_EMAIL => {
                let url = payload["verification_url"].as_str().unwrap_or_default();
                format!(
                    "Hi {first_name},\n\n\
                     Verify your email address to continue your ElevateGS registration:\n\n\
                     {url}\n\n\
                     If you did not request this, you can ignore this email.\n"
                )
            }
            _ => self.payload_json.clone(),
        }
    }
}

/// Delivery abstraction used by the outbox worker.
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs the message instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = %message.template,
            subject = %message.subject(),
            body = %message.render_body(),
            "email outbox send stub"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EmailWorkerConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl EmailWorkerConfig {
    /// Default worker config: 5s poll interval, 10 messages per batch,
    /// 5 max attempts, and 5s->5m exponential backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    /// Clamp nonsensical values from the CLI into something safe.
    #[must_use]
    pub fn normalize(self) -> Self {
        let poll_interval = if self.poll_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.poll_interval
        };
        let batch_size = if self.batch_size == 0 {
            1
        } else {
            self.batch_size
        };
        let max_attempts = self.max_attempts.max(1);
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_secs(1)
        } else {
            self.backoff_base
        };
        let backoff_max = if self.backoff_max < backoff_base {
            backoff_base
        } else {
            self.backoff_max
        };
        Self {
            poll_interval,
            batch_size,
            max_attempts,
            backoff_base,
            backoff_max,
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }
}

impl Default for EmailWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the background task that drains the email outbox.
pub fn spawn_outbox_worker(
    pool: PgPool,
    sender: Arc<dyn EmailSender>,
    config: EmailWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();
        let poll_interval = config.poll_interval();

        loop {
            let batch_result = process_outbox_batch(&pool, sender.as_ref(), &config).await;
            if let Err(err) = batch_result {
                error!("email outbox batch failed: {err}");
            }

            sleep(poll_interval).await;
        }
    })
}

async fn process_outbox_batch(
    pool: &PgPool,
    sender: &dyn EmailSender,
    config: &EmailWorkerConfig,
) -> Result<usize> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start email outbox transaction")?;

    // Lock a batch so concurrent workers never double-send a row.
    let query = r"
        SELECT id, to_email, template, payload_json::text AS payload_json, attempts
        FROM email_outbox
        WHERE status = 'pending'
          AND next_attempt_at <= NOW()
        ORDER BY next_attempt_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(i64::try_from(config.batch_size()).unwrap_or(0))
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to load email outbox batch")?;

    if rows.is_empty() {
        // Commit even on empty to release locks.
        tx.commit()
            .await
            .context("failed to commit empty outbox batch")?;
        return Ok(0);
    }

    let row_count = rows.len();
    for row in rows {
        let id: Uuid = row.get("id");
        let attempts: i32 = row.get("attempts");
        let attempts = u32::try_from(attempts).unwrap_or(0);
        let message = EmailMessage {
            to_email: row.get("to_email"),
            template: row.get("template"),
            payload_json: row.get("payload_json"),
        };

        let send_result = sender.send(&message);
        update_outbox_status(&mut tx, id, attempts, send_result, config).await?;
    }

    tx.commit()
        .await
        .context("failed to commit email outbox batch")?;

    Ok(row_count)
}

async fn update_outbox_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    attempts: u32,
    send_result: Result<()>,
    config: &EmailWorkerConfig,
) -> Result<()> {
    let next_attempt = attempts.saturating_add(1);
    let next_attempts_i32 = i32::try_from(next_attempt).unwrap_or(i32::MAX);
    match send_result {
        Ok(()) => {
            let query = r"
                UPDATE email_outbox
                SET status = 'sent',
                    attempts = $2,
                    last_error = NULL,
                    sent_at = NOW(),
                    next_attempt_at = NOW()
                WHERE id = $1
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(id)
                .bind(next_attempts_i32)
                .execute(&mut **tx)
                .instrument(span)
                .await
                .context("failed to update outbox status to sent")?;
        }
        Err(err) => {
            let max_attempts = config.max_attempts();
            if next_attempt >= max_attempts {
                let query = r"
                    UPDATE email_outbox
                    SET status = 'failed',
                        attempts = $2,
                        last_error = $3,
                        next_attempt_at = NOW()
                    WHERE id = $1
                ";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(id)
                    .bind(next_attempts_i32)
                    .bind(err.to_string())
                    .execute(&mut **tx)
                    .instrument(span)
                    .await
                    .context("failed to update outbox status to failed")?;
            } else {
                let delay =
                    backoff_delay(next_attempt, config.backoff_base(), config.backoff_max());
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                let query = r"
                    UPDATE email_outbox
                    SET status = 'pending',
                        attempts = $2,
                        last_error = $3,
                        next_attempt_at = NOW() + ($4 * INTERVAL '1 millisecond')
                    WHERE id = $1
                ";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(id)
                    .bind(next_attempts_i32)
                    .bind(err.to_string())
                    .bind(delay_ms)
                    .execute(&mut **tx)
                    .instrument(span)
                    .await
                    .context("failed to update outbox retry schedule")?;
            }
        }
    }

    Ok(())
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_per_template() {
        let activation = EmailMessage {
            to_email: "alice@example.com".to_string(),
            template: TEMPLATE_ACCOUNT_ACTIVATION.to_string(),
            payload_json: "{}".to_string(),
        };
        assert_eq!(activation.subject(), "Activate your ElevateGS account");

        let verify = EmailMessage {
            template: TEMPLATE_VERIFY_EMAIL.to_string(),
            ..activation.clone()
        };
        assert_eq!(verify.subject(), "Verify your email address");

        let unknown = EmailMessage {
            template: "password_reset".to_string(),
            ..activation
        };
        assert_eq!(unknown.subject(), "ElevateGS notification");
    }

    #[test]
    fn render_body_per_template() {
        let activation = EmailMessage {
            to_email: "alice@example.com".to_string(),
            template: TEMPLATE_ACCOUNT_ACTIVATION.to_string(),
            payload_json:
                r#"{"first_name":"Alice","activation_url":"https://elevategs.test/activate/tok"}"#
                    .to_string(),
        };
        let body = activation.render_body();
        assert!(body.starts_with("Hi Alice,"));
        assert!(body.contains("https://elevategs.test/activate/tok"));

        let verify = EmailMessage {
            template: TEMPLATE_VERIFY_EMAIL.to_string(),
            payload_json:
                r#"{"first_name":"Bob","verification_url":"https://elevategs.test/email/verify/tok"}"#
                    .to_string(),
            ..activation.clone()
        };
        let body = verify.render_body();
        assert!(body.starts_with("Hi Bob,"));
        assert!(body.contains("/email/verify/tok"));
    }

    #[test]
    fn render_body_unknown_template_keeps_payload() {
        let message = EmailMessage {
            to_email: "alice@example.com".to_string(),
            template: "password_reset".to_string(),
            payload_json: r#"{"reset_url":"https://elevategs.test/reset/tok"}"#.to_string(),
        };
        assert_eq!(message.render_body(), message.payload_json);
    }

    #[test]
    fn render_body_tolerates_malformed_payload() {
        let message = EmailMessage {
            to_email: "alice@example.com".to_string(),
            template: TEMPLATE_ACCOUNT_ACTIVATION.to_string(),
            payload_json: "not json".to_string(),
        };
        let body = message.render_body();
        assert!(body.starts_with("Hi there,"));
    }

    #[test]
    fn normalize_clamps_zeroes() {
        let config = EmailWorkerConfig::new()
            .with_poll_interval_seconds(0)
            .with_batch_size(0)
            .with_max_attempts(0)
            .with_backoff_base_seconds(0)
            .with_backoff_max_seconds(0)
            .normalize();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.batch_size(), 1);
        assert_eq!(config.max_attempts(), 1);
        assert_eq!(config.backoff_base(), Duration::from_secs(1));
        assert!(config.backoff_max() >= config.backoff_base());
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);
        // Jitter keeps the delay within [half, full] of the capped value.
        for attempt in 1..=10 {
            let delay = backoff_delay(attempt, base, max);
            let uncapped = base * (1 << (attempt - 1).min(31));
            let capped = if uncapped > max { max } else { uncapped };
            assert!(delay <= capped);
            assert!(delay >= capped / 2);
        }
    }

    #[test]
    fn log_sender_always_succeeds() {
        let message = EmailMessage {
            to_email: "bob@example.com".to_string(),
            template: TEMPLATE_ACCOUNT_ACTIVATION.to_string(),
            payload_json: r#"{"activation_url":"https://elevategs.test/activate/x"}"#.to_string(),
        };
        assert!(LogEmailSender.send(&message).is_ok());
    }
}
