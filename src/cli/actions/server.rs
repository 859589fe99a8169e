use crate::api;
use anyhow::Result;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub frontend_url: String,
    pub jwt_secret: String,
    pub session_ttl_seconds: i64,
    pub activation_token_ttl_seconds: i64,
    pub verification_token_ttl_seconds: i64,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub google_redirect_url: Option<String>,
    pub vapid_public_key: Option<String>,
    pub vapid_private_key: Option<String>,
    pub upload_dir: String,
    pub email_outbox_poll_seconds: u64,
    pub email_outbox_batch_size: usize,
    pub email_outbox_max_attempts: u32,
    pub email_outbox_backoff_base_seconds: u64,
    pub email_outbox_backoff_max_seconds: u64,
}

/// Execute the server action.
///
/// # Errors
/// Returns an error if the database is unreachable or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let mut auth_config = api::handlers::auth::AuthConfig::new(
        SecretString::from(args.jwt_secret),
        args.frontend_url,
    )
    .with_session_ttl_seconds(args.session_ttl_seconds)
    .with_activation_token_ttl_seconds(args.activation_token_ttl_seconds)
    .with_verification_token_ttl_seconds(args.verification_token_ttl_seconds);

    if let (Some(client_id), Some(client_secret), Some(redirect_url)) = (
        args.google_client_id,
        args.google_client_secret,
        args.google_redirect_url,
    ) {
        auth_config = auth_config.with_google(api::handlers::auth::GoogleConfig {
            client_id,
            client_secret: SecretString::from(client_secret),
            redirect_url,
        });
    }

    let email_config = api::email::EmailWorkerConfig::new()
        .with_poll_interval_seconds(args.email_outbox_poll_seconds)
        .with_batch_size(args.email_outbox_batch_size)
        .with_max_attempts(args.email_outbox_max_attempts)
        .with_backoff_base_seconds(args.email_outbox_backoff_base_seconds)
        .with_backoff_max_seconds(args.email_outbox_backoff_max_seconds);

    let mut push_config = api::push::PushConfig::new();
    if let (Some(public_key), Some(private_key)) = (args.vapid_public_key, args.vapid_private_key) {
        push_config = push_config.with_vapid(public_key, SecretString::from(private_key));
    }

    let upload_config = api::uploads::UploadConfig::new(args.upload_dir);

    api::new(
        args.port,
        args.dsn,
        auth_config,
        email_config,
        push_config,
        upload_config,
    )
    .await
}
