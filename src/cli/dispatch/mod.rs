//! Command-line argument dispatch.
//!
//! Maps validated CLI matches to the action to execute, currently only
//! starting the API server with its full configuration.

use crate::cli::actions::{Action, server::Args};
use anyhow::{Context, Result, anyhow};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;
    let jwt_secret = matches
        .get_one::<String>("jwt-secret")
        .cloned()
        .context("missing required argument: --jwt-secret")?;
    let frontend_url = matches
        .get_one::<String>("frontend-url")
        .cloned()
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let google_client_id = matches.get_one::<String>("google-client-id").cloned();
    let google_client_secret = matches.get_one::<String>("google-client-secret").cloned();
    let google_redirect_url = matches.get_one::<String>("google-redirect-url").cloned();

    // clap enforces secret/redirect -> client-id, the reverse needs a check
    if google_client_id.is_some() && (google_client_secret.is_none() || google_redirect_url.is_none())
    {
        return Err(anyhow!(
            "--google-client-id requires --google-client-secret and --google-redirect-url"
        ));
    }

    let vapid_public_key = matches.get_one::<String>("vapid-public-key").cloned();
    let vapid_private_key = matches.get_one::<String>("vapid-private-key").cloned();

    if vapid_public_key.is_some() && vapid_private_key.is_none() {
        return Err(anyhow!("--vapid-public-key requires --vapid-private-key"));
    }

    Ok(Action::Server(Box::new(Args {
        port,
        dsn,
        frontend_url,
        jwt_secret,
        session_ttl_seconds: matches
            .get_one::<i64>("session-ttl-seconds")
            .copied()
            .unwrap_or(43_200),
        activation_token_ttl_seconds: matches
            .get_one::<i64>("activation-token-ttl-seconds")
            .copied()
            .unwrap_or(86_400),
        verification_token_ttl_seconds: matches
            .get_one::<i64>("verification-token-ttl-seconds")
            .copied()
            .unwrap_or(1_800),
        google_client_id,
        google_client_secret,
        google_redirect_url,
        vapid_public_key,
        vapid_private_key,
        upload_dir: matches
            .get_one::<String>("upload-dir")
            .cloned()
            .unwrap_or_else(|| "storage/uploads".to_string()),
        email_outbox_poll_seconds: matches
            .get_one::<u64>("outbox-poll-seconds")
            .copied()
            .unwrap_or(5),
        email_outbox_batch_size: matches
            .get_one::<usize>("outbox-batch-size")
            .copied()
            .unwrap_or(10),
        email_outbox_max_attempts: matches
            .get_one::<u32>("outbox-max-attempts")
            .copied()
            .unwrap_or(5),
        email_outbox_backoff_base_seconds: matches
            .get_one::<u64>("outbox-backoff-base-seconds")
            .copied()
            .unwrap_or(5),
        email_outbox_backoff_max_seconds: matches
            .get_one::<u64>("outbox-backoff-max-seconds")
            .copied()
            .unwrap_or(300),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;

    fn base_args() -> Vec<&'static str> {
        vec![
            "elevategs",
            "--dsn",
            "postgres://user@localhost:5432/elevategs",
            "--jwt-secret",
            "secret",
        ]
    }

    #[test]
    fn server_action_with_defaults() {
        temp_env::with_vars(
            [
                ("ELEVATEGS_GOOGLE_CLIENT_ID", None::<&str>),
                ("ELEVATEGS_VAPID_PUBLIC_KEY", None::<&str>),
            ],
            || {
                let matches = commands::new().get_matches_from(base_args());
                let action = handler(&matches).unwrap();
                let Action::Server(args) = action;

                assert_eq!(args.port, 8080);
                assert_eq!(args.session_ttl_seconds, 43_200);
                assert_eq!(args.activation_token_ttl_seconds, 86_400);
                assert_eq!(args.verification_token_ttl_seconds, 1_800);
                assert!(args.google_client_id.is_none());
                assert!(args.vapid_public_key.is_none());
                assert_eq!(args.upload_dir, "storage/uploads");
            },
        );
    }

    #[test]
    fn google_client_id_requires_secret_and_redirect() {
        temp_env::with_vars(
            [
                ("ELEVATEGS_GOOGLE_CLIENT_ID", Some("client-id")),
                ("ELEVATEGS_GOOGLE_CLIENT_SECRET", None::<&str>),
                ("ELEVATEGS_GOOGLE_REDIRECT_URL", None::<&str>),
            ],
            || {
                let matches = commands::new().get_matches_from(base_args());
                let result = handler(&matches);
                assert!(result.is_err());
            },
        );
    }

    #[test]
    fn vapid_public_requires_private() {
        temp_env::with_vars(
            [
                ("ELEVATEGS_VAPID_PUBLIC_KEY", Some("BPubKey")),
                ("ELEVATEGS_VAPID_PRIVATE_KEY", None::<&str>),
                ("ELEVATEGS_GOOGLE_CLIENT_ID", None::<&str>),
            ],
            || {
                let matches = commands::new().get_matches_from(base_args());
                let result = handler(&matches);
                assert!(result.is_err());
            },
        );
    }

    #[test]
    fn google_fully_configured() {
        temp_env::with_vars(
            [
                ("ELEVATEGS_GOOGLE_CLIENT_ID", Some("client-id")),
                ("ELEVATEGS_GOOGLE_CLIENT_SECRET", Some("client-secret")),
                (
                    "ELEVATEGS_GOOGLE_REDIRECT_URL",
                    Some("https://api.elevategs.test/api/auth/google/callback"),
                ),
                ("ELEVATEGS_VAPID_PUBLIC_KEY", None::<&str>),
            ],
            || {
                let matches = commands::new().get_matches_from(base_args());
                let Action::Server(args) = handler(&matches).unwrap();
                assert_eq!(args.google_client_id.as_deref(), Some("client-id"));
                assert_eq!(
                    args.google_redirect_url.as_deref(),
                    Some("https://api.elevategs.test/api/auth/google/callback")
                );
            },
        );
    }
}
