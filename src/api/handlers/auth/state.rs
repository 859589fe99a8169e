//! Auth configuration and shared state, including the transient store that
//! carries the Google sign-in round trip.

use secrecy::SecretString;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::types::Role;

const DEFAULT_SESSION_TTL_SECONDS: i64 = 12 * 60 * 60;
const DEFAULT_ACTIVATION_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_VERIFICATION_TOKEN_TTL_SECONDS: i64 = 30 * 60;
const OAUTH_ROUND_TTL: Duration = Duration::from_secs(10 * 60);

/// Google OAuth client settings. Sign-in routes return 404-style redirects
/// when this is absent.
#[derive(Clone, Debug)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_url: String,
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    jwt_secret: SecretString,
    frontend_base_url: String,
    session_ttl_seconds: i64,
    activation_token_ttl_seconds: i64,
    verification_token_ttl_seconds: i64,
    google: Option<GoogleConfig>,
}

impl AuthConfig {
    #[must_use]
    pub fn new(jwt_secret: SecretString, frontend_base_url: String) -> Self {
        Self {
            jwt_secret,
            frontend_base_url,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            activation_token_ttl_seconds: DEFAULT_ACTIVATION_TOKEN_TTL_SECONDS,
            verification_token_ttl_seconds: DEFAULT_VERIFICATION_TOKEN_TTL_SECONDS,
            google: None,
        }
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_activation_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.activation_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_verification_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.verification_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_google(mut self, google: GoogleConfig) -> Self {
        self.google = Some(google);
        self
    }

    pub(crate) fn jwt_secret(&self) -> &SecretString {
        &self.jwt_secret
    }

    pub(crate) fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    pub(super) fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    pub(super) fn activation_token_ttl_seconds(&self) -> i64 {
        self.activation_token_ttl_seconds
    }

    pub(super) fn verification_token_ttl_seconds(&self) -> i64 {
        self.verification_token_ttl_seconds
    }

    pub(super) fn google(&self) -> Option<&GoogleConfig> {
        self.google.as_ref()
    }

    pub(super) fn session_cookie_secure(&self) -> bool {
        self.frontend_base_url.starts_with("https://")
    }
}

/// Snapshot of the Google profile carried across the role-selection step.
#[derive(Clone, Debug)]
pub(super) struct GoogleProfile {
    pub(super) google_id: String,
    pub(super) email: String,
    pub(super) first_name: String,
    pub(super) last_name: String,
    pub(super) name: String,
    pub(super) picture: Option<String>,
}

pub(super) struct OAuthRound {
    pub(super) role: Option<Role>,
    created_at: Instant,
}

struct PendingSelection {
    profile: GoogleProfile,
    created_at: Instant,
}

/// Transient, TTL-bounded state for the Google round trip: the `state` nonce
/// sent to Google, and profile snapshots awaiting role selection. Entries are
/// swept on access; nothing is persisted.
pub struct OAuthState {
    round_ttl: Duration,
    rounds: Mutex<HashMap<String, OAuthRound>>,
    selections: Mutex<HashMap<Uuid, PendingSelection>>,
}

impl Default for OAuthState {
    fn default() -> Self {
        Self::new()
    }
}

impl OAuthState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            round_ttl: OAUTH_ROUND_TTL,
            rounds: Mutex::new(HashMap::new()),
            selections: Mutex::new(HashMap::new()),
        }
    }

    pub(super) async fn store_round(&self, state: String, role: Option<Role>) {
        let mut rounds = self.rounds.lock().await;
        rounds.retain(|_, entry| entry.created_at.elapsed() < self.round_ttl);
        rounds.insert(
            state,
            OAuthRound {
                role,
                created_at: Instant::now(),
            },
        );
    }

    pub(super) async fn take_round(&self, state: &str) -> Option<OAuthRound> {
        let mut rounds = self.rounds.lock().await;
        let round = rounds.remove(state)?;
        if round.created_at.elapsed() < self.round_ttl {
            Some(round)
        } else {
            None
        }
    }

    pub(super) async fn store_selection(&self, profile: GoogleProfile) -> Uuid {
        let selection_id = Uuid::new_v4();
        let mut selections = self.selections.lock().await;
        selections.retain(|_, entry| entry.created_at.elapsed() < self.round_ttl);
        selections.insert(
            selection_id,
            PendingSelection {
                profile,
                created_at: Instant::now(),
            },
        );
        selection_id
    }

    pub(super) async fn take_selection(&self, selection_id: Uuid) -> Option<GoogleProfile> {
        let mut selections = self.selections.lock().await;
        let selection = selections.remove(&selection_id)?;
        if selection.created_at.elapsed() < self.round_ttl {
            Some(selection.profile)
        } else {
            None
        }
    }
}

pub struct AuthState {
    config: AuthConfig,
    oauth: OAuthState,
    http: reqwest::Client,
}

impl AuthState {
    /// # Panics
    /// Never panics in practice; the reqwest builder only fails on invalid
    /// TLS backends, and we use the defaults.
    #[must_use]
    pub fn new(config: AuthConfig) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            config,
            oauth: OAuthState::new(),
            http,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub(super) fn oauth(&self) -> &OAuthState {
        &self.oauth
    }

    pub(super) fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig::new(
            SecretString::from("secret"),
            "https://elevategs.test".to_string(),
        )
    }

    #[test]
    fn auth_config_defaults_and_overrides() {
        let cfg = config();
        assert_eq!(cfg.frontend_base_url(), "https://elevategs.test");
        assert_eq!(cfg.session_ttl_seconds(), DEFAULT_SESSION_TTL_SECONDS);
        assert_eq!(
            cfg.activation_token_ttl_seconds(),
            DEFAULT_ACTIVATION_TOKEN_TTL_SECONDS
        );
        assert_eq!(
            cfg.verification_token_ttl_seconds(),
            DEFAULT_VERIFICATION_TOKEN_TTL_SECONDS
        );
        assert!(cfg.google().is_none());
        assert!(cfg.session_cookie_secure());

        let cfg = cfg
            .with_session_ttl_seconds(60)
            .with_activation_token_ttl_seconds(120)
            .with_verification_token_ttl_seconds(30);
        assert_eq!(cfg.session_ttl_seconds(), 60);
        assert_eq!(cfg.activation_token_ttl_seconds(), 120);
        assert_eq!(cfg.verification_token_ttl_seconds(), 30);
    }

    #[test]
    fn cookie_secure_requires_https_frontend() {
        let cfg = AuthConfig::new(
            SecretString::from("secret"),
            "http://localhost:8080".to_string(),
        );
        assert!(!cfg.session_cookie_secure());
    }

    #[tokio::test]
    async fn oauth_round_is_single_use() {
        let state = OAuthState::new();
        state
            .store_round("nonce".to_string(), Some(Role::Teacher))
            .await;

        let round = state.take_round("nonce").await.unwrap();
        assert_eq!(round.role, Some(Role::Teacher));
        assert!(state.take_round("nonce").await.is_none());
    }

    #[tokio::test]
    async fn unknown_round_is_none() {
        let state = OAuthState::new();
        assert!(state.take_round("missing").await.is_none());
    }

    #[tokio::test]
    async fn selection_round_trip() {
        let state = OAuthState::new();
        let profile = GoogleProfile {
            google_id: "g-123".to_string(),
            email: "alice@example.com".to_string(),
            first_name: "Alice".to_string(),
            last_name: "Doe".to_string(),
            name: "Alice Doe".to_string(),
            picture: None,
        };
        let id = state.store_selection(profile).await;

        let taken = state.take_selection(id).await.unwrap();
        assert_eq!(taken.email, "alice@example.com");
        assert!(state.take_selection(id).await.is_none());
    }
}
