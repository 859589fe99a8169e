//! Web-push configuration and delivery abstraction.
//!
//! Browser subscriptions are stored per (user, endpoint) and addressed
//! through a [`PushSender`]. The default sender logs the delivery instead of
//! speaking the Web Push protocol, which keeps local development free of
//! VAPID key ceremony; a real sender is a drop-in trait implementation.

use anyhow::Result;
use secrecy::SecretString;
use tracing::info;

/// VAPID key pair used to sign push requests. The private key never leaves
/// this struct unredacted.
#[derive(Clone, Debug)]
pub struct VapidKeys {
    public_key: String,
    #[allow(dead_code)]
    private_key: SecretString,
}

#[derive(Clone, Debug, Default)]
pub struct PushConfig {
    vapid: Option<VapidKeys>,
}

impl PushConfig {
    /// Push disabled until a VAPID key pair is supplied.
    #[must_use]
    pub fn new() -> Self {
        Self { vapid: None }
    }

    #[must_use]
    pub fn with_vapid(mut self, public_key: String, private_key: SecretString) -> Self {
        self.vapid = Some(VapidKeys {
            public_key,
            private_key,
        });
        self
    }

    /// The public key browsers need to create a subscription, when configured.
    #[must_use]
    pub fn public_key(&self) -> Option<&str> {
        self.vapid.as_ref().map(|keys| keys.public_key.as_str())
    }
}

/// A stored browser subscription, as handed to a [`PushSender`].
#[derive(Clone, Debug)]
pub struct PushTarget {
    pub endpoint: String,
    pub p256dh_key: String,
    pub auth_key: String,
    pub content_encoding: String,
}

#[derive(Clone, Debug)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub url: String,
}

impl PushPayload {
    /// Payload for the `/api/push/test` endpoint.
    #[must_use]
    pub fn test() -> Self {
        Self {
            title: "ElevateGS".to_string(),
            body: "Push notifications are working.".to_string(),
            url: "/dashboard".to_string(),
        }
    }
}

/// Delivery abstraction for web push. Errors mark a single subscription as
/// failed; the caller decides whether that is fatal.
pub trait PushSender: Send + Sync {
    fn send(&self, target: &PushTarget, payload: &PushPayload) -> Result<()>;
}

/// Shared push state handed to handlers as an extension.
pub struct PushState {
    config: PushConfig,
    sender: std::sync::Arc<dyn PushSender>,
}

impl PushState {
    #[must_use]
    pub fn new(config: PushConfig, sender: std::sync::Arc<dyn PushSender>) -> Self {
        Self { config, sender }
    }

    #[must_use]
    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    #[must_use]
    pub fn sender(&self) -> &dyn PushSender {
        self.sender.as_ref()
    }
}

/// Local dev sender that logs instead of delivering.
#[derive(Clone, Debug)]
pub struct LogPushSender;

impl PushSender for LogPushSender {
    fn send(&self, target: &PushTarget, payload: &PushPayload) -> Result<()> {
        info!(
            endpoint = %target.endpoint,
            content_encoding = %target.content_encoding,
            title = %payload.title,
            body = %payload.body,
            url = %payload.url,
            "web push send stub"
        );
        Ok(())
    }
}
