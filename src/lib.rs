//! # ElevateGS API
//!
//! `elevategs` is the HTTP API behind the ElevateGS learning management
//! system. It owns the account lifecycle and the ambient services the web
//! client depends on.
//!
//! ## Accounts & Activation
//!
//! Accounts carry a role (`admin`, `teacher`, `student`) and two independent
//! gates: `is_active` and `email_verified_at`. An account can sign in only
//! when both hold.
//!
//! - **API registration** creates an inactive account and emails an
//!   activation link. The activation token is stored as a SHA-256 hash with a
//!   24 hour expiry; issuing a new token overwrites (and thereby invalidates)
//!   the previous one.
//! - **Web registration** requires the email address to be pre-verified
//!   through a short-lived link sent before the account exists; a verified
//!   record is consumed at account creation and the account starts active.
//! - **Google sign-in** bridges the external profile onto a local account,
//!   deferring role selection through transient server-side state when the
//!   user arrives without one.
//!
//! ## Guards
//!
//! Requests authenticate through either a server-side session cookie or a
//! bearer JWT. The session guard wins when both are present. Database rows
//! only ever store token hashes, never raw tokens.
//!
//! ## Surrounding surfaces
//!
//! Push subscriptions, in-app notifications, validated file uploads with a
//! polymorphic owner pair, an optimistic version-conflict guard for offline
//! edits, and a transactional email outbox drained by a background worker.

pub mod api;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
