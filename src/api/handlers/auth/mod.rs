//! Account lifecycle handlers.
//!
//! Two registration funnels feed the same `users` table:
//!
//! - **API funnel**: the account is created inactive and activated through an
//!   emailed link whose SHA-256 hash lives on the user row. Issuing a new
//!   link overwrites the hash, which is what invalidates the old link.
//! - **Web funnel**: the address is verified *before* the account exists via
//!   a short-lived record in `email_verifications`; registration consumes the
//!   verified record and the account starts active.
//!
//! Google sign-in bridges onto the same table, parking profiles in transient
//! state when the user still has to pick a role.
//!
//! Raw tokens (activation, verification, session) are emailed or set as
//! cookies but never stored; the database only ever sees hashes.

pub(crate) mod activation;
pub(crate) mod login;
pub(crate) mod oauth;
pub(crate) mod register;
pub(crate) mod session;
mod state;
pub(crate) mod storage;
pub(crate) mod tokens;
pub(crate) mod types;
mod utils;
pub(crate) mod verification;

pub use state::{AuthConfig, AuthState, GoogleConfig};
pub use storage::UserRecord;
