pub mod auth;
pub mod health;
pub mod notifications;
pub mod push;
pub mod uploads;
