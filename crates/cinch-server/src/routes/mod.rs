//! Route modules, composed in `crate::router` (`buildit-api/src/routes/mod.rs` pattern).

pub mod admin;
pub mod health;
pub mod webhooks;
