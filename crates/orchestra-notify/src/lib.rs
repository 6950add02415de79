//! `orchestra-notify` — push notifications to probes through a gorush gateway.
//!
//! A [`PushTarget`] plus a [`PushPayload`] is turned into a platform-specific
//! [`GorushNotification`] and POSTed to `<gorush_url>/api/push`. Only `ios`
//! and `android` probes are reachable; any other platform yields
//! [`NotifyError::UnsupportedPlatform`] and is skipped by callers.

pub mod bulk;
pub mod error;
pub mod gorush;
pub mod notifier;
pub mod payload;

pub use bulk::{notify_bulk, BulkReport};
pub use error::NotifyError;
pub use gorush::GorushDispatcher;
pub use notifier::Notifier;
pub use payload::{GorushNotification, GorushRequest, PushPayload, PushSettings, PushTarget};
