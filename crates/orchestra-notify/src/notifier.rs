use async_trait::async_trait;

use crate::error::NotifyError;
use crate::payload::{PushPayload, PushTarget};

/// Delivers one payload to one probe.
///
/// Implementors must be `Send + Sync` so a single instance can be shared by
/// every job task.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Push `payload` to `target`. Returns only after the gateway accepted
    /// the notification or delivery was given up.
    async fn notify(&self, target: &PushTarget, payload: &PushPayload) -> Result<(), NotifyError>;

    /// Human-readable name used in logs.
    fn name(&self) -> &str;
}
