//! Broadcast one payload to many probes, outside any job.

use futures_util::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::error::NotifyError;
use crate::notifier::Notifier;
use crate::payload::{PushPayload, PushTarget};

/// Outcome counts of a bulk broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub sent: usize,
    pub unsupported: usize,
    pub failed: usize,
}

/// Notify every target independently with at most `concurrency` requests in
/// flight. A failure on one target never blocks the others; every failure is
/// logged with the probe it concerns.
pub async fn notify_bulk(
    notifier: &dyn Notifier,
    targets: &[PushTarget],
    payload: &PushPayload,
    concurrency: usize,
) -> BulkReport {
    let outcomes: Vec<Result<(), NotifyError>> = stream::iter(targets)
        .map(|target| async move {
            let result = notifier.notify(target, payload).await;
            if let Err(ref e) = result {
                warn!(
                    notifier = notifier.name(),
                    probe_id = %target.probe_id,
                    platform = %target.platform,
                    error = %e,
                    "bulk notification not delivered"
                );
            }
            result
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut report = BulkReport::default();
    for outcome in outcomes {
        match outcome {
            Ok(()) => report.sent += 1,
            Err(NotifyError::UnsupportedPlatform { .. }) => report.unsupported += 1,
            Err(_) => report.failed += 1,
        }
    }
    info!(
        sent = report.sent,
        unsupported = report.unsupported,
        failed = report.failed,
        "bulk notification finished"
    );
    report
}
