//! Probe-driven transitions of per-target work items.
//!
//! ```text
//! ready ──► notified ──► accepted ──► done
//!   │          │            │
//!   └──────────┴────────────┴──► rejected
//! ```
//! `accept` may skip `notified` when the probe polls before the push lands.

use orchestra_core::ProbeId;

use crate::error::Result;
use crate::store::JobStore;
use crate::types::{TimestampColumn, WorkItem, WorkItemState};

const NOTIFY_FROM: &[WorkItemState] = &[WorkItemState::Ready];
const ACCEPT_FROM: &[WorkItemState] = &[WorkItemState::Ready, WorkItemState::Notified];
const REJECT_FROM: &[WorkItemState] = &[
    WorkItemState::Ready,
    WorkItemState::Notified,
    WorkItemState::Accepted,
];
const DONE_FROM: &[WorkItemState] = &[WorkItemState::Accepted];

/// Record that the push for `id` was accepted by the gateway.
pub fn mark_notified(store: &dyn JobStore, id: &str, probe_id: &ProbeId) -> Result<WorkItem> {
    store.set_work_item_state(
        id,
        probe_id,
        WorkItemState::Notified,
        NOTIFY_FROM,
        TimestampColumn::Notification,
    )
}

pub fn accept(store: &dyn JobStore, id: &str, probe_id: &ProbeId) -> Result<WorkItem> {
    store.set_work_item_state(
        id,
        probe_id,
        WorkItemState::Accepted,
        ACCEPT_FROM,
        TimestampColumn::Accept,
    )
}

pub fn reject(store: &dyn JobStore, id: &str, probe_id: &ProbeId) -> Result<WorkItem> {
    store.set_work_item_state(
        id,
        probe_id,
        WorkItemState::Rejected,
        REJECT_FROM,
        TimestampColumn::Done,
    )
}

pub fn complete(store: &dyn JobStore, id: &str, probe_id: &ProbeId) -> Result<WorkItem> {
    store.set_work_item_state(
        id,
        probe_id,
        WorkItemState::Done,
        DONE_FROM,
        TimestampColumn::Done,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use crate::schedule::Schedule;
    use crate::store::{NewJob, SqliteStore};
    use crate::types::{ExperimentDefinition, JobKind, NewWorkItem, TargetFilter};
    use rusqlite::Connection;

    fn setup() -> (SqliteStore, String, ProbeId) {
        let store = SqliteStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let job = store
            .insert_experiment_job(
                &NewJob {
                    comment: String::new(),
                    schedule: Schedule::parse("R/2030-01-01T00:00:00Z/P1D").unwrap(),
                    delay: 0,
                    filter: TargetFilter::default(),
                },
                &ExperimentDefinition {
                    experiment_no: 0,
                    test_name: "dash".into(),
                    signing_key_id: "k".into(),
                    signed_experiment: "t".into(),
                },
            )
            .unwrap();
        let JobKind::Experiment { experiment_no } = job.kind else {
            unreachable!()
        };
        let probe = ProbeId::from("probe-a");
        let id = store
            .create_work_items(&[NewWorkItem {
                probe_id: probe.clone(),
                job_id: job.id,
                experiment_no,
                args_idx: vec![],
            }])
            .unwrap()
            .remove(0);
        (store, id, probe)
    }

    #[test]
    fn happy_path_sets_each_timestamp() {
        let (store, id, probe) = setup();
        let item = mark_notified(&store, &id, &probe).unwrap();
        assert_eq!(item.state, WorkItemState::Notified);
        assert!(item.notification_time.is_some());

        let item = accept(&store, &id, &probe).unwrap();
        assert_eq!(item.state, WorkItemState::Accepted);
        assert!(item.accept_time.is_some());

        let item = complete(&store, &id, &probe).unwrap();
        assert_eq!(item.state, WorkItemState::Done);
        assert!(item.done_time.is_some());
    }

    #[test]
    fn accept_can_skip_notified() {
        let (store, id, probe) = setup();
        let item = accept(&store, &id, &probe).unwrap();
        assert_eq!(item.state, WorkItemState::Accepted);
        assert!(item.notification_time.is_none());
    }

    #[test]
    fn reject_is_reachable_until_done() {
        let (store, id, probe) = setup();
        accept(&store, &id, &probe).unwrap();
        let item = reject(&store, &id, &probe).unwrap();
        assert_eq!(item.state, WorkItemState::Rejected);

        // terminal: nothing moves a rejected item
        for result in [
            mark_notified(&store, &id, &probe),
            accept(&store, &id, &probe),
            reject(&store, &id, &probe),
            complete(&store, &id, &probe),
        ] {
            assert!(matches!(
                result,
                Err(SchedulerError::InconsistentState { .. })
            ));
        }
    }

    #[test]
    fn done_requires_accepted() {
        let (store, id, probe) = setup();
        let before = store.get_work_item(&id).unwrap();
        assert!(complete(&store, &id, &probe).is_err());
        assert_eq!(store.get_work_item(&id).unwrap(), before);

        mark_notified(&store, &id, &probe).unwrap();
        assert!(mark_notified(&store, &id, &probe).is_err());
    }
}
