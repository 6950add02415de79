//! Resolve a job's filter into concrete push targets for one run.

use orchestra_core::JobId;
use orchestra_notify::PushPayload;
use tracing::debug;

use crate::error::Result;
use crate::keystore::Keystore;
use crate::store::{JobStore, ProbeRegistry};
use crate::types::{JobPayload, JobTarget, NewWorkItem, TargetFilter};

/// Query the registry and pair every matching probe with its payload.
///
/// For experiment jobs the signed experiment is verified once, then one
/// `ready` work item is created per target in a single batch; the work item
/// id is what the probe is told to fetch. Any failure aborts resolution and
/// leaves no work items behind.
pub fn resolve_targets(
    job_id: &JobId,
    filter: &TargetFilter,
    payload: &JobPayload,
    registry: &dyn ProbeRegistry,
    store: &dyn JobStore,
) -> Result<Vec<JobTarget>> {
    let probes = registry.find_probes(filter)?;

    let targets: Vec<JobTarget> = match payload {
        JobPayload::Alert(alert) => {
            let push = PushPayload::Alert {
                message: alert.message.clone(),
                extra: alert.extra.clone(),
            };
            probes
                .into_iter()
                .map(|probe| JobTarget {
                    target: probe.into(),
                    payload: push.clone(),
                    work_item_id: None,
                })
                .collect()
        }
        JobPayload::Experiment(def) => {
            let keystore = Keystore::from_pems(registry.load_signing_keys()?);
            let claims = keystore.verify(&def.signing_key_id, &def.signed_experiment)?;
            let args_idx = claims.args_idx();

            let items: Vec<NewWorkItem> = probes
                .iter()
                .map(|probe| NewWorkItem {
                    probe_id: probe.id.clone(),
                    job_id: job_id.clone(),
                    experiment_no: def.experiment_no,
                    args_idx: args_idx.clone(),
                })
                .collect();
            let ids = store.create_work_items(&items)?;

            probes
                .into_iter()
                .zip(ids)
                .map(|(probe, id)| JobTarget {
                    target: probe.into(),
                    payload: PushPayload::Experiment {
                        experiment_id: id.clone(),
                    },
                    work_item_id: Some(id),
                })
                .collect()
        }
    };

    debug!(job_id = %job_id, count = targets.len(), "targets resolved");
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::test_keys;
    use crate::schedule::Schedule;
    use crate::store::{NewJob, SqliteStore};
    use crate::types::{AlertPayload, ExperimentDefinition, JobKind, ProbeRecord, WorkItemState};
    use orchestra_core::{Platform, ProbeId};
    use rusqlite::Connection;

    fn store_with_probes() -> SqliteStore {
        let s = SqliteStore::new(Connection::open_in_memory().unwrap()).unwrap();
        for (id, cc, platform) in [("a", "IT", "ios"), ("b", "IT", "android"), ("c", "BR", "ios")] {
            s.upsert_probe(&ProbeRecord {
                id: ProbeId::from(id),
                country: cc.into(),
                platform: Platform::from(platform),
                token: format!("tok-{id}"),
            })
            .unwrap();
        }
        s
    }

    fn experiment_job(s: &SqliteStore, signed: String, key_id: String) -> (JobId, ExperimentDefinition) {
        let def = ExperimentDefinition {
            experiment_no: 0,
            test_name: "web_connectivity".into(),
            signing_key_id: key_id,
            signed_experiment: signed,
        };
        let job = s
            .insert_experiment_job(
                &NewJob {
                    comment: String::new(),
                    schedule: Schedule::parse("R/2030-01-01T00:00:00Z/P1D").unwrap(),
                    delay: 0,
                    filter: TargetFilter::default(),
                },
                &def,
            )
            .unwrap();
        let JobKind::Experiment { experiment_no } = job.kind else {
            unreachable!()
        };
        (job.id, ExperimentDefinition { experiment_no, ..def })
    }

    #[test]
    fn alert_targets_share_one_payload() {
        let s = store_with_probes();
        let payload = JobPayload::Alert(AlertPayload {
            message: "hi".into(),
            extra: Default::default(),
        });
        let filter = TargetFilter {
            countries: vec!["IT".into()],
            platforms: vec![],
        };
        let targets = resolve_targets(&JobId::new(), &filter, &payload, &s, &s).unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.work_item_id.is_none()));
        assert_eq!(targets[0].target.token, "tok-a");
        assert_eq!(targets[1].target.platform, Platform::Android);
    }

    #[test]
    fn experiment_creates_one_ready_item_per_target() {
        let s = store_with_probes();
        let key_id = s.add_signing_key(test_keys::PUBLIC_PEM).unwrap();
        let (job_id, def) = experiment_job(&s, test_keys::sign(&test_keys::web_connectivity(2)), key_id);

        let targets = resolve_targets(
            &job_id,
            &TargetFilter::default(),
            &JobPayload::Experiment(def.clone()),
            &s,
            &s,
        )
        .unwrap();
        assert_eq!(targets.len(), 3);

        for t in &targets {
            let id = t.work_item_id.as_deref().unwrap();
            assert_eq!(
                t.payload,
                PushPayload::Experiment {
                    experiment_id: id.to_string()
                }
            );
            let item = s.get_work_item(id).unwrap();
            assert_eq!(item.state, WorkItemState::Ready);
            assert_eq!(item.probe_id, t.target.probe_id);
            assert_eq!(item.job_id, job_id);
            assert_eq!(item.experiment_no, def.experiment_no);
            assert_eq!(item.args_idx, vec![0, 1]);
        }
    }

    #[test]
    fn bad_signature_aborts_before_any_work_item() {
        let s = store_with_probes();
        let key_id = s.add_signing_key(test_keys::PUBLIC_PEM).unwrap();
        let (job_id, def) = experiment_job(&s, "not.a.jws".into(), key_id);

        let err = resolve_targets(
            &job_id,
            &TargetFilter::default(),
            &JobPayload::Experiment(def),
            &s,
            &s,
        )
        .unwrap_err();
        assert_eq!(err.code(), "SIGNATURE_ERROR");
        assert!(s
            .list_pending_work_items(&ProbeId::from("a"), None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn failed_batch_leaves_no_work_items_and_retry_creates_one_each() {
        let s = store_with_probes();
        let key_id = s.add_signing_key(test_keys::PUBLIC_PEM).unwrap();
        let (job_id, def) = experiment_job(&s, test_keys::sign(&test_keys::web_connectivity(1)), key_id);
        let payload = JobPayload::Experiment(def);

        // probes resolve in id order a, b, c: the insert for b fails
        s.execute_batch(
            "CREATE TRIGGER fail_b BEFORE INSERT ON client_experiments
             WHEN NEW.probe_id = 'b'
             BEGIN SELECT RAISE(ABORT, 'insert rejected'); END;",
        )
        .unwrap();
        let err = resolve_targets(&job_id, &TargetFilter::default(), &payload, &s, &s).unwrap_err();
        assert_eq!(err.code(), "DATABASE_ERROR");
        for probe in ["a", "b", "c"] {
            assert!(s
                .list_pending_work_items(&ProbeId::from(probe), None)
                .unwrap()
                .is_empty());
        }

        s.execute_batch("DROP TRIGGER fail_b;").unwrap();
        let targets = resolve_targets(&job_id, &TargetFilter::default(), &payload, &s, &s).unwrap();
        assert_eq!(targets.len(), 3);
        for probe in ["a", "b", "c"] {
            let pending = s.list_pending_work_items(&ProbeId::from(probe), None).unwrap();
            assert_eq!(pending.len(), 1, "{probe}");
        }
    }
}
