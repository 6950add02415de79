//! Operator-facing job management: create, delete and list.

use std::sync::Arc;

use orchestra_core::JobId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::engine::Scheduler;
use crate::error::{Result, SchedulerError};
use crate::job::Job;
use crate::keystore::Keystore;
use crate::schedule::Schedule;
use crate::store::{JobListing, NewJob, ProbeRegistry, SqliteStore};
use crate::types::{AlertPayload, ExperimentDefinition, JobRecord, TargetFilter};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertJobRequest {
    pub schedule: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub delay: i64,
    #[serde(default)]
    pub filter: TargetFilter,
    pub message: String,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentJobRequest {
    pub schedule: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub delay: i64,
    #[serde(default)]
    pub filter: TargetFilter,
    pub signing_key_id: String,
    pub signed_experiment: String,
}

/// Persists administrative changes and mirrors them into the live scheduler.
pub struct AdminHandle {
    store: Arc<SqliteStore>,
    scheduler: Arc<Scheduler>,
}

impl AdminHandle {
    pub fn new(store: Arc<SqliteStore>, scheduler: Arc<Scheduler>) -> Self {
        Self { store, scheduler }
    }

    /// Store a new alert job and arm it.
    pub fn create_alert_job(&self, req: AlertJobRequest) -> Result<JobRecord> {
        let job = NewJob {
            schedule: Schedule::parse(&req.schedule)?,
            comment: req.comment,
            delay: req.delay,
            filter: req.filter,
        };
        let alert = AlertPayload {
            message: req.message,
            extra: req.extra,
        };
        let record = self.store.insert_alert_job(&job, &alert)?;
        self.arm(&record);
        Ok(record)
    }

    /// Verify, store and arm a signed experiment job.
    pub fn create_experiment_job(&self, req: ExperimentJobRequest) -> Result<JobRecord> {
        let schedule = Schedule::parse(&req.schedule)?;
        let keystore = Keystore::from_pems(self.store.load_signing_keys()?);
        let claims = keystore.verify(&req.signing_key_id, &req.signed_experiment)?;
        if claims.test_name.is_empty() {
            return Err(SchedulerError::Signature("experiment has no test_name".into()));
        }

        let job = NewJob {
            schedule,
            comment: req.comment,
            delay: req.delay,
            filter: req.filter,
        };
        let experiment = ExperimentDefinition {
            experiment_no: 0,
            test_name: claims.test_name,
            signing_key_id: req.signing_key_id,
            signed_experiment: req.signed_experiment,
        };
        let record = self.store.insert_experiment_job(&job, &experiment)?;
        self.arm(&record);
        Ok(record)
    }

    /// Mark a job deleted and stop rearming it.
    ///
    /// Fails with `JobNotFound` only if no active row exists; a job that
    /// already finished is simply no longer in the live registry.
    pub fn delete_job(&self, id: &JobId) -> Result<()> {
        self.store.mark_job_deleted(id)?;
        match self.scheduler.delete_job(id) {
            Ok(()) | Err(SchedulerError::JobNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        info!(job_id = %id, "job deleted by operator");
        Ok(())
    }

    pub fn list_jobs(&self, include_deleted: bool) -> Result<Vec<JobListing>> {
        self.store.list_jobs(include_deleted)
    }

    fn arm(&self, record: &JobRecord) {
        let armed = self
            .scheduler
            .run_job(Arc::new(Job::from_record(record.clone())));
        debug!(job_id = %record.id, armed, "job handed to scheduler");
    }
}
