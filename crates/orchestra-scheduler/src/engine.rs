use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use orchestra_core::config::SchedulerConfig;
use orchestra_core::JobId;
use orchestra_notify::Notifier;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::job::{Job, RunContext};
use crate::store::{JobStore, ProbeRegistry};

/// Backoff applied after a run aborts before advancing its job.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Consecutive aborts after which the job is reported as stalled.
    pub stall_alarm_after: u32,
}

impl RetryPolicy {
    /// Delay before the retry following the `failures`-th consecutive abort.
    ///
    /// Schedule: base → 2·base → 4·base → … → max (cap).
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl From<&SchedulerConfig> for RetryPolicy {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            base: Duration::from_secs(config.retry_base_secs.max(1)),
            max: Duration::from_secs(config.retry_max_secs.max(config.retry_base_secs).max(1)),
            stall_alarm_after: config.stall_alarm_after.max(1),
        }
    }
}

/// Live jobs partitioned by kind, then by id.
#[derive(Default)]
pub struct JobRegistry {
    partitions: DashMap<&'static str, DashMap<JobId, Arc<Job>>>,
}

impl JobRegistry {
    fn insert(&self, job: Arc<Job>) -> Option<Arc<Job>> {
        self.partitions
            .entry(job.kind().tag())
            .or_default()
            .insert(job.id().clone(), job)
    }

    fn remove(&self, id: &JobId) -> Option<Arc<Job>> {
        self.partitions
            .iter()
            .find_map(|p| p.value().remove(id).map(|(_, job)| job))
    }

    /// Remove `job` only if it is still the registered instance for its id.
    fn remove_exact(&self, job: &Arc<Job>) {
        if let Some(partition) = self.partitions.get(job.kind().tag()) {
            partition.remove_if(job.id(), |_, current| Arc::ptr_eq(current, job));
        }
    }

    pub fn get(&self, id: &JobId) -> Option<Arc<Job>> {
        self.partitions
            .iter()
            .find_map(|p| p.value().get(id).map(|j| Arc::clone(j.value())))
    }

    /// Ids of live jobs of one kind (`"alert"` or `"experiment"`).
    pub fn ids(&self, kind: &str) -> Vec<JobId> {
        self.partitions
            .get(kind)
            .map(|p| p.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns the live jobs and one timer task per job.
///
/// Each task sleeps until its job is due, runs it, then rearms from the
/// job's new state. Deleting a job stops the task at its next wake-up; a run
/// already in progress is not interrupted.
pub struct Scheduler {
    ctx: Arc<RunContext>,
    jobs: Arc<JobRegistry>,
    policy: RetryPolicy,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<dyn ProbeRegistry>,
        notifier: Arc<dyn Notifier>,
        config: &SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx: Arc::new(RunContext {
                store,
                registry,
                notifier,
            }),
            jobs: Arc::new(JobRegistry::default()),
            policy: RetryPolicy::from(config),
            shutdown_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    /// Load every active job and arm its timer.
    ///
    /// A failure to read the job list is fatal and returned as is.
    pub fn start(&self) -> Result<usize> {
        let records = self.ctx.store.load_active_jobs()?;
        let mut armed = 0;
        for record in records {
            if self.run_job(Arc::new(Job::from_record(record))) {
                armed += 1;
            }
        }
        info!(jobs = armed, "scheduler started");
        Ok(armed)
    }

    /// Register `job` and arm its timer, unless it is already done.
    ///
    /// Returns whether the job was armed. A job registered under the same id
    /// is retired and replaced.
    pub fn run_job(&self, job: Arc<Job>) -> bool {
        if job.is_done() {
            debug!(job_id = %job.id(), "job already done, not arming");
            return false;
        }
        if let Some(previous) = self.jobs.insert(Arc::clone(&job)) {
            warn!(job_id = %job.id(), "job re-armed, retiring previous instance");
            previous.retire();
        }

        let handle = tokio::spawn(drive(
            job,
            Arc::clone(&self.ctx),
            Arc::clone(&self.jobs),
            self.policy,
            self.shutdown_tx.subscribe(),
        ));
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
        true
    }

    /// Stop rearming a job and drop it from the registry.
    pub fn delete_job(&self, id: &JobId) -> Result<()> {
        let job = self
            .jobs
            .remove(id)
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        job.retire();
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Stop every timer and wait for in-progress runs to finish.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "job task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

/// Timer loop of one job.
async fn drive(
    job: Arc<Job>,
    ctx: Arc<RunContext>,
    jobs: Arc<JobRegistry>,
    policy: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    let mut wait = job.wait_duration(Utc::now()).await;

    loop {
        if job.is_done() || *shutdown.borrow() {
            break;
        }
        debug!(job_id = %job.id(), wait_ms = wait.as_millis() as u64, "job armed");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = job.retired() => break,
            _ = shutdown.changed() => break,
        }

        match job.run(&ctx).await {
            Ok(_) => {
                failures = 0;
                wait = job.wait_duration(Utc::now()).await;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                wait = policy.backoff(failures);
                let retry_after_ms = wait.as_millis() as u64;
                if failures >= policy.stall_alarm_after {
                    error!(
                        job_id = %job.id(),
                        failures,
                        stalled = true,
                        error = %e,
                        retry_after_ms,
                        "job stalled: consecutive runs aborted"
                    );
                } else {
                    warn!(
                        job_id = %job.id(),
                        failures,
                        error = %e,
                        retry_after_ms,
                        "job run aborted, retrying"
                    );
                }
            }
        }
    }

    jobs.remove_exact(&job);
    debug!(job_id = %job.id(), "job timer retired");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::job::tests::{alert_job, sqlite_with_probes, RecordingNotifier};
    use crate::schedule::Schedule;
    use crate::store::{NewJob, SqliteStore};
    use crate::types::{AlertPayload, JobRecord, TargetFilter};
    use crate::types::JobKind;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(40),
            stall_alarm_after: 2,
        }
    }

    fn scheduler(store: Arc<SqliteStore>, notifier: Arc<RecordingNotifier>) -> Scheduler {
        Scheduler::new(
            store.clone(),
            store,
            notifier,
            &SchedulerConfig::default(),
        )
        .with_retry_policy(fast_policy())
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn insert_alert(store: &SqliteStore, schedule: &str) -> JobRecord {
        store
            .insert_alert_job(
                &NewJob {
                    comment: String::new(),
                    schedule: Schedule::parse(schedule).unwrap(),
                    delay: 0,
                    filter: TargetFilter::default(),
                },
                &AlertPayload {
                    message: "m".into(),
                    extra: Default::default(),
                },
            )
            .unwrap()
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let p = RetryPolicy {
            base: Duration::from_secs(30),
            max: Duration::from_secs(600),
            stall_alarm_after: 5,
        };
        let secs: Vec<u64> = (1..=7).map(|n| p.backoff(n).as_secs()).collect();
        assert_eq!(secs, vec![30, 60, 120, 240, 480, 600, 600]);
        assert_eq!(p.backoff(u32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn zero_base_from_config_is_clamped() {
        let p = RetryPolicy::from(&SchedulerConfig {
            retry_base_secs: 0,
            retry_max_secs: 0,
            stall_alarm_after: 0,
        });
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(4), Duration::from_secs(1));
        assert_eq!(p.stall_alarm_after, 1);
    }

    #[tokio::test]
    async fn start_arms_active_jobs_and_bounded_jobs_complete() {
        let store = sqlite_with_probes(&[("a", "IT", "ios")]);
        let notifier = Arc::new(RecordingNotifier::default());
        insert_alert(&store, "R2/2020-01-01T00:00:00Z/PT0.02S");
        insert_alert(&store, "R/2020-01-01T00:00:00Z/P1D");
        let sched = scheduler(store.clone(), notifier.clone());

        assert_eq!(sched.start().unwrap(), 2);
        assert_eq!(sched.jobs().ids("alert").len(), 2);

        // bounded job: 3 runs, then retired; unbounded job: 1 run, then waits a day
        wait_until(|| notifier.delivered.lock().unwrap().len() == 4).await;
        wait_until(|| sched.jobs().len() == 1).await;

        sched.shutdown().await;
        assert_eq!(notifier.delivered.lock().unwrap().len(), 4);
        assert_eq!(store.load_active_jobs().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_stops_future_runs() {
        let store = sqlite_with_probes(&[("a", "IT", "ios")]);
        let notifier = Arc::new(RecordingNotifier::default());
        let sched = scheduler(store.clone(), notifier.clone());
        let job = Arc::new(alert_job(&store, "R/2020-01-01T00:00:00Z/PT0.05S"));
        let id = job.id().clone();

        assert!(sched.run_job(Arc::clone(&job)));
        wait_until(|| !notifier.delivered.lock().unwrap().is_empty()).await;

        sched.delete_job(&id).unwrap();
        assert!(job.is_done());
        assert!(sched.jobs().get(&id).is_none());
        let runs = job.snapshot().await.times_run;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(job.snapshot().await.times_run, runs);

        assert!(matches!(
            sched.delete_job(&id),
            Err(SchedulerError::JobNotFound { .. })
        ));
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn delete_does_not_cancel_an_in_flight_run() {
        let store = sqlite_with_probes(&[("a", "IT", "ios"), ("b", "IT", "ios")]);
        let notifier = Arc::new(RecordingNotifier {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let sched = scheduler(store.clone(), notifier.clone());
        let job = Arc::new(alert_job(&store, "R/2020-01-01T00:00:00Z/PT0S"));
        let id = job.id().clone();

        sched.run_job(Arc::clone(&job));
        wait_until(|| notifier.in_flight.load(Ordering::SeqCst) == 1).await;
        sched.delete_job(&id).unwrap();

        // the run in progress still reaches both targets, then nothing more
        sched.shutdown().await;
        assert_eq!(job.snapshot().await.times_run, 1);
        assert_eq!(notifier.delivered.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn done_jobs_are_not_armed() {
        let store = sqlite_with_probes(&[]);
        let sched = scheduler(store.clone(), Arc::new(RecordingNotifier::default()));
        let record = insert_alert(&store, "R0/2020-01-01T00:00:00Z/P1D");
        let job = Arc::new(Job::from_record(JobRecord {
            is_done: true,
            ..record
        }));
        assert!(!sched.run_job(job));
        assert!(sched.jobs().is_empty());
    }

    #[tokio::test]
    async fn aborted_runs_are_retried_with_backoff() {
        let store = sqlite_with_probes(&[("a", "IT", "ios")]);
        let notifier = Arc::new(RecordingNotifier::default());
        let sched = scheduler(store.clone(), notifier.clone());
        let record = insert_alert(&store, "R/2020-01-01T00:00:00Z/P1D");
        // points at a missing alert row: every run aborts
        let job = Arc::new(Job::from_record(JobRecord {
            kind: JobKind::Alert { alert_no: 999 },
            ..record
        }));

        sched.run_job(Arc::clone(&job));
        tokio::time::sleep(Duration::from_millis(150)).await;

        // still registered and armed, never advanced
        assert!(sched.jobs().get(job.id()).is_some());
        assert!(!job.is_done());
        assert_eq!(job.snapshot().await.times_run, 0);
        sched.shutdown().await;
    }

    struct FailingStore;

    impl JobStore for FailingStore {
        fn load_active_jobs(&self) -> Result<Vec<JobRecord>> {
            Err(SchedulerError::Database(rusqlite::Error::InvalidQuery))
        }
        fn load_payload(&self, _: &JobKind) -> Result<crate::types::JobPayload> {
            unreachable!()
        }
        fn save_job_run_state(
            &self,
            _: &JobId,
            _: u64,
            _: chrono::DateTime<Utc>,
            _: bool,
        ) -> Result<()> {
            unreachable!()
        }
        fn create_work_items(&self, _: &[crate::types::NewWorkItem]) -> Result<Vec<String>> {
            unreachable!()
        }
        fn get_work_item(&self, _: &str) -> Result<crate::types::WorkItem> {
            unreachable!()
        }
        fn set_work_item_state(
            &self,
            _: &str,
            _: &orchestra_core::ProbeId,
            _: crate::types::WorkItemState,
            _: &[crate::types::WorkItemState],
            _: crate::types::TimestampColumn,
        ) -> Result<crate::types::WorkItem> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn startup_fails_when_jobs_cannot_be_loaded() {
        let probes = sqlite_with_probes(&[]);
        let sched = Scheduler::new(
            Arc::new(FailingStore),
            probes,
            Arc::new(RecordingNotifier::default()),
            &SchedulerConfig::default(),
        );
        let err = sched.start().unwrap_err();
        assert_eq!(err.code(), "DATABASE_ERROR");
        assert!(sched.jobs().is_empty());
    }
}
