//! A live job: schedule, run counters and the run/reschedule cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use orchestra_core::JobId;
use orchestra_notify::{Notifier, NotifyError};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::schedule::Schedule;
use crate::store::{far_future, JobStore, ProbeRegistry};
use crate::targets::resolve_targets;
use crate::types::{JobKind, JobPayload, JobRecord, JobTarget, TargetFilter};
use crate::work_items;

/// Collaborators a run needs.
pub struct RunContext {
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<dyn ProbeRegistry>,
    pub notifier: Arc<dyn Notifier>,
}

/// Counters mutated only while the run lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunState {
    pub times_run: u64,
    pub next_run_at: DateTime<Utc>,
    pub is_done: bool,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Per-target outcome counts of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub targets: usize,
    pub sent: usize,
    pub unsupported: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The job was not due (or already finished) when the lock was taken.
    Skipped,
    Completed(RunReport),
}

pub struct Job {
    id: JobId,
    kind: JobKind,
    schedule: Schedule,
    filter: TargetFilter,
    comment: String,
    /// Held for the whole run, so runs of one job never overlap.
    state: Mutex<RunState>,
    /// Mirror of `state.is_done`, readable without waiting for a run.
    done: AtomicBool,
    deleted: AtomicBool,
    retire_signal: Notify,
}

impl Job {
    pub fn from_record(record: JobRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            schedule: record.schedule,
            filter: record.filter,
            comment: record.comment,
            state: Mutex::new(RunState {
                times_run: record.times_run,
                next_run_at: record.next_run_at,
                is_done: record.is_done,
                last_run_at: None,
            }),
            done: AtomicBool::new(record.is_done),
            deleted: AtomicBool::new(false),
            retire_signal: Notify::new(),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// True once the job finished its schedule or was deleted.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst) || self.deleted.load(Ordering::SeqCst)
    }

    /// Current counters. Waits for an in-progress run to finish.
    pub async fn snapshot(&self) -> RunState {
        *self.state.lock().await
    }

    /// Stop future runs. A run already in progress completes normally.
    pub fn retire(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        self.retire_signal.notify_one();
    }

    /// Resolves once [`Job::retire`] has been called.
    pub async fn retired(&self) {
        if self.deleted.load(Ordering::SeqCst) {
            return;
        }
        self.retire_signal.notified().await;
    }

    fn should_run(&self, state: &RunState, now: DateTime<Utc>) -> bool {
        if state.is_done || self.deleted.load(Ordering::SeqCst) {
            return false;
        }
        if now < self.schedule.start_time {
            return false;
        }
        if !self.schedule.repeat.allows_run(state.times_run) {
            return false;
        }
        now >= state.next_run_at
    }

    /// How long to sleep before the next run is due.
    ///
    /// Before the first run this is measured against the schedule's start
    /// time, afterwards against `next_run_at`.
    pub async fn wait_duration(&self, now: DateTime<Utc>) -> std::time::Duration {
        let state = self.state.lock().await;
        let due = if state.times_run == 0 && state.last_run_at.is_none() {
            self.schedule.start_time
        } else {
            state.next_run_at
        };
        (due - now).to_std().unwrap_or(std::time::Duration::ZERO)
    }

    /// Execute one run if the job is due.
    ///
    /// Returns an error, without touching the counters, when the payload
    /// cannot be refreshed or targets cannot be resolved. Per-target
    /// notification failures are logged and counted, never returned.
    pub async fn run(&self, ctx: &RunContext) -> Result<RunOutcome> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if !state.is_done && !self.schedule.repeat.allows_run(state.times_run) {
            // A persisted row can carry more runs than its schedule allows.
            warn!(job_id = %self.id, times_run = state.times_run, "run budget exhausted, marking done");
            state.is_done = true;
            self.done.store(true, Ordering::SeqCst);
            self.persist(ctx, &state);
            return Ok(RunOutcome::Skipped);
        }
        if !self.should_run(&state, now) {
            debug!(job_id = %self.id, next_run_at = %state.next_run_at, "job not due");
            return Ok(RunOutcome::Skipped);
        }

        let payload = ctx.store.load_payload(&self.kind)?;
        self.check_payload(&payload)?;
        let targets = resolve_targets(
            &self.id,
            &self.filter,
            &payload,
            ctx.registry.as_ref(),
            ctx.store.as_ref(),
        )?;

        let last_run_at = Utc::now();
        let report = self.dispatch(ctx, &targets).await;

        state.times_run += 1;
        state.last_run_at = Some(last_run_at);
        if self.schedule.repeat.allows_run(state.times_run) {
            state.next_run_at = last_run_at
                .checked_add_signed(self.schedule.span())
                .map_or_else(far_future, |t| t.min(far_future()));
        } else {
            state.is_done = true;
        }
        self.done.store(state.is_done, Ordering::SeqCst);
        self.persist(ctx, &state);

        info!(
            job_id = %self.id,
            kind = self.kind.tag(),
            run = state.times_run,
            targets = report.targets,
            sent = report.sent,
            unsupported = report.unsupported,
            failed = report.failed,
            is_done = state.is_done,
            next_run_at = %state.next_run_at,
            "job run complete"
        );
        Ok(RunOutcome::Completed(report))
    }

    fn check_payload(&self, payload: &JobPayload) -> Result<()> {
        match (&self.kind, payload) {
            (JobKind::Alert { .. }, JobPayload::Alert(_))
            | (JobKind::Experiment { .. }, JobPayload::Experiment(_)) => Ok(()),
            _ => Err(SchedulerError::CorruptRecord {
                id: self.id.to_string(),
                reason: format!("payload does not match {} job", self.kind.tag()),
            }),
        }
    }

    async fn dispatch(&self, ctx: &RunContext, targets: &[JobTarget]) -> RunReport {
        let mut report = RunReport {
            targets: targets.len(),
            ..Default::default()
        };

        for t in targets {
            let probe_id = &t.target.probe_id;
            match ctx.notifier.notify(&t.target, &t.payload).await {
                Ok(()) => {
                    report.sent += 1;
                    if let Some(id) = &t.work_item_id {
                        if let Err(e) = work_items::mark_notified(ctx.store.as_ref(), id, probe_id) {
                            warn!(job_id = %self.id, %probe_id, work_item = %id, error = %e, "could not mark work item notified");
                        }
                    }
                }
                Err(NotifyError::UnsupportedPlatform { platform }) => {
                    report.unsupported += 1;
                    info!(job_id = %self.id, %probe_id, %platform, "unsupported platform, target skipped");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(job_id = %self.id, %probe_id, platform = %t.target.platform, error = %e, "notification failed");
                }
            }
        }
        report
    }

    /// Write counters back. The in-memory state stays authoritative if this
    /// fails; the next successful save catches the row up.
    fn persist(&self, ctx: &RunContext, state: &RunState) {
        if let Err(e) =
            ctx.store
                .save_job_run_state(&self.id, state.times_run, state.next_run_at, state.is_done)
        {
            error!(job_id = %self.id, error = %e, "failed to persist run state");
        }
    }
}
