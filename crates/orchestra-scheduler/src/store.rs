//! Datastore seams and their SQLite implementation.
//!
//! The engine only talks to [`JobStore`] and [`ProbeRegistry`]. [`SqliteStore`]
//! implements both on one connection and additionally carries the
//! administrative and probe-facing queries.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use orchestra_core::{JobId, Platform, ProbeId};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::keystore::Keystore;
use crate::schedule::Schedule;
use crate::types::{
    AlertPayload, ClientExperiment, ExperimentDefinition, JobKind, JobPayload, JobRecord,
    JobState, NewWorkItem, ProbeRecord, TargetFilter, TimestampColumn, WorkItem, WorkItemState,
};

/// Read side of the active-probe registry.
pub trait ProbeRegistry: Send + Sync {
    /// Probes matching `filter` that hold a live push token, ordered by id.
    fn find_probes(&self, filter: &TargetFilter) -> Result<Vec<ProbeRecord>>;

    /// Trusted experiment signing keys, `fingerprint -> PEM`.
    fn load_signing_keys(&self) -> Result<HashMap<String, String>>;
}

/// Job and work-item persistence used by running jobs.
pub trait JobStore: Send + Sync {
    /// Every job that is active and not done.
    fn load_active_jobs(&self) -> Result<Vec<JobRecord>>;

    /// Current payload content for a job.
    fn load_payload(&self, kind: &JobKind) -> Result<JobPayload>;

    fn save_job_run_state(
        &self,
        id: &JobId,
        times_run: u64,
        next_run_at: DateTime<Utc>,
        is_done: bool,
    ) -> Result<()>;

    /// Create work items in state `ready`, all or none, and return their ids
    /// in input order.
    fn create_work_items(&self, items: &[NewWorkItem]) -> Result<Vec<String>>;

    fn get_work_item(&self, id: &str) -> Result<WorkItem>;

    /// Move a work item to `new_state` if `probe_id` owns it and its current
    /// state is in `allowed`. The state and `column` are written together.
    fn set_work_item_state(
        &self,
        id: &str,
        probe_id: &ProbeId,
        new_state: WorkItemState,
        allowed: &[WorkItemState],
        column: TimestampColumn,
    ) -> Result<WorkItem>;
}

/// Fields an administrator supplies when creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub comment: String,
    pub schedule: Schedule,
    pub delay: i64,
    pub filter: TargetFilter,
}

/// Job listing entry for operators.
#[derive(Debug, Clone)]
pub struct JobListing {
    pub record: JobRecord,
    pub payload: Option<JobPayload>,
}

/// SQLite-backed store.
///
/// Wraps a single connection in a `Mutex`; every call holds the lock only for
/// the duration of its own statements.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    // --- administration -------------------------------------------------

    #[instrument(skip(self, job, alert), fields(comment = %job.comment))]
    pub fn insert_alert_job(&self, job: &NewJob, alert: &AlertPayload) -> Result<JobRecord> {
        let extra = serde_json::to_string(&alert.extra)?;
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO job_alerts (message, extra) VALUES (?1, ?2)",
            params![alert.message, extra],
        )?;
        let alert_no = tx.last_insert_rowid();
        let record = insert_job_row(&tx, job, JobKind::Alert { alert_no })?;
        tx.commit()?;
        info!(job_id = %record.id, alert_no, "alert job stored");
        Ok(record)
    }

    #[instrument(skip(self, job, experiment), fields(comment = %job.comment))]
    pub fn insert_experiment_job(
        &self,
        job: &NewJob,
        experiment: &ExperimentDefinition,
    ) -> Result<JobRecord> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO job_experiments (test_name, signing_key_id, signed_experiment)
             VALUES (?1, ?2, ?3)",
            params![
                experiment.test_name,
                experiment.signing_key_id,
                experiment.signed_experiment
            ],
        )?;
        let experiment_no = tx.last_insert_rowid();
        let record = insert_job_row(&tx, job, JobKind::Experiment { experiment_no })?;
        tx.commit()?;
        info!(job_id = %record.id, experiment_no, "experiment job stored");
        Ok(record)
    }

    /// Flag a job as deleted. Deleted jobs are never loaded again.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn mark_job_deleted(&self, id: &JobId) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE jobs SET state = 'deleted' WHERE id = ?1 AND state = 'active'",
            [id.as_str()],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// All jobs (optionally including deleted ones), oldest first, with
    /// their payloads. Rows that fail to decode are logged and skipped.
    pub fn list_jobs(&self, include_deleted: bool) -> Result<Vec<JobListing>> {
        let rows = {
            let db = self.db.lock().unwrap();
            let sql = if include_deleted {
                format!("{JOB_COLUMNS} FROM jobs ORDER BY creation_time")
            } else {
                format!("{JOB_COLUMNS} FROM jobs WHERE state = 'active' ORDER BY creation_time")
            };
            let mut stmt = db.prepare(&sql)?;
            let rows = stmt
                .query_map([], JobRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_record() {
                Ok(record) => {
                    let payload = self.load_payload(&record.kind).ok();
                    out.push(JobListing { record, payload });
                }
                Err(e) => error!(error = %e, "skipping undecodable job row"),
            }
        }
        Ok(out)
    }

    // --- probe registry -------------------------------------------------

    /// Register or refresh a probe and its push token.
    #[instrument(skip(self, probe), fields(probe_id = %probe.id))]
    pub fn upsert_probe(&self, probe: &ProbeRecord) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO active_probes
             (id, probe_cc, platform, token, is_token_expired, last_updated)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)
             ON CONFLICT (id) DO UPDATE SET
                probe_cc = excluded.probe_cc,
                platform = excluded.platform,
                token = excluded.token,
                is_token_expired = 0,
                last_updated = excluded.last_updated",
            params![
                probe.id.as_str(),
                probe.country,
                probe.platform.as_str(),
                probe.token,
                now
            ],
        )?;
        Ok(())
    }

    /// Mark a probe's push token as rejected by the platform.
    pub fn expire_token(&self, probe_id: &ProbeId) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE active_probes SET is_token_expired = 1 WHERE id = ?1",
            [probe_id.as_str()],
        )?;
        Ok(())
    }

    /// Trust a new experiment signing key. Returns its fingerprint.
    pub fn add_signing_key(&self, pem: &str) -> Result<String> {
        let key_id = Keystore::fingerprint(pem);
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO signing_keys (key_id, public_key_pem, created_at)
             VALUES (?1, ?2, ?3)",
            params![key_id, pem, fmt_ts(Utc::now())],
        )?;
        info!(%key_id, "signing key registered");
        Ok(key_id)
    }

    /// Run raw SQL against the underlying connection.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.db.lock().unwrap().execute_batch(sql)?;
        Ok(())
    }

    // --- probe-facing work items ------------------------------------------

    /// Work items a probe still has to pick up (`ready` or `notified`),
    /// created at or after `since`.
    #[instrument(skip(self), fields(probe_id = %probe_id))]
    pub fn list_pending_work_items(
        &self,
        probe_id: &ProbeId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ClientExperiment>> {
        let since = fmt_ts(since.unwrap_or(DateTime::<Utc>::UNIX_EPOCH));
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{CLIENT_EXPERIMENT_COLUMNS}
             WHERE c.probe_id = ?1
               AND c.state IN ('ready', 'notified')
               AND c.creation_time >= ?2
             ORDER BY c.creation_time"
        ))?;
        let rows = stmt.query_map(params![probe_id.as_str(), since], row_to_client_experiment)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// One work item with its experiment, visible only to its owner.
    pub fn get_client_experiment(&self, id: &str, probe_id: &ProbeId) -> Result<ClientExperiment> {
        let db = self.db.lock().unwrap();
        let exp = db
            .query_row(
                &format!("{CLIENT_EXPERIMENT_COLUMNS} WHERE c.id = ?1"),
                [id],
                row_to_client_experiment,
            )
            .optional()?
            .ok_or_else(|| SchedulerError::NotFound { id: id.to_string() })?;
        if &exp.work_item.probe_id != probe_id {
            return Err(SchedulerError::AccessDenied { id: id.to_string() });
        }
        Ok(exp)
    }
}

impl ProbeRegistry for SqliteStore {
    #[instrument(skip(self, filter), fields(countries = filter.countries.len(), platforms = filter.platforms.len()))]
    fn find_probes(&self, filter: &TargetFilter) -> Result<Vec<ProbeRecord>> {
        let mut sql = String::from(
            "SELECT id, probe_cc, platform, token FROM active_probes
             WHERE is_token_expired = 0 AND token != ''",
        );
        let mut args: Vec<String> = Vec::new();
        if !filter.countries.is_empty() {
            sql.push_str(&format!(
                " AND probe_cc IN ({})",
                placeholders(filter.countries.len())
            ));
            args.extend(filter.countries.iter().cloned());
        }
        if !filter.platforms.is_empty() {
            sql.push_str(&format!(
                " AND platform IN ({})",
                placeholders(filter.platforms.len())
            ));
            args.extend(filter.platforms.iter().map(|p| p.as_str().to_string()));
        }
        sql.push_str(" ORDER BY id");

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&sql)?;
        let probes = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(ProbeRecord {
                    id: ProbeId::from(row.get::<_, String>(0)?),
                    country: row.get(1)?,
                    platform: Platform::from(row.get::<_, String>(2)?),
                    token: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        debug!(count = probes.len(), "probes resolved");
        Ok(probes)
    }

    fn load_signing_keys(&self) -> Result<HashMap<String, String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT key_id, public_key_pem FROM signing_keys")?;
        let keys = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<HashMap<String, String>>>()?;
        Ok(keys)
    }
}

impl JobStore for SqliteStore {
    #[instrument(skip(self))]
    fn load_active_jobs(&self) -> Result<Vec<JobRecord>> {
        let rows = {
            let db = self.db.lock().unwrap();
            let mut stmt = db.prepare(&format!(
                "{JOB_COLUMNS} FROM jobs
                 WHERE state = 'active' AND is_done = 0
                 ORDER BY creation_time"
            ))?;
            let rows = stmt
                .query_map([], JobRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match row.into_record() {
                Ok(job) => jobs.push(job),
                Err(e) => error!(job_id = %id, error = %e, "active job cannot be loaded"),
            }
        }
        Ok(jobs)
    }

    fn load_payload(&self, kind: &JobKind) -> Result<JobPayload> {
        let db = self.db.lock().unwrap();
        match *kind {
            JobKind::Alert { alert_no } => {
                let (message, extra): (String, String) = db
                    .query_row(
                        "SELECT message, extra FROM job_alerts WHERE alert_no = ?1",
                        [alert_no],
                        |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
                    )
                    .optional()?
                    .ok_or_else(|| SchedulerError::CorruptRecord {
                        id: format!("alert {alert_no}"),
                        reason: "referenced alert does not exist".into(),
                    })?;
                Ok(JobPayload::Alert(AlertPayload {
                    message,
                    extra: serde_json::from_str(&extra)?,
                }))
            }
            JobKind::Experiment { experiment_no } => db
                .query_row(
                    "SELECT experiment_no, test_name, signing_key_id, signed_experiment
                     FROM job_experiments WHERE experiment_no = ?1",
                    [experiment_no],
                    |r| {
                        Ok(ExperimentDefinition {
                            experiment_no: r.get(0)?,
                            test_name: r.get(1)?,
                            signing_key_id: r.get(2)?,
                            signed_experiment: r.get(3)?,
                        })
                    },
                )
                .optional()?
                .map(JobPayload::Experiment)
                .ok_or_else(|| SchedulerError::CorruptRecord {
                    id: format!("experiment {experiment_no}"),
                    reason: "referenced experiment does not exist".into(),
                }),
        }
    }

    #[instrument(skip(self), fields(job_id = %id))]
    fn save_job_run_state(
        &self,
        id: &JobId,
        times_run: u64,
        next_run_at: DateTime<Utc>,
        is_done: bool,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE jobs SET times_run = ?1, next_run_at = ?2, is_done = ?3 WHERE id = ?4",
            params![times_run as i64, fmt_ts(next_run_at), is_done, id.as_str()],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    #[instrument(skip(self, items), fields(count = items.len()))]
    fn create_work_items(&self, items: &[NewWorkItem]) -> Result<Vec<String>> {
        let now = fmt_ts(Utc::now());
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let mut ids = Vec::with_capacity(items.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO client_experiments
                 (id, probe_id, job_id, experiment_no, args_idx, state, progress,
                  creation_time, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'ready', 0, ?6, ?6)",
            )?;
            for item in items {
                let id = Uuid::now_v7().to_string();
                stmt.execute(params![
                    id,
                    item.probe_id.as_str(),
                    item.job_id.as_str(),
                    item.experiment_no,
                    serde_json::to_string(&item.args_idx)?,
                    now
                ])?;
                ids.push(id);
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    fn get_work_item(&self, id: &str) -> Result<WorkItem> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("{WORK_ITEM_COLUMNS} WHERE id = ?1"),
            [id],
            row_to_work_item,
        )
        .optional()?
        .ok_or_else(|| SchedulerError::NotFound { id: id.to_string() })
    }

    #[instrument(skip(self, allowed), fields(probe_id = %probe_id, to = %new_state))]
    fn set_work_item_state(
        &self,
        id: &str,
        probe_id: &ProbeId,
        new_state: WorkItemState,
        allowed: &[WorkItemState],
        column: TimestampColumn,
    ) -> Result<WorkItem> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let (owner, state): (String, String) = tx
            .query_row(
                "SELECT probe_id, state FROM client_experiments WHERE id = ?1",
                [id],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()?
            .ok_or_else(|| SchedulerError::NotFound { id: id.to_string() })?;

        if owner != probe_id.as_str() {
            return Err(SchedulerError::AccessDenied { id: id.to_string() });
        }
        let current: WorkItemState = state
            .parse()
            .map_err(|reason| SchedulerError::CorruptRecord {
                id: id.to_string(),
                reason,
            })?;
        if !allowed.contains(&current) {
            return Err(SchedulerError::InconsistentState {
                id: id.to_string(),
                state: current.to_string(),
            });
        }

        let now = fmt_ts(Utc::now());
        let sql = format!(
            "UPDATE client_experiments
             SET state = ?1, {col} = ?2, last_updated = ?2
             WHERE id = ?3 AND state = ?4",
            col = column.column()
        );
        let n = tx.execute(
            &sql,
            params![new_state.to_string(), now, id, current.to_string()],
        )?;
        if n == 0 {
            return Err(SchedulerError::InconsistentState {
                id: id.to_string(),
                state: current.to_string(),
            });
        }

        let item = tx.query_row(
            &format!("{WORK_ITEM_COLUMNS} WHERE id = ?1"),
            [id],
            row_to_work_item,
        )?;
        tx.commit()?;
        debug!(work_item = %id, from = %current, "work item transitioned");
        Ok(item)
    }
}

// --- row helpers -----------------------------------------------------------

const JOB_COLUMNS: &str = "SELECT id, comment, schedule, delay, target_countries,
        target_platforms, creation_time, times_run, next_run_at, is_done, state,
        alert_no, experiment_no";

const WORK_ITEM_COLUMNS: &str = "SELECT id, probe_id, job_id, experiment_no, args_idx,
        state, progress, creation_time, notification_time, accept_time, done_time,
        last_updated FROM client_experiments";

const CLIENT_EXPERIMENT_COLUMNS: &str = "SELECT c.id, c.probe_id, c.job_id, c.experiment_no,
        c.args_idx, c.state, c.progress, c.creation_time, c.notification_time,
        c.accept_time, c.done_time, c.last_updated,
        e.test_name, e.signing_key_id, e.signed_experiment
        FROM client_experiments c
        JOIN job_experiments e ON e.experiment_no = c.experiment_no";

/// Latest instant that survives an RFC 3339 round trip through the store.
pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Fixed-width UTC timestamps, so string order equals time order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp {s:?}: {e}"))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn insert_job_row(tx: &rusqlite::Transaction<'_>, job: &NewJob, kind: JobKind) -> Result<JobRecord> {
    let id = JobId::new();
    let now = Utc::now();
    let (alert_no, experiment_no) = match kind {
        JobKind::Alert { alert_no } => (Some(alert_no), None),
        JobKind::Experiment { experiment_no } => (None, Some(experiment_no)),
    };
    tx.execute(
        "INSERT INTO jobs
         (id, comment, schedule, delay, target_countries, target_platforms,
          creation_time, times_run, next_run_at, is_done, state, alert_no, experiment_no)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, 0, 'active', ?9, ?10)",
        params![
            id.as_str(),
            job.comment,
            job.schedule.to_string(),
            job.delay,
            serde_json::to_string(&job.filter.countries)?,
            serde_json::to_string(&job.filter.platforms)?,
            fmt_ts(now),
            fmt_ts(job.schedule.start_time),
            alert_no,
            experiment_no
        ],
    )?;
    Ok(JobRecord {
        id,
        comment: job.comment.clone(),
        schedule: job.schedule.clone(),
        delay: job.delay,
        filter: job.filter.clone(),
        kind,
        times_run: 0,
        next_run_at: job.schedule.start_time,
        is_done: false,
        state: JobState::Active,
        creation_time: now,
    })
}

/// Raw `jobs` row, decoded into a [`JobRecord`] in a second step so that a
/// malformed row becomes a [`SchedulerError::CorruptRecord`] for that job.
struct JobRow {
    id: String,
    comment: String,
    schedule: String,
    delay: i64,
    countries: String,
    platforms: String,
    creation_time: String,
    times_run: i64,
    next_run_at: String,
    is_done: bool,
    state: String,
    alert_no: Option<i64>,
    experiment_no: Option<i64>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            comment: row.get(1)?,
            schedule: row.get(2)?,
            delay: row.get(3)?,
            countries: row.get(4)?,
            platforms: row.get(5)?,
            creation_time: row.get(6)?,
            times_run: row.get(7)?,
            next_run_at: row.get(8)?,
            is_done: row.get(9)?,
            state: row.get(10)?,
            alert_no: row.get(11)?,
            experiment_no: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<JobRecord> {
        let corrupt = |reason: String| SchedulerError::CorruptRecord {
            id: self.id.clone(),
            reason,
        };
        let kind = match (self.alert_no, self.experiment_no) {
            (Some(alert_no), None) => JobKind::Alert { alert_no },
            (None, Some(experiment_no)) => JobKind::Experiment { experiment_no },
            _ => return Err(corrupt("job must reference exactly one payload".into())),
        };
        let schedule = Schedule::parse(&self.schedule).map_err(|e| corrupt(e.to_string()))?;
        let countries: Vec<String> =
            serde_json::from_str(&self.countries).map_err(|e| corrupt(e.to_string()))?;
        let platforms: Vec<Platform> =
            serde_json::from_str(&self.platforms).map_err(|e| corrupt(e.to_string()))?;
        let creation_time = parse_ts(&self.creation_time).map_err(&corrupt)?;
        let next_run_at = parse_ts(&self.next_run_at).map_err(&corrupt)?;
        let state: JobState = self.state.parse().map_err(&corrupt)?;
        let times_run = u64::try_from(self.times_run)
            .map_err(|_| corrupt(format!("negative times_run {}", self.times_run)))?;

        Ok(JobRecord {
            id: JobId::from(self.id.clone()),
            comment: self.comment.clone(),
            schedule,
            delay: self.delay,
            filter: TargetFilter {
                countries,
                platforms,
            },
            kind,
            times_run,
            next_run_at,
            is_done: self.is_done,
            state,
            creation_time,
        })
    }
}

fn row_to_work_item(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    let ts = |idx: usize| -> rusqlite::Result<DateTime<Utc>> {
        parse_ts(&row.get::<_, String>(idx)?).map_err(|e| conversion_error(idx, e))
    };
    let opt_ts = |idx: usize| -> rusqlite::Result<Option<DateTime<Utc>>> {
        row.get::<_, Option<String>>(idx)?
            .map(|s| parse_ts(&s).map_err(|e| conversion_error(idx, e)))
            .transpose()
    };
    let args_idx: Vec<u32> = serde_json::from_str(&row.get::<_, String>(4)?)
        .map_err(|e| conversion_error(4, e.to_string()))?;
    let state: WorkItemState = row
        .get::<_, String>(5)?
        .parse()
        .map_err(|e| conversion_error(5, e))?;

    Ok(WorkItem {
        id: row.get(0)?,
        probe_id: ProbeId::from(row.get::<_, String>(1)?),
        job_id: JobId::from(row.get::<_, String>(2)?),
        experiment_no: row.get(3)?,
        args_idx,
        state,
        progress: row.get(6)?,
        creation_time: ts(7)?,
        notification_time: opt_ts(8)?,
        accept_time: opt_ts(9)?,
        done_time: opt_ts(10)?,
        last_updated: ts(11)?,
    })
}

fn row_to_client_experiment(row: &Row<'_>) -> rusqlite::Result<ClientExperiment> {
    Ok(ClientExperiment {
        work_item: row_to_work_item(row)?,
        test_name: row.get(12)?,
        signing_key_id: row.get(13)?,
        signed_experiment: row.get(14)?,
    })
}
