use chrono::{DateTime, Utc};
use orchestra_core::{JobId, Platform, ProbeId};
use orchestra_notify::{PushPayload, PushTarget};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::schedule::Schedule;

/// Which payload table a job points at. Exactly one reference per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    Alert { alert_no: i64 },
    Experiment { experiment_no: i64 },
}

impl JobKind {
    /// Registry partition name.
    pub fn tag(&self) -> &'static str {
        match self {
            JobKind::Alert { .. } => "alert",
            JobKind::Experiment { .. } => "experiment",
        }
    }
}

/// Alert text and the opaque data forwarded to the app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub message: String,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// A signed experiment as stored by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    pub experiment_no: i64,
    pub test_name: String,
    /// Hex SHA-256 fingerprint of the signer's public key PEM.
    pub signing_key_id: String,
    /// Compact JWS (RS256) carrying [`ExperimentClaims`](crate::keystore::ExperimentClaims).
    pub signed_experiment: String,
}

/// Payload content, refreshed from the datastore before every run.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Alert(AlertPayload),
    Experiment(ExperimentDefinition),
}

/// Country / platform targeting. An empty list means "no filter".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFilter {
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<Platform>,
}

/// Administrative state of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Active,
    Deleted,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Active => "active",
            JobState::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobState::Active),
            "deleted" => Ok(JobState::Deleted),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A job row as persisted in the `jobs` table.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub comment: String,
    pub schedule: Schedule,
    /// Stored for the operator; not used to offset runs.
    pub delay: i64,
    pub filter: TargetFilter,
    pub kind: JobKind,
    pub times_run: u64,
    pub next_run_at: DateTime<Utc>,
    pub is_done: bool,
    pub state: JobState,
    pub creation_time: DateTime<Utc>,
}

/// An active probe as known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRecord {
    pub id: ProbeId,
    pub country: String,
    pub platform: Platform,
    pub token: String,
}

impl From<ProbeRecord> for PushTarget {
    fn from(p: ProbeRecord) -> Self {
        PushTarget {
            probe_id: p.id,
            token: p.token,
            platform: p.platform,
        }
    }
}

/// One resolved target of one run, with the payload it should receive.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTarget {
    pub target: PushTarget,
    pub payload: PushPayload,
    /// Work item created for this target, for experiment jobs.
    pub work_item_id: Option<String>,
}

/// Lifecycle of a per-target work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Ready,
    Notified,
    Accepted,
    Rejected,
    Done,
}

impl std::fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkItemState::Ready => "ready",
            WorkItemState::Notified => "notified",
            WorkItemState::Accepted => "accepted",
            WorkItemState::Rejected => "rejected",
            WorkItemState::Done => "done",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkItemState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ready" => Ok(WorkItemState::Ready),
            "notified" => Ok(WorkItemState::Notified),
            "accepted" => Ok(WorkItemState::Accepted),
            "rejected" => Ok(WorkItemState::Rejected),
            "done" => Ok(WorkItemState::Done),
            other => Err(format!("unknown work item state: {other}")),
        }
    }
}

/// Timestamp written alongside a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampColumn {
    Notification,
    Accept,
    Done,
}

impl TimestampColumn {
    /// Column name in `client_experiments`. Only these fixed names are ever
    /// interpolated into SQL.
    pub fn column(&self) -> &'static str {
        match self {
            TimestampColumn::Notification => "notification_time",
            TimestampColumn::Accept => "accept_time",
            TimestampColumn::Done => "done_time",
        }
    }
}

/// Fields needed to create a work item in state `ready`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkItem {
    pub probe_id: ProbeId,
    pub job_id: JobId,
    pub experiment_no: i64,
    pub args_idx: Vec<u32>,
}

/// A persisted per-target work item (`client_experiments` row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub probe_id: ProbeId,
    pub job_id: JobId,
    pub experiment_no: i64,
    pub args_idx: Vec<u32>,
    pub state: WorkItemState,
    pub progress: i64,
    pub creation_time: DateTime<Utc>,
    pub notification_time: Option<DateTime<Utc>>,
    pub accept_time: Option<DateTime<Utc>>,
    pub done_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

/// A work item joined with the experiment a probe has to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientExperiment {
    pub work_item: WorkItem,
    pub test_name: String,
    pub signing_key_id: String,
    pub signed_experiment: String,
}
