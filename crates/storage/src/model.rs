//! Domain types shared by every storage backend.
//!
//! Timestamps are UTC with millisecond precision; backends truncate anything
//! finer so values read back compare equal on every engine.

use std::{fmt, str::FromStr};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

use crate::{Error, Result};

/// A named unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Assigned on insert; ignored by `add_job`.
    pub id: i64,
    pub unique_name: String,
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub parameters: Option<String>,
    /// Set by the store on insert.
    pub created_at: DateTime<Utc>,
    /// Set by the store on every update.
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
}

impl Job {
    pub fn new(unique_name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            id: 0,
            unique_name: unique_name.into(),
            title: None,
            job_type: Some(job_type.into()),
            parameters: None,
            created_at: DateTime::UNIX_EPOCH,
            updated_at: None,
            deleted: false,
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: impl Into<String>) -> Self {
        self.parameters = Some(parameters.into());
        self
    }
}

/// Storage discriminator for [`TriggerKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    Instant,
    Scheduled,
    Recurring,
}

impl TriggerType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Instant => "Instant",
            Self::Scheduled => "Scheduled",
            Self::Recurring => "Recurring",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Instant" => Ok(Self::Instant),
            "Scheduled" => Ok(Self::Scheduled),
            "Recurring" => Ok(Self::Recurring),
            other => Err(Error::data_corruption(format!(
                "unknown trigger type: {other}"
            ))),
        }
    }
}

/// Variant-specific trigger payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "triggerType", rename_all_fields = "camelCase")]
pub enum TriggerKind {
    /// Fire once, optionally delayed.
    Instant { delayed_minutes: i32 },
    /// Fire once at a fixed time.
    Scheduled { start_at: DateTime<Utc> },
    /// Fire repeatedly per `definition` (cron-like).
    Recurring {
        start_at: Option<DateTime<Utc>>,
        end_at: Option<DateTime<Utc>>,
        definition: String,
        /// Advisory: the scheduler should not start a run while another is
        /// still in flight. Storage does not enforce it.
        no_parallel_execution: bool,
    },
}

impl TriggerKind {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::Instant { .. } => TriggerType::Instant,
            Self::Scheduled { .. } => TriggerType::Scheduled,
            Self::Recurring { .. } => TriggerType::Recurring,
        }
    }
}

/// A rule describing when a job's runs are created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub id: i64,
    pub job_id: i64,
    pub is_active: bool,
    pub user_id: Option<String>,
    pub user_display_name: Option<String>,
    pub parameters: Option<String>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(flatten)]
    pub kind: TriggerKind,
}

impl Trigger {
    /// An active trigger of the given kind, not yet attached to a job.
    pub fn new(kind: TriggerKind) -> Self {
        Self {
            id: 0,
            job_id: 0,
            is_active: true,
            user_id: None,
            user_display_name: None,
            parameters: None,
            comment: None,
            created_at: DateTime::UNIX_EPOCH,
            deleted: false,
            kind,
        }
    }

    pub fn instant(delayed_minutes: i32) -> Self {
        Self::new(TriggerKind::Instant { delayed_minutes })
    }

    pub fn scheduled(start_at: DateTime<Utc>) -> Self {
        Self::new(TriggerKind::Scheduled { start_at })
    }

    pub fn recurring(definition: impl Into<String>) -> Self {
        Self::new(TriggerKind::Recurring {
            start_at: None,
            end_at: None,
            definition: definition.into(),
            no_parallel_execution: false,
        })
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.user_display_name = Some(display_name.into());
        self
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.kind.trigger_type()
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self.kind, TriggerKind::Recurring { .. })
    }
}

/// Lifecycle state of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobRunState {
    #[default]
    Scheduled,
    Preparing,
    Starting,
    Started,
    Connected,
    Initializing,
    Processing,
    Finishing,
    Collecting,
    Completed,
    Failed,
    Deleted,
    Omitted,
}

impl JobRunState {
    pub const ALL: [Self; 13] = [
        Self::Scheduled,
        Self::Preparing,
        Self::Starting,
        Self::Started,
        Self::Connected,
        Self::Initializing,
        Self::Processing,
        Self::Finishing,
        Self::Collecting,
        Self::Completed,
        Self::Failed,
        Self::Deleted,
        Self::Omitted,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "Scheduled",
            Self::Preparing => "Preparing",
            Self::Starting => "Starting",
            Self::Started => "Started",
            Self::Connected => "Connected",
            Self::Initializing => "Initializing",
            Self::Processing => "Processing",
            Self::Finishing => "Finishing",
            Self::Collecting => "Collecting",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Deleted => "Deleted",
            Self::Omitted => "Omitted",
        }
    }

    /// No further transitions happen from a terminal state.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Deleted | Self::Omitted
        )
    }
}

impl fmt::Display for JobRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobRunState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::data_corruption(format!("unknown job run state: {s}")))
    }
}

/// One concrete execution of a job, produced by a trigger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub id: i64,
    pub job_id: i64,
    pub trigger_id: i64,
    #[serde(default)]
    pub state: JobRunState,
    /// Percentage, 0–100.
    pub progress: Option<f64>,
    pub planned_start_at: DateTime<Utc>,
    pub actual_start_at: Option<DateTime<Utc>>,
    pub actual_end_at: Option<DateTime<Utc>>,
    pub estimated_end_at: Option<DateTime<Utc>>,
    pub job_parameters: Option<String>,
    pub instance_parameters: Option<String>,
    pub pid: Option<i32>,
    #[serde(default)]
    pub deleted: bool,
}

impl JobRun {
    /// A scheduled run for `trigger_id` of `job_id`.
    pub fn new(job_id: i64, trigger_id: i64, planned_start_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            job_id,
            trigger_id,
            state: JobRunState::Scheduled,
            progress: None,
            planned_start_at,
            actual_start_at: None,
            actual_end_at: None,
            estimated_end_at: None,
            job_parameters: None,
            instance_parameters: None,
            pid: None,
            deleted: false,
        }
    }
}

/// One page of a filtered, sorted listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    /// Size of the full filtered set, independent of the page requested.
    pub total_items: u64,
}

impl<T> PagedResult<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of pages needed for `total_items`.
    pub fn total_pages(&self) -> u64 {
        self.total_items.div_ceil(u64::from(self.page_size.max(1)))
    }
}

/// What a single retention pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub job_runs_deleted: u64,
    pub triggers_deleted: u64,
}

impl RetentionReport {
    pub fn is_empty(&self) -> bool {
        self.job_runs_deleted == 0 && self.triggers_deleted == 0
    }
}

// ── Time helpers ────────────────────────────────────────────────────────────

pub(crate) fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::data_corruption(format!("timestamp out of range: {ms}")))
}

/// Drop sub-millisecond precision.
pub(crate) fn truncate_ms(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

pub(crate) fn now_utc() -> DateTime<Utc> {
    truncate_ms(Utc::now())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, chrono::TimeZone};

    #[test]
    fn trigger_type_roundtrip() {
        for t in [
            TriggerType::Instant,
            TriggerType::Scheduled,
            TriggerType::Recurring,
        ] {
            assert_eq!(t.as_str().parse::<TriggerType>().unwrap(), t);
        }
    }

    #[test]
    fn unknown_discriminator_is_corruption() {
        let err = "Cron".parse::<TriggerType>().unwrap_err();
        assert!(matches!(err, Error::DataCorruption { .. }));
    }

    #[test]
    fn job_run_state_parse() {
        for state in JobRunState::ALL {
            assert_eq!(state.to_string().parse::<JobRunState>().unwrap(), state);
        }
        assert!("Running".parse::<JobRunState>().is_err());
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = JobRunState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                JobRunState::Completed,
                JobRunState::Failed,
                JobRunState::Deleted,
                JobRunState::Omitted
            ]
        );
    }

    #[test]
    fn trigger_serializes_with_tag() {
        let trigger = Trigger::recurring("*/5 * * * *");
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["triggerType"], TriggerType::Recurring.as_str());
        assert_eq!(json["definition"], "*/5 * * * *");
        assert_eq!(json["noParallelExecution"], false);
        assert!(json.get("no_parallel_execution").is_none());
        assert_eq!(json["isActive"], true);
    }

    #[test]
    fn trigger_fields_deserialize_camel_case() {
        let trigger: Trigger = serde_json::from_value(serde_json::json!({
            "id": 0,
            "jobId": 0,
            "triggerType": "Instant",
            "delayedMinutes": 15,
            "isActive": true,
            "deleted": false,
            "comment": null,
            "userId": null,
            "userDisplayName": null,
            "parameters": null,
            "createdAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(trigger.kind, TriggerKind::Instant { delayed_minutes: 15 });
    }

    #[test]
    fn job_type_serializes_as_type() {
        let json = serde_json::to_value(Job::new("testjob", "Jobs.Test")).unwrap();
        assert_eq!(json["type"], "Jobs.Test");
        assert_eq!(json["uniqueName"], "testjob");
    }

    #[test]
    fn truncation_keeps_millis() {
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let truncated = truncate_ms(at);
        assert_eq!(truncated.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(from_ms(to_ms(at)).unwrap(), truncated);
    }

    #[test]
    fn total_pages() {
        let page = PagedResult::<i64> {
            items: vec![],
            page: 1,
            page_size: 2,
            total_items: 5,
        };
        assert_eq!(page.total_pages(), 3);
    }
}
