//! Paging, filtering and sorting shared by both backends.
//!
//! Every sortable field knows its SQL column and how to compare two entities
//! in memory, so a listing orders identically whichever backend serves it.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::{
    Error, Result,
    model::{Job, JobRun, JobRunState, Trigger, TriggerKind},
};

pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Job-level filter. At most one field may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub job_type: Option<String>,
    pub unique_name: Option<String>,
    /// Case-sensitive substring of unique name, type or title.
    pub query: Option<String>,
}

/// The single filter left after [`JobFilter::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveFilter {
    JobType(String),
    UniqueName(String),
    Query(String),
}

impl JobFilter {
    /// Blank values count as unset. More than one set filter is a usage error.
    pub fn resolve(&self) -> Result<Option<ActiveFilter>> {
        let set = |v: &Option<String>| {
            v.as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(str::to_owned)
        };
        let candidates = [
            set(&self.job_type).map(ActiveFilter::JobType),
            set(&self.unique_name).map(ActiveFilter::UniqueName),
            set(&self.query).map(ActiveFilter::Query),
        ];
        let mut active = candidates.into_iter().flatten();
        let first = active.next();
        if active.next().is_some() {
            return Err(Error::InvalidFilterCombination);
        }
        Ok(first)
    }
}

impl ActiveFilter {
    pub fn matches(&self, job: &Job) -> bool {
        match self {
            Self::JobType(t) => job.job_type.as_deref() == Some(t.as_str()),
            Self::UniqueName(n) => job.unique_name == *n,
            Self::Query(q) => {
                job.unique_name.contains(q.as_str())
                    || job.job_type.as_deref().is_some_and(|t| t.contains(q.as_str()))
                    || job.title.as_deref().is_some_and(|t| t.contains(q.as_str()))
            },
        }
    }
}

/// Paging, filter, visibility and sort for a listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions {
    /// 1-based.
    pub page: u32,
    pub page_size: u32,
    pub filter: JobFilter,
    /// `true` lists only soft-deleted rows, `false` only live ones.
    pub show_deleted: bool,
    /// Field names, `-` prefix for descending. Unknown names are skipped.
    pub sort: Vec<String>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            filter: JobFilter::default(),
            show_deleted: false,
            sort: Vec::new(),
        }
    }
}

impl ListOptions {
    #[must_use]
    pub fn page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.filter.job_type = Some(job_type.into());
        self
    }

    #[must_use]
    pub fn unique_name(mut self, unique_name: impl Into<String>) -> Self {
        self.filter.unique_name = Some(unique_name.into());
        self
    }

    #[must_use]
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.filter.query = Some(query.into());
        self
    }

    #[must_use]
    pub fn show_deleted(mut self, show_deleted: bool) -> Self {
        self.show_deleted = show_deleted;
        self
    }

    #[must_use]
    pub fn sort_by<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sort = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Validate and resolve everything a backend needs, before any I/O.
    pub(crate) fn plan<F: SortField>(&self) -> Result<ListPlan<F>> {
        let filter = self.filter.resolve()?;
        if self.page == 0 || self.page_size == 0 {
            return Err(Error::InvalidPaging {
                page: self.page,
                page_size: self.page_size,
            });
        }
        Ok(ListPlan {
            filter,
            sort: parse_sort(&self.sort),
            show_deleted: self.show_deleted,
            page: self.page,
            page_size: self.page_size,
        })
    }
}

/// Validated form of [`ListOptions`].
#[derive(Debug, Clone)]
pub(crate) struct ListPlan<F> {
    pub filter: Option<ActiveFilter>,
    pub sort: Vec<SortKey<F>>,
    pub show_deleted: bool,
    pub page: u32,
    pub page_size: u32,
}

impl<F> ListPlan<F> {
    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }

    /// Rows skipped before this page, clamped to `i64::MAX` for far-off pages.
    pub fn offset(&self) -> i64 {
        let skipped = u64::from(self.page - 1).saturating_mul(u64::from(self.page_size));
        i64::try_from(skipped).unwrap_or(i64::MAX)
    }

    /// Slice an already filtered and sorted set down to the requested page.
    pub fn paginate<T: Clone>(&self, items: &[T]) -> Vec<T> {
        let offset = usize::try_from(self.offset()).unwrap_or(usize::MAX);
        items
            .iter()
            .skip(offset)
            .take(self.page_size as usize)
            .cloned()
            .collect()
    }
}

/// Which job runs a run listing covers, before job filter and visibility.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RunScope<'a> {
    All,
    Job(i64),
    Trigger { job_id: i64, trigger_id: i64 },
    /// Runs whose producing trigger carries this user id.
    UserId(&'a str),
    UserDisplayName(&'a str),
    /// Empty slice selects nothing.
    States(&'a [JobRunState]),
}

// ── Sorting ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn sql(self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }

    fn apply(self, ord: Ordering) -> Ordering {
        match self {
            Self::Ascending => ord,
            Self::Descending => ord.reverse(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey<F> {
    pub field: F,
    pub direction: SortDirection,
}

impl<F> SortKey<F> {
    pub fn asc(field: F) -> Self {
        Self {
            field,
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(field: F) -> Self {
        Self {
            field,
            direction: SortDirection::Descending,
        }
    }
}

/// A sortable column of one entity.
pub trait SortField: Copy + Sized {
    type Entity;

    /// Column holding the entity id, used as the final tie-break.
    const ID_COLUMN: &'static str;

    /// Match a normalized name (lowercase, no `_`).
    fn from_name(name: &str) -> Option<Self>;
    fn column(self) -> &'static str;
    fn compare(self, a: &Self::Entity, b: &Self::Entity) -> Ordering;
    fn id(entity: &Self::Entity) -> i64;
    fn default_order() -> Vec<SortKey<Self>>;
}

/// Parse one key such as `-createdDateTimeUtc` or `+title`.
pub fn parse_sort_key<F: SortField>(raw: &str) -> Option<SortKey<F>> {
    let raw = raw.trim();
    let (direction, name) = match raw.strip_prefix('-') {
        Some(rest) => (SortDirection::Descending, rest),
        None => (
            SortDirection::Ascending,
            raw.strip_prefix('+').unwrap_or(raw),
        ),
    };
    let normalized: String = name
        .trim()
        .chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect();
    if normalized.is_empty() {
        return None;
    }
    F::from_name(&normalized).map(|field| SortKey { field, direction })
}

/// Known keys in listed order, or the entity default when none are usable.
pub fn parse_sort<F: SortField>(keys: &[String]) -> Vec<SortKey<F>> {
    let parsed: Vec<_> = keys.iter().filter_map(|k| parse_sort_key(k)).collect();
    if parsed.is_empty() {
        F::default_order()
    } else {
        parsed
    }
}

/// `ORDER BY` clause for the keys, always ending in an id tie-break.
pub fn order_by_sql<F: SortField>(keys: &[SortKey<F>]) -> String {
    let mut parts: Vec<String> = keys
        .iter()
        .map(|k| format!("{} {}", k.field.column(), k.direction.sql()))
        .collect();
    parts.push(format!("{} ASC", F::ID_COLUMN));
    format!(" ORDER BY {}", parts.join(", "))
}

/// Comparator for the keys, always ending in an id tie-break.
pub fn compare_by<F: SortField>(keys: &[SortKey<F>], a: &F::Entity, b: &F::Entity) -> Ordering {
    keys.iter()
        .map(|k| k.direction.apply(k.field.compare(a, b)))
        .find(|o| o.is_ne())
        .unwrap_or_else(|| F::id(a).cmp(&F::id(b)))
}

pub fn sort_entities<F: SortField>(items: &mut [F::Entity], keys: &[SortKey<F>]) {
    items.sort_by(|a, b| compare_by(keys, a, b));
}

fn cmp_opt_f64(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.total_cmp(&y),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobField {
    Id,
    UniqueName,
    Title,
    Type,
    CreatedAt,
    UpdatedAt,
}

impl SortField for JobField {
    type Entity = Job;

    const ID_COLUMN: &'static str = "jobs.id";

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "id" => Self::Id,
            "uniquename" | "name" => Self::UniqueName,
            "title" => Self::Title,
            "type" | "jobtype" => Self::Type,
            "createddatetimeutc" | "createdat" | "created" => Self::CreatedAt,
            "updateddatetimeutc" | "updatedat" | "updated" => Self::UpdatedAt,
            _ => return None,
        })
    }

    fn column(self) -> &'static str {
        match self {
            Self::Id => "jobs.id",
            Self::UniqueName => "jobs.unique_name",
            Self::Title => "jobs.title",
            Self::Type => "jobs.job_type",
            Self::CreatedAt => "jobs.created_ms",
            Self::UpdatedAt => "jobs.updated_ms",
        }
    }

    fn compare(self, a: &Job, b: &Job) -> Ordering {
        match self {
            Self::Id => a.id.cmp(&b.id),
            Self::UniqueName => a.unique_name.cmp(&b.unique_name),
            Self::Title => a.title.cmp(&b.title),
            Self::Type => a.job_type.cmp(&b.job_type),
            Self::CreatedAt => a.created_at.cmp(&b.created_at),
            Self::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        }
    }

    fn id(job: &Job) -> i64 {
        job.id
    }

    fn default_order() -> Vec<SortKey<Self>> {
        vec![SortKey::asc(Self::CreatedAt)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRunField {
    Id,
    JobId,
    TriggerId,
    State,
    Progress,
    PlannedStart,
    ActualStart,
    ActualEnd,
    EstimatedEnd,
    Pid,
}

impl SortField for JobRunField {
    type Entity = JobRun;

    const ID_COLUMN: &'static str = "job_runs.id";

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "id" => Self::Id,
            "jobid" => Self::JobId,
            "triggerid" => Self::TriggerId,
            "state" => Self::State,
            "progress" => Self::Progress,
            "plannedstartdatetimeutc" | "plannedstartat" | "plannedstart" => Self::PlannedStart,
            "actualstartdatetimeutc" | "actualstartat" | "actualstart" => Self::ActualStart,
            "actualenddatetimeutc" | "actualendat" | "actualend" => Self::ActualEnd,
            "estimatedenddatetimeutc" | "estimatedendat" | "estimatedend" => Self::EstimatedEnd,
            "pid" => Self::Pid,
            _ => return None,
        })
    }

    fn column(self) -> &'static str {
        match self {
            Self::Id => "job_runs.id",
            Self::JobId => "job_runs.job_id",
            Self::TriggerId => "job_runs.trigger_id",
            Self::State => "job_runs.state",
            Self::Progress => "job_runs.progress",
            Self::PlannedStart => "job_runs.planned_start_ms",
            Self::ActualStart => "job_runs.actual_start_ms",
            Self::ActualEnd => "job_runs.actual_end_ms",
            Self::EstimatedEnd => "job_runs.estimated_end_ms",
            Self::Pid => "job_runs.pid",
        }
    }

    fn compare(self, a: &JobRun, b: &JobRun) -> Ordering {
        match self {
            Self::Id => a.id.cmp(&b.id),
            Self::JobId => a.job_id.cmp(&b.job_id),
            Self::TriggerId => a.trigger_id.cmp(&b.trigger_id),
            Self::State => a.state.as_str().cmp(b.state.as_str()),
            Self::Progress => cmp_opt_f64(a.progress, b.progress),
            Self::PlannedStart => a.planned_start_at.cmp(&b.planned_start_at),
            Self::ActualStart => a.actual_start_at.cmp(&b.actual_start_at),
            Self::ActualEnd => a.actual_end_at.cmp(&b.actual_end_at),
            Self::EstimatedEnd => a.estimated_end_at.cmp(&b.estimated_end_at),
            Self::Pid => a.pid.cmp(&b.pid),
        }
    }

    fn id(run: &JobRun) -> i64 {
        run.id
    }

    fn default_order() -> Vec<SortKey<Self>> {
        vec![SortKey::desc(Self::PlannedStart)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerField {
    Id,
    JobId,
    Type,
    IsActive,
    UserId,
    UserDisplayName,
    Comment,
    CreatedAt,
    StartAt,
    EndAt,
}

impl TriggerField {
    fn start_at(trigger: &Trigger) -> Option<DateTime<Utc>> {
        match &trigger.kind {
            TriggerKind::Instant { .. } => None,
            TriggerKind::Scheduled { start_at } => Some(*start_at),
            TriggerKind::Recurring { start_at, .. } => *start_at,
        }
    }

    fn end_at(trigger: &Trigger) -> Option<DateTime<Utc>> {
        match &trigger.kind {
            TriggerKind::Recurring { end_at, .. } => *end_at,
            _ => None,
        }
    }
}

impl SortField for TriggerField {
    type Entity = Trigger;

    const ID_COLUMN: &'static str = "triggers.id";

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "id" => Self::Id,
            "jobid" => Self::JobId,
            "type" | "triggertype" => Self::Type,
            "isactive" | "active" => Self::IsActive,
            "userid" => Self::UserId,
            "userdisplayname" => Self::UserDisplayName,
            "comment" => Self::Comment,
            "createddatetimeutc" | "createdat" | "created" => Self::CreatedAt,
            "startdatetimeutc" | "startat" | "start" => Self::StartAt,
            "enddatetimeutc" | "endat" | "end" => Self::EndAt,
            _ => return None,
        })
    }

    fn column(self) -> &'static str {
        match self {
            Self::Id => "triggers.id",
            Self::JobId => "triggers.job_id",
            Self::Type => "triggers.trigger_type",
            Self::IsActive => "triggers.is_active",
            Self::UserId => "triggers.user_id",
            Self::UserDisplayName => "triggers.user_display_name",
            Self::Comment => "triggers.comment",
            Self::CreatedAt => "triggers.created_ms",
            Self::StartAt => "triggers.start_ms",
            Self::EndAt => "triggers.end_ms",
        }
    }

    fn compare(self, a: &Trigger, b: &Trigger) -> Ordering {
        match self {
            Self::Id => a.id.cmp(&b.id),
            Self::JobId => a.job_id.cmp(&b.job_id),
            Self::Type => a.trigger_type().as_str().cmp(b.trigger_type().as_str()),
            Self::IsActive => a.is_active.cmp(&b.is_active),
            Self::UserId => a.user_id.cmp(&b.user_id),
            Self::UserDisplayName => a.user_display_name.cmp(&b.user_display_name),
            Self::Comment => a.comment.cmp(&b.comment),
            Self::CreatedAt => a.created_at.cmp(&b.created_at),
            Self::StartAt => Self::start_at(a).cmp(&Self::start_at(b)),
            Self::EndAt => Self::end_at(a).cmp(&Self::end_at(b)),
        }
    }

    fn id(trigger: &Trigger) -> i64 {
        trigger.id
    }

    fn default_order() -> Vec<SortKey<Self>> {
        vec![SortKey::asc(Self::Id)]
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, chrono::TimeDelta, rstest::rstest};

    fn job(id: i64, name: &str, created_offset_secs: i64) -> Job {
        let mut job = Job::new(name, "Jobs.Test");
        job.id = id;
        job.created_at = DateTime::UNIX_EPOCH + TimeDelta::seconds(created_offset_secs);
        job
    }

    #[rstest]
    #[case("title", Some(SortKey::asc(JobField::Title)))]
    #[case("-title", Some(SortKey::desc(JobField::Title)))]
    #[case("+Title", Some(SortKey::asc(JobField::Title)))]
    #[case("-CreatedDateTimeUtc", Some(SortKey::desc(JobField::CreatedAt)))]
    #[case("unique_name", Some(SortKey::asc(JobField::UniqueName)))]
    #[case(" -UpdatedAt ", Some(SortKey::desc(JobField::UpdatedAt)))]
    #[case("bogus", None)]
    #[case("-", None)]
    #[case("", None)]
    fn parses_job_sort_keys(#[case] raw: &str, #[case] expected: Option<SortKey<JobField>>) {
        assert_eq!(parse_sort_key::<JobField>(raw), expected);
    }

    #[test]
    fn unknown_keys_fall_back_to_default() {
        let keys = parse_sort::<JobField>(&["nope".into(), "".into()]);
        assert_eq!(keys, JobField::default_order());
        let keys = parse_sort::<JobRunField>(&[]);
        assert_eq!(keys, vec![SortKey::desc(JobRunField::PlannedStart)]);
    }

    #[test]
    fn unknown_keys_are_skipped_among_known() {
        let keys = parse_sort::<JobField>(&["nope".into(), "-title".into(), "id".into()]);
        assert_eq!(
            keys,
            vec![SortKey::desc(JobField::Title), SortKey::asc(JobField::Id)]
        );
    }

    #[test]
    fn order_by_ends_with_id() {
        let sql = order_by_sql(&[SortKey::desc(JobField::Title)]);
        assert_eq!(sql, " ORDER BY jobs.title DESC, jobs.id ASC");
        let sql = order_by_sql(&JobRunField::default_order());
        assert_eq!(
            sql,
            " ORDER BY job_runs.planned_start_ms DESC, job_runs.id ASC"
        );
    }

    #[test]
    fn in_memory_sort_ties_break_on_id() {
        let mut jobs = vec![job(3, "c", 10), job(1, "a", 10), job(2, "b", 5)];
        sort_entities(&mut jobs, &JobField::default_order());
        let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn descending_puts_nulls_last() {
        let mut a = job(1, "a", 0);
        a.updated_at = Some(Utc::now());
        let b = job(2, "b", 0);
        let mut jobs = vec![b.clone(), a.clone()];
        sort_entities(&mut jobs, &[SortKey::desc(JobField::UpdatedAt)]);
        assert_eq!(jobs[0].id, 1);
        sort_entities(&mut jobs, &[SortKey::asc(JobField::UpdatedAt)]);
        assert_eq!(jobs[0].id, 2);
    }

    #[test]
    fn two_filters_are_rejected() {
        let opts = ListOptions::default().job_type("A").query("x");
        assert!(matches!(
            opts.plan::<JobField>(),
            Err(Error::InvalidFilterCombination)
        ));
    }

    #[test]
    fn blank_filters_count_as_unset() {
        let filter = JobFilter {
            job_type: Some("  ".into()),
            unique_name: Some("testjob".into()),
            query: Some(String::new()),
        };
        assert_eq!(
            filter.resolve().unwrap(),
            Some(ActiveFilter::UniqueName("testjob".into()))
        );
    }

    #[rstest]
    #[case(0, 10)]
    #[case(1, 0)]
    fn zero_paging_is_rejected(#[case] page: u32, #[case] page_size: u32) {
        let opts = ListOptions::default().page(page, page_size);
        assert!(matches!(
            opts.plan::<JobField>(),
            Err(Error::InvalidPaging { .. })
        ));
    }

    #[rstest]
    #[case(1, 2, vec![1, 2])]
    #[case(2, 2, vec![3, 4])]
    #[case(3, 2, vec![5])]
    #[case(4, 2, vec![])]
    fn paginate_slices(#[case] page: u32, #[case] size: u32, #[case] expected: Vec<i32>) {
        let plan = ListOptions::default()
            .page(page, size)
            .plan::<JobField>()
            .unwrap();
        assert_eq!(plan.paginate(&[1, 2, 3, 4, 5]), expected);
    }

    #[test]
    fn far_page_offset_saturates() {
        let plan = ListOptions::default()
            .page(u32::MAX, u32::MAX)
            .plan::<JobField>()
            .unwrap();
        assert_eq!(plan.offset(), i64::MAX);
        assert!(plan.paginate(&[1, 2, 3]).is_empty());
    }

    #[rstest]
    #[case("test", true)]
    #[case("Jobs.", true)]
    #[case("Nightly", true)]
    #[case("TEST", false)]
    #[case("other", false)]
    fn free_text_matches_name_type_or_title(#[case] q: &str, #[case] expected: bool) {
        let j = Job::new("testjob", "Jobs.Test").with_title("Nightly export");
        assert_eq!(ActiveFilter::Query(q.into()).matches(&j), expected);
    }

    #[test]
    fn trigger_start_sorts_instant_first() {
        let mut instant = Trigger::instant(0);
        instant.id = 1;
        let mut scheduled = Trigger::scheduled(Utc::now());
        scheduled.id = 2;
        let mut triggers = vec![scheduled, instant];
        sort_entities(&mut triggers, &[SortKey::asc(TriggerField::StartAt)]);
        assert_eq!(triggers[0].id, 1);
    }
}
