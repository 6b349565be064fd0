//! The storage contract every backend implements.

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    tracing::warn,
};

use crate::{
    Result,
    model::{Job, JobRun, JobRunState, PagedResult, RetentionReport, Trigger},
    query::ListOptions,
};

/// Persistence backend for jobs, triggers and job runs.
///
/// Absence is `Ok(None)`. Mutations addressing a row that does not exist
/// return `Ok(false)`. Soft-deleted rows only show up through
/// `ListOptions::show_deleted`, which lists exclusively deleted rows.
#[async_trait]
pub trait JobStorage: Send + Sync {
    // ── Jobs ────────────────────────────────────────────────────────────────

    /// Insert a job and return it with its id and creation time assigned.
    /// A taken unique name (deleted jobs included) is a constraint violation.
    async fn add_job(&self, job: &Job) -> Result<Job>;

    /// Overwrite every mutable field and refresh `updated_at`.
    async fn update_job(&self, job: &Job) -> Result<bool>;

    /// Soft-delete a job.
    async fn delete_job(&self, job_id: i64) -> Result<bool>;

    async fn get_job_by_id(&self, job_id: i64) -> Result<Option<Job>>;
    async fn get_job_by_unique_name(&self, unique_name: &str) -> Result<Option<Job>>;

    /// Filtered, sorted page of jobs. Default order is creation ascending.
    async fn get_jobs(&self, options: &ListOptions) -> Result<PagedResult<Job>>;

    /// Number of live jobs.
    async fn get_jobs_count(&self) -> Result<u64>;

    // ── Triggers ────────────────────────────────────────────────────────────

    /// Attach a trigger to an existing job.
    async fn add_trigger(&self, job_id: i64, trigger: &Trigger) -> Result<Trigger>;

    /// Overwrite a trigger's mutable fields. Id, job, creation time and
    /// trigger type never change; a type mismatch updates nothing.
    async fn update_trigger(&self, job_id: i64, trigger: &Trigger) -> Result<bool>;

    async fn disable_trigger(&self, job_id: i64, trigger_id: i64) -> Result<bool>;
    async fn enable_trigger(&self, job_id: i64, trigger_id: i64) -> Result<bool>;

    /// Soft-delete a trigger.
    async fn delete_trigger(&self, job_id: i64, trigger_id: i64) -> Result<bool>;

    async fn get_trigger_by_id(&self, job_id: i64, trigger_id: i64) -> Result<Option<Trigger>>;

    /// Triggers of one job, active before inactive, then by id.
    /// Only paging and `show_deleted` are honored.
    async fn get_triggers_by_job_id(
        &self,
        job_id: i64,
        options: &ListOptions,
    ) -> Result<PagedResult<Trigger>>;

    /// Active triggers across all jobs, filtered by their job.
    async fn get_active_triggers(&self, options: &ListOptions) -> Result<PagedResult<Trigger>>;

    // ── Job runs ────────────────────────────────────────────────────────────

    async fn add_job_run(&self, run: &JobRun) -> Result<JobRun>;

    /// Overwrite state and planned start. Every other nullable field keeps
    /// its stored value when `run` leaves it `None`.
    async fn update_job_run(&self, run: &JobRun) -> Result<bool>;

    async fn update_progress(&self, job_run_id: i64, progress: Option<f64>) -> Result<bool>;

    async fn get_job_run_by_id(&self, job_run_id: i64) -> Result<Option<JobRun>>;

    /// Every run listing defaults to planned start descending and applies
    /// the job filter to each run's job.
    async fn get_job_runs(&self, options: &ListOptions) -> Result<PagedResult<JobRun>>;

    async fn get_job_runs_by_job_id(
        &self,
        job_id: i64,
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>>;

    async fn get_job_runs_by_trigger_id(
        &self,
        job_id: i64,
        trigger_id: i64,
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>>;

    /// Runs produced by triggers owned by `user_id`.
    async fn get_job_runs_by_user_id(
        &self,
        user_id: &str,
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>>;

    async fn get_job_runs_by_user_display_name(
        &self,
        user_display_name: &str,
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>>;

    async fn get_job_runs_by_state(
        &self,
        state: JobRunState,
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>> {
        self.get_job_runs_by_states(&[state], options).await
    }

    async fn get_job_runs_by_states(
        &self,
        states: &[JobRunState],
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>>;

    /// Live run of the trigger with the latest actual start strictly before
    /// `as_of`.
    async fn get_last_job_run_by_trigger_id(
        &self,
        job_id: i64,
        trigger_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Option<JobRun>>;

    /// Live scheduled run of the trigger with the earliest planned start at
    /// or after `as_of`.
    async fn get_next_job_run_by_trigger_id(
        &self,
        job_id: i64,
        trigger_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Option<JobRun>>;

    /// Whether a live run of the trigger is still in a non-terminal state.
    async fn has_non_terminal_job_run(&self, trigger_id: i64) -> Result<bool>;

    // ── Maintenance ─────────────────────────────────────────────────────────

    /// Liveness probe. Never fails; storage errors are logged and reported
    /// as `false`.
    async fn is_available(&self) -> bool {
        match self.get_jobs(&ListOptions::default().page(1, 1)).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "job storage is not available");
                false
            },
        }
    }

    /// Soft-delete live runs that ended at or before `deadline`, then any
    /// non-recurring trigger among theirs that has no live run left.
    async fn apply_retention(&self, deadline: DateTime<Utc>) -> Result<RetentionReport>;
}
