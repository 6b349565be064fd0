//! In-memory storage for tests and embedding.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard},
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    tracing::{debug, info},
};

use crate::{
    Error, Result,
    model::{
        Job, JobRun, JobRunState, PagedResult, RetentionReport, Trigger, TriggerKind, now_utc,
        truncate_ms,
    },
    query::{
        JobField, JobRunField, ListOptions, ListPlan, RunScope, TriggerField, sort_entities,
    },
    store::JobStorage,
};

#[derive(Default)]
struct State {
    jobs: BTreeMap<i64, Job>,
    triggers: BTreeMap<i64, Trigger>,
    runs: BTreeMap<i64, JobRun>,
    last_job_id: i64,
    last_trigger_id: i64,
    last_run_id: i64,
}

impl State {
    fn job_matches<F>(&self, job_id: i64, plan: &ListPlan<F>) -> bool {
        match &plan.filter {
            None => true,
            Some(filter) => self.jobs.get(&job_id).is_some_and(|j| filter.matches(j)),
        }
    }

    fn run_in_scope(&self, run: &JobRun, scope: RunScope<'_>) -> bool {
        match scope {
            RunScope::All => true,
            RunScope::Job(job_id) => run.job_id == job_id,
            RunScope::Trigger { job_id, trigger_id } => {
                run.job_id == job_id && run.trigger_id == trigger_id
            },
            RunScope::UserId(user_id) => self
                .triggers
                .get(&run.trigger_id)
                .is_some_and(|t| t.user_id.as_deref() == Some(user_id)),
            RunScope::UserDisplayName(name) => self
                .triggers
                .get(&run.trigger_id)
                .is_some_and(|t| t.user_display_name.as_deref() == Some(name)),
            RunScope::States(states) => states.contains(&run.state),
        }
    }

    fn trigger_of(&mut self, job_id: i64, trigger_id: i64) -> Option<&mut Trigger> {
        self.triggers
            .get_mut(&trigger_id)
            .filter(|t| t.job_id == job_id)
    }
}

/// `BTreeMap`-backed storage. Nothing survives the process.
pub struct InMemoryStorage {
    state: Mutex<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn list_runs(&self, scope: RunScope<'_>, options: &ListOptions) -> Result<PagedResult<JobRun>> {
        let plan = options.plan::<JobRunField>()?;
        let state = self.lock();
        let mut runs: Vec<JobRun> = state
            .runs
            .values()
            .filter(|r| r.deleted == plan.show_deleted)
            .filter(|r| state.run_in_scope(r, scope))
            .filter(|r| state.job_matches(r.job_id, &plan))
            .cloned()
            .collect();
        sort_entities(&mut runs, &plan.sort);
        Ok(page_of(&plan, &runs))
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn page_of<F, T: Clone>(plan: &ListPlan<F>, items: &[T]) -> PagedResult<T> {
    PagedResult {
        items: plan.paginate(items),
        page: plan.page,
        page_size: plan.page_size,
        total_items: items.len() as u64,
    }
}

fn truncate_opt(at: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    at.map(truncate_ms)
}

fn truncate_kind(kind: &TriggerKind) -> TriggerKind {
    match kind {
        TriggerKind::Instant { delayed_minutes } => TriggerKind::Instant {
            delayed_minutes: *delayed_minutes,
        },
        TriggerKind::Scheduled { start_at } => TriggerKind::Scheduled {
            start_at: truncate_ms(*start_at),
        },
        TriggerKind::Recurring {
            start_at,
            end_at,
            definition,
            no_parallel_execution,
        } => TriggerKind::Recurring {
            start_at: truncate_opt(*start_at),
            end_at: truncate_opt(*end_at),
            definition: definition.clone(),
            no_parallel_execution: *no_parallel_execution,
        },
    }
}

#[async_trait]
impl JobStorage for InMemoryStorage {
    async fn add_job(&self, job: &Job) -> Result<Job> {
        let mut state = self.lock();
        if state.jobs.values().any(|j| j.unique_name == job.unique_name) {
            return Err(Error::unique_name_taken(&job.unique_name));
        }
        state.last_job_id += 1;
        let stored = Job {
            id: state.last_job_id,
            created_at: now_utc(),
            updated_at: None,
            deleted: false,
            ..job.clone()
        };
        state.jobs.insert(stored.id, stored.clone());
        info!(job_id = stored.id, unique_name = %stored.unique_name, "job added");
        Ok(stored)
    }

    async fn update_job(&self, job: &Job) -> Result<bool> {
        let mut state = self.lock();
        if !state.jobs.contains_key(&job.id) {
            return Ok(false);
        }
        if state
            .jobs
            .values()
            .any(|j| j.id != job.id && j.unique_name == job.unique_name)
        {
            return Err(Error::unique_name_taken(&job.unique_name));
        }
        let Some(stored) = state.jobs.get_mut(&job.id) else {
            return Ok(false);
        };
        stored.unique_name = job.unique_name.clone();
        stored.title = job.title.clone();
        stored.job_type = job.job_type.clone();
        stored.parameters = job.parameters.clone();
        stored.deleted = job.deleted;
        stored.updated_at = Some(now_utc());
        Ok(true)
    }

    async fn delete_job(&self, job_id: i64) -> Result<bool> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        job.deleted = true;
        job.updated_at = Some(now_utc());
        info!(job_id, "job deleted");
        Ok(true)
    }

    async fn get_job_by_id(&self, job_id: i64) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn get_job_by_unique_name(&self, unique_name: &str) -> Result<Option<Job>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .find(|j| j.unique_name == unique_name)
            .cloned())
    }

    async fn get_jobs(&self, options: &ListOptions) -> Result<PagedResult<Job>> {
        let plan = options.plan::<JobField>()?;
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.deleted == plan.show_deleted)
            .filter(|j| plan.filter.as_ref().is_none_or(|f| f.matches(j)))
            .cloned()
            .collect();
        sort_entities(&mut jobs, &plan.sort);
        Ok(page_of(&plan, &jobs))
    }

    async fn get_jobs_count(&self) -> Result<u64> {
        Ok(self.lock().jobs.values().filter(|j| !j.deleted).count() as u64)
    }

    async fn add_trigger(&self, job_id: i64, trigger: &Trigger) -> Result<Trigger> {
        let mut state = self.lock();
        if !state.jobs.contains_key(&job_id) {
            return Err(Error::missing_reference(format!("job {job_id}")));
        }
        state.last_trigger_id += 1;
        let stored = Trigger {
            id: state.last_trigger_id,
            job_id,
            created_at: now_utc(),
            deleted: false,
            kind: truncate_kind(&trigger.kind),
            ..trigger.clone()
        };
        state.triggers.insert(stored.id, stored.clone());
        info!(
            job_id,
            trigger_id = stored.id,
            trigger_type = %stored.trigger_type(),
            "trigger added"
        );
        Ok(stored)
    }

    async fn update_trigger(&self, job_id: i64, trigger: &Trigger) -> Result<bool> {
        let mut state = self.lock();
        let Some(stored) = state
            .trigger_of(job_id, trigger.id)
            .filter(|t| t.trigger_type() == trigger.trigger_type())
        else {
            return Ok(false);
        };
        stored.is_active = trigger.is_active;
        stored.user_id = trigger.user_id.clone();
        stored.user_display_name = trigger.user_display_name.clone();
        stored.parameters = trigger.parameters.clone();
        stored.comment = trigger.comment.clone();
        stored.kind = truncate_kind(&trigger.kind);
        Ok(true)
    }

    async fn disable_trigger(&self, job_id: i64, trigger_id: i64) -> Result<bool> {
        let mut state = self.lock();
        let Some(trigger) = state.trigger_of(job_id, trigger_id) else {
            return Ok(false);
        };
        trigger.is_active = false;
        Ok(true)
    }

    async fn enable_trigger(&self, job_id: i64, trigger_id: i64) -> Result<bool> {
        let mut state = self.lock();
        let Some(trigger) = state.trigger_of(job_id, trigger_id) else {
            return Ok(false);
        };
        trigger.is_active = true;
        Ok(true)
    }

    async fn delete_trigger(&self, job_id: i64, trigger_id: i64) -> Result<bool> {
        let mut state = self.lock();
        let Some(trigger) = state.trigger_of(job_id, trigger_id) else {
            return Ok(false);
        };
        trigger.deleted = true;
        Ok(true)
    }

    async fn get_trigger_by_id(&self, job_id: i64, trigger_id: i64) -> Result<Option<Trigger>> {
        Ok(self.lock().trigger_of(job_id, trigger_id).cloned())
    }

    async fn get_triggers_by_job_id(
        &self,
        job_id: i64,
        options: &ListOptions,
    ) -> Result<PagedResult<Trigger>> {
        let plan = options.plan::<TriggerField>()?;
        let state = self.lock();
        let mut triggers: Vec<Trigger> = state
            .triggers
            .values()
            .filter(|t| t.job_id == job_id && t.deleted == plan.show_deleted)
            .cloned()
            .collect();
        triggers.sort_by(|a, b| b.is_active.cmp(&a.is_active).then(a.id.cmp(&b.id)));
        Ok(page_of(&plan, &triggers))
    }

    async fn get_active_triggers(&self, options: &ListOptions) -> Result<PagedResult<Trigger>> {
        let plan = options.plan::<TriggerField>()?;
        let state = self.lock();
        let mut triggers: Vec<Trigger> = state
            .triggers
            .values()
            .filter(|t| t.is_active && t.deleted == plan.show_deleted)
            .filter(|t| state.job_matches(t.job_id, &plan))
            .cloned()
            .collect();
        sort_entities(&mut triggers, &plan.sort);
        Ok(page_of(&plan, &triggers))
    }

    async fn add_job_run(&self, run: &JobRun) -> Result<JobRun> {
        let mut state = self.lock();
        if !state.jobs.contains_key(&run.job_id) {
            return Err(Error::missing_reference(format!("job {}", run.job_id)));
        }
        if !state.triggers.contains_key(&run.trigger_id) {
            return Err(Error::missing_reference(format!(
                "trigger {}",
                run.trigger_id
            )));
        }
        state.last_run_id += 1;
        let stored = JobRun {
            id: state.last_run_id,
            planned_start_at: truncate_ms(run.planned_start_at),
            actual_start_at: truncate_opt(run.actual_start_at),
            actual_end_at: truncate_opt(run.actual_end_at),
            estimated_end_at: truncate_opt(run.estimated_end_at),
            deleted: false,
            ..run.clone()
        };
        state.runs.insert(stored.id, stored.clone());
        debug!(
            job_run_id = stored.id,
            job_id = stored.job_id,
            trigger_id = stored.trigger_id,
            "job run added"
        );
        Ok(stored)
    }

    async fn update_job_run(&self, run: &JobRun) -> Result<bool> {
        let mut state = self.lock();
        let Some(stored) = state.runs.get_mut(&run.id) else {
            return Ok(false);
        };
        stored.state = run.state;
        stored.planned_start_at = truncate_ms(run.planned_start_at);
        if run.progress.is_some() {
            stored.progress = run.progress;
        }
        if let Some(at) = run.actual_start_at {
            stored.actual_start_at = Some(truncate_ms(at));
        }
        if let Some(at) = run.actual_end_at {
            stored.actual_end_at = Some(truncate_ms(at));
        }
        if let Some(at) = run.estimated_end_at {
            stored.estimated_end_at = Some(truncate_ms(at));
        }
        if run.job_parameters.is_some() {
            stored.job_parameters = run.job_parameters.clone();
        }
        if run.instance_parameters.is_some() {
            stored.instance_parameters = run.instance_parameters.clone();
        }
        if run.pid.is_some() {
            stored.pid = run.pid;
        }
        Ok(true)
    }

    async fn update_progress(&self, job_run_id: i64, progress: Option<f64>) -> Result<bool> {
        let mut state = self.lock();
        let Some(run) = state.runs.get_mut(&job_run_id) else {
            return Ok(false);
        };
        run.progress = progress;
        Ok(true)
    }

    async fn get_job_run_by_id(&self, job_run_id: i64) -> Result<Option<JobRun>> {
        Ok(self.lock().runs.get(&job_run_id).cloned())
    }

    async fn get_job_runs(&self, options: &ListOptions) -> Result<PagedResult<JobRun>> {
        self.list_runs(RunScope::All, options)
    }

    async fn get_job_runs_by_job_id(
        &self,
        job_id: i64,
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>> {
        self.list_runs(RunScope::Job(job_id), options)
    }

    async fn get_job_runs_by_trigger_id(
        &self,
        job_id: i64,
        trigger_id: i64,
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>> {
        self.list_runs(RunScope::Trigger { job_id, trigger_id }, options)
    }

    async fn get_job_runs_by_user_id(
        &self,
        user_id: &str,
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>> {
        self.list_runs(RunScope::UserId(user_id), options)
    }

    async fn get_job_runs_by_user_display_name(
        &self,
        user_display_name: &str,
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>> {
        self.list_runs(RunScope::UserDisplayName(user_display_name), options)
    }

    async fn get_job_runs_by_states(
        &self,
        states: &[JobRunState],
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>> {
        self.list_runs(RunScope::States(states), options)
    }

    async fn get_last_job_run_by_trigger_id(
        &self,
        job_id: i64,
        trigger_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Option<JobRun>> {
        let as_of = truncate_ms(as_of);
        let state = self.lock();
        Ok(state
            .runs
            .values()
            .filter(|r| !r.deleted && r.job_id == job_id && r.trigger_id == trigger_id)
            .filter_map(|r| r.actual_start_at.filter(|s| *s < as_of).map(|s| (s, r)))
            .max_by(|(sa, a), (sb, b)| sa.cmp(sb).then(a.id.cmp(&b.id)))
            .map(|(_, r)| r.clone()))
    }

    async fn get_next_job_run_by_trigger_id(
        &self,
        job_id: i64,
        trigger_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Option<JobRun>> {
        let as_of = truncate_ms(as_of);
        let state = self.lock();
        Ok(state
            .runs
            .values()
            .filter(|r| !r.deleted && r.job_id == job_id && r.trigger_id == trigger_id)
            .filter(|r| r.state == JobRunState::Scheduled && r.planned_start_at >= as_of)
            .min_by(|a, b| {
                a.planned_start_at
                    .cmp(&b.planned_start_at)
                    .then(a.id.cmp(&b.id))
            })
            .cloned())
    }

    async fn has_non_terminal_job_run(&self, trigger_id: i64) -> Result<bool> {
        Ok(self
            .lock()
            .runs
            .values()
            .any(|r| r.trigger_id == trigger_id && !r.deleted && !r.state.is_terminal()))
    }

    async fn apply_retention(&self, deadline: DateTime<Utc>) -> Result<RetentionReport> {
        let deadline = truncate_ms(deadline);
        let mut state = self.lock();
        let mut report = RetentionReport::default();
        let mut affected = BTreeSet::new();

        for run in state.runs.values_mut() {
            if !run.deleted && run.actual_end_at.is_some_and(|end| end <= deadline) {
                run.deleted = true;
                report.job_runs_deleted += 1;
                affected.insert(run.trigger_id);
            }
        }

        for trigger_id in affected {
            let has_live_run = state
                .runs
                .values()
                .any(|r| r.trigger_id == trigger_id && !r.deleted);
            if has_live_run {
                continue;
            }
            if let Some(trigger) = state.triggers.get_mut(&trigger_id)
                && !trigger.deleted
                && !trigger.is_recurring()
            {
                trigger.deleted = true;
                report.triggers_deleted += 1;
            }
        }

        if !report.is_empty() {
            info!(
                job_runs = report.job_runs_deleted,
                triggers = report.triggers_deleted,
                %deadline,
                "retention applied"
            );
        }
        Ok(report)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, chrono::TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn ids_are_never_reused() {
        let store = InMemoryStorage::new();
        let a = store.add_job(&Job::new("a", "T")).await.unwrap();
        store.delete_job(a.id).await.unwrap();
        let b = store.add_job(&Job::new("b", "T")).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn update_rename_collision_is_rejected() {
        let store = InMemoryStorage::new();
        store.add_job(&Job::new("a", "T")).await.unwrap();
        let mut b = store.add_job(&Job::new("b", "T")).await.unwrap();
        b.unique_name = "a".into();
        assert!(matches!(
            store.update_job(&b).await,
            Err(Error::UniqueConstraintViolation { .. })
        ));
    }

    #[tokio::test]
    async fn trigger_lookup_is_scoped_to_job() {
        let store = InMemoryStorage::new();
        let job = store.add_job(&Job::new("a", "T")).await.unwrap();
        let other = store.add_job(&Job::new("b", "T")).await.unwrap();
        let trigger = store
            .add_trigger(job.id, &Trigger::instant(0))
            .await
            .unwrap();
        assert!(
            store
                .get_trigger_by_id(other.id, trigger.id)
                .await
                .unwrap()
                .is_none()
        );
        assert!(!store.disable_trigger(other.id, trigger.id).await.unwrap());
    }

    #[tokio::test]
    async fn update_trigger_keeps_type() {
        let store = InMemoryStorage::new();
        let job = store.add_job(&Job::new("a", "T")).await.unwrap();
        let trigger = store
            .add_trigger(job.id, &Trigger::scheduled(at(0)))
            .await
            .unwrap();
        let replacement = Trigger {
            id: trigger.id,
            ..Trigger::instant(5)
        };
        assert!(!store.update_trigger(job.id, &replacement).await.unwrap());
        let stored = store.get_trigger_by_id(job.id, trigger.id).await.unwrap();
        assert_eq!(stored.unwrap().kind, TriggerKind::Scheduled { start_at: at(0) });
    }

    #[tokio::test]
    async fn sub_millisecond_precision_is_dropped() {
        let store = InMemoryStorage::new();
        let job = store.add_job(&Job::new("a", "T")).await.unwrap();
        let trigger = store
            .add_trigger(job.id, &Trigger::instant(0))
            .await
            .unwrap();
        let planned = Utc.timestamp_opt(1_700_000_000, 1_234_567).unwrap();
        let run = store
            .add_job_run(&JobRun::new(job.id, trigger.id, planned))
            .await
            .unwrap();
        assert_eq!(run.planned_start_at.timestamp_subsec_nanos(), 1_000_000);
    }
}
