//! SQLite-backed job storage using sqlx.

use std::fmt;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool, sqlite::SqliteRow},
    tracing::{debug, info},
};

use crate::{
    Error, Result,
    model::{
        Job, JobRun, JobRunState, PagedResult, RetentionReport, Trigger, TriggerKind,
        TriggerType, from_ms, now_utc, to_ms,
    },
    query::{
        ActiveFilter, JobField, JobRunField, ListOptions, ListPlan, RunScope, SortField,
        TriggerField, order_by_sql,
    },
    store::JobStorage,
};

const JOB_COLUMNS: &str = "jobs.id AS id, jobs.unique_name AS unique_name, jobs.title AS title, \
     jobs.job_type AS job_type, jobs.parameters AS parameters, jobs.created_ms AS created_ms, \
     jobs.updated_ms AS updated_ms, jobs.deleted AS deleted";

const TRIGGER_COLUMNS: &str = "triggers.id AS id, triggers.job_id AS job_id, \
     triggers.trigger_type AS trigger_type, triggers.is_active AS is_active, \
     triggers.user_id AS user_id, triggers.user_display_name AS user_display_name, \
     triggers.parameters AS parameters, triggers.comment AS comment, \
     triggers.created_ms AS created_ms, triggers.start_ms AS start_ms, triggers.end_ms AS end_ms, \
     triggers.definition AS definition, triggers.no_parallel_execution AS no_parallel_execution, \
     triggers.delayed_minutes AS delayed_minutes, triggers.deleted AS deleted";

const RUN_COLUMNS: &str = "job_runs.id AS id, job_runs.job_id AS job_id, \
     job_runs.trigger_id AS trigger_id, job_runs.state AS state, job_runs.progress AS progress, \
     job_runs.planned_start_ms AS planned_start_ms, job_runs.actual_start_ms AS actual_start_ms, \
     job_runs.actual_end_ms AS actual_end_ms, job_runs.estimated_end_ms AS estimated_end_ms, \
     job_runs.job_parameters AS job_parameters, \
     job_runs.instance_parameters AS instance_parameters, job_runs.pid AS pid, \
     job_runs.deleted AS deleted";

const RUN_SOURCE: &str = "job_runs LEFT JOIN jobs ON jobs.id = job_runs.job_id \
     LEFT JOIN triggers ON triggers.id = job_runs.trigger_id";

const TRIGGER_SOURCE: &str = "triggers LEFT JOIN jobs ON jobs.id = triggers.job_id";

// ── Rows ────────────────────────────────────────────────────────────────────

#[derive(FromRow)]
struct JobRow {
    id: i64,
    unique_name: String,
    title: Option<String>,
    job_type: Option<String>,
    parameters: Option<String>,
    created_ms: i64,
    updated_ms: Option<i64>,
    deleted: bool,
}

impl TryFrom<JobRow> for Job {
    type Error = Error;

    fn try_from(r: JobRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            unique_name: r.unique_name,
            title: r.title,
            job_type: r.job_type,
            parameters: r.parameters,
            created_at: from_ms(r.created_ms)?,
            updated_at: r.updated_ms.map(from_ms).transpose()?,
            deleted: r.deleted,
        })
    }
}

#[derive(FromRow)]
struct TriggerRow {
    id: i64,
    job_id: i64,
    trigger_type: String,
    is_active: bool,
    user_id: Option<String>,
    user_display_name: Option<String>,
    parameters: Option<String>,
    comment: Option<String>,
    created_ms: i64,
    start_ms: Option<i64>,
    end_ms: Option<i64>,
    definition: Option<String>,
    no_parallel_execution: bool,
    delayed_minutes: i32,
    deleted: bool,
}

impl TryFrom<TriggerRow> for Trigger {
    type Error = Error;

    fn try_from(r: TriggerRow) -> Result<Self> {
        let kind = match r.trigger_type.parse::<TriggerType>()? {
            TriggerType::Instant => TriggerKind::Instant {
                delayed_minutes: r.delayed_minutes,
            },
            TriggerType::Scheduled => {
                let start_ms = r.start_ms.ok_or_else(|| {
                    Error::data_corruption(format!("scheduled trigger {} has no start", r.id))
                })?;
                TriggerKind::Scheduled {
                    start_at: from_ms(start_ms)?,
                }
            },
            TriggerType::Recurring => TriggerKind::Recurring {
                start_at: r.start_ms.map(from_ms).transpose()?,
                end_at: r.end_ms.map(from_ms).transpose()?,
                definition: r.definition.unwrap_or_default(),
                no_parallel_execution: r.no_parallel_execution,
            },
        };
        Ok(Self {
            id: r.id,
            job_id: r.job_id,
            is_active: r.is_active,
            user_id: r.user_id,
            user_display_name: r.user_display_name,
            parameters: r.parameters,
            comment: r.comment,
            created_at: from_ms(r.created_ms)?,
            deleted: r.deleted,
            kind,
        })
    }
}

#[derive(FromRow)]
struct JobRunRow {
    id: i64,
    job_id: i64,
    trigger_id: i64,
    state: String,
    progress: Option<f64>,
    planned_start_ms: i64,
    actual_start_ms: Option<i64>,
    actual_end_ms: Option<i64>,
    estimated_end_ms: Option<i64>,
    job_parameters: Option<String>,
    instance_parameters: Option<String>,
    pid: Option<i32>,
    deleted: bool,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = Error;

    fn try_from(r: JobRunRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            job_id: r.job_id,
            trigger_id: r.trigger_id,
            state: r.state.parse()?,
            progress: r.progress,
            planned_start_at: from_ms(r.planned_start_ms)?,
            actual_start_at: r.actual_start_ms.map(from_ms).transpose()?,
            actual_end_at: r.actual_end_ms.map(from_ms).transpose()?,
            estimated_end_at: r.estimated_end_ms.map(from_ms).transpose()?,
            job_parameters: r.job_parameters,
            instance_parameters: r.instance_parameters,
            pid: r.pid,
            deleted: r.deleted,
        })
    }
}

/// Variant payload flattened onto the `triggers` columns.
struct KindColumns<'a> {
    start_ms: Option<i64>,
    end_ms: Option<i64>,
    definition: Option<&'a str>,
    no_parallel_execution: bool,
    delayed_minutes: i32,
}

impl<'a> From<&'a TriggerKind> for KindColumns<'a> {
    fn from(kind: &'a TriggerKind) -> Self {
        let empty = KindColumns {
            start_ms: None,
            end_ms: None,
            definition: None,
            no_parallel_execution: false,
            delayed_minutes: 0,
        };
        match kind {
            TriggerKind::Instant { delayed_minutes } => KindColumns {
                delayed_minutes: *delayed_minutes,
                ..empty
            },
            TriggerKind::Scheduled { start_at } => KindColumns {
                start_ms: Some(to_ms(*start_at)),
                ..empty
            },
            TriggerKind::Recurring {
                start_at,
                end_at,
                definition,
                no_parallel_execution,
            } => KindColumns {
                start_ms: start_at.map(to_ms),
                end_ms: end_at.map(to_ms),
                definition: Some(definition),
                no_parallel_execution: *no_parallel_execution,
                delayed_minutes: 0,
            },
        }
    }
}

/// Translate constraint failures into storage errors.
fn map_write_error(e: sqlx::Error, unique_name: Option<&str>) -> Error {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation()
            && let Some(name) = unique_name
        {
            return Error::unique_name_taken(name);
        }
        if db.is_foreign_key_violation() {
            return Error::missing_reference(db.message());
        }
    }
    Error::Sqlx(e)
}

// ── Predicates ──────────────────────────────────────────────────────────────

fn push_job_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: Option<&ActiveFilter>) {
    match filter {
        None => {},
        Some(ActiveFilter::JobType(job_type)) => {
            qb.push(" AND jobs.job_type = ").push_bind(job_type.clone());
        },
        Some(ActiveFilter::UniqueName(name)) => {
            qb.push(" AND jobs.unique_name = ").push_bind(name.clone());
        },
        Some(ActiveFilter::Query(q)) => {
            qb.push(" AND (instr(jobs.unique_name, ")
                .push_bind(q.clone())
                .push(") > 0 OR instr(jobs.job_type, ")
                .push_bind(q.clone())
                .push(") > 0 OR instr(jobs.title, ")
                .push_bind(q.clone())
                .push(") > 0)");
        },
    }
}

fn push_states(qb: &mut QueryBuilder<'_, Sqlite>, states: impl IntoIterator<Item = JobRunState>) {
    qb.push("(");
    let mut list = qb.separated(", ");
    for state in states {
        list.push_bind(state.as_str());
    }
    list.push_unseparated(")");
}

fn push_run_scope(qb: &mut QueryBuilder<'_, Sqlite>, scope: RunScope<'_>) {
    match scope {
        RunScope::All => {},
        RunScope::Job(job_id) => {
            qb.push(" AND job_runs.job_id = ").push_bind(job_id);
        },
        RunScope::Trigger { job_id, trigger_id } => {
            qb.push(" AND job_runs.job_id = ")
                .push_bind(job_id)
                .push(" AND job_runs.trigger_id = ")
                .push_bind(trigger_id);
        },
        RunScope::UserId(user_id) => {
            qb.push(" AND triggers.user_id = ")
                .push_bind(user_id.to_owned());
        },
        RunScope::UserDisplayName(name) => {
            qb.push(" AND triggers.user_display_name = ")
                .push_bind(name.to_owned());
        },
        RunScope::States([]) => {
            qb.push(" AND 0");
        },
        RunScope::States(states) => {
            qb.push(" AND job_runs.state IN ");
            push_states(qb, states.iter().copied());
        },
    }
}

// ── Store ───────────────────────────────────────────────────────────────────

/// SQLite-backed persistence for jobs, triggers and job runs.
pub struct SqliteStorage {
    pool: SqlitePool,
    connection_string: Option<String>,
}

impl SqliteStorage {
    /// Create a storage over an existing pool (migrations must already be run).
    ///
    /// Call [`crate::run_migrations`] before using this constructor.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            connection_string: None,
        }
    }

    pub(crate) fn connected(pool: SqlitePool, connection_string: &str) -> Self {
        Self {
            pool,
            connection_string: Some(connection_string.to_owned()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Count and fetch one page. `predicate` must start with ` WHERE`.
    async fn fetch_page<F, R, T>(
        &self,
        columns: &str,
        source: &str,
        plan: &ListPlan<F>,
        order_by: &str,
        predicate: impl Fn(&mut QueryBuilder<'_, Sqlite>),
    ) -> Result<PagedResult<T>>
    where
        R: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
        T: TryFrom<R, Error = Error>,
    {
        let mut count = QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*) FROM {source}"));
        predicate(&mut count);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {columns} FROM {source}"));
        predicate(&mut select);
        select
            .push(order_by)
            .push(" LIMIT ")
            .push_bind(plan.limit())
            .push(" OFFSET ")
            .push_bind(plan.offset());
        debug!(sql = select.sql(), "listing page");

        let items = select
            .build_query_as::<R>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(T::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(PagedResult {
            items,
            page: plan.page,
            page_size: plan.page_size,
            total_items: total as u64,
        })
    }

    async fn list_runs(
        &self,
        scope: RunScope<'_>,
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>> {
        let plan = options.plan::<JobRunField>()?;
        self.fetch_page::<_, JobRunRow, JobRun>(
            RUN_COLUMNS,
            RUN_SOURCE,
            &plan,
            &order_by_sql(&plan.sort),
            |qb| {
                qb.push(" WHERE job_runs.deleted = ")
                    .push_bind(plan.show_deleted);
                push_run_scope(qb, scope);
                push_job_filter(qb, plan.filter.as_ref());
            },
        )
        .await
    }

    async fn find_run(
        &self,
        sql: &str,
        job_id: i64,
        trigger_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Option<JobRun>> {
        let row = sqlx::query_as::<_, JobRunRow>(sql)
            .bind(job_id)
            .bind(trigger_id)
            .bind(to_ms(as_of))
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRun::try_from).transpose()
    }
}

impl fmt::Display for SqliteStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.connection_string {
            Some(url) => write!(f, "SqliteStorage (sqlite, connection: {url})"),
            None => f.write_str("SqliteStorage (sqlite, shared pool)"),
        }
    }
}

#[async_trait]
impl JobStorage for SqliteStorage {
    async fn add_job(&self, job: &Job) -> Result<Job> {
        let created_at = now_utc();
        let result = sqlx::query(
            "INSERT INTO jobs (unique_name, title, job_type, parameters, created_ms, deleted)
             VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(&job.unique_name)
        .bind(&job.title)
        .bind(&job.job_type)
        .bind(&job.parameters)
        .bind(to_ms(created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, Some(&job.unique_name)))?;

        let stored = Job {
            id: result.last_insert_rowid(),
            created_at,
            updated_at: None,
            deleted: false,
            ..job.clone()
        };
        info!(job_id = stored.id, unique_name = %stored.unique_name, "job added");
        Ok(stored)
    }

    async fn update_job(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET unique_name = ?, title = ?, job_type = ?, parameters = ?,
                 deleted = ?, updated_ms = ?
             WHERE id = ?",
        )
        .bind(&job.unique_name)
        .bind(&job.title)
        .bind(&job.job_type)
        .bind(&job.parameters)
        .bind(job.deleted)
        .bind(to_ms(now_utc()))
        .bind(job.id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, Some(&job.unique_name)))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_job(&self, job_id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET deleted = 1, updated_ms = ? WHERE id = ?")
            .bind(to_ms(now_utc()))
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(job_id, "job deleted");
        }
        Ok(deleted)
    }

    async fn get_job_by_id(&self, job_id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE jobs.id = ?");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn get_job_by_unique_name(&self, unique_name: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE jobs.unique_name = ?");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(unique_name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn get_jobs(&self, options: &ListOptions) -> Result<PagedResult<Job>> {
        let plan = options.plan::<JobField>()?;
        self.fetch_page::<_, JobRow, Job>(
            JOB_COLUMNS,
            "jobs",
            &plan,
            &order_by_sql(&plan.sort),
            |qb| {
                qb.push(" WHERE jobs.deleted = ").push_bind(plan.show_deleted);
                push_job_filter(qb, plan.filter.as_ref());
            },
        )
        .await
    }

    async fn get_jobs_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE deleted = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn add_trigger(&self, job_id: i64, trigger: &Trigger) -> Result<Trigger> {
        let created_at = now_utc();
        let cols = KindColumns::from(&trigger.kind);
        let result = sqlx::query(
            "INSERT INTO triggers (job_id, trigger_type, is_active, user_id, user_display_name,
                 parameters, comment, created_ms, start_ms, end_ms, definition,
                 no_parallel_execution, delayed_minutes, deleted)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(job_id)
        .bind(trigger.trigger_type().as_str())
        .bind(trigger.is_active)
        .bind(&trigger.user_id)
        .bind(&trigger.user_display_name)
        .bind(&trigger.parameters)
        .bind(&trigger.comment)
        .bind(to_ms(created_at))
        .bind(cols.start_ms)
        .bind(cols.end_ms)
        .bind(cols.definition)
        .bind(cols.no_parallel_execution)
        .bind(cols.delayed_minutes)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, None))?;

        let trigger_id = result.last_insert_rowid();
        info!(
            job_id,
            trigger_id,
            trigger_type = %trigger.trigger_type(),
            "trigger added"
        );
        // Read back so stored precision is what the caller sees.
        self.get_trigger_by_id(job_id, trigger_id)
            .await?
            .ok_or_else(|| Error::data_corruption(format!("trigger {trigger_id} vanished")))
    }

    async fn update_trigger(&self, job_id: i64, trigger: &Trigger) -> Result<bool> {
        let cols = KindColumns::from(&trigger.kind);
        let result = sqlx::query(
            "UPDATE triggers SET is_active = ?, user_id = ?, user_display_name = ?,
                 parameters = ?, comment = ?, start_ms = ?, end_ms = ?, definition = ?,
                 no_parallel_execution = ?, delayed_minutes = ?
             WHERE id = ? AND job_id = ? AND trigger_type = ?",
        )
        .bind(trigger.is_active)
        .bind(&trigger.user_id)
        .bind(&trigger.user_display_name)
        .bind(&trigger.parameters)
        .bind(&trigger.comment)
        .bind(cols.start_ms)
        .bind(cols.end_ms)
        .bind(cols.definition)
        .bind(cols.no_parallel_execution)
        .bind(cols.delayed_minutes)
        .bind(trigger.id)
        .bind(job_id)
        .bind(trigger.trigger_type().as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn disable_trigger(&self, job_id: i64, trigger_id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE triggers SET is_active = 0 WHERE id = ? AND job_id = ?")
            .bind(trigger_id)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn enable_trigger(&self, job_id: i64, trigger_id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE triggers SET is_active = 1 WHERE id = ? AND job_id = ?")
            .bind(trigger_id)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_trigger(&self, job_id: i64, trigger_id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE triggers SET deleted = 1 WHERE id = ? AND job_id = ?")
            .bind(trigger_id)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_trigger_by_id(&self, job_id: i64, trigger_id: i64) -> Result<Option<Trigger>> {
        let sql = format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE triggers.id = ? AND triggers.job_id = ?"
        );
        let row = sqlx::query_as::<_, TriggerRow>(&sql)
            .bind(trigger_id)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Trigger::try_from).transpose()
    }

    async fn get_triggers_by_job_id(
        &self,
        job_id: i64,
        options: &ListOptions,
    ) -> Result<PagedResult<Trigger>> {
        let plan = options.plan::<TriggerField>()?;
        let order_by = format!(
            " ORDER BY triggers.is_active DESC, {} ASC",
            TriggerField::ID_COLUMN
        );
        self.fetch_page::<_, TriggerRow, Trigger>(
            TRIGGER_COLUMNS,
            "triggers",
            &plan,
            &order_by,
            |qb| {
                qb.push(" WHERE triggers.job_id = ")
                    .push_bind(job_id)
                    .push(" AND triggers.deleted = ")
                    .push_bind(plan.show_deleted);
            },
        )
        .await
    }

    async fn get_active_triggers(&self, options: &ListOptions) -> Result<PagedResult<Trigger>> {
        let plan = options.plan::<TriggerField>()?;
        self.fetch_page::<_, TriggerRow, Trigger>(
            TRIGGER_COLUMNS,
            TRIGGER_SOURCE,
            &plan,
            &order_by_sql(&plan.sort),
            |qb| {
                qb.push(" WHERE triggers.is_active = 1 AND triggers.deleted = ")
                    .push_bind(plan.show_deleted);
                push_job_filter(qb, plan.filter.as_ref());
            },
        )
        .await
    }

    async fn add_job_run(&self, run: &JobRun) -> Result<JobRun> {
        let result = sqlx::query(
            "INSERT INTO job_runs (job_id, trigger_id, state, progress, planned_start_ms,
                 actual_start_ms, actual_end_ms, estimated_end_ms, job_parameters,
                 instance_parameters, pid, deleted)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(run.job_id)
        .bind(run.trigger_id)
        .bind(run.state.as_str())
        .bind(run.progress)
        .bind(to_ms(run.planned_start_at))
        .bind(run.actual_start_at.map(to_ms))
        .bind(run.actual_end_at.map(to_ms))
        .bind(run.estimated_end_at.map(to_ms))
        .bind(&run.job_parameters)
        .bind(&run.instance_parameters)
        .bind(run.pid)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, None))?;

        let job_run_id = result.last_insert_rowid();
        debug!(
            job_run_id,
            job_id = run.job_id,
            trigger_id = run.trigger_id,
            "job run added"
        );
        self.get_job_run_by_id(job_run_id)
            .await?
            .ok_or_else(|| Error::data_corruption(format!("job run {job_run_id} vanished")))
    }

    async fn update_job_run(&self, run: &JobRun) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE job_runs SET
                 state = ?,
                 planned_start_ms = ?,
                 progress = COALESCE(?, progress),
                 actual_start_ms = COALESCE(?, actual_start_ms),
                 actual_end_ms = COALESCE(?, actual_end_ms),
                 estimated_end_ms = COALESCE(?, estimated_end_ms),
                 job_parameters = COALESCE(?, job_parameters),
                 instance_parameters = COALESCE(?, instance_parameters),
                 pid = COALESCE(?, pid)
             WHERE id = ?",
        )
        .bind(run.state.as_str())
        .bind(to_ms(run.planned_start_at))
        .bind(run.progress)
        .bind(run.actual_start_at.map(to_ms))
        .bind(run.actual_end_at.map(to_ms))
        .bind(run.estimated_end_at.map(to_ms))
        .bind(&run.job_parameters)
        .bind(&run.instance_parameters)
        .bind(run.pid)
        .bind(run.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_progress(&self, job_run_id: i64, progress: Option<f64>) -> Result<bool> {
        let result = sqlx::query("UPDATE job_runs SET progress = ? WHERE id = ?")
            .bind(progress)
            .bind(job_run_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_job_run_by_id(&self, job_run_id: i64) -> Result<Option<JobRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE job_runs.id = ?");
        let row = sqlx::query_as::<_, JobRunRow>(&sql)
            .bind(job_run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRun::try_from).transpose()
    }

    async fn get_job_runs(&self, options: &ListOptions) -> Result<PagedResult<JobRun>> {
        self.list_runs(RunScope::All, options).await
    }

    async fn get_job_runs_by_job_id(
        &self,
        job_id: i64,
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>> {
        self.list_runs(RunScope::Job(job_id), options).await
    }

    async fn get_job_runs_by_trigger_id(
        &self,
        job_id: i64,
        trigger_id: i64,
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>> {
        self.list_runs(RunScope::Trigger { job_id, trigger_id }, options)
            .await
    }

    async fn get_job_runs_by_user_id(
        &self,
        user_id: &str,
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>> {
        self.list_runs(RunScope::UserId(user_id), options).await
    }

    async fn get_job_runs_by_user_display_name(
        &self,
        user_display_name: &str,
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>> {
        self.list_runs(RunScope::UserDisplayName(user_display_name), options)
            .await
    }

    async fn get_job_runs_by_states(
        &self,
        states: &[JobRunState],
        options: &ListOptions,
    ) -> Result<PagedResult<JobRun>> {
        self.list_runs(RunScope::States(states), options).await
    }

    async fn get_last_job_run_by_trigger_id(
        &self,
        job_id: i64,
        trigger_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Option<JobRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM job_runs
             WHERE job_runs.job_id = ? AND job_runs.trigger_id = ? AND job_runs.deleted = 0
               AND job_runs.actual_start_ms IS NOT NULL AND job_runs.actual_start_ms < ?
             ORDER BY job_runs.actual_start_ms DESC, job_runs.id DESC
             LIMIT 1"
        );
        self.find_run(&sql, job_id, trigger_id, as_of).await
    }

    async fn get_next_job_run_by_trigger_id(
        &self,
        job_id: i64,
        trigger_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Option<JobRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM job_runs
             WHERE job_runs.job_id = ? AND job_runs.trigger_id = ? AND job_runs.deleted = 0
               AND job_runs.state = '{}' AND job_runs.planned_start_ms >= ?
             ORDER BY job_runs.planned_start_ms ASC, job_runs.id ASC
             LIMIT 1",
            JobRunState::Scheduled.as_str()
        );
        self.find_run(&sql, job_id, trigger_id, as_of).await
    }

    async fn has_non_terminal_job_run(&self, trigger_id: i64) -> Result<bool> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT EXISTS (SELECT 1 FROM job_runs WHERE deleted = 0 AND trigger_id = ",
        );
        qb.push_bind(trigger_id).push(" AND state NOT IN ");
        push_states(
            &mut qb,
            JobRunState::ALL.into_iter().filter(|s| s.is_terminal()),
        );
        qb.push(")");
        let exists: bool = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(exists)
    }

    async fn apply_retention(&self, deadline: DateTime<Utc>) -> Result<RetentionReport> {
        let deadline_ms = to_ms(deadline);
        let mut tx = self.pool.begin().await?;

        let trigger_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT trigger_id FROM job_runs
             WHERE deleted = 0 AND actual_end_ms IS NOT NULL AND actual_end_ms <= ?",
        )
        .bind(deadline_ms)
        .fetch_all(&mut *tx)
        .await?;

        let job_runs_deleted = sqlx::query(
            "UPDATE job_runs SET deleted = 1
             WHERE deleted = 0 AND actual_end_ms IS NOT NULL AND actual_end_ms <= ?",
        )
        .bind(deadline_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let mut triggers_deleted = 0;
        for trigger_id in trigger_ids {
            triggers_deleted += sqlx::query(
                "UPDATE triggers SET deleted = 1
                 WHERE id = ? AND deleted = 0 AND trigger_type <> ?
                   AND NOT EXISTS (
                       SELECT 1 FROM job_runs
                       WHERE job_runs.trigger_id = triggers.id AND job_runs.deleted = 0
                   )",
            )
            .bind(trigger_id)
            .bind(TriggerType::Recurring.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;

        let report = RetentionReport {
            job_runs_deleted,
            triggers_deleted,
        };
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
