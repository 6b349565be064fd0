//! Persistence for jobs, triggers and job runs.
//!
//! [`JobStorage`] is the contract; [`SqliteStorage`] and [`InMemoryStorage`]
//! implement it with identical paging, filtering, sorting and soft-delete
//! semantics. [`RetentionSweeper`] prunes finished runs on a timer.

pub mod error;
pub mod model;
pub mod query;
pub mod retention;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;

use std::str::FromStr;

use {
    jobstore_config::{StorageConfig, validate_config},
    sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    tracing::info,
};

pub use {
    error::{Error, Result},
    model::{
        Job, JobRun, JobRunState, PagedResult, RetentionReport, Trigger, TriggerKind, TriggerType,
    },
    query::{JobFilter, ListOptions, SortDirection, SortKey},
    retention::RetentionSweeper,
    store::JobStorage,
    store_memory::InMemoryStorage,
    store_sqlite::SqliteStorage,
};

/// Run database migrations for the job store.
///
/// Creates the `jobs`, `triggers` and `job_runs` tables. Call this before
/// [`SqliteStorage::with_pool`] when sharing a pool with other components.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}

/// Validate `config`, connect, and create the schema when asked to.
///
/// Any error-level diagnostic aborts before a connection is attempted.
pub async fn open(config: &StorageConfig) -> Result<SqliteStorage> {
    let validation = validate_config(config);
    if validation.has_errors() {
        return Err(Error::invalid_config(validation.errors()));
    }

    let url = config.connection_string.trim();
    let connect_options = SqliteConnectOptions::from_str(url)?
        .foreign_keys(true)
        .create_if_missing(config.auto_create_schema);

    // Every connection to an in-memory database sees its own database, so
    // the pool must hold exactly one connection and never recycle it.
    let pool_options = if is_in_memory(url) {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(config.max_connections)
    };
    let pool = pool_options.connect_with(connect_options).await?;

    if config.auto_create_schema {
        run_migrations(&pool).await?;
    }

    info!(connection = url, "job storage opened");
    Ok(SqliteStorage::connected(pool, url))
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("sqlite::memory:", true)]
    #[case("sqlite://file:jobs?mode=memory&cache=shared", true)]
    #[case("sqlite://jobs.db?mode=rwc", false)]
    fn detects_in_memory_urls(#[case] url: &str, #[case] expected: bool) {
        assert_eq!(is_in_memory(url), expected);
    }

    #[tokio::test]
    async fn invalid_config_never_connects() {
        let config = StorageConfig {
            retention_secs: Some(60),
            ..StorageConfig::with_connection_string("sqlite::memory:")
        };
        let err = open(&config).await.err().unwrap();
        match err {
            Error::InvalidConfig { diagnostics } => {
                assert_eq!(diagnostics.len(), 1);
                assert!(diagnostics[0].contains("storage.retention_secs"));
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_connection_string_is_rejected() {
        let err = open(&StorageConfig::default()).await.err().unwrap();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn opens_file_database_and_reopens_it() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let config = StorageConfig::with_connection_string(&url);

        let first = open(&config).await.unwrap();
        let job = first.add_job(&Job::new("persisted", "T")).await.unwrap();
        first.pool().close().await;

        let second = open(&config).await.unwrap();
        let loaded = second.get_job_by_unique_name("persisted").await.unwrap();
        assert_eq!(loaded.map(|j| j.id), Some(job.id));
        assert!(second.is_available().await);
    }

    #[tokio::test]
    async fn missing_file_without_auto_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("absent.db").display());
        let config = StorageConfig {
            auto_create_schema: false,
            ..StorageConfig::with_connection_string(url)
        };
        assert!(matches!(open(&config).await, Err(Error::Sqlx(_))));
    }
}
