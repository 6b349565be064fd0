//! Periodic retention sweeper.
//!
//! Sweeps once on start and then every interval, calling
//! [`JobStorage::apply_retention`] with `now - retention`. Sweeps never
//! overlap, whether they come from the timer or from [`RetentionSweeper::sweep`].

use std::{sync::Arc, time::Duration};

use {
    chrono::{DateTime, TimeDelta, Utc},
    jobstore_config::{MIN_RETENTION_SECS, StorageConfig},
    tokio::{
        sync::{Mutex, Notify, RwLock},
        task::JoinHandle,
    },
    tracing::{debug, info, warn},
};

use crate::{Error, Result, model::RetentionReport, store::JobStorage};

pub struct RetentionSweeper {
    storage: Arc<dyn JobStorage>,
    retention: TimeDelta,
    interval: Duration,
    sweep_lock: Mutex<()>,
    timer_handle: Mutex<Option<JoinHandle<()>>>,
    wake_notify: Arc<Notify>,
    running: RwLock<bool>,
}

impl RetentionSweeper {
    /// A retention window under one day or a zero interval is rejected.
    pub fn new(
        storage: Arc<dyn JobStorage>,
        retention: Duration,
        interval: Duration,
    ) -> Result<Arc<Self>> {
        if retention < Duration::from_secs(MIN_RETENTION_SECS) {
            return Err(Error::invalid_config([format!(
                "retention must be at least one day, got {}s",
                retention.as_secs()
            )]));
        }
        if interval.is_zero() {
            return Err(Error::invalid_config([
                "sweep interval must be greater than zero",
            ]));
        }
        let retention = TimeDelta::from_std(retention).map_err(|e| {
            Error::invalid_config([format!("retention window out of range: {e}")])
        })?;

        Ok(Arc::new(Self {
            storage,
            retention,
            interval,
            sweep_lock: Mutex::new(()),
            timer_handle: Mutex::new(None),
            wake_notify: Arc::new(Notify::new()),
            running: RwLock::new(false),
        }))
    }

    /// `None` when the config leaves retention disabled.
    pub fn from_config(
        storage: Arc<dyn JobStorage>,
        config: &StorageConfig,
    ) -> Result<Option<Arc<Self>>> {
        config
            .retention()
            .map(|retention| Self::new(storage, retention, config.retention_interval()))
            .transpose()
    }

    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.timer_handle.lock().await;
        if handle.is_some() {
            return;
        }
        *self.running.write().await = true;

        let sweeper = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            sweeper.timer_loop().await;
        }));
        info!(
            retention_secs = self.retention.num_seconds(),
            interval_secs = self.interval.as_secs(),
            "retention sweeper started"
        );
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.wake_notify.notify_one();

        let mut handle = self.timer_handle.lock().await;
        if let Some(h) = handle.take() {
            h.abort();
        }
        info!("retention sweeper stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Sweep now, waiting for any sweep already in progress.
    pub async fn sweep(&self) -> Result<RetentionReport> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let _guard = self.sweep_lock.lock().await;
        let deadline = now - self.retention;
        debug!(%deadline, "sweeping expired job runs");
        self.storage.apply_retention(deadline).await
    }

    async fn timer_loop(self: &Arc<Self>) {
        loop {
            if !*self.running.read().await {
                break;
            }

            if let Err(e) = self.sweep().await {
                warn!(error = %e, "retention sweep failed");
            }

            let notify = Arc::clone(&self.wake_notify);
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {},
                () = notify.notified() => {
                    debug!("retention sweeper woken by notify");
                },
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use {
        super::*,
        crate::{
            model::{Job, JobRun, JobRunState, Trigger},
            store_memory::InMemoryStorage,
        },
    };

    const DAY: Duration = Duration::from_secs(MIN_RETENTION_SECS);

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_800_000_000, 0).unwrap()
    }

    /// One finished run that ended `age_days` ago, under an instant trigger.
    async fn seeded(age_days: i64) -> (Arc<InMemoryStorage>, JobRun) {
        let storage = Arc::new(InMemoryStorage::new());
        let job = storage.add_job(&Job::new("sweep", "T")).await.unwrap();
        let trigger = storage
            .add_trigger(job.id, &Trigger::instant(0))
            .await
            .unwrap();
        let ended = now() - TimeDelta::days(age_days);
        let mut run = JobRun::new(job.id, trigger.id, ended - TimeDelta::hours(1));
        run.state = JobRunState::Completed;
        run.actual_start_at = Some(ended - TimeDelta::hours(1));
        run.actual_end_at = Some(ended);
        let run = storage.add_job_run(&run).await.unwrap();
        (storage, run)
    }

    #[test]
    fn short_retention_is_rejected() {
        let storage = Arc::new(InMemoryStorage::new());
        let err = RetentionSweeper::new(storage, DAY - Duration::from_secs(1), DAY)
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let storage = Arc::new(InMemoryStorage::new());
        assert!(RetentionSweeper::new(storage, DAY, Duration::ZERO).is_err());
    }

    #[test]
    fn disabled_retention_builds_nothing() {
        let storage = Arc::new(InMemoryStorage::new());
        let config = StorageConfig::with_connection_string("sqlite::memory:");
        assert!(
            RetentionSweeper::from_config(storage, &config)
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn sweep_uses_retention_window() {
        let (storage, run) = seeded(31).await;
        let sweeper = RetentionSweeper::new(storage.clone(), DAY * 30, DAY).unwrap();

        let report = sweeper.sweep_at(now()).await.unwrap();
        assert_eq!(report.job_runs_deleted, 1);
        assert_eq!(report.triggers_deleted, 1);
        let stored = storage.get_job_run_by_id(run.id).await.unwrap().unwrap();
        assert!(stored.deleted);

        let again = sweeper.sweep_at(now()).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn recent_runs_survive() {
        let (storage, run) = seeded(29).await;
        let sweeper = RetentionSweeper::new(storage.clone(), DAY * 30, DAY).unwrap();

        assert!(sweeper.sweep_at(now()).await.unwrap().is_empty());
        let stored = storage.get_job_run_by_id(run.id).await.unwrap().unwrap();
        assert!(!stored.deleted);
    }

    #[tokio::test]
    async fn concurrent_sweeps_do_not_double_count() {
        let (storage, _) = seeded(40).await;
        let sweeper = RetentionSweeper::new(storage, DAY * 30, DAY).unwrap();

        let (a, b) = tokio::join!(sweeper.sweep_at(now()), sweeper.sweep_at(now()));
        let total = a.unwrap().job_runs_deleted + b.unwrap().job_runs_deleted;
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn start_sweeps_immediately() {
        // Anything older than a year is expired relative to the wall clock.
        let storage = Arc::new(InMemoryStorage::new());
        let job = storage.add_job(&Job::new("old", "T")).await.unwrap();
        let trigger = storage
            .add_trigger(job.id, &Trigger::instant(0))
            .await
            .unwrap();
        let ended = Utc::now() - TimeDelta::days(400);
        let mut run = JobRun::new(job.id, trigger.id, ended);
        run.actual_end_at = Some(ended);
        let run = storage.add_job_run(&run).await.unwrap();

        let sweeper = RetentionSweeper::new(storage.clone(), DAY * 365, DAY).unwrap();
        sweeper.start().await;
        assert!(sweeper.is_running().await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stored = storage.get_job_run_by_id(run.id).await.unwrap().unwrap();
        assert!(stored.deleted);

        sweeper.stop().await;
        assert!(!sweeper.is_running().await);
    }
}
