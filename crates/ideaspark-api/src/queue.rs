//! Background job queue over the `jobs` table. Workers claim jobs with a
//! lease, so a job whose worker dies is picked up again once the lease
//! runs out. Failures are retried with exponential backoff until the
//! attempt budget is spent, then kept as failed for inspection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ideaspark_db::jobs::Retention;
use ideaspark_db::models::JobRow;
use ideaspark_db::{Database, DbError};

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn handle(&self, payload: &Value) -> anyhow::Result<()>;
}

/// `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1 << exp).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub lease: Duration,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub retention: Retention,
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            retention: Retention::default(),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    db: Arc<Database>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    config: QueueConfig,
    wake: Notify,
}

impl JobQueue {
    pub fn new(db: Arc<Database>, config: QueueConfig, handlers: Vec<Arc<dyn JobHandler>>) -> Self {
        let handlers = handlers.into_iter().map(|h| (h.kind(), h)).collect();
        Self {
            inner: Arc::new(QueueInner {
                db,
                handlers,
                config,
                wake: Notify::new(),
            }),
        }
    }

    /// Persist a job and wake one idle worker. Lower `priority` runs first.
    pub async fn enqueue(
        &self,
        kind: &str,
        payload: Value,
        priority: i64,
    ) -> Result<Uuid, DbError> {
        let kind_owned = kind.to_string();
        let max_attempts = self.inner.config.max_attempts;
        let id = self
            .inner
            .db
            .run(move |db| db.enqueue_job(&kind_owned, &payload, priority, max_attempts))
            .await?;
        debug!("Enqueued {} job {}", kind, id);
        self.inner.wake.notify_one();
        Ok(id)
    }

    pub async fn failed_jobs(&self, limit: u32) -> Result<Vec<JobRow>, DbError> {
        self.inner.db.run(move |db| db.failed_jobs(limit)).await
    }

    /// Claim and run one job. False when nothing was ready.
    pub async fn process_next(&self) -> Result<bool, DbError> {
        let lease = chrono::Duration::from_std(self.inner.config.lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let Some(job) = self.inner.db.run(move |db| db.claim_job(lease)).await? else {
            return Ok(false);
        };
        debug!("Claimed {} job {} (attempt {})", job.kind, job.id, job.attempts);

        let Some(handler) = self.inner.handlers.get(job.kind.as_str()).cloned() else {
            error!("No handler for {} job {}, failing it", job.kind, job.id);
            let id = job.id.clone();
            let attempt = job.attempts;
            let reason = format!("no handler for job kind '{}'", job.kind);
            self.inner
                .db
                .run(move |db| db.fail_job(&id, attempt, &reason))
                .await?;
            return Ok(true);
        };

        let outcome = handler.handle(&job.payload).await;
        let id = job.id.clone();
        let attempt = job.attempts;
        let recorded = match outcome {
            Ok(()) => {
                self.inner
                    .db
                    .run(move |db| db.complete_job(&id, attempt))
                    .await?
            }
            Err(e) if job.attempts >= job.max_attempts => {
                error!(
                    "{} job {} failed permanently after {} attempts: {:#}",
                    job.kind, job.id, job.attempts, e
                );
                let reason = format!("{:#}", e);
                self.inner
                    .db
                    .run(move |db| db.fail_job(&id, attempt, &reason))
                    .await?
            }
            Err(e) => {
                let delay = self.inner.config.retry.delay(job.attempts);
                warn!(
                    "{} job {} failed (attempt {}/{}), retrying in {:?}: {:#}",
                    job.kind, job.id, job.attempts, job.max_attempts, delay, e
                );
                let run_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                let reason = format!("{:#}", e);
                self.inner
                    .db
                    .run(move |db| db.retry_job(&id, attempt, &reason, run_at))
                    .await?
            }
        };
        if !recorded {
            warn!(
                "{} job {} lost its lease during attempt {}, result dropped",
                job.kind, job.id, attempt
            );
        }
        Ok(true)
    }

    /// Start the worker pool and the retention sweeper. Everything stops
    /// when `shutdown` is cancelled.
    pub fn start(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(self.inner.config.concurrency + 1);
        for worker in 0..self.inner.config.concurrency {
            let queue = self.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                queue.run_worker(worker, shutdown).await;
            }));
        }

        let queue = self.clone();
        tasks.push(tokio::spawn(async move {
            queue.run_sweeper(shutdown).await;
        }));
        info!(
            "Job queue started with {} workers",
            self.inner.config.concurrency
        );
        tasks
    }

    async fn run_worker(&self, worker: usize, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => warn!("Job worker {} error: {}", worker, e),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
            }
        }
        debug!("Job worker {} stopped", worker);
    }

    async fn run_sweeper(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.config.sweep_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let retention = self.inner.config.retention;
            match self.inner.db.run(move |db| db.prune_jobs(&retention)).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Job sweep: pruned {} finished jobs", count);
                    }
                }
                Err(e) => warn!("Job sweep error: {}", e),
            }
        }
    }
}
