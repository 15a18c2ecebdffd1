/// Sequenced, persistent job queue.
///
/// Every encrypt/decrypt task becomes an encrypted `JobModel`, persisted
/// before execution and deleted on success or permanent failure, so work
/// survives a process restart without plaintext at rest. Jobs carry a
/// process-wide monotonic sequence id; the in-memory structure is a
/// `BTreeMap` keyed by that id, so the loop always takes the smallest id
/// regardless of arrival order.
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::model::job::{EncryptableTask, JobModel, JobProps};
use crate::session::cache::SessionCache;

/// Executes one decrypted task; implemented by the orchestrator
pub trait TaskRunner: Send + Sync {
    fn run_task(
        &self,
        task: &EncryptableTask,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub struct JobQueue<C: SessionCache> {
    cache: Arc<C>,
    pending: Mutex<BTreeMap<u64, JobModel>>,
    sequence_id: AtomicU64,
    running: AtomicBool,
    cancelled: AtomicBool,
}

impl<C: SessionCache> JobQueue<C> {
    pub fn new(cache: Arc<C>) -> Self {
        Self {
            cache,
            pending: Mutex::new(BTreeMap::new()),
            sequence_id: AtomicU64::new(0),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Seed the sequence counter past every persisted job, so ids never
    /// repeat across a process restart
    pub async fn hydrate(&self, key: &[u8]) -> Result<()> {
        let jobs = self.cache.fetch_jobs().await?;
        let max_seen = jobs
            .iter()
            .filter_map(|job| job.props(key))
            .map(|props| props.sequence_id)
            .max();

        if let Some(max) = max_seen {
            self.sequence_id.store(max + 1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Wrap a task as an encrypted job, persist it, and stage it in order
    pub async fn feed_task(
        &self,
        task: EncryptableTask,
        is_background: bool,
        delayed_until: Option<DateTime<Utc>>,
        key: &[u8],
    ) -> Result<JobModel> {
        let sequence_id = self.sequence_id.fetch_add(1, Ordering::SeqCst);
        let props = JobProps {
            sequence_id,
            task,
            is_background,
            delayed_until,
            scheduled_at: Utc::now(),
            attempts: 0,
        };

        let job = JobModel::create(&props, key)?;
        self.cache.create_job(job.clone()).await?;
        self.pending.lock().await.insert(sequence_id, job.clone());

        log::debug!("queued job {} with sequence id {}", job.id(), sequence_id);
        Ok(job)
    }

    /// Stage persisted jobs (all of them, or one) for processing
    pub async fn load_tasks(&self, job: Option<JobModel>, key: &[u8]) -> Result<()> {
        let jobs = match job {
            Some(job) => vec![job],
            None => self.cache.fetch_jobs().await?,
        };

        let mut pending = self.pending.lock().await;
        for job in jobs {
            if let Some(props) = job.props(key) {
                pending.entry(props.sequence_id).or_insert(job);
            }
        }
        Ok(())
    }

    /// Ask the loop to stop between jobs; the in-flight job is not dropped
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The processing loop. Idempotent: concurrent calls start one loop.
    ///
    /// Jobs run strictly in sequence-id order. Successful and permanently
    /// failed jobs are deleted from the cache; transient failures leave the
    /// job persisted for a later `feed_task` / `load_tasks` to retry.
    pub async fn attempt_task_sequence<R, V>(&self, runner: &R, viable: V, key: &[u8])
    where
        R: TaskRunner,
        V: Fn() -> bool,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let mut reloaded = false;

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                log::debug!("job loop cancelled, draining");
                break;
            }

            let next = self.pending.lock().await.pop_first();
            let Some((sequence_id, job)) = next else {
                // Drained: one reload catches jobs persisted by a previous
                // process generation, then the loop exits
                if reloaded || !self.reload(key).await {
                    break;
                }
                reloaded = true;
                continue;
            };

            let Some(mut props) = job.props(key) else {
                // Undecodable props can never execute
                log::warn!("dropping job {} with unreadable props", job.id());
                let _ = self.cache.delete_job(job.id()).await;
                continue;
            };

            if let Some(delayed_until) = props.delayed_until {
                if delayed_until > Utc::now() {
                    self.pending.lock().await.insert(sequence_id, job);
                    break;
                }
            }

            if !viable() {
                let staged = self.pending.lock().await.len() + 1;
                log::debug!("session not viable, leaving {} jobs persisted", staged);
                self.pending.lock().await.insert(sequence_id, job);
                break;
            }

            props.attempts += 1;
            let _ = job.update_props(key, &props);

            match runner.run_task(&props.task).await {
                Ok(()) => {
                    if let Err(e) = self.cache.delete_job(job.id()).await {
                        log::warn!("completed job {} not deleted: {}", job.id(), e);
                    }
                }
                Err(e) if e.is_permanent() => {
                    log::warn!(
                        "job {} failed permanently ({}), deleting",
                        job.id(),
                        e
                    );
                    let _ = self.cache.delete_job(job.id()).await;
                }
                Err(e) => {
                    log::info!(
                        "job {} failed ({}), attempt {}, will retry",
                        job.id(),
                        e,
                        props.attempts
                    );
                    if self.pending.lock().await.is_empty() {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// Refill the staging map from the cache; true if anything was staged
    async fn reload(&self, key: &[u8]) -> bool {
        let jobs = match self.cache.fetch_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                log::warn!("job reload failed: {}", e);
                return false;
            }
        };
        if jobs.is_empty() {
            return false;
        }

        let mut pending = self.pending.lock().await;
        for job in jobs {
            if let Some(props) = job.props(key) {
                pending.entry(props.sequence_id).or_insert(job);
            }
        }
        !pending.is_empty()
    }
}
