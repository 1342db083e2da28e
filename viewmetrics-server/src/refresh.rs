//! Background refresh queue
//!
//! Jobs force-refresh a set of datasets outside the request path. Each job
//! gets a bounded number of attempts with a fixed delay between them; a job
//! that runs out of attempts is marked failed and published on the failure
//! channel so it is never dropped silently.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use viewmetrics_shared::{MetricsError, RefreshConfig, Result};

use crate::reconciler::FetchReconciler;

pub type JobId = u64;

/// Why a refresh job was queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTrigger {
    Scheduled,
    /// A request found none of its datasets in the cache
    DegradedCache,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running { attempt: u32 },
    Succeeded { attempts: u32, written: usize },
    Failed { attempts: u32, error: String },
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. } | JobStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshJob {
    pub id: JobId,
    pub dataset_ids: Vec<String>,
    pub trigger: RefreshTrigger,
}

/// Published when a job exhausts its attempts
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub job: RefreshJob,
    pub attempts: u32,
    pub last_error: String,
}

/// Statistics for refresh monitoring
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshStats {
    /// Jobs accepted onto the queue
    pub enqueued: u64,
    /// Enqueue calls folded into an identical pending job
    pub coalesced: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Attempts beyond the first
    pub retries: u64,
}

/// Fixed-delay retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RefreshConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_secs(config.retry_delay_secs),
        }
    }

    /// Run `op` until it succeeds or the attempts are used up
    ///
    /// `op` receives the 1-based attempt number. Exhaustion yields
    /// `MetricsError::TaskExhausted` carrying the last error.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(MetricsError::TaskExhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        retry_in_secs = self.delay.as_secs(),
                        error = %e,
                        "Refresh attempt failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Finished job statuses kept for `status` and `wait`
const FINISHED_HISTORY: usize = 256;

/// Job statuses, forgetting the oldest finished jobs past a bound
#[derive(Default)]
struct StatusRegistry {
    statuses: HashMap<JobId, JobStatus>,
    finished: VecDeque<JobId>,
}

struct QueueState {
    statuses: RwLock<StatusRegistry>,
    /// Sorted id set -> job that is queued or running for it
    pending: Mutex<HashMap<Vec<String>, JobId>>,
    stats: RwLock<RefreshStats>,
    next_id: AtomicU64,
    finished: Notify,
    history: usize,
}

impl QueueState {
    fn new(history: usize) -> Self {
        Self {
            statuses: RwLock::new(StatusRegistry::default()),
            pending: Mutex::new(HashMap::new()),
            stats: RwLock::new(RefreshStats::default()),
            next_id: AtomicU64::new(0),
            finished: Notify::new(),
            history,
        }
    }

    async fn set_status(&self, job_id: JobId, status: JobStatus) {
        let finished = status.is_finished();
        {
            let mut registry = self.statuses.write().await;
            registry.statuses.insert(job_id, status);
            if finished {
                registry.finished.push_back(job_id);
                while registry.finished.len() > self.history {
                    if let Some(oldest) = registry.finished.pop_front() {
                        registry.statuses.remove(&oldest);
                    }
                }
            }
        }
        if finished {
            self.finished.notify_waiters();
        }
    }

    async fn status(&self, job_id: JobId) -> Option<JobStatus> {
        self.statuses.read().await.statuses.get(&job_id).cloned()
    }
}

fn coalescing_key(dataset_ids: &[String]) -> Vec<String> {
    let mut key = dataset_ids.to_vec();
    key.sort();
    key.dedup();
    key
}

/// Cloneable handle that puts jobs on the queue
#[derive(Clone)]
struct Enqueuer {
    sender: mpsc::UnboundedSender<RefreshJob>,
    state: Arc<QueueState>,
}

impl Enqueuer {
    async fn enqueue(&self, dataset_ids: Vec<String>, trigger: RefreshTrigger) -> Option<JobId> {
        let key = coalescing_key(&dataset_ids);
        let mut pending = self.state.pending.lock().await;

        if let Some(&existing) = pending.get(&key) {
            self.state.stats.write().await.coalesced += 1;
            debug!(job_id = existing, ?trigger, "Refresh already pending, coalesced");
            return Some(existing);
        }

        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let job = RefreshJob {
            id,
            dataset_ids,
            trigger,
        };

        self.state.set_status(id, JobStatus::Queued).await;
        if self.sender.send(job).is_err() {
            warn!(job_id = id, "Refresh queue is closed, job dropped");
            self.state.statuses.write().await.statuses.remove(&id);
            return None;
        }

        pending.insert(key, id);
        self.state.stats.write().await.enqueued += 1;
        info!(job_id = id, ?trigger, "Refresh job queued");
        Some(id)
    }
}

pub struct RefreshQueue {
    enqueuer: Enqueuer,
    failures: broadcast::Sender<JobFailure>,
    worker: JoinHandle<()>,
    scheduler: Option<JoinHandle<()>>,
}

impl RefreshQueue {
    /// Start the queue and its worker
    pub fn start(reconciler: FetchReconciler, policy: RetryPolicy) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (failures, _) = broadcast::channel(64);
        let state = Arc::new(QueueState::new(FINISHED_HISTORY));

        let worker = tokio::spawn(run_worker(
            receiver,
            reconciler,
            policy,
            state.clone(),
            failures.clone(),
        ));

        Self {
            enqueuer: Enqueuer { sender, state },
            failures,
            worker,
            scheduler: None,
        }
    }

    /// Queue a refresh of `dataset_ids`
    ///
    /// Returns the id of the pending job when an identical one is already
    /// queued or running, and `None` once the queue has shut down.
    pub async fn enqueue(
        &self,
        dataset_ids: Vec<String>,
        trigger: RefreshTrigger,
    ) -> Option<JobId> {
        self.enqueuer.enqueue(dataset_ids, trigger).await
    }

    /// Status of a queued, running or recently finished job
    ///
    /// Only the latest finished jobs are remembered; older ones return `None`.
    pub async fn status(&self, job_id: JobId) -> Option<JobStatus> {
        self.enqueuer.state.status(job_id).await
    }

    /// Wait until a job succeeds or fails
    pub async fn wait(&self, job_id: JobId) -> Option<JobStatus> {
        loop {
            let notified = self.enqueuer.state.finished.notified();
            match self.status(job_id).await {
                Some(status) if status.is_finished() => return Some(status),
                Some(_) => notified.await,
                None => return None,
            }
        }
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<JobFailure> {
        self.failures.subscribe()
    }

    pub async fn stats(&self) -> RefreshStats {
        self.enqueuer.state.stats.read().await.clone()
    }

    /// Enqueue a refresh of `dataset_ids` every `interval`, starting now
    pub fn start_scheduler(&mut self, dataset_ids: Vec<String>, interval: Duration) {
        if let Some(previous) = self.scheduler.take() {
            previous.abort();
        }

        let enqueuer = self.enqueuer.clone();
        info!(
            interval_secs = interval.as_secs(),
            views = dataset_ids.len(),
            "Refresh scheduler started"
        );
        self.scheduler = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if enqueuer
                    .enqueue(dataset_ids.clone(), RefreshTrigger::Scheduled)
                    .await
                    .is_none()
                {
                    break;
                }
            }
        }));
    }

    /// Stop scheduling, let queued jobs finish, then stop the worker
    pub async fn shutdown(self) {
        if let Some(scheduler) = self.scheduler {
            scheduler.abort();
            let _ = scheduler.await;
        }
        drop(self.enqueuer);
        if let Err(e) = self.worker.await {
            error!(error = %e, "Refresh worker terminated abnormally");
        }
        info!("Refresh queue stopped");
    }

    /// Stop immediately, abandoning queued and running jobs
    pub async fn abort(self) {
        if let Some(scheduler) = self.scheduler {
            scheduler.abort();
        }
        let pending = self.enqueuer.state.pending.lock().await.len();
        self.worker.abort();
        let _ = self.worker.await;
        if pending > 0 {
            warn!(pending, "Refresh queue aborted with jobs outstanding");
        } else {
            debug!("Refresh queue aborted");
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<RefreshJob>,
    reconciler: FetchReconciler,
    policy: RetryPolicy,
    state: Arc<QueueState>,
    failures: broadcast::Sender<JobFailure>,
) {
    debug!("Refresh worker started");
    while let Some(job) = receiver.recv().await {
        process_job(&job, &reconciler, &policy, &state, &failures).await;
    }
    debug!("Refresh worker drained");
}

async fn process_job(
    job: &RefreshJob,
    reconciler: &FetchReconciler,
    policy: &RetryPolicy,
    state: &QueueState,
    failures: &broadcast::Sender<JobFailure>,
) {
    info!(
        job_id = job.id,
        trigger = ?job.trigger,
        views = job.dataset_ids.len(),
        "Refresh job started"
    );

    let mut attempts = 0;
    let result = policy
        .run(|attempt| {
            attempts = attempt;
            async move {
                state.set_status(job.id, JobStatus::Running { attempt }).await;
                if attempt > 1 {
                    state.stats.write().await.retries += 1;
                }
                reconciler.refresh_all(&job.dataset_ids).await
            }
        })
        .await;

    // Later enqueues of the same ids must start a new job from here on
    state
        .pending
        .lock()
        .await
        .remove(&coalescing_key(&job.dataset_ids));

    match result {
        Ok(written) => {
            state.stats.write().await.succeeded += 1;
            state
                .set_status(job.id, JobStatus::Succeeded { attempts, written })
                .await;
            info!(job_id = job.id, attempts, written, "Data fetched and cached");
        }
        Err(e) => {
            let last_error = match &e {
                MetricsError::TaskExhausted { last_error, .. } => last_error.clone(),
                other => other.to_string(),
            };
            state.stats.write().await.failed += 1;
            state
                .set_status(
                    job.id,
                    JobStatus::Failed {
                        attempts,
                        error: e.to_string(),
                    },
                )
                .await;
            error!(
                job_id = job.id,
                trigger = ?job.trigger,
                dataset_ids = ?job.dataset_ids,
                attempts,
                error = %last_error,
                "Refresh job failed after exhausting retries"
            );
            // no subscribers is fine; the status registry still records it
            let _ = failures.send(JobFailure {
                job: job.clone(),
                attempts,
                last_error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DatasetCache, MemoryCache};
    use crate::workers::WorkerPool;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tokio::time::Instant;
    use viewmetrics_shared::{Dataset, FetchError};
    use viewmetrics_source::ViewSource;

    /// Fails the first `failures` calls, then succeeds
    struct FlakySource {
        failures: usize,
        calls: AtomicUsize,
        call_times: StdMutex<Vec<Instant>>,
    }

    impl FlakySource {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
                call_times: StdMutex::new(Vec::new()),
            })
        }

        fn call_times(&self) -> Vec<Instant> {
            self.call_times.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ViewSource for FlakySource {
        async fn fetch_view(&self, view_id: &str) -> std::result::Result<Dataset, FetchError> {
            self.call_times.lock().unwrap().push(Instant::now());
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(FetchError::new(view_id, "connection reset"));
            }
            Ok(Dataset::from_records_value(&json!([{"category": "filter1"}])).unwrap())
        }

        fn source_name(&self) -> &'static str {
            "flaky"
        }
    }

    fn reconciler(source: Arc<FlakySource>) -> FetchReconciler {
        FetchReconciler::new(
            source,
            DatasetCache::new(Arc::new(MemoryCache::new())),
            "test",
            Duration::from_secs(3600),
            WorkerPool::new("fetch", 2),
        )
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::from_config(&RefreshConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_exactly_three_attempts() {
        let source = FlakySource::new(usize::MAX);
        let queue = RefreshQueue::start(reconciler(source.clone()), policy());
        let mut failures = queue.subscribe_failures();

        let job_id = queue
            .enqueue(vec!["v1".to_string()], RefreshTrigger::Manual)
            .await
            .unwrap();
        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.job.id, job_id);
        assert_eq!(failure.attempts, 3);
        assert!(failure.last_error.contains("connection reset"));

        let times = source.call_times();
        assert_eq!(times.len(), 3);
        for pair in times.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_secs(60) && gap < Duration::from_secs(61));
        }

        // no fourth attempt, however long we wait
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);

        match queue.status(job_id).await.unwrap() {
            JobStatus::Failed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected status: {other:?}"),
        }
        let stats = queue.stats().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retries, 2);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_second_attempt() {
        let source = FlakySource::new(1);
        let reconciler = reconciler(source.clone());
        let cache = reconciler.cache().clone();
        let queue = RefreshQueue::start(reconciler, policy());

        let job_id = queue
            .enqueue(vec!["v1".to_string()], RefreshTrigger::DegradedCache)
            .await
            .unwrap();
        let status = queue.wait(job_id).await.unwrap();
        assert_eq!(
            status,
            JobStatus::Succeeded {
                attempts: 2,
                written: 1
            }
        );
        assert!(cache.get("test", "v1").await.is_some());
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_pending_jobs_coalesce() {
        let source = FlakySource::new(usize::MAX);
        let queue = RefreshQueue::start(reconciler(source), policy());

        let ids = vec!["v2".to_string(), "v1".to_string()];
        let first = queue.enqueue(ids.clone(), RefreshTrigger::DegradedCache).await;
        let second = queue
            .enqueue(vec!["v1".to_string(), "v2".to_string()], RefreshTrigger::DegradedCache)
            .await;
        assert_eq!(first, second);

        let stats = queue.stats().await;
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.coalesced, 1);

        // once finished, the same ids queue a new job
        queue.wait(first.unwrap()).await;
        let third = queue.enqueue(ids, RefreshTrigger::Manual).await;
        assert_ne!(third, first);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_enqueues_on_interval() {
        let source = FlakySource::new(0);
        let mut queue = RefreshQueue::start(reconciler(source.clone()), policy());

        queue.start_scheduler(vec!["v1".to_string()], Duration::from_secs(300));
        tokio::time::sleep(Duration::from_secs(650)).await;

        // ticks at 0s, 300s and 600s
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_finished_statuses_are_bounded() {
        let state = QueueState::new(2);
        for id in 1..=4 {
            state.set_status(id, JobStatus::Queued).await;
        }
        for id in 1..=3 {
            state
                .set_status(id, JobStatus::Succeeded { attempts: 1, written: 1 })
                .await;
        }

        // the oldest finished job is forgotten, unfinished ones are kept
        assert_eq!(state.status(1).await, None);
        assert!(state.status(2).await.is_some());
        assert!(state.status(3).await.is_some());
        assert_eq!(state.status(4).await, Some(JobStatus::Queued));
        assert_eq!(state.statuses.read().await.statuses.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_counts_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_secs(5),
        };
        let started = Instant::now();
        let mut seen = Vec::new();
        let err = policy
            .run(|attempt| {
                seen.push(attempt);
                async { Err::<(), _>(MetricsError::Config("boom".to_string())) }
            })
            .await
            .unwrap_err();

        assert_eq!(seen, vec![1, 2]);
        assert!(matches!(err, MetricsError::TaskExhausted { attempts: 2, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }
}
