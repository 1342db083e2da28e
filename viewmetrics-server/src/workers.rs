//! Bounded fan-out/fan-in over keyed work items
//!
//! Every item carries its id into the task and comes back tagged with it, so
//! callers reassemble results by id. A task that panics becomes a
//! [`TaskFailure`] for its own id; sibling tasks keep running.

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error("worker pool closed")]
    PoolClosed,
}

impl From<JoinError> for TaskFailure {
    fn from(err: JoinError) -> Self {
        if err.is_cancelled() {
            return TaskFailure::Cancelled;
        }
        let payload = err.into_panic();
        let reason = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        TaskFailure::Panicked(reason)
    }
}

pub type Keyed<T> = Vec<(String, Result<T, TaskFailure>)>;

/// Worker pool that caps how many tasks run at once
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl WorkerPool {
    pub fn new(name: &'static str, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            name,
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run async work for every item, at most `limit` at a time
    ///
    /// Results come back in submission order, each tagged with its id.
    pub async fn run_keyed<I, T, F, Fut>(&self, items: Vec<(String, I)>, f: F) -> Keyed<T>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(String, I) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        debug!(pool = self.name, tasks = items.len(), limit = self.limit, "Dispatching tasks");

        let mut handles = Vec::with_capacity(items.len());
        for (id, input) in items {
            let permits = self.permits.clone();
            let work = f(id.clone(), input);
            let handle = tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| TaskFailure::PoolClosed)?;
                Ok::<T, TaskFailure>(work.await)
            });
            handles.push((id, handle));
        }

        self.collect(handles).await
    }

    /// Run CPU-bound work on the blocking thread pool, at most `limit` at a time
    pub async fn run_blocking_keyed<I, T, F>(&self, items: Vec<(String, I)>, f: F) -> Keyed<T>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(&str, I) -> T + Send + Sync + 'static,
    {
        debug!(pool = self.name, tasks = items.len(), limit = self.limit, "Dispatching blocking tasks");

        let f = Arc::new(f);
        let mut handles = Vec::with_capacity(items.len());
        for (id, input) in items {
            let permits = self.permits.clone();
            let f = f.clone();
            let task_id = id.clone();
            let handle = tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| TaskFailure::PoolClosed)?;
                tokio::task::spawn_blocking(move || f(&task_id, input))
                    .await
                    .map_err(TaskFailure::from)
            });
            handles.push((id, handle));
        }

        self.collect(handles).await
    }

    async fn collect<T>(
        &self,
        handles: Vec<(String, tokio::task::JoinHandle<Result<T, TaskFailure>>)>,
    ) -> Keyed<T> {
        let mut results = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(TaskFailure::from(e)),
            };
            if let Err(failure) = &outcome {
                warn!(pool = self.name, id = %id, error = %failure, "Task failed");
            }
            results.push((id, outcome));
        }
        results
    }
}
