//! Job executor: runs due jobs through registered handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobKind, JobResult, JobStatus};

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&Job) -> JobResult + Send + Sync>;

#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to poll for due jobs when the queue is idle
    pub poll_interval: Duration,
    /// Thread name, also used in log records
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "side-effect-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request shutdown and wait for the loop to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Counters for one executor run.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_dead_lettered: u64,
}

impl ExecutorStats {
    fn record(&mut self, status: &JobStatus) {
        self.jobs_processed += 1;
        match status {
            JobStatus::Completed => self.jobs_succeeded += 1,
            JobStatus::DeadLettered { .. } => self.jobs_dead_lettered += 1,
            JobStatus::Pending | JobStatus::Running => {}
        }
    }
}

/// Polls a job store for due jobs and executes them with registered handlers.
///
/// Handler failures never propagate: the job is dead-lettered and the executor
/// moves on.
pub struct JobExecutor<S: JobStore> {
    store: S,
    handlers: HashMap<String, JobHandler>,
}

impl<S: JobStore + 'static> JobExecutor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for an exact kind name, a `"category.*"` prefix or `"*"`.
    pub fn register_handler<F>(&mut self, kind_pattern: impl Into<String>, handler: F)
    where
        F: Fn(&Job) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(kind_pattern.into(), Box::new(handler));
    }

    fn get_handler(&self, kind: &JobKind) -> Option<&JobHandler> {
        let type_name = kind.type_name();
        if let Some(h) = self.handlers.get(type_name) {
            return Some(h);
        }

        let by_category = self.handlers.iter().find_map(|(pattern, handler)| {
            let prefix = pattern.strip_suffix(".*")?;
            type_name
                .strip_prefix(prefix)
                .filter(|rest| rest.starts_with('.'))
                .map(|_| handler)
        });

        by_category.or_else(|| self.handlers.get("*"))
    }

    /// Run every job that is due at `now` and return what happened.
    pub fn run_due(&self, now: DateTime<Utc>) -> Result<ExecutorStats, JobStoreError> {
        let mut stats = ExecutorStats::default();
        while let Some(mut job) = self.store.claim_next(now)? {
            self.execute(&mut job, now)?;
            stats.record(&job.status);
        }
        Ok(stats)
    }

    /// Execute one claimed job and persist its new status.
    pub fn execute(&self, job: &mut Job, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let outcome = match self.get_handler(&job.kind) {
            Some(handler) => handler(&*job),
            None => JobResult::Failure(format!("no handler for job kind: {}", job.kind.type_name())),
        };

        match outcome {
            JobResult::Success => {
                job.mark_completed(now);
                self.store.update(job)?;
                debug!(job_id = %job.id, kind = job.kind.type_name(), "job completed");
            }
            JobResult::Failure(error) => {
                job.mark_failed(error.clone(), now);
                warn!(job_id = %job.id, kind = job.kind.type_name(), error = %error, "job dead-lettered");
                self.store.dead_letter(job.clone(), error, now)?;
            }
        }
        Ok(())
    }

    /// Run the executor on a background thread until the handle is shut down.
    pub fn spawn(self, config: JobExecutorConfig) -> std::io::Result<JobExecutorHandle>
    where
        S: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || executor_loop(self, config, shutdown_rx, stats_clone))?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn executor_loop<S: JobStore + 'static>(
    executor: JobExecutor<S>,
    config: JobExecutorConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, "job executor started");
    let started = Instant::now();

    loop {
        match shutdown_rx.recv_timeout(Duration::ZERO) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        let now = Utc::now();
        match executor.store.claim_next(now) {
            Ok(Some(mut job)) => {
                debug!(executor = %config.name, job_id = %job.id, kind = job.kind.type_name(), "claimed job");
                if let Err(e) = executor.execute(&mut job, now) {
                    error!(executor = %config.name, job_id = %job.id, error = %e, "failed to record job outcome");
                }
                if let Ok(mut s) = stats.lock() {
                    s.record(&job.status);
                }
            }
            Ok(None) => thread::sleep(config.poll_interval),
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim job");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(
        executor = %config.name,
        uptime_secs = started.elapsed().as_secs(),
        "job executor stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;

    fn enqueue(store: &InMemoryJobStore, kind: JobKind, now: DateTime<Utc>) {
        store
            .enqueue(Job::new(kind, serde_json::json!({}), now))
            .unwrap();
    }

    #[test]
    fn runs_due_jobs_through_matching_handlers() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_handler("notification.*", |_job| JobResult::Success);

        let now = Utc::now();
        enqueue(&store, JobKind::notification("funding_succeeded"), now);
        enqueue(&store, JobKind::notification("project_refunded"), now);

        let stats = executor.run_due(now).unwrap();

        assert_eq!(stats.jobs_succeeded, 2);
        assert_eq!(store.stats().unwrap().completed, 2);
    }

    #[test]
    fn category_pattern_does_not_match_partial_words() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_handler("notif.*", |_job| JobResult::Success);

        let now = Utc::now();
        enqueue(&store, JobKind::notification("funding_succeeded"), now);

        let stats = executor.run_due(now).unwrap();
        assert_eq!(stats.jobs_dead_lettered, 1);
    }

    #[test]
    fn failing_handler_dead_letters_without_retry() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_handler("*", |_job| JobResult::Failure("mailer unavailable".to_string()));

        let now = Utc::now();
        enqueue(&store, JobKind::activity_log("funded"), now);

        let stats = executor.run_due(now).unwrap();

        assert_eq!(stats.jobs_dead_lettered, 1);
        let dls = store.list_dead_letters().unwrap();
        assert_eq!(dls[0].reason, "mailer unavailable");
    }

    #[test]
    fn exact_handler_wins_over_wildcard() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_handler("*", |_job| JobResult::Failure("wrong handler".to_string()));
        executor.register_handler("activity.funded", |_job| JobResult::Success);

        let now = Utc::now();
        enqueue(&store, JobKind::activity_log("funded"), now);

        assert_eq!(executor.run_due(now).unwrap().jobs_succeeded, 1);
    }

    #[test]
    fn spawned_executor_drains_the_queue() {
        let store = InMemoryJobStore::arc();
        let mut executor = JobExecutor::new(store.clone());
        executor.register_handler("*", |_job| JobResult::Success);
        enqueue(&store, JobKind::activity_log("funded"), Utc::now());

        let handle = executor
            .spawn(JobExecutorConfig::default().with_poll_interval(Duration::from_millis(5)))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_processed == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.stats().jobs_succeeded, 1);
        handle.shutdown();
    }
}
