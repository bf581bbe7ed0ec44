//! Durable task queue and its worker pool.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use mailforge_core::{Task, TaskId, TaskKind};

use super::executor::{self, TaskRunner};
use super::handler::TaskHandler;
use super::types::{QueueError, QueueStats, RetryPolicy, WorkerCounters};
use crate::config::QueueConfig;
use crate::store::TaskStore;

struct WorkerPool {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    workers: usize,
}

/// Task queue backed by a [`TaskStore`].
///
/// Enqueueing only writes a pending row; any process running workers against
/// the same store may pick it up.
pub struct TaskQueue<S> {
    store: Arc<S>,
    handler: Arc<dyn TaskHandler>,
    config: QueueConfig,
    retry: RetryPolicy,
    counters: Arc<WorkerCounters>,
    pool: Mutex<Option<WorkerPool>>,
}

impl<S: TaskStore + 'static> TaskQueue<S> {
    pub fn new(store: Arc<S>, handler: Arc<dyn TaskHandler>, config: QueueConfig) -> Self {
        Self {
            store,
            handler,
            retry: RetryPolicy::from_config(&config),
            config,
            counters: Arc::new(WorkerCounters::default()),
            pool: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Enqueue `kind` for immediate execution.
    pub async fn enqueue(&self, kind: TaskKind) -> Result<TaskId, QueueError> {
        self.insert(&kind, Utc::now(), self.config.default_max_retries)
            .await
    }

    /// Enqueue `kind` to become eligible after `delay`.
    pub async fn enqueue_delayed(
        &self,
        kind: TaskKind,
        delay: Duration,
    ) -> Result<TaskId, QueueError> {
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .ok_or(QueueError::InvalidDelay(delay))?;
        self.insert(&kind, at, self.config.default_max_retries)
            .await
    }

    /// Enqueue with an explicit retry budget instead of the configured default.
    pub async fn enqueue_with_retries(
        &self,
        kind: TaskKind,
        max_retries: u32,
    ) -> Result<TaskId, QueueError> {
        self.insert(&kind, Utc::now(), max_retries).await
    }

    #[instrument(skip(self, kind), fields(task_type = kind.type_name()), err)]
    async fn insert(
        &self,
        kind: &TaskKind,
        scheduled_at: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<TaskId, QueueError> {
        let task = Task::new(kind, max_retries, scheduled_at)?;
        let id = self.store.create_task(task).await?;
        info!(task_id = %id, scheduled_at = %scheduled_at, "task enqueued");
        Ok(id)
    }

    /// Spawn `num_workers` polling loops and the stale sweep.
    ///
    /// A no-op while the pool is already running. Must be called from within
    /// a Tokio runtime.
    pub fn start(&self, num_workers: usize) {
        let mut pool = self.lock_pool();
        if pool.is_some() {
            warn!("task queue already running");
            return;
        }

        let token = CancellationToken::new();
        let runner = TaskRunner {
            store: self.store.clone(),
            handler: self.handler.clone(),
            retry: self.retry,
            counters: self.counters.clone(),
        };

        let mut handles = Vec::with_capacity(num_workers + 1);
        for worker_id in 0..num_workers {
            handles.push(tokio::spawn(executor::worker_loop(
                runner.clone(),
                worker_id,
                self.config.poll_interval(),
                token.child_token(),
            )));
        }
        handles.push(tokio::spawn(executor::sweep_loop(
            self.store.clone(),
            self.counters.clone(),
            self.config.stale_after(),
            self.config.sweep_interval(),
            token.child_token(),
        )));

        info!(workers = num_workers, "task queue started");
        *pool = Some(WorkerPool {
            token,
            handles,
            workers: num_workers,
        });
    }

    pub fn is_running(&self) -> bool {
        self.lock_pool().is_some()
    }

    /// Signal every loop to stop and wait up to `timeout` for in-flight tasks.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), QueueError> {
        let Some(pool) = self.lock_pool().take() else {
            return Ok(());
        };

        info!(workers = pool.workers, "task queue shutting down");
        pool.token.cancel();

        match tokio::time::timeout(timeout, join_all(pool.handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "task worker terminated abnormally");
                    }
                }
                info!("task queue stopped");
                Ok(())
            }
            Err(_) => {
                error!(?timeout, "task workers did not stop in time");
                Err(QueueError::ShutdownTimeout(timeout))
            }
        }
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let counts = self.store.task_counts_by_status().await?;
        let (running, workers) = match self.lock_pool().as_ref() {
            Some(pool) => (true, pool.workers),
            None => (false, 0),
        };
        Ok(QueueStats::collect(counts, running, workers, &self.counters))
    }

    /// Delete completed and failed tasks older than `age`.
    pub async fn cleanup_older_than(&self, age: Duration) -> Result<u64, QueueError> {
        let cutoff = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or(QueueError::InvalidDelay(age))?;
        let removed = self.store.cleanup_tasks_older_than(cutoff).await?;
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "removed old tasks");
        }
        Ok(removed)
    }

    /// Claim and run a single task on the calling task, outside the pool.
    /// Returns whether anything was eligible.
    pub async fn process_next(&self) -> Result<bool, QueueError> {
        let runner = TaskRunner {
            store: self.store.clone(),
            handler: self.handler.clone(),
            retry: self.retry,
            counters: self.counters.clone(),
        };
        Ok(runner.run_next().await?)
    }

    /// Run one stale sweep immediately.
    pub async fn recover_stale(&self) -> Result<u64, QueueError> {
        let recovered = executor::recover_stale(self.store.as_ref(), self.config.stale_after()).await?;
        WorkerCounters::add(&self.counters.recovered, recovered);
        Ok(recovered)
    }

    fn lock_pool(&self) -> MutexGuard<'_, Option<WorkerPool>> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use mailforge_core::{
        AdminNotificationPayload, TaskStatus, UserId, UserNotificationPayload,
    };

    use super::*;
    use crate::jobs::TaskError;
    use crate::store::InMemoryStore;

    #[derive(Default)]
    struct Scripted {
        calls: AtomicU32,
        fail_first: u32,
        permanent: bool,
        panic: bool,
    }

    #[async_trait]
    impl TaskHandler for Scripted {
        async fn handle(&self, _task: &Task, _kind: TaskKind) -> Result<(), TaskError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("handler exploded");
            }
            if call < self.fail_first {
                return Err(if self.permanent {
                    TaskError::permanent("bad input")
                } else {
                    TaskError::transient("smtp unavailable")
                });
            }
            Ok(())
        }
    }

    fn config() -> QueueConfig {
        QueueConfig {
            base_retry_delay_ms: 0,
            poll_interval_ms: 10,
            ..QueueConfig::default()
        }
    }

    fn notification() -> TaskKind {
        TaskKind::CreateUserNotification(UserNotificationPayload {
            user_id: UserId::new(),
            title: "Import finished".into(),
            message: "120 contacts imported".into(),
            kind: "info".into(),
        })
    }

    fn queue(handler: Scripted) -> (Arc<InMemoryStore>, TaskQueue<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let queue = TaskQueue::new(store.clone(), Arc::new(handler), config());
        (store, queue)
    }

    #[tokio::test]
    async fn enqueued_task_is_completed() {
        let (store, queue) = queue(Scripted::default());
        let id = queue.enqueue(notification()).await.unwrap();

        assert!(queue.process_next().await.unwrap());
        assert!(!queue.process_next().await.unwrap());

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn delayed_task_is_not_claimed_early() {
        let (_store, queue) = queue(Scripted::default());
        queue
            .enqueue_delayed(notification(), Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(!queue.process_next().await.unwrap());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let (store, queue) = queue(Scripted {
            fail_first: 2,
            ..Scripted::default()
        });
        let id = queue.enqueue(notification()).await.unwrap();

        for _ in 0..3 {
            assert!(queue.process_next().await.unwrap());
        }

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 2);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.tasks_retried, 2);
        assert_eq!(stats.tasks_succeeded, 1);
    }

    #[tokio::test]
    async fn exhausting_retries_fails_the_task() {
        let (store, queue) = queue(Scripted {
            fail_first: u32::MAX,
            ..Scripted::default()
        });
        let id = queue.enqueue_with_retries(notification(), 2).await.unwrap();

        assert!(queue.process_next().await.unwrap());
        assert!(queue.process_next().await.unwrap());
        assert!(!queue.process_next().await.unwrap());

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        assert!(task.error_message.unwrap().contains("smtp unavailable"));
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let (store, queue) = queue(Scripted {
            fail_first: 1,
            permanent: true,
            ..Scripted::default()
        });
        let id = queue.enqueue(notification()).await.unwrap();

        assert!(queue.process_next().await.unwrap());
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let (store, queue) = queue(Scripted {
            panic: true,
            ..Scripted::default()
        });
        let id = queue.enqueue_with_retries(notification(), 1).await.unwrap();

        assert!(queue.process_next().await.unwrap());

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().contains("handler exploded"));
        assert_eq!(queue.stats().await.unwrap().tasks_panicked, 1);
    }

    #[tokio::test]
    async fn undecodable_payload_fails_without_retry() {
        let (store, queue) = queue(Scripted::default());
        let mut task = Task::new(&notification(), 5, Utc::now()).unwrap();
        task.task_type = "send_fax".into();
        let id = store.create_task(task).await.unwrap();

        assert!(queue.process_next().await.unwrap());

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert!(task.error_message.unwrap().starts_with("malformed task"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_pool_drains_queue_and_shuts_down() {
        let (store, queue) = queue(Scripted::default());
        for _ in 0..20 {
            queue
                .enqueue(TaskKind::SendAdminNotification(AdminNotificationPayload {
                    company_id: None,
                    title: "Bounce spike".into(),
                    message: "Bounce rate above 5%".into(),
                    kind: "warning".into(),
                }))
                .await
                .unwrap();
        }

        queue.start(4);
        queue.start(4);
        assert!(queue.is_running());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let counts = store.task_counts_by_status().await.unwrap();
            if counts.completed == 20 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "queue not drained: {counts:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        queue.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(!queue.is_running());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.tasks_processed, 20);
        assert_eq!(stats.workers, 0);
    }

    /// Counts how many times each task reaches the handler.
    #[derive(Default)]
    struct Recording {
        seen: Mutex<HashMap<TaskId, u32>>,
    }

    #[async_trait]
    impl TaskHandler for Recording {
        async fn handle(&self, task: &Task, _kind: TaskKind) -> Result<(), TaskError> {
            *self.seen.lock().unwrap().entry(task.id).or_default() += 1;
            tokio::task::yield_now().await;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_workers_handle_each_task_exactly_once() {
        let store = Arc::new(InMemoryStore::new());
        let handler = Arc::new(Recording::default());
        let queue = TaskQueue::new(store.clone(), handler.clone(), config());

        let mut ids = Vec::new();
        for _ in 0..60 {
            ids.push(queue.enqueue(notification()).await.unwrap());
        }
        queue.start(8);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let counts = store.task_counts_by_status().await.unwrap();
            if counts.completed == 60 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "queue not drained: {counts:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        queue.shutdown(Duration::from_secs(5)).await.unwrap();

        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), ids.len());
        for id in &ids {
            assert_eq!(seen.get(id), Some(&1), "task {id} handled {:?} times", seen.get(id));
            let task = store.get_task(*id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
        }
    }

    /// Simulates a sweep plus a second worker taking the task mid-run.
    struct Reclaimed {
        store: Arc<InMemoryStore>,
    }

    #[async_trait]
    impl TaskHandler for Reclaimed {
        async fn handle(&self, _task: &Task, _kind: TaskKind) -> Result<(), TaskError> {
            let later = Utc::now() + chrono::Duration::seconds(1);
            self.store.reset_stale_tasks(later).await.unwrap();
            self.store.claim_next_task(later).await.unwrap();
            Ok(())
        }
    }

    #[tokio::test]
    async fn outcome_of_a_reclaimed_task_is_discarded() {
        let store = Arc::new(InMemoryStore::new());
        let handler = Reclaimed {
            store: store.clone(),
        };
        let queue = TaskQueue::new(store.clone(), Arc::new(handler), config());
        let id = queue.enqueue(notification()).await.unwrap();

        assert!(queue.process_next().await.unwrap());

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.tasks_processed, 1);
        assert_eq!(stats.tasks_succeeded, 0);
    }

    #[tokio::test]
    async fn stale_task_is_recovered_and_rerun() {
        let (store, queue) = queue(Scripted::default());
        let id = queue.enqueue(notification()).await.unwrap();

        let claimed = store.claim_next_task(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        store.set_task_started_at(id, Utc::now() - chrono::Duration::hours(1));

        assert_eq!(queue.recover_stale().await.unwrap(), 1);
        assert_eq!(queue.recover_stale().await.unwrap(), 0);

        assert!(queue.process_next().await.unwrap());
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(queue.stats().await.unwrap().stale_recovered, 1);
    }
}
