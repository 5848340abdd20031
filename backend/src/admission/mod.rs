//! Capacity-driven admission of batch tasks.
//!
//! On every tick, for every configured kind, the controller reads the oldest
//! waiting tasks and dispatches as many as there is capacity for, where
//! capacity is the smaller of idle endpoints and idle worker slots.

mod executor;
mod repository;

use std::sync::Arc;
use std::time::Duration;

use bigmodel_common::Task;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::AdmissionConfig;
use crate::error::Result;
use crate::pool::{EndpointPools, WorkerPool};

pub use executor::{InferenceTaskExecutor, TaskExecutor};
pub use repository::{InMemoryTaskRepository, RepositoryError, TaskRepository};

/// Settings of an [`AdmissionController`].
#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    pub tick_interval: Duration,
    /// Tasks younger than this are left for a later tick.
    pub window: Duration,
    pub batch_limit: usize,
    pub kinds: Vec<String>,
}

impl From<&AdmissionConfig> for AdmissionSettings {
    fn from(cfg: &AdmissionConfig) -> Self {
        Self {
            tick_interval: Duration::from_secs(cfg.tick_interval_secs.max(1)),
            window: Duration::from_secs(cfg.window_secs),
            batch_limit: cfg.batch_limit,
            kinds: cfg.kinds.clone(),
        }
    }
}

/// Idle capacity observed at the start of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacitySnapshot {
    pub idle_endpoints: usize,
    pub idle_workers: usize,
}

impl CapacitySnapshot {
    /// Tasks that can be dispatched right now.
    pub fn capacity(&self) -> usize {
        self.idle_endpoints.min(self.idle_workers)
    }
}

/// Keep the oldest `capacity` tasks.
///
/// `tasks` must already be ordered oldest first.
pub fn select_for_dispatch(mut tasks: Vec<Task>, capacity: usize) -> Vec<Task> {
    tasks.truncate(capacity);
    tasks
}

/// Periodically moves waiting tasks onto the worker pool.
pub struct AdmissionController {
    repo: Arc<dyn TaskRepository>,
    pools: Arc<EndpointPools>,
    workers: Arc<WorkerPool>,
    executor: Arc<dyn TaskExecutor>,
    settings: AdmissionSettings,
}

impl AdmissionController {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        pools: Arc<EndpointPools>,
        workers: Arc<WorkerPool>,
        executor: Arc<dyn TaskExecutor>,
        settings: AdmissionSettings,
    ) -> Self {
        Self {
            repo,
            pools,
            workers,
            executor,
            settings,
        }
    }

    pub fn capacity(&self, kind: &str) -> Result<CapacitySnapshot> {
        Ok(CapacitySnapshot {
            idle_endpoints: self.pools.idle_count(kind)?,
            idle_workers: self.workers.idle_slots(),
        })
    }

    /// Run one admission pass for `kind`. Returns the number of tasks dispatched.
    pub async fn tick(&self, kind: &str) -> Result<usize> {
        let snapshot = self.capacity(kind)?;
        let capacity = snapshot.capacity();
        if capacity == 0 {
            tracing::debug!(
                "No capacity for {} (idle endpoints {}, idle workers {})",
                kind,
                snapshot.idle_endpoints,
                snapshot.idle_workers
            );
            return Ok(0);
        }

        let watermark = Utc::now()
            - chrono::Duration::from_std(self.settings.window).unwrap_or_else(|_| chrono::Duration::zero());
        let tasks = self
            .repo
            .get_waiting_tasks(kind, watermark, self.settings.batch_limit)
            .await?;
        if tasks.is_empty() {
            return Ok(0);
        }

        let waiting = tasks.len();
        let selected = select_for_dispatch(tasks, capacity);
        let mut dispatched = 0;

        for task in selected {
            if !self.repo.mark_running(task.id).await? {
                tracing::debug!("Task {} was claimed elsewhere", task.id);
                continue;
            }

            let id = task.id;
            let repo = self.repo.clone();
            let executor = self.executor.clone();
            let submitted = self.workers.submit(async move {
                let outcome = executor.execute(&task).await;
                let status = outcome.status();
                if let Err(e) = repo.complete(task.id, outcome).await {
                    tracing::error!("Failed to record outcome of task {}: {}", task.id, e);
                } else {
                    tracing::info!("Task {} ({}) {}", task.id, task.kind, status);
                }
            });

            match submitted {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    tracing::warn!("Task {} not dispatched: {}", id, e);
                    self.repo.reset_waiting(id).await?;
                }
            }
        }

        tracing::info!(
            "Dispatched {} of {} waiting {} task(s) (capacity {})",
            dispatched,
            waiting,
            kind,
            capacity
        );
        Ok(dispatched)
    }

    /// Tick every configured kind on a fixed interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Admission controller started for {:?} every {:?}",
            self.settings.kinds,
            self.settings.tick_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            for kind in &self.settings.kinds {
                let controller = self.clone();
                let kind = kind.clone();
                tokio::spawn(async move {
                    if let Err(e) = controller.tick(&kind).await {
                        tracing::warn!("Admission tick for {} failed: {}", kind, e);
                    }
                });
            }
        }

        tracing::info!("Admission controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Endpoint, EndpointPool};
    use bigmodel_common::{TaskOutcome, TaskStatus};
    use serde_json::json;

    struct FixedOutcome(TaskOutcome);

    #[async_trait::async_trait]
    impl TaskExecutor for FixedOutcome {
        async fn execute(&self, _task: &Task) -> TaskOutcome {
            self.0.clone()
        }
    }

    fn pools_with(kind: &str, endpoints: usize) -> Arc<EndpointPools> {
        let mut pools = EndpointPools::new();
        pools.insert(EndpointPool::new(
            kind,
            (0..endpoints)
                .map(|i| Endpoint::new(format!("http://{}-{}", kind, i)))
                .collect(),
        ));
        Arc::new(pools)
    }

    fn settings(kind: &str) -> AdmissionSettings {
        AdmissionSettings {
            tick_interval: Duration::from_millis(10),
            window: Duration::ZERO,
            batch_limit: 8,
            kinds: vec![kind.to_string()],
        }
    }

    async fn seed(repo: &InMemoryTaskRepository, kind: &str, count: usize) -> Vec<Task> {
        let mut tasks = Vec::new();
        for i in 0..count {
            let task = Task::new(kind, format!("user{}", i), json!({"n": i}))
                .with_created_at(Utc::now() - chrono::Duration::seconds(100 - i as i64));
            repo.insert(task.clone()).await.unwrap();
            tasks.push(task);
        }
        tasks
    }

    #[test]
    fn test_select_keeps_oldest() {
        let tasks: Vec<Task> = (0..5).map(|i| Task::new("wukong", format!("u{}", i), json!({}))).collect();
        let ids: Vec<_> = tasks.iter().map(|t| t.id).collect();

        let selected = select_for_dispatch(tasks, 2);
        assert_eq!(selected.iter().map(|t| t.id).collect::<Vec<_>>(), ids[..2].to_vec());
    }

    #[test]
    fn test_capacity_is_minimum() {
        let snapshot = CapacitySnapshot {
            idle_endpoints: 2,
            idle_workers: 3,
        };
        assert_eq!(snapshot.capacity(), 2);
    }

    #[tokio::test]
    async fn test_two_oldest_dispatched() {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let tasks = seed(&repo, "wukong", 5).await;

        let pools = pools_with("wukong", 2);
        let workers = Arc::new(WorkerPool::new(3));
        let controller = AdmissionController::new(
            repo.clone(),
            pools,
            workers.clone(),
            Arc::new(FixedOutcome(TaskOutcome::Finished(json!({"ok": true})))),
            settings("wukong"),
        );

        assert_eq!(controller.tick("wukong").await.unwrap(), 2);
        workers.shutdown().await;

        for task in &tasks[..2] {
            assert_eq!(repo.get(task.id).await.unwrap().status, TaskStatus::Finished);
        }
        for task in &tasks[2..] {
            assert!(repo.get(task.id).await.unwrap().is_waiting());
        }
    }

    #[tokio::test]
    async fn test_no_capacity_dispatches_nothing() {
        let repo = Arc::new(InMemoryTaskRepository::new());
        seed(&repo, "wukong", 3).await;

        let pools = pools_with("wukong", 1);
        let _lease = pools.get("wukong").unwrap().try_acquire().unwrap();
        let controller = AdmissionController::new(
            repo.clone(),
            pools.clone(),
            Arc::new(WorkerPool::new(3)),
            Arc::new(FixedOutcome(TaskOutcome::Finished(json!({})))),
            settings("wukong"),
        );

        assert_eq!(controller.tick("wukong").await.unwrap(), 0);
        assert_eq!(
            repo.get_waiting_tasks("wukong", Utc::now(), 8).await.unwrap().len(),
            3
        );
    }

    #[tokio::test]
    async fn test_window_holds_back_young_tasks() {
        let repo = Arc::new(InMemoryTaskRepository::new());
        repo.insert(Task::new("wukong", "a", json!({}))).await.unwrap();

        let mut settings = settings("wukong");
        settings.window = Duration::from_secs(60);
        let controller = AdmissionController::new(
            repo.clone(),
            pools_with("wukong", 2),
            Arc::new(WorkerPool::new(2)),
            Arc::new(FixedOutcome(TaskOutcome::Finished(json!({})))),
            settings,
        );

        assert_eq!(controller.tick("wukong").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_error() {
        let controller = AdmissionController::new(
            Arc::new(InMemoryTaskRepository::new()),
            pools_with("wukong", 1),
            Arc::new(WorkerPool::new(1)),
            Arc::new(FixedOutcome(TaskOutcome::Finished(json!({})))),
            settings("glm2"),
        );

        assert!(controller.tick("glm2").await.is_err());
    }

    #[tokio::test]
    async fn test_closed_worker_pool_puts_tasks_back() {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let tasks = seed(&repo, "wukong", 2).await;

        let workers = Arc::new(WorkerPool::new(2));
        let controller = AdmissionController::new(
            repo.clone(),
            pools_with("wukong", 2),
            workers.clone(),
            Arc::new(FixedOutcome(TaskOutcome::Finished(json!({})))),
            settings("wukong"),
        );

        workers.shutdown().await;
        assert_eq!(controller.capacity("wukong").unwrap().capacity(), 2);
        assert_eq!(controller.tick("wukong").await.unwrap(), 0);
        for task in &tasks {
            assert!(repo.get(task.id).await.unwrap().is_waiting());
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let tasks = seed(&repo, "wukong", 1).await;
        let workers = Arc::new(WorkerPool::new(1));
        let controller = Arc::new(AdmissionController::new(
            repo.clone(),
            pools_with("wukong", 1),
            workers.clone(),
            Arc::new(FixedOutcome(TaskOutcome::Failed("boom".to_string()))),
            settings("wukong"),
        ));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(controller.run(shutdown.clone()));

        let mut status = TaskStatus::Waiting;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = repo.get(tasks[0].id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
        }

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(status, TaskStatus::Error);
    }
}
