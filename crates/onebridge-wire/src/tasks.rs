//! Registry of background tasks owned by one adapter instance.
//!
//! Every task the bridge spawns (transport accept/read loops, delayed
//! recalls) is registered here under a name. Shutdown cancels the whole set
//! in one pass instead of hunting for tasks by type or name.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct OwnedTask {
    name: String,
    handle: JoinHandle<()>,
}

/// Outcome of [`TaskSet::cancel_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelReport {
    /// Tasks that were still running and got cancelled.
    pub cancelled: usize,
    /// Tasks that did not acknowledge cancellation before the deadline.
    pub timed_out: Vec<String>,
}

#[derive(Default)]
struct Registry {
    tasks: Vec<OwnedTask>,
    /// Set by `cancel_all`, under the same lock as `tasks`.
    closed: bool,
}

/// Shareable set of named background tasks.
#[derive(Clone, Default)]
pub struct TaskSet {
    registry: Arc<Mutex<Registry>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn and register a task. After [`cancel_all`](Self::cancel_all) the
    /// set is closed and new tasks are dropped without running.
    pub fn spawn<F>(&self, name: impl Into<String>, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut registry = self.lock();
        if registry.closed {
            debug!(task = %name, "Task set closed, not spawning");
            return false;
        }
        registry.tasks.retain(|t| !t.handle.is_finished());
        let handle = tokio::spawn(fut);
        registry.tasks.push(OwnedTask { name, handle });
        true
    }

    /// Number of registered tasks that have not finished.
    pub fn active(&self) -> usize {
        self.lock()
            .tasks
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close the set, abort every task and wait up to `timeout` for them to
    /// wind down. Calling it again is a no-op.
    pub async fn cancel_all(&self, timeout: Duration) -> CancelReport {
        let tasks: Vec<OwnedTask> = {
            let mut registry = self.lock();
            registry.closed = true;
            registry.tasks.drain(..).collect()
        };

        let mut report = CancelReport::default();
        let deadline = tokio::time::Instant::now() + timeout;
        for task in &tasks {
            if !task.handle.is_finished() {
                task.handle.abort();
                report.cancelled += 1;
            }
        }
        for task in tasks {
            if tokio::time::timeout_at(deadline, task.handle).await.is_err() {
                warn!(task = %task.name, "Task did not stop before the cancel deadline");
                report.timed_out.push(task.name);
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_all_aborts_sleeping_tasks() {
        let set = TaskSet::new();
        set.spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(set.active(), 1);

        let report = set.cancel_all(Duration::from_secs(1)).await;
        assert_eq!(report.cancelled, 1);
        assert!(report.timed_out.is_empty());
        assert_eq!(set.active(), 0);
    }

    #[tokio::test]
    async fn test_spawn_after_close_is_refused() {
        let set = TaskSet::new();
        set.cancel_all(Duration::from_millis(10)).await;
        assert!(set.is_closed());
        assert!(!set.spawn("late", async {}));
        assert_eq!(set.active(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_is_idempotent() {
        let set = TaskSet::new();
        set.spawn("quick", async {});
        tokio::task::yield_now().await;
        let first = set.cancel_all(Duration::from_millis(50)).await;
        let second = set.cancel_all(Duration::from_millis(50)).await;
        assert!(first.timed_out.is_empty());
        assert_eq!(second, CancelReport::default());
    }

    #[tokio::test]
    async fn test_clones_share_tasks() {
        let set = TaskSet::new();
        let other = set.clone();
        other.spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(set.active(), 1);
        set.cancel_all(Duration::from_secs(1)).await;
        assert!(other.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_spawn_racing_cancel_never_escapes() {
        let set = TaskSet::new();
        let mut spawners = Vec::new();
        for _ in 0..4 {
            let set = set.clone();
            spawners.push(tokio::spawn(async move {
                let mut accepted = 0usize;
                while accepted < 5_000 && set.spawn("racer", std::future::pending::<()>()) {
                    accepted += 1;
                    tokio::task::yield_now().await;
                }
                accepted
            }));
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = set.cancel_all(Duration::from_secs(5)).await;

        let mut accepted = 0;
        for spawner in spawners {
            accepted += spawner.await.unwrap();
        }
        // Every accepted task was registered before the drain and got aborted.
        assert_eq!(report.cancelled, accepted);
        assert_eq!(set.active(), 0);
        assert!(!set.spawn("late", async {}));
    }
}
