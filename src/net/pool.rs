//! Shared I/O worker pool.
//!
//! # Responsibilities
//! - Run accepts and per-connection work on one tokio runtime
//! - Track every spawned task so shutdown can wait for it
//! - Abort outstanding tasks when a graceful drain runs out of time
//!
//! # Design Decisions
//! - Cheap to clone; the server and its controller share one pool
//! - Counting is done by a guard owned by the task, so aborted and
//!   panicking tasks are still accounted for

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};

/// Handle to the I/O pool.
#[derive(Clone)]
pub struct IoPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    handle: Handle,
    active: AtomicUsize,
    idle: Notify,
    tasks: Mutex<JoinSet<()>>,
}

impl IoPool {
    /// Create a pool that spawns onto the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                handle,
                active: AtomicUsize::new(0),
                idle: Notify::new(),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Create a pool on the runtime the caller is running in.
    ///
    /// # Panics
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// The runtime this pool spawns onto.
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Spawn a tracked task.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let guard = TaskGuard {
            inner: Arc::clone(&self.inner),
        };

        let mut tasks = self.inner.tasks.lock();
        // Reap finished tasks so the set only holds live ones.
        while let Some(result) = tasks.try_join_next() {
            log_join_result(result);
        }
        tasks.spawn_on(
            async move {
                let _guard = guard;
                future.await;
            },
            &self.inner.handle,
        );
    }

    /// Number of tracked tasks that have not finished.
    pub fn active_tasks(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until every tracked task has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.active_tasks() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait up to `timeout` for the pool to go idle. Returns whether it did.
    pub async fn drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_idle()).await.is_ok()
    }

    /// Abort every outstanding task. Their sockets are dropped with them.
    pub fn abort_all(&self) {
        let mut tasks = self.inner.tasks.lock();
        tracing::debug!(tasks = tasks.len(), "Aborting outstanding I/O tasks");
        tasks.abort_all();
    }
}

impl std::fmt::Debug for IoPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoPool")
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

fn log_join_result(result: Result<(), JoinError>) {
    if let Err(error) = result {
        if error.is_panic() {
            tracing::error!(error = %error, "I/O task panicked");
        }
    }
}

struct TaskGuard {
    inner: Arc<PoolInner>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn drains_finished_tasks() {
        let pool = IoPool::current();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        pool.spawn(async move {
            let _ = rx.await;
        });
        assert_eq!(pool.active_tasks(), 1);
        assert!(!pool.drain(Duration::from_millis(50)).await);

        tx.send(()).unwrap();
        assert!(pool.drain(Duration::from_secs(1)).await);
        assert_eq!(pool.active_tasks(), 0);
    }

    #[tokio::test]
    async fn abort_releases_stuck_tasks() {
        let pool = IoPool::current();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        pool.spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            flag.store(true, Ordering::SeqCst);
        });
        assert!(!pool.drain(Duration::from_millis(20)).await);

        pool.abort_all();
        assert!(pool.drain(Duration::from_secs(1)).await);
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicked_task_is_reaped_and_pool_keeps_working() {
        let pool = IoPool::current();
        pool.spawn(async {
            panic!("connection task blew up");
        });
        assert!(pool.drain(Duration::from_secs(1)).await);

        // The next spawn reaps the panicked task's result.
        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.spawn(async move {
            let _ = tx.send(7);
        });
        assert_eq!(rx.await.unwrap(), 7);
        assert!(pool.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn idle_pool_drains_immediately() {
        let pool = IoPool::current();
        assert!(pool.drain(Duration::from_millis(1)).await);
    }
}
