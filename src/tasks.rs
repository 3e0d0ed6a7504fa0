//! Supervised background tasks keyed by node id.
//!
//! At most one task runs per key. Every task gets a child of the root
//! cancellation token, so shutdown reaches all of them at once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProvisionError;

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    generation: u64,
}

#[derive(Clone, Default)]
pub struct TaskSupervisor {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    root: CancellationToken,
    tasks: Mutex<HashMap<String, Running>>,
    generation: AtomicU64,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled on shutdown. Long-lived loops run under children of it.
    pub fn root(&self) -> CancellationToken {
        self.inner.root.clone()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, Running>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start `task` under `key` unless one is already running there.
    pub fn spawn<F, Fut>(&self, key: &str, task: F) -> Result<(), ProvisionError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks();
        if let Some(running) = tasks.get(key) {
            if !running.handle.is_finished() {
                return Err(ProvisionError::AlreadyRunning(key.to_string()));
            }
        }

        let cancel = self.inner.root.child_token();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let fut = task(cancel.clone());

        let supervisor = self.clone();
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            fut.await;
            supervisor.finish(&owned_key, generation);
        });

        debug!(key, generation, "task started");
        tasks.insert(
            key.to_string(),
            Running {
                cancel,
                handle,
                generation,
            },
        );
        Ok(())
    }

    fn finish(&self, key: &str, generation: u64) {
        let mut tasks = self.tasks();
        if tasks.get(key).is_some_and(|r| r.generation == generation) {
            tasks.remove(key);
            debug!(key, generation, "task finished");
        }
    }

    /// Request cancellation of the task under `key`. Returns whether one was running.
    pub fn cancel(&self, key: &str) -> bool {
        match self.tasks().get(key) {
            Some(running) if !running.handle.is_finished() => {
                running.cancel.cancel();
                info!(key, "task cancellation requested");
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.tasks()
            .get(key)
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Keys with a live task, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .tasks()
            .iter()
            .filter(|(_, r)| !r.handle.is_finished())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Cancel everything and wait up to `grace` for tasks to return.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.root.cancel();
        let handles: Vec<(String, JoinHandle<()>)> = self
            .tasks()
            .drain()
            .map(|(key, running)| (key, running.handle))
            .collect();
        if handles.is_empty() {
            return;
        }

        info!(tasks = handles.len(), "waiting for running tasks");
        for (key, handle) in handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(key = %key, error = %e, "task ended abnormally"),
                Err(_) => {
                    warn!(key = %key, "task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn one_task_per_key() {
        let supervisor = TaskSupervisor::new();
        let (tx, rx) = oneshot::channel::<()>();

        supervisor
            .spawn("n1", |_| async move {
                let _ = rx.await;
            })
            .unwrap();
        assert!(supervisor.is_running("n1"));

        let err = supervisor.spawn("n1", |_| async {}).unwrap_err();
        assert!(matches!(err, ProvisionError::AlreadyRunning(ref id) if id == "n1"));
        supervisor.spawn("n2", |_| async {}).unwrap();

        tx.send(()).unwrap();
        for _ in 0..100 {
            if !supervisor.is_running("n1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!supervisor.is_running("n1"));
        supervisor.spawn("n1", |_| async {}).unwrap();
    }

    #[tokio::test]
    async fn cancel_reaches_the_task() {
        let supervisor = TaskSupervisor::new();
        let (tx, rx) = oneshot::channel();

        supervisor
            .spawn("n1", |cancel| async move {
                cancel.cancelled().await;
                let _ = tx.send("stopped");
            })
            .unwrap();

        assert!(supervisor.cancel("n1"));
        assert_eq!(rx.await.unwrap(), "stopped");
        assert!(!supervisor.cancel("missing"));
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let supervisor = TaskSupervisor::new();
        for key in ["a", "b"] {
            supervisor
                .spawn(key, |cancel| async move { cancel.cancelled().await })
                .unwrap();
        }
        assert_eq!(supervisor.running(), vec!["a".to_string(), "b".to_string()]);

        supervisor.shutdown(Duration::from_secs(1)).await;
        assert!(supervisor.root().is_cancelled());
        assert!(supervisor.running().is_empty());
    }
}
