//! Start/stop handle shared by the long-running background loops.

use std::{
    future::Future,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU8, Ordering},
    },
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STOPPED: u8 = 0;
const RUNNING: u8 = 1;

/// Owns at most one spawned loop. `start` on a running task and `stop` on a
/// stopped one are no-ops, so neither ever leaves two loops alive.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    state: AtomicU8,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl BackgroundTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: AtomicU8::new(STOPPED),
            task: Mutex::new(None),
        }
    }

    /// Spawns `make(token)` unless already running. Returns whether a new
    /// loop was started.
    pub fn start<F, Fut>(&self, make: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if self
            .state
            .compare_exchange(STOPPED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(make(token.clone()));
        if let Some((displaced, _)) = slot.replace((token, handle)) {
            displaced.cancel();
        }
        tracing::debug!(task = self.name, "Background task started");
        true
    }

    /// Cancels the loop and waits for it to finish.
    pub async fn stop(&self) {
        // The state flip and the take happen under the same lock as in `start`.
        let taken = {
            let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
            if self
                .state
                .compare_exchange(RUNNING, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            slot.take()
        };
        if let Some((token, handle)) = taken {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(task = self.name, error = %e, "Background task ended abnormally");
            }
        }
        tracing::debug!(task = self.name, "Background task stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if let Some((token, handle)) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_start_twice_spawns_once() {
        let task = BackgroundTask::new("test");
        let spawned = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let spawned = Arc::clone(&spawned);
            task.start(move |token| async move {
                spawned.fetch_add(1, Ordering::SeqCst);
                token.cancelled().await;
            });
        }
        tokio::task::yield_now().await;
        assert!(task.is_running());
        assert_eq!(spawned.load(Ordering::SeqCst), 1);

        task.stop().await;
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let task = BackgroundTask::new("test");
        task.stop().await;
        assert!(!task.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_stop_leaves_no_detached_loop() {
        let task = Arc::new(BackgroundTask::new("test"));
        let alive = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let task = Arc::clone(&task);
                let alive = Arc::clone(&alive);
                tokio::spawn(async move {
                    for _ in 0..500 {
                        let alive = Arc::clone(&alive);
                        task.start(move |token| async move {
                            alive.fetch_add(1, Ordering::SeqCst);
                            token.cancelled().await;
                            alive.fetch_sub(1, Ordering::SeqCst);
                        });
                        task.stop().await;
                    }
                })
            })
            .collect();
        for w in workers {
            w.await.unwrap();
        }
        task.stop().await;

        // Every loop ever started must have seen its cancellation.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while alive.load(Ordering::SeqCst) != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("a background loop was left running");
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let task = BackgroundTask::new("test");
        assert!(task.start(|token| async move { token.cancelled().await }));
        task.stop().await;
        assert!(task.start(|token| async move { token.cancelled().await }));
        assert!(task.is_running());
        task.stop().await;
    }
}
