//! Named background tasks that share one cancellation token.
//!
//! A session spawns its writer, reader, and heartbeat tasks into a
//! [`TaskGroup`]; tearing the session down cancels the token and joins
//! every task within a grace period, aborting any that overrun, so no
//! task outlives its transport.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct TaskGroup {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskGroup {
    /// A group whose token is a child of `parent`: cancelling the
    /// parent cancels the group, not the other way round.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            tasks: Vec::new(),
        }
    }

    /// The group's cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn `f(token)` under `name`.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(f(self.cancel.clone()));
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every task and wait for them to finish.
    ///
    /// Tasks still running after `grace` are aborted. Returns the number
    /// of tasks that had to be aborted.
    pub async fn shutdown(self, grace: Duration) -> usize {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "task finished"),
                Ok(Err(e)) if e.is_panic() => warn!(task = name, "task panicked"),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(task = name, ?grace, "task overran grace period; aborting");
                    handle.abort();
                    let _ = handle.await;
                    aborted += 1;
                }
            }
        }
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn cooperative_tasks_exit_on_cancel() {
        let root = CancellationToken::new();
        let mut group = TaskGroup::child_of(&root);
        let exited = Arc::new(AtomicUsize::new(0));
        for name in ["writer", "reader", "heartbeat"] {
            let exited = Arc::clone(&exited);
            group.spawn(name, move |cancel| async move {
                cancel.cancelled().await;
                exited.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(group.len(), 3);
        let aborted = group.shutdown(Duration::from_secs(1)).await;
        assert_eq!(aborted, 0);
        assert_eq!(exited.load(Ordering::SeqCst), 3);
        assert!(!root.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_task_is_aborted() {
        let root = CancellationToken::new();
        let mut group = TaskGroup::child_of(&root);
        group.spawn("stubborn", |_cancel| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let aborted = group.shutdown(Duration::from_millis(100)).await;
        assert_eq!(aborted, 1);
    }

    #[tokio::test]
    async fn parent_cancel_reaches_group() {
        let root = CancellationToken::new();
        let group = TaskGroup::child_of(&root);
        let token = group.token();
        root.cancel();
        assert!(token.is_cancelled());
    }
}
