//! Cooperative cancellation and bounded concurrency.

use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// Shared "shutting down" flag.
///
/// Loops check it at every iteration boundary and exit early; work already in
/// flight is allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake everything waiting on it
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is raised
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_shutting_down() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless shutdown interrupts it.
    /// Returns `false` when interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.is_shutting_down();
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_shutting_down(),
            _ = self.wait() => false,
        }
    }
}

/// Runs a set of independent tasks with a fixed concurrency limit.
#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    semaphore: Arc<Semaphore>,
    shutdown: ShutdownSignal,
}

impl BoundedExecutor {
    pub fn new(limit: usize, shutdown: ShutdownSignal) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            shutdown,
        }
    }

    /// Run `task` for every item with at most `limit` in flight.
    ///
    /// Items that have not started when shutdown is raised are skipped, so the
    /// result may be shorter than the input. Result order is unspecified.
    pub async fn run<T, R, F, Fut>(&self, items: impl IntoIterator<Item = T>, task: F) -> Vec<R>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = R>,
    {
        let task = &task;
        let jobs = items.into_iter().map(|item| {
            let semaphore = self.semaphore.clone();
            let shutdown = self.shutdown.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if shutdown.is_shutting_down() {
                    return None;
                }
                Some(task(item).await)
            }
        });

        join_all(jobs).await.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn never_exceeds_limit() {
        let executor = BoundedExecutor::new(3, ShutdownSignal::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = executor
            .run(0..20, |i| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    i * 2
                }
            })
            .await;

        assert_eq!(results.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(results.iter().sum::<i32>(), (0..20).map(|i| i * 2).sum::<i32>());
    }

    #[tokio::test]
    async fn skips_pending_items_after_shutdown() {
        let shutdown = ShutdownSignal::new();
        let executor = BoundedExecutor::new(1, shutdown.clone());

        let results = executor
            .run(0..10, |i| {
                let shutdown = shutdown.clone();
                async move {
                    if i == 2 {
                        shutdown.trigger();
                    }
                    i
                }
            })
            .await;

        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn sleep_is_interrupted_by_shutdown() {
        let shutdown = ShutdownSignal::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.trigger();
        });

        let completed = shutdown.sleep(Duration::from_secs(30)).await;
        assert!(!completed);
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_triggered() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        shutdown.wait().await;
        assert!(!shutdown.sleep(Duration::ZERO).await);
    }
}
