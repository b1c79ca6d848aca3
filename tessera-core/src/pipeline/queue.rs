//! Task set for async continuations.
//!
//! Work that has to wait on an async directive is pushed here as a boxed
//! future. A driver owns the `FuturesUnordered` actually polling them, so
//! continuations on different nodes make progress concurrently while each
//! node's own chain stays ordered. New work can be pushed while the driver
//! is waiting; `Notify` wakes it to absorb the new futures.

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Futures being driven by a [`TaskSet`].
pub(crate) type Running<T> = FuturesUnordered<BoxFuture<'static, T>>;

pub(crate) struct TaskSet<T> {
    incoming: Mutex<Vec<BoxFuture<'static, T>>>,
    notify: Notify,
}

impl<T> TaskSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            incoming: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Queue a future for the driver.
    pub(crate) fn push(&self, task: BoxFuture<'static, T>) {
        self.incoming.lock().push(task);
        self.notify.notify_one();
    }

    /// Move queued futures into the driver's set.
    pub(crate) fn absorb(&self, running: &mut Running<T>) {
        let incoming = std::mem::take(&mut *self.incoming.lock());
        for task in incoming {
            running.push(task);
        }
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.incoming.lock().is_empty()
    }

    /// Wait until a new future is queued.
    pub(crate) async fn queued(&self) {
        if self.has_queued() {
            return;
        }
        self.notify.notified().await;
    }

    /// The next finished output, or `None` once nothing is queued or running.
    pub(crate) async fn next(&self, running: &mut Running<T>) -> Option<T> {
        loop {
            self.absorb(running);
            if running.is_empty() {
                return None;
            }
            tokio::select! {
                biased;
                Some(output) = running.next() => return Some(output),
                _ = self.notify.notified() => {}
            }
        }
    }
}

impl<E> TaskSet<Result<(), E>> {
    /// Drive everything to completion, stopping at the first error.
    pub(crate) async fn drain(&self) -> Result<(), E> {
        let mut running = Running::new();
        while let Some(output) = self.next(&mut running).await {
            output?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn drains_tasks_pushed_while_running() {
        let set: Arc<TaskSet<Result<(), String>>> = Arc::new(TaskSet::new());
        let count = Arc::new(AtomicUsize::new(0));

        let inner_set = set.clone();
        let inner_count = count.clone();
        set.push(
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                inner_count.fetch_add(1, Ordering::SeqCst);
                let nested_count = inner_count.clone();
                inner_set.push(
                    async move {
                        nested_count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                    .boxed(),
                );
                Ok(())
            }
            .boxed(),
        );

        set.drain().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drain_stops_at_first_error() {
        let set: TaskSet<Result<(), String>> = TaskSet::new();
        set.push(async { Err("boom".to_string()) }.boxed());
        assert_eq!(set.drain().await, Err("boom".to_string()));
    }

    #[tokio::test]
    async fn next_on_empty_set_is_none() {
        let set: TaskSet<u8> = TaskSet::new();
        let mut running = Running::new();
        assert!(set.next(&mut running).await.is_none());
    }
}
