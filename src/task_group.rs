//! Join-all task group for remote mutations
//!
//! Every spawned task runs to completion even when a sibling fails. `wait`
//! returns the first error to arrive and logs the rest. Nothing is rolled
//! back, so a failed pass may still have posted part of its work.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

pub struct TaskGroup<'a, E> {
    tasks: Vec<BoxFuture<'a, Result<(), E>>>,
    limit: Option<Arc<Semaphore>>,
}

impl<E> Default for TaskGroup<'_, E> {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            limit: None,
        }
    }
}

impl<'a, E> TaskGroup<'a, E>
where
    E: Display + Send + 'a,
{
    /// Unbounded group: every task is in flight at once.
    pub fn new() -> Self {
        Self::default()
    }

    /// Group running at most `limit` tasks at a time. `None` or zero means
    /// unbounded.
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            tasks: Vec::new(),
            limit: limit
                .filter(|limit| *limit > 0)
                .map(|limit| Arc::new(Semaphore::new(limit))),
        }
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'a,
    {
        match &self.limit {
            Some(semaphore) => {
                let semaphore = Arc::clone(semaphore);
                self.tasks.push(Box::pin(async move {
                    // The semaphore is never closed; a failed acquire just runs unthrottled.
                    let _permit = semaphore.acquire_owned().await.ok();
                    task.await
                }));
            }
            None => self.tasks.push(Box::pin(task)),
        }
    }

    /// Drive every task to completion and report the first failure.
    pub async fn wait(self) -> Result<(), E> {
        let mut running: FuturesUnordered<_> = self.tasks.into_iter().collect();
        let mut first_error = None;
        let mut failed = 0usize;

        while let Some(result) = running.next().await {
            let Err(err) = result else {
                continue;
            };
            failed += 1;
            if first_error.is_none() {
                first_error = Some(err);
            } else {
                warn!(error = %err, "additional task failure");
            }
        }

        match first_error {
            Some(err) => {
                if failed > 1 {
                    warn!(failed, "task group finished with multiple failures");
                }
                Err(err)
            }
            None => Ok(()),
        }
    }
}
