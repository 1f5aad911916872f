//! Worker Pool / Scheduler (C5): bounded concurrency over a todo list of
//! project names. `buffer_unordered` enforces the worker cap; queue
//! membership (each project appears in `todo` at most once per run) is what
//! guarantees at-most-one pipeline per project, so no keyed mutex map is
//! needed the way the Design Notes' open question raises for a
//! thread-based port.

use crate::model::Serial;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One unit of scheduled work: a project name and the serial the Controller
/// expects its metadata fetch to return at least.
#[derive(Debug, Clone)]
pub struct TodoItem {
    pub project: String,
    pub serial: Serial,
}

#[derive(Debug)]
pub enum WorkerOutcome<T> {
    Succeeded { project: String, outcome: T },
    Failed { project: String, error: String },
    /// Never dispatched because a prior failure already tripped
    /// `stop-on-error`.
    Cancelled { project: String },
}

/// Drains `todo` through `work` with at most `workers` concurrent
/// invocations. `on_complete` runs after each item finishes — never
/// concurrently with itself, since stream polling is single-threaded — so
/// the Controller can rewrite `todo` incrementally without
/// its own synchronization.
///
/// `work` is generic over the pipeline call so this module stays testable
/// without a real storage/client pair behind it.
pub async fn drain<T, F, Fut>(
    todo: Vec<TodoItem>,
    workers: usize,
    stop_on_error: bool,
    work: F,
    mut on_complete: impl FnMut(&WorkerOutcome<T>),
) -> Vec<WorkerOutcome<T>>
where
    F: Fn(TodoItem) -> Fut,
    Fut: std::future::Future<Output = Result<T, String>>,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let mut results = Vec::with_capacity(todo.len());

    let tasks = stream::iter(todo).map(|item| {
        let cancelled = Arc::clone(&cancelled);
        let fut = work(item.clone());
        async move {
            if cancelled.load(Ordering::SeqCst) {
                return WorkerOutcome::Cancelled { project: item.project };
            }
            match fut.await {
                Ok(outcome) => WorkerOutcome::Succeeded { project: item.project, outcome },
                Err(error) => {
                    if stop_on_error {
                        cancelled.store(true, Ordering::SeqCst);
                    }
                    WorkerOutcome::Failed { project: item.project, error }
                }
            }
        }
    });

    let mut tasks = Box::pin(tasks.buffer_unordered(workers.max(1)));
    while let Some(outcome) = tasks.next().await {
        on_complete(&outcome);
        results.push(outcome);
    }
    results
}
