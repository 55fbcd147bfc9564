//! # Bounded Concurrent Task Queue
//!
//! Sole admission point for concurrent downstream calls. At most N tasks run
//! at once; additional admitted tasks wait in a priority-ordered pending list
//! (higher numeric priority drains first, ties broken by arrival order). The
//! pending list is capacity-bounded: once full, new admissions fail fast with
//! a capacity error rather than growing memory unboundedly.
//!
//! Each task runs under a wall-clock timeout; a timed-out task is reported as
//! failed to its handle and its future is dropped at the next await point.
//! A request already sent downstream may still complete remotely; detecting
//! that drift is the reconciliation engine's job. The queue never retries
//! internally; retry policy is layered by the caller around the downstream
//! call the task performs.

use crate::config::ExecutionConfig;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Identity and scheduling options for an enqueued task.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub id: String,
    /// Higher runs first.
    pub priority: u8,
}

impl TaskOptions {
    pub fn new(id: impl Into<String>, priority: u8) -> Self {
        Self {
            id: id.into(),
            priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The pending list is full; this is the system's backpressure signal.
    #[error("Task queue capacity exceeded ({pending} tasks pending)")]
    CapacityExceeded { pending: usize },

    /// The task exceeded its allotted wall-clock time.
    #[error("Task '{id}' timed out after {timeout:?}")]
    TimedOut { id: String, timeout: Duration },

    /// The task's result channel closed before a result arrived (queue
    /// dropped mid-flight, e.g. on shutdown).
    #[error("Task '{id}' was dropped before completion")]
    Dropped { id: String },
}

/// Completion handle for an enqueued task.
pub struct TaskHandle<T> {
    id: String,
    rx: oneshot::Receiver<Result<T, QueueError>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the task's terminal outcome.
    pub async fn join(self) -> Result<T, QueueError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Dropped { id: self.id }),
        }
    }
}

struct PendingTask {
    priority: u8,
    seq: u64,
    id: String,
    job: BoxFuture<'static, ()>,
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    pending: BinaryHeap<PendingTask>,
    running: usize,
    next_seq: u64,
}

struct Inner {
    config: ExecutionConfig,
    state: Mutex<QueueState>,
}

pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(QueueState {
                    pending: BinaryHeap::new(),
                    running: 0,
                    next_seq: 0,
                }),
            }),
        }
    }

    /// Enqueue a task. Starts immediately when a concurrency slot is free,
    /// otherwise waits in the priority-ordered pending list. Fails fast when
    /// the pending list is at capacity.
    pub fn enqueue<T, Fut>(
        &self,
        options: TaskOptions,
        future: Fut,
    ) -> Result<TaskHandle<T>, QueueError>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let timeout = self.inner.config.task_timeout();
        let job_id = options.id.clone();

        let job: BoxFuture<'static, ()> = Box::pin(async move {
            let outcome = match tokio::time::timeout(timeout, future).await {
                Ok(value) => Ok(value),
                Err(_) => {
                    warn!(task_id = %job_id, timeout_ms = timeout.as_millis() as u64, "Task timed out");
                    Err(QueueError::TimedOut {
                        id: job_id.clone(),
                        timeout,
                    })
                }
            };
            // Receiver may have been dropped; the outcome is discarded then.
            let _ = tx.send(outcome);
        });

        let mut state = self.inner.state.lock();
        if state.running < self.inner.config.max_concurrent_emissions {
            state.running += 1;
            drop(state);
            trace!(task_id = %options.id, "Task dispatched immediately");
            Self::dispatch(Arc::clone(&self.inner), job);
        } else {
            if state.pending.len() >= self.inner.config.max_queue_size {
                let pending = state.pending.len();
                drop(state);
                warn!(task_id = %options.id, pending, "Task rejected: queue at capacity");
                return Err(QueueError::CapacityExceeded { pending });
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(PendingTask {
                priority: options.priority,
                seq,
                id: options.id.clone(),
                job,
            });
            trace!(
                task_id = %options.id,
                priority = options.priority,
                depth = state.pending.len(),
                "Task queued"
            );
        }

        Ok(TaskHandle { id: options.id, rx })
    }

    /// Run a job; on completion immediately start the next eligible pending
    /// task, preserving the concurrency bound.
    fn dispatch(inner: Arc<Inner>, job: BoxFuture<'static, ()>) {
        tokio::spawn(async move {
            job.await;
            let next = {
                let mut state = inner.state.lock();
                match state.pending.pop() {
                    Some(task) => {
                        debug!(task_id = %task.id, "Draining pending task");
                        Some(task.job)
                    }
                    None => {
                        state.running -= 1;
                        None
                    }
                }
            };
            if let Some(job) = next {
                Self::dispatch(inner, job);
            }
        });
    }

    /// Number of tasks waiting in the pending list.
    pub fn depth(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Number of concurrency slots currently in use.
    pub fn in_use(&self) -> usize {
        self.inner.state.lock().running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tokio::sync::Notify;

    fn queue(concurrency: usize, capacity: usize, timeout_ms: u64) -> TaskQueue {
        TaskQueue::new(ExecutionConfig {
            max_concurrent_emissions: concurrency,
            max_queue_size: capacity,
            task_timeout_ms: timeout_ms,
        })
    }

    #[tokio::test]
    async fn runs_tasks_and_returns_results() {
        let queue = queue(2, 10, 1_000);
        let handle = queue
            .enqueue(TaskOptions::new("t1", 0), async { 41 + 1 })
            .expect("enqueue");
        assert_eq!(handle.join().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn respects_concurrency_bound() {
        let queue = queue(2, 10, 5_000);
        let gate = Arc::new(Notify::new());
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..5 {
            let gate = Arc::clone(&gate);
            let peak = Arc::clone(&peak);
            let active = Arc::clone(&active);
            let handle = queue
                .enqueue(TaskOptions::new(format!("t{i}"), 0), async move {
                    let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    peak.fetch_max(now, AtomicOrdering::SeqCst);
                    gate.notified().await;
                    active.fetch_sub(1, AtomicOrdering::SeqCst);
                })
                .expect("enqueue");
            handles.push(handle);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.in_use(), 2);
        assert_eq!(queue.depth(), 3);

        for _ in 0..5 {
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for handle in handles {
            handle.join().await.expect("task completes");
        }
        assert_eq!(peak.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(queue.in_use(), 0);
    }

    #[tokio::test]
    async fn excess_enqueues_fail_fast() {
        let queue = queue(1, 2, 5_000);
        let gate = Arc::new(Notify::new());

        // One running, two pending fills the queue.
        let mut handles = Vec::new();
        for i in 0..3 {
            let gate = Arc::clone(&gate);
            handles.push(
                queue
                    .enqueue(TaskOptions::new(format!("t{i}"), 0), async move {
                        gate.notified().await;
                    })
                    .expect("enqueue"),
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let overflow = queue.enqueue(TaskOptions::new("overflow", 0), async {});
        assert!(matches!(
            overflow,
            Err(QueueError::CapacityExceeded { pending: 2 })
        ));

        for _ in 0..4 {
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn higher_priority_drains_first() {
        let queue = queue(1, 10, 5_000);
        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker = {
            let gate = Arc::clone(&gate);
            queue
                .enqueue(TaskOptions::new("blocker", 0), async move {
                    gate.notified().await;
                })
                .expect("enqueue")
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut handles = Vec::new();
        for (id, priority) in [("low", 1u8), ("high", 9u8), ("mid", 5u8)] {
            let order = Arc::clone(&order);
            handles.push(
                queue
                    .enqueue(TaskOptions::new(id, priority), async move {
                        order.lock().push(id.to_string());
                    })
                    .expect("enqueue"),
            );
        }

        gate.notify_waiters();
        blocker.join().await.expect("blocker");
        for handle in handles {
            handle.join().await.expect("task");
        }

        assert_eq!(*order.lock(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn ties_drain_in_arrival_order() {
        let queue = queue(1, 10, 5_000);
        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker = {
            let gate = Arc::clone(&gate);
            queue
                .enqueue(TaskOptions::new("blocker", 0), async move {
                    gate.notified().await;
                })
                .expect("enqueue")
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut handles = Vec::new();
        for id in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            handles.push(
                queue
                    .enqueue(TaskOptions::new(id, 5), async move {
                        order.lock().push(id.to_string());
                    })
                    .expect("enqueue"),
            );
        }

        gate.notify_waiters();
        blocker.join().await.expect("blocker");
        for handle in handles {
            handle.join().await.expect("task");
        }

        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn timed_out_task_reports_failure_and_frees_slot() {
        let queue = queue(1, 10, 30);

        let slow = queue
            .enqueue(TaskOptions::new("slow", 0), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "never"
            })
            .expect("enqueue");

        let result = slow.join().await;
        assert!(matches!(result, Err(QueueError::TimedOut { .. })));

        // The slot is free again for the next task.
        let quick = queue
            .enqueue(TaskOptions::new("quick", 0), async { "done" })
            .expect("enqueue");
        assert_eq!(quick.join().await.unwrap(), "done");
    }
}
