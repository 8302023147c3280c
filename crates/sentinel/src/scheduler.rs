//! Priority scheduling and the worker pool.
//!
//! A bounded max-heap queue (severity priority, FIFO within a priority)
//! feeds a fixed pool of workers. Each attempt runs under the configured
//! deadline on a child cancellation token; a panic inside a diagnosis is
//! contained at the spawn boundary and recorded as task failure.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sentinel_config::SchedulerConfig;

use crate::entities::{Event, Report, Task, TaskStatus};
use crate::error::SentinelError;
use crate::storage::Store;

/// The work a scheduler drives; implemented by the diagnosis engine.
#[async_trait]
pub trait Diagnose: Send + Sync {
    /// Produce a report for one task. Cancellation of `cancel` must reach
    /// the agent subprocess; cleanup may outlive it on independent
    /// deadlines.
    async fn diagnose(&self, task: &Task, cancel: CancellationToken)
        -> Result<Report, SentinelError>;
}

struct QueueItem {
    task: Task,
    seq: u64,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then older submissions first.
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PriorityQueue {
    heap: Mutex<BinaryHeap<QueueItem>>,
    /// One permit per queued item; closing wakes all poppers.
    items: Semaphore,
    capacity: usize,
    seq: AtomicU64,
}

impl PriorityQueue {
    fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            items: Semaphore::new(0),
            capacity,
            seq: AtomicU64::new(0),
        }
    }

    fn push(&self, task: Task) -> Result<(), SentinelError> {
        let mut heap = self.heap.lock().expect("queue lock poisoned");
        if heap.len() >= self.capacity {
            return Err(SentinelError::QueueUnavailable(format!(
                "queue full ({} items)",
                heap.len()
            )));
        }
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        heap.push(QueueItem { task, seq });
        drop(heap);
        self.items.add_permits(1);
        Ok(())
    }

    /// Block until an item is available; `None` after close.
    async fn pop(&self) -> Option<Task> {
        match self.items.acquire().await {
            Ok(permit) => {
                permit.forget();
                let mut heap = self.heap.lock().expect("queue lock poisoned");
                heap.pop().map(|item| item.task)
            }
            Err(_closed) => None,
        }
    }

    fn close(&self) {
        self.items.close();
    }

    fn depth(&self) -> usize {
        self.heap.lock().expect("queue lock poisoned").len()
    }
}

/// Worker-pool scheduler over the priority queue.
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Arc<PriorityQueue>,
    store: Arc<dyn Store>,
    cancel: CancellationToken,
    running: Arc<AtomicUsize>,
    /// Admission lock; holds the stopped flag.
    admission: Mutex<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(config: SchedulerConfig, store: Arc<dyn Store>) -> Self {
        Self {
            queue: Arc::new(PriorityQueue::new(config.queue_size)),
            config,
            store,
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicUsize::new(0)),
            admission: Mutex::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool.
    pub fn start(&self, diagnoser: Arc<dyn Diagnose>) {
        let mut workers = self.workers.lock().expect("worker list poisoned");
        for worker_id in 0..self.config.max_concurrency {
            let queue = Arc::clone(&self.queue);
            let diagnoser = Arc::clone(&diagnoser);
            let store = Arc::clone(&self.store);
            let running = Arc::clone(&self.running);
            let cancel = self.cancel.clone();
            let config = self.config.clone();

            workers.push(tokio::spawn(async move {
                info!(worker_id, "worker started");
                while let Some(task) = queue.pop().await {
                    running.fetch_add(1, AtomicOrdering::SeqCst);
                    run_task(&config, &store, &diagnoser, task, &cancel).await;
                    running.fetch_sub(1, AtomicOrdering::SeqCst);
                }
                info!(worker_id, "worker drained");
            }));
        }
    }

    /// Admit an event: create its task, persist, enqueue.
    pub async fn submit(&self, event: Event) -> Result<String, SentinelError> {
        {
            let stopped = self.admission.lock().expect("admission lock poisoned");
            if *stopped {
                return Err(SentinelError::QueueUnavailable("scheduler stopped".to_string()));
            }
        }

        let task = Task::new(event);
        let task_id = task.id.clone();
        if let Err(e) = self.store.create_task(&task).await {
            warn!(error = %e, "task persist failed at admission");
        }
        self.queue.push(task)?;
        Ok(task_id)
    }

    /// Stop admission, close the queue, cancel running work, wait for the
    /// pool to drain.
    pub async fn stop(&self) {
        {
            let mut stopped = self.admission.lock().expect("admission lock poisoned");
            *stopped = true;
        }
        self.queue.close();
        self.cancel.cancel();

        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().expect("worker list poisoned");
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
        info!("scheduler stopped");
    }

    /// Queued (not yet running) tasks.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Tasks currently executing.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.load(AtomicOrdering::SeqCst)
    }
}

/// Execute one task with retries. Every exit path records a terminal
/// status in the store.
async fn run_task(
    config: &SchedulerConfig,
    store: &Arc<dyn Store>,
    diagnoser: &Arc<dyn Diagnose>,
    mut task: Task,
    cancel: &CancellationToken,
) {
    let attempts = config.retry_count.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.retry_count = attempt - 1;
        if let Err(e) = store.update_task(&task).await {
            warn!(task = %task.id, error = %e, "task update failed");
        }

        match run_attempt(config, diagnoser, &task, cancel).await {
            Ok(_report) => {
                task.status = TaskStatus::Completed;
                task.finished_at = Some(Utc::now());
                task.error = None;
                if let Err(e) = store.update_task(&task).await {
                    warn!(task = %task.id, error = %e, "task update failed");
                }
                return;
            }
            Err(e) => {
                error!(
                    task = %task.id,
                    attempt,
                    kind = e.kind(),
                    error = %e,
                    "diagnosis attempt failed"
                );
                last_error = format!("{} ({})", e, e.kind());
            }
        }

        if attempt < attempts {
            if cancel.is_cancelled() {
                last_error.push_str("; retry skipped: scheduler stopped");
                break;
            }
            tokio::time::sleep(config.retry_delay).await;
        }
    }

    task.status = TaskStatus::Failed;
    task.finished_at = Some(Utc::now());
    task.error = Some(last_error);
    if let Err(e) = store.update_task(&task).await {
        warn!(task = %task.id, error = %e, "task update failed");
    }
}

/// One attempt under the per-attempt deadline, with a panic boundary.
async fn run_attempt(
    config: &SchedulerConfig,
    diagnoser: &Arc<dyn Diagnose>,
    task: &Task,
    cancel: &CancellationToken,
) -> Result<Report, SentinelError> {
    let attempt_cancel = cancel.child_token();

    // The spawn boundary contains panics; a poisoned diagnosis becomes a
    // task failure instead of a dead worker.
    let handle = {
        let task = task.clone();
        let token = attempt_cancel.clone();
        let diagnoser = Arc::clone(diagnoser);
        tokio::spawn(async move { diagnoser.diagnose(&task, token).await })
    };

    match tokio::time::timeout(config.default_timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) if join_error.is_panic() => Err(SentinelError::Internal(format!(
            "diagnosis panicked: {join_error}"
        ))),
        Ok(Err(join_error)) => Err(SentinelError::Internal(format!(
            "diagnosis task aborted: {join_error}"
        ))),
        Err(_elapsed) => {
            // Deadline: cancel the attempt. The engine finishes its
            // independent-context cleanup on the detached task.
            attempt_cancel.cancel();
            warn!(task = %task.id, "attempt deadline elapsed, cancelling");
            Err(SentinelError::Timeout)
        }
    }
}
