//! Background task queue for frame dispatch.
//!
//! A fixed pool of worker threads pulls dispatch jobs from one shared channel.
//! The queue knows nothing about video or networking: it runs submitted
//! [`DispatchWork`] units and records each task's lifecycle in a result store
//! that status queries read as snapshots.
//!
//! Task status moves Pending -> Running -> Completed | Failed and never
//! regresses. Finished tasks are retained up to a configurable cap; the oldest
//! finished entries are evicted first. In-flight tasks are never evicted.

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// How long `stop()` waits for the pool to drain before giving up.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);
/// Worker pop timeout, so the running flag is re-checked periodically.
const POP_TIMEOUT: Duration = Duration::from_secs(1);

pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_TASK_RETENTION: usize = 1024;

/// Unit of work the queue executes. This is the only operation the pipeline
/// defers: sending one sampled frame to the detection sink.
pub trait DispatchWork: Send + 'static {
    fn run(&self) -> Result<serde_json::Value>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug)]
struct TaskRecord {
    status: TaskStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
    created_at: SystemTime,
    started_at: Option<SystemTime>,
    completed_at: Option<SystemTime>,
}

impl TaskRecord {
    fn new() -> Self {
        Self {
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: SystemTime::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Point-in-time copy of one task, safe to hand out across threads.
#[derive(Clone, Debug, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: f64,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub duration: f64,
}

/// Aggregate queue statistics, computed by scanning the result store.
#[derive(Clone, Debug, Serialize)]
pub struct QueueStats {
    pub queue_size: usize,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub active_workers: usize,
}

enum QueueMessage {
    Run(String, Box<dyn DispatchWork>),
    Shutdown,
}

struct ResultStore {
    tasks: HashMap<String, TaskRecord>,
    /// Finished task ids in completion order, for retention eviction.
    finished: VecDeque<String>,
    retention: usize,
}

impl ResultStore {
    fn mark_finished(&mut self, id: &str) {
        self.finished.push_back(id.to_string());
        while self.finished.len() > self.retention {
            if let Some(old) = self.finished.pop_front() {
                self.tasks.remove(&old);
            }
        }
    }
}

/// Shared bounded worker pool. One instance serves all streams.
pub struct TaskQueue {
    sender: Sender<QueueMessage>,
    receiver: Receiver<QueueMessage>,
    store: Arc<Mutex<ResultStore>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    is_running: Arc<AtomicBool>,
    worker_count: usize,
}

impl TaskQueue {
    pub fn new(worker_count: usize, retention: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            sender,
            receiver,
            store: Arc::new(Mutex::new(ResultStore {
                tasks: HashMap::new(),
                finished: VecDeque::new(),
                retention: retention.max(1),
            })),
            workers: Mutex::new(Vec::new()),
            is_running: Arc::new(AtomicBool::new(false)),
            worker_count: worker_count.max(1),
        }
    }

    /// Spawn the worker pool. Calling this while already running is a no-op.
    pub fn start(&self) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            log::warn!("task queue is already running");
            return;
        }
        let mut workers = lock_poisoned(&self.workers);
        workers.clear();
        for i in 0..self.worker_count {
            let receiver = self.receiver.clone();
            let store = Arc::clone(&self.store);
            let is_running = Arc::clone(&self.is_running);
            let handle = std::thread::Builder::new()
                .name(format!("frame-worker-{i}"))
                .spawn(move || worker_loop(receiver, store, is_running));
            match handle {
                Ok(handle) => workers.push(handle),
                Err(error) => log::error!("failed to spawn worker {i}: {error}"),
            }
        }
        log::info!("started task queue with {} workers", workers.len());
    }

    /// Stop the worker pool: one sentinel per worker, then a bounded join.
    /// Best-effort; a worker stuck in a long dispatch is left to finish on
    /// its own.
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        for _ in 0..self.worker_count {
            let _ = self.sender.send(QueueMessage::Shutdown);
        }
        let deadline = Instant::now() + SHUTDOWN_WAIT;
        let mut workers = lock_poisoned(&self.workers);
        for handle in workers.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        log::info!("stopped task queue");
    }

    /// Record a Pending task and enqueue it. Never blocks on completion.
    /// Duplicate ids are rejected so a second submission cannot overwrite the
    /// record backing status lookups for the first.
    pub fn submit(&self, id: &str, work: Box<dyn DispatchWork>) -> Result<String> {
        {
            let mut store = lock_poisoned(&self.store);
            if store.tasks.contains_key(id) {
                bail!("task id '{id}' is already in use");
            }
            store.tasks.insert(id.to_string(), TaskRecord::new());
        }
        self.sender
            .send(QueueMessage::Run(id.to_string(), work))
            .map_err(|_| anyhow!("task queue channel is closed"))?;
        log::debug!("queued task {id}");
        Ok(id.to_string())
    }

    pub fn status(&self, id: &str) -> Option<TaskSnapshot> {
        let store = lock_poisoned(&self.store);
        let task = store.tasks.get(id)?;
        let end = task
            .completed_at
            .map(epoch_secs)
            .unwrap_or_else(|| epoch_secs(SystemTime::now()));
        let begin = task
            .started_at
            .map(epoch_secs)
            .unwrap_or_else(|| epoch_secs(task.created_at));
        Some(TaskSnapshot {
            id: id.to_string(),
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            created_at: epoch_secs(task.created_at),
            started_at: task.started_at.map(epoch_secs),
            completed_at: task.completed_at.map(epoch_secs),
            duration: (end - begin).max(0.0),
        })
    }

    /// Number of tasks waiting in the channel. The capture engines use this
    /// as the backpressure signal.
    pub fn queued_len(&self) -> usize {
        self.receiver.len()
    }

    /// O(total retained tasks); status-endpoint only, not a hot path.
    pub fn stats(&self) -> QueueStats {
        let store = lock_poisoned(&self.store);
        let mut stats = QueueStats {
            queue_size: self.queued_len(),
            total_tasks: store.tasks.len(),
            completed_tasks: 0,
            failed_tasks: 0,
            pending_tasks: 0,
            running_tasks: 0,
            active_workers: 0,
        };
        for task in store.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending_tasks += 1,
                TaskStatus::Running => stats.running_tasks += 1,
                TaskStatus::Completed => stats.completed_tasks += 1,
                TaskStatus::Failed => stats.failed_tasks += 1,
            }
        }
        drop(store);
        let workers = lock_poisoned(&self.workers);
        stats.active_workers = workers.iter().filter(|w| !w.is_finished()).count();
        stats
    }
}

fn worker_loop(
    receiver: Receiver<QueueMessage>,
    store: Arc<Mutex<ResultStore>>,
    is_running: Arc<AtomicBool>,
) {
    while is_running.load(Ordering::SeqCst) {
        let message = match receiver.recv_timeout(POP_TIMEOUT) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let (id, work) = match message {
            QueueMessage::Run(id, work) => (id, work),
            QueueMessage::Shutdown => break,
        };

        {
            let mut store = lock_poisoned(&store);
            if let Some(task) = store.tasks.get_mut(&id) {
                task.status = TaskStatus::Running;
                task.started_at = Some(SystemTime::now());
            }
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| work.run()));
        let mut store = lock_poisoned(&store);
        if let Some(task) = store.tasks.get_mut(&id) {
            match outcome {
                Ok(Ok(value)) => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(value);
                    log::debug!("task {id} completed");
                }
                Ok(Err(error)) => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error.to_string());
                    log::error!("task {id} failed: {error:#}");
                }
                Err(panic) => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(panic_message(panic));
                    log::error!("task {id} panicked");
                }
            }
            task.completed_at = Some(SystemTime::now());
            store.mark_finished(&id);
        }
    }
}

fn epoch_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("dispatch panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("dispatch panicked: {message}")
    } else {
        "dispatch panicked".to_string()
    }
}

fn lock_poisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
