use crate::core::analysis::{self, QualityMetrics};
use crate::core::hash::{FingerprintMode, Fingerprinter};
use crate::core::models::Fingerprint;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkerError {
    #[error("Image analysis failed: {0}")]
    Analysis(String),

    #[error("Fingerprinting failed: {0}")]
    Hash(String),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Worker returned {0} output for a different task kind")]
    UnexpectedOutput(&'static str),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("Worker pool is shut down")]
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Analyze,
    Hash,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Analysis(QualityMetrics),
    Fingerprint(Fingerprint),
}

impl TaskOutput {
    fn kind_name(&self) -> &'static str {
        match self {
            TaskOutput::Analysis(_) => "analysis",
            TaskOutput::Fingerprint(_) => "fingerprint",
        }
    }
}

struct TaskMessage {
    id: u64,
    kind: TaskKind,
    bytes: Vec<u8>,
}

struct TaskReply {
    id: u64,
    result: Result<TaskOutput, WorkerError>,
}

type Waiter = oneshot::Sender<Result<TaskOutput, WorkerError>>;
type PendingMap = Arc<Mutex<HashMap<u64, Waiter>>>;

/// Fixed set of OS threads running CPU-bound image work.
///
/// Each worker owns an inbound channel and handles its tasks one at a time in
/// posting order. Workers post tagged replies to a shared completion channel;
/// a router thread hands each reply to the caller waiting on that correlation
/// id. Tasks are assigned round-robin, with no queue limit.
pub struct WorkerPool {
    senders: Vec<Sender<TaskMessage>>,
    workers: Vec<JoinHandle<()>>,
    router: Option<JoinHandle<()>>,
    pending: PendingMap,
    next_worker: AtomicUsize,
    next_id: AtomicU64,
}

impl WorkerPool {
    pub fn new(size: usize, mode: FingerprintMode) -> Result<Self, WorkerError> {
        let size = if size == 0 {
            log::warn!("Worker pool size 0 requested, using 1 worker");
            1
        } else {
            size
        };

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (reply_tx, reply_rx) = mpsc::channel::<TaskReply>();

        let mut senders = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let (task_tx, task_rx) = mpsc::channel::<TaskMessage>();
            let replies = reply_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("claimcull-worker-{}", index))
                .spawn(move || run_worker(index, mode, task_rx, replies))
                .map_err(|e| WorkerError::Spawn(e.to_string()))?;
            senders.push(task_tx);
            workers.push(handle);
        }
        // Only workers may keep the completion channel open.
        drop(reply_tx);

        let router_pending = pending.clone();
        let router = thread::Builder::new()
            .name("claimcull-router".to_string())
            .spawn(move || run_router(reply_rx, router_pending))
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        log::info!("Started worker pool with {} worker(s), {:?} fingerprints", size, mode);

        Ok(Self {
            senders,
            workers,
            router: Some(router),
            pending,
            next_worker: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Run `kind` on `bytes` in a worker and wait for its reply.
    pub async fn submit(&self, kind: TaskKind, bytes: Vec<u8>) -> Result<TaskOutput, WorkerError> {
        let (_, _, reply) = self.dispatch(kind, bytes)?;
        reply.await.map_err(|_| WorkerError::Unavailable)?
    }

    pub async fn hash(&self, bytes: Vec<u8>) -> Result<Fingerprint, WorkerError> {
        match self.submit(TaskKind::Hash, bytes).await? {
            TaskOutput::Fingerprint(fingerprint) => Ok(fingerprint),
            other => Err(WorkerError::UnexpectedOutput(other.kind_name())),
        }
    }

    pub async fn analyze(&self, bytes: Vec<u8>) -> Result<QualityMetrics, WorkerError> {
        match self.submit(TaskKind::Analyze, bytes).await? {
            TaskOutput::Analysis(metrics) => Ok(metrics),
            other => Err(WorkerError::UnexpectedOutput(other.kind_name())),
        }
    }

    /// Close every inbound channel and wait for all threads to exit.
    pub fn shutdown(mut self) {
        self.senders.clear();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("Worker thread exited with a panic");
            }
        }
        if let Some(router) = self.router.take() {
            if router.join().is_err() {
                log::warn!("Router thread exited with a panic");
            }
        }
    }

    /// Register a waiter and post the task. Returns the correlation id and the
    /// index of the worker it was routed to.
    fn dispatch(
        &self,
        kind: TaskKind,
        bytes: Vec<u8>,
    ) -> Result<(u64, usize, oneshot::Receiver<Result<TaskOutput, WorkerError>>), WorkerError>
    {
        if self.senders.is_empty() {
            return Err(WorkerError::Unavailable);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let worker = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        let (tx, rx) = oneshot::channel();

        // Registered before posting so a fast reply always finds its waiter.
        lock_pending(&self.pending).insert(id, tx);

        if self.senders[worker]
            .send(TaskMessage { id, kind, bytes })
            .is_err()
        {
            lock_pending(&self.pending).remove(&id);
            return Err(WorkerError::Unavailable);
        }

        log::trace!("Task {} ({:?}) routed to worker {}", id, kind, worker);
        Ok((id, worker, rx))
    }
}

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, Waiter>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_worker(
    index: usize,
    mode: FingerprintMode,
    inbox: Receiver<TaskMessage>,
    replies: Sender<TaskReply>,
) {
    let fingerprinter = Fingerprinter::new(mode);

    while let Ok(task) = inbox.recv() {
        let result = guarded(|| execute(&fingerprinter, task.kind, &task.bytes));
        if replies.send(TaskReply { id: task.id, result }).is_err() {
            break;
        }
    }

    log::debug!("Worker {} stopped", index);
}

fn execute(
    fingerprinter: &Fingerprinter,
    kind: TaskKind,
    bytes: &[u8],
) -> Result<TaskOutput, WorkerError> {
    match kind {
        TaskKind::Analyze => analysis::analyze_bytes(bytes)
            .map(TaskOutput::Analysis)
            .map_err(|e| WorkerError::Analysis(e.to_string())),
        TaskKind::Hash => fingerprinter
            .fingerprint(bytes)
            .map(TaskOutput::Fingerprint)
            .map_err(|e| WorkerError::Hash(e.to_string())),
    }
}

/// Run a task, turning a panic into a rejected result for that task only.
fn guarded<F>(task: F) -> Result<TaskOutput, WorkerError>
where
    F: FnOnce() -> Result<TaskOutput, WorkerError>,
{
    panic::catch_unwind(AssertUnwindSafe(task))
        .unwrap_or_else(|payload| Err(WorkerError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_router(replies: Receiver<TaskReply>, pending: PendingMap) {
    while let Ok(reply) = replies.recv() {
        route_reply(&pending, reply);
    }
    log::debug!("Reply router stopped");
}

/// Deliver a reply to its waiter. Replies for unknown or already-completed
/// ids are dropped; returns whether the reply was delivered.
fn route_reply(pending: &PendingMap, reply: TaskReply) -> bool {
    let waiter = lock_pending(pending).remove(&reply.id);
    match waiter {
        Some(waiter) => {
            // The caller may have stopped waiting; nothing else to do then.
            let _ = waiter.send(reply.result);
            true
        }
        None => {
            log::warn!("Discarding reply for unknown or completed task {}", reply.id);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::content_fingerprint;
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    fn create_test_png(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let intensity = ((x * 3 + y) % 256) as u8;
            Rgb([intensity, intensity, intensity])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_hash_matches_content_fingerprint() {
        let pool = WorkerPool::new(2, FingerprintMode::ContentDigest).unwrap();
        let fingerprint = pool.hash(b"roof photo".to_vec()).await.unwrap();
        assert_eq!(fingerprint, content_fingerprint(b"roof photo"));
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_analyze_real_image() {
        let pool = WorkerPool::new(1, FingerprintMode::ContentDigest).unwrap();
        let metrics = pool.analyze(create_test_png(200, 150)).await.unwrap();
        assert!(metrics.brightness > 0.0);
        assert!(metrics.sharpness >= 0.0);
    }

    #[tokio::test]
    async fn test_malformed_image_does_not_kill_worker() {
        let pool = WorkerPool::new(1, FingerprintMode::ContentDigest).unwrap();

        let failed = pool.analyze(b"not an image".to_vec()).await;
        assert!(matches!(failed, Err(WorkerError::Analysis(_))));

        // Same single worker keeps serving.
        assert!(pool.hash(b"next".to_vec()).await.is_ok());
        assert!(pool.analyze(create_test_png(32, 32)).await.is_ok());
    }

    #[tokio::test]
    async fn test_perceptual_hash_failure_is_rejected() {
        let pool = WorkerPool::new(2, FingerprintMode::Perceptual).unwrap();
        let result = pool.hash(b"garbage".to_vec()).await;
        assert!(matches!(result, Err(WorkerError::Hash(_))));
    }

    #[test]
    fn test_dispatch_round_robin_with_increasing_ids() {
        let pool = WorkerPool::new(2, FingerprintMode::ContentDigest).unwrap();

        let (id1, w1, _r1) = pool.dispatch(TaskKind::Hash, b"a".to_vec()).unwrap();
        let (id2, w2, _r2) = pool.dispatch(TaskKind::Hash, b"b".to_vec()).unwrap();
        let (id3, w3, _r3) = pool.dispatch(TaskKind::Hash, b"c".to_vec()).unwrap();

        assert!(id1 < id2 && id2 < id3);
        assert_eq!((w1, w2, w3), (0, 1, 0));
    }

    #[test]
    fn test_worker_executes_in_posting_order() {
        let (task_tx, task_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        let posted = [5u64, 2, 9, 4, 7];
        for id in posted {
            task_tx
                .send(TaskMessage {
                    id,
                    kind: TaskKind::Hash,
                    bytes: id.to_string().into_bytes(),
                })
                .unwrap();
        }
        drop(task_tx);

        // Returns once the inbox is closed and drained.
        run_worker(0, FingerprintMode::ContentDigest, task_rx, reply_tx);

        let replies: Vec<TaskReply> = reply_rx.iter().collect();
        let order: Vec<u64> = replies.iter().map(|r| r.id).collect();
        assert_eq!(order, posted);
        for reply in replies {
            assert_eq!(
                reply.result,
                Ok(TaskOutput::Fingerprint(content_fingerprint(
                    reply.id.to_string().as_bytes()
                )))
            );
        }
    }

    #[tokio::test]
    async fn test_single_worker_finishes_earlier_tasks_first() {
        let pool = WorkerPool::new(1, FingerprintMode::ContentDigest).unwrap();

        // A slow decode first, then cheap hashes, all posted before any await.
        let mut receivers = vec![pool.dispatch(TaskKind::Analyze, create_test_png(1200, 900)).unwrap().2];
        for i in 0..5 {
            let (_, worker, rx) = pool
                .dispatch(TaskKind::Hash, format!("frame-{}", i).into_bytes())
                .unwrap();
            assert_eq!(worker, 0);
            receivers.push(rx);
        }

        let last = receivers.pop().unwrap();
        assert!(last.await.unwrap().is_ok());

        // Every earlier reply was routed before the last one.
        for mut rx in receivers {
            assert!(rx.try_recv().unwrap().is_ok());
        }
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_concurrent_submissions_are_correlated() {
        let pool = Arc::new(WorkerPool::new(2, FingerprintMode::ContentDigest).unwrap());

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let bytes = format!("image-{}", i).into_bytes();
                    let fingerprint = pool.hash(bytes.clone()).await.unwrap();
                    (bytes, fingerprint)
                })
            })
            .collect();

        for handle in handles {
            let (bytes, fingerprint) = handle.await.unwrap();
            assert_eq!(fingerprint, content_fingerprint(&bytes));
        }
    }

    #[test]
    fn test_router_discards_unknown_and_duplicate_replies() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        lock_pending(&pending).insert(7, tx);

        let reply = |id| TaskReply {
            id,
            result: Ok(TaskOutput::Fingerprint(Fingerprint("0000000000000000".to_string()))),
        };

        assert!(!route_reply(&pending, reply(99)));
        assert!(route_reply(&pending, reply(7)));
        assert!(!route_reply(&pending, reply(7)));

        let delivered = rx.try_recv().unwrap().unwrap();
        assert_eq!(
            delivered,
            TaskOutput::Fingerprint(Fingerprint("0000000000000000".to_string()))
        );
    }

    #[test]
    fn test_panicking_task_is_rejected() {
        let result = guarded(|| panic!("decoder blew up"));
        assert_eq!(result, Err(WorkerError::Panicked("decoder blew up".to_string())));
    }

    #[tokio::test]
    async fn test_zero_size_pool_uses_one_worker() {
        let pool = WorkerPool::new(0, FingerprintMode::ContentDigest).unwrap();
        assert_eq!(pool.worker_count(), 1);
        assert!(pool.hash(b"x".to_vec()).await.is_ok());
    }
}
