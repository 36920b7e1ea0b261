//! # Writer Pipeline
//!
//! Disk writes from every file and swap backend in a process go through one
//! FIFO queue drained by a single background thread, so callers never block
//! on I/O unless the queue is full.
//!
//! ## Design Overview
//!
//! ```text
//! set(key) ──┐                                       ┌──► pwrite / memcpy
//! flush()  ──┼──► FIFO (bounded by bytes) ──► writer ┼──► ftruncate + remap
//! void()   ──┘        ▲        ▲                     └──► fsync
//!                     │        └── get(key): copy out of a queued or
//!                     │            in-progress write
//!                     └── set(key) again: overwrite the queued payload
//! ```
//!
//! ## Guarantees
//!
//! - Operations for one target are applied in the order they were queued.
//! - A `get` issued after a `set` sees the new bytes even if they are still in
//!   the queue ([`WriterPipeline::read_pending`]).
//! - Rewriting a tile whose write is still queued replaces the queued payload
//!   instead of adding a second write ([`WriterPipeline::coalesce`]).
//! - [`WriterPipeline::enqueue`] blocks while the queued payload bytes exceed
//!   the configured limit.
//! - Dropping the pipeline drains the queue before the thread exits.
//!
//! ## Locking Model
//!
//! One mutex guards the queue, the in-progress record and per-target counters.
//! The writer thread releases it while doing I/O and never takes a backend
//! lock, so backends may enqueue while holding their own state lock.
//!
//! ## Failures
//!
//! The writer cannot return an error to whoever queued an operation. Failures
//! are logged and recorded per target; the owning backend collects them with
//! [`WriterPipeline::take_failures`] and applies its `IoFailurePolicy`.

mod target;

pub use target::{QueuedOp, TargetId, WriteHandle, WriteOp, WriteTarget};

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::config::QUEUE_ENTRY_OVERHEAD;
use crate::error::WriteFailure;

struct TargetState {
    target: Arc<dyn WriteTarget>,
    pending: usize,
    failures: Vec<WriteFailure>,
}

struct InProgress {
    handle: WriteHandle,
    data: Arc<Vec<u8>>,
}

struct QueueState {
    order: VecDeque<WriteHandle>,
    queued: HashMap<WriteHandle, QueuedOp>,
    in_progress: Option<InProgress>,
    targets: HashMap<TargetId, TargetState>,
    queued_bytes: usize,
    next_handle: u64,
    next_target: u64,
    shutdown: bool,
}

impl QueueState {
    fn entry_cost(op: &QueuedOp) -> usize {
        op.op.payload_len() + QUEUE_ENTRY_OVERHEAD
    }

    fn settle(&mut self, target: TargetId, cost: usize) {
        self.queued_bytes -= cost;
        if let Some(state) = self.targets.get_mut(&target) {
            state.pending -= 1;
        }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    queue_not_empty: Condvar,
    queue_below_limit: Condvar,
    op_done: Condvar,
    size_limit: usize,
}

/// Handle to the background writer. Shared by every backend of a
/// [`TileContext`](crate::context::TileContext).
pub struct WriterPipeline {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl WriterPipeline {
    /// Starts the writer thread. `size_limit` bounds the queued payload bytes.
    pub fn new(size_limit: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                order: VecDeque::with_capacity(64),
                queued: HashMap::new(),
                in_progress: None,
                targets: HashMap::new(),
                queued_bytes: 0,
                next_handle: 1,
                next_target: 1,
                shutdown: false,
            }),
            queue_not_empty: Condvar::new(),
            queue_below_limit: Condvar::new(),
            op_done: Condvar::new(),
            size_limit,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("tile-writer".into())
            .spawn(move || writer_loop(&worker_shared))
            .wrap_err("failed to spawn tile writer thread")?;

        debug!(size_limit, "tile writer started");

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn register(&self, target: Arc<dyn WriteTarget>) -> TargetId {
        let mut state = self.shared.state.lock();
        let id = TargetId(state.next_target);
        state.next_target += 1;
        trace!(target_id = id.0, path = %target.path().display(), "registered write target");
        state.targets.insert(
            id,
            TargetState {
                target,
                pending: 0,
                failures: Vec::new(),
            },
        );
        id
    }

    /// Waits for the target's operations and forgets it.
    pub fn unregister(&self, target: TargetId) {
        self.finish_writing(target);
        let mut state = self.shared.state.lock();
        if let Some(removed) = state.targets.remove(&target) {
            for failure in removed.failures {
                warn!(
                    path = %removed.target.path().display(),
                    offset = failure.offset,
                    error = %failure.message,
                    "unreported write failure at close"
                );
            }
        }
    }

    /// Appends an operation, blocking while the queue is over its byte limit.
    pub fn enqueue(&self, op: QueuedOp) -> WriteHandle {
        let mut state = self.shared.state.lock();

        while state.queued_bytes > self.shared.size_limit {
            self.shared.queue_below_limit.wait(&mut state);
        }

        let handle = WriteHandle(state.next_handle);
        state.next_handle += 1;
        state.queued_bytes += QueueState::entry_cost(&op);
        if let Some(target) = state.targets.get_mut(&op.target) {
            target.pending += 1;
        }
        state.order.push_back(handle);
        state.queued.insert(handle, op);

        self.shared.queue_not_empty.notify_one();
        handle
    }

    /// Replaces the payload of a still-queued write of the same length.
    ///
    /// Returns false if the write already started or finished; the caller must
    /// queue a new one.
    pub fn coalesce(&self, handle: WriteHandle, data: &[u8]) -> bool {
        let mut state = self.shared.state.lock();
        match state.queued.get_mut(&handle) {
            Some(QueuedOp {
                op: WriteOp::Write { data: queued, .. },
                ..
            }) if queued.len() == data.len() => {
                queued.copy_from_slice(data);
                true
            }
            _ => false,
        }
    }

    /// Drops a queued operation. Returns false if it already started.
    pub fn cancel(&self, handle: WriteHandle) -> bool {
        let mut state = self.shared.state.lock();
        let Some(op) = state.queued.remove(&handle) else {
            return false;
        };
        let cost = QueueState::entry_cost(&op);
        state.settle(op.target, cost);
        drop(state);

        self.shared.queue_below_limit.notify_all();
        self.shared.op_done.notify_all();
        true
    }

    /// Copies the payload of a queued or in-progress write into `dest`.
    pub fn read_pending(&self, handle: WriteHandle, dest: &mut [u8]) -> bool {
        let state = self.shared.state.lock();

        if let Some(QueuedOp {
            op: WriteOp::Write { data, .. },
            ..
        }) = state.queued.get(&handle)
        {
            let len = data.len().min(dest.len());
            dest[..len].copy_from_slice(&data[..len]);
            return true;
        }

        match &state.in_progress {
            Some(current) if current.handle == handle => {
                let len = current.data.len().min(dest.len());
                dest[..len].copy_from_slice(&current.data[..len]);
                true
            }
            _ => false,
        }
    }

    /// True if `handle` has not completed yet.
    pub fn is_pending(&self, handle: WriteHandle) -> bool {
        let state = self.shared.state.lock();
        state.queued.contains_key(&handle)
            || state
                .in_progress
                .as_ref()
                .is_some_and(|current| current.handle == handle)
    }

    /// Blocks until every operation queued for `target` has been performed.
    pub fn finish_writing(&self, target: TargetId) {
        let mut state = self.shared.state.lock();
        while state.targets.get(&target).is_some_and(|t| t.pending > 0) {
            self.shared.op_done.wait(&mut state);
        }
    }

    pub fn is_idle(&self, target: TargetId) -> bool {
        let state = self.shared.state.lock();
        state.targets.get(&target).map_or(true, |t| t.pending == 0)
    }

    pub fn take_failures(&self, target: TargetId) -> Vec<WriteFailure> {
        let mut state = self.shared.state.lock();
        state
            .targets
            .get_mut(&target)
            .map(|t| std::mem::take(&mut t.failures))
            .unwrap_or_default()
    }

    pub fn queued_bytes(&self) -> usize {
        self.shared.state.lock().queued_bytes
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queued.len()
    }
}

impl Drop for WriterPipeline {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.queue_not_empty.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("tile writer thread panicked");
            }
        }
        debug!("tile writer stopped");
    }
}

fn writer_loop(shared: &Shared) {
    loop {
        let mut state = shared.state.lock();

        let (handle, op) = loop {
            match state.order.pop_front() {
                Some(handle) => {
                    // Cancelled entries leave their handle behind in `order`.
                    if let Some(op) = state.queued.remove(&handle) {
                        break (handle, op);
                    }
                }
                None if state.shutdown => return,
                None => shared.queue_not_empty.wait(&mut state),
            }
        };

        let cost = QueueState::entry_cost(&op);
        let QueuedOp { target, key, op } = op;
        let offset = op.offset();
        let sink = state.targets.get(&target).map(|t| Arc::clone(&t.target));

        let payload = match op {
            WriteOp::Write { data, .. } => {
                let data = Arc::new(data);
                state.in_progress = Some(InProgress {
                    handle,
                    data: Arc::clone(&data),
                });
                Some(data)
            }
            other => {
                drop(state);
                let result = match (&sink, other) {
                    (Some(sink), WriteOp::Truncate { len }) => sink.truncate(len),
                    (Some(sink), WriteOp::Sync) => sink.sync(),
                    _ => Ok(()),
                };
                finish_op(shared, target, key, offset, cost, sink.as_deref(), result);
                continue;
            }
        };
        drop(state);

        let result = match (&sink, &payload) {
            (Some(sink), Some(data)) => sink.write_at(offset, data),
            _ => Ok(()),
        };
        finish_op(shared, target, key, offset, cost, sink.as_deref(), result);
    }
}

fn finish_op(
    shared: &Shared,
    target: TargetId,
    key: Option<crate::tile::TileKey>,
    offset: u64,
    cost: usize,
    sink: Option<&dyn WriteTarget>,
    result: Result<()>,
) {
    let mut state = shared.state.lock();
    state.in_progress = None;
    state.settle(target, cost);

    if let Err(err) = result {
        warn!(
            path = %sink.map(|s| s.path().display().to_string()).unwrap_or_default(),
            offset,
            tile = ?key,
            error = %err,
            "background tile write failed"
        );
        if let Some(t) = state.targets.get_mut(&target) {
            t.failures.push(WriteFailure {
                key,
                offset,
                message: format!("{:#}", err),
            });
        }
    }
    drop(state);

    shared.queue_below_limit.notify_all();
    shared.op_done.notify_all();
}
