//! Single-thread task queues for driver calls and buffer handling.
//!
//! Each [`Worker`] owns one named OS thread draining an unbounded channel,
//! so tasks on a worker run one at a time in submission order.
//! [`DualWorkerContext`] pairs a `device-ops` worker (every driver call)
//! with a `buffer-ops` worker (every image acquire/release) so a slow
//! driver call never delays buffer reclaim.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::camera::CameraError;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct WorkerInner {
    name: &'static str,
    /// `None` once shut down
    tx: Mutex<Option<Sender<Task>>>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
    done_rx: Mutex<Option<Receiver<()>>>,
}

/// Handle to a single-thread task queue. Clones share the same thread.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.inner.name)
            .field("is_shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Worker {
    /// Spawn the worker thread.
    pub fn spawn(name: &'static str) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // Ends once every sender is gone and the queue is empty.
                while let Ok(task) = rx.recv() {
                    task();
                }
                log::debug!("Worker '{}' drained and stopped", name);
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            inner: Arc::new(WorkerInner {
                name,
                tx: Mutex::new(Some(tx)),
                thread_id: handle.thread().id(),
                handle: Mutex::new(Some(handle)),
                done_rx: Mutex::new(Some(done_rx)),
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Queue a task. Never blocks.
    ///
    /// # Errors
    /// * `CameraError::WorkerShutDown` - If `shutdown()` has already been called
    pub fn submit<F>(&self, task: F) -> Result<(), CameraError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.inner.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let shut_down = CameraError::WorkerShutDown {
            worker: self.inner.name,
        };
        match guard.as_ref() {
            Some(tx) => tx.send(Box::new(task)).map_err(|_| shut_down),
            None => Err(shut_down),
        }
    }

    /// Queue a task, or run it on the calling thread if the worker no
    /// longer accepts work. Used for best-effort cleanup.
    pub fn submit_or_run<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task: Task = Box::new(task);
        let rejected = {
            let guard = self.inner.tx.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(tx) => tx.send(task).err().map(|e| e.0),
                None => Some(task),
            }
        };
        if let Some(task) = rejected {
            log::debug!("Worker '{}' is shut down, running task inline", self.inner.name);
            task();
        }
    }

    /// Whether the calling thread is this worker's thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Stop accepting tasks. Tasks already queued still run; a running task
    /// is never interrupted. Does not wait. Safe to call repeatedly and from
    /// the worker's own thread.
    pub fn shutdown(&self) {
        let tx = self
            .inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if tx.is_some() {
            log::debug!("Worker '{}' shutting down", self.inner.name);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Wait up to `timeout` for the thread to drain its queue and exit.
    ///
    /// Returns `true` if the thread has exited. Always `false` before
    /// `shutdown()` or when called from the worker itself.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        if !self.is_shut_down() || self.is_current() {
            return false;
        }
        let mut done = self
            .inner
            .done_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(rx) = done.as_ref() else {
            return true;
        };
        match rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                done.take();
                if let Some(handle) = self
                    .inner
                    .handle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                {
                    let _ = handle.join();
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

/// The two execution contexts used by a capture session.
#[derive(Debug, Clone)]
pub struct DualWorkerContext {
    device_ops: Worker,
    buffer_ops: Worker,
}

impl DualWorkerContext {
    pub const DEVICE_OPS: &'static str = "device-ops";
    pub const BUFFER_OPS: &'static str = "buffer-ops";

    /// Spawn both worker threads.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            device_ops: Worker::spawn(Self::DEVICE_OPS)?,
            buffer_ops: Worker::spawn(Self::BUFFER_OPS)?,
        })
    }

    /// Worker that serializes every driver call.
    pub fn device_ops(&self) -> &Worker {
        &self.device_ops
    }

    /// Worker that serializes buffer acquisition and release.
    pub fn buffer_ops(&self) -> &Worker {
        &self.buffer_ops
    }

    /// Safe-quit both workers. Idempotent.
    pub fn shutdown(&self) {
        self.device_ops.shutdown();
        self.buffer_ops.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.device_ops.is_shut_down() && self.buffer_ops.is_shut_down()
    }

    /// Wait for both threads to exit, each bounded by `timeout`.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let device = self.device_ops.await_termination(timeout);
        let buffer = self.buffer_ops.await_termination(timeout);
        device && buffer
    }
}
