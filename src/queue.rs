//! Single-lane operation queue.
//!
//! The frame's GATT link cannot have two requests outstanding, so every
//! exchange is submitted here and a single worker task runs them one at a
//! time, in submission order. Each job carries its own oneshot for the result,
//! so a failing job only fails its own caller.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{FrameError, Result};

type Job = BoxFuture<'static, ()>;

/// FIFO of async operations drained by one worker task.
pub struct OperationQueue {
    tx: mpsc::UnboundedSender<Job>,
    busy: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl OperationQueue {
    /// Spawns the worker on the current tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let busy = Arc::new(AtomicBool::new(false));
        let flag = busy.clone();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                flag.store(true, Ordering::SeqCst);
                // A panicking job drops its reply sender; the lane keeps going.
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!("queued operation panicked");
                }
                flag.store(false, Ordering::SeqCst);
            }
            debug!("operation queue drained and closed");
        });
        Self { tx, busy, worker }
    }

    /// Runs `op` after everything submitted before it has settled.
    pub async fn enqueue<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job = async move {
            let result = op().await;
            // the caller may have given up waiting
            let _ = reply.send(result);
        };
        self.tx
            .send(Box::pin(job))
            .map_err(|_| FrameError::QueueClosed)?;
        rx.await.map_err(|_| FrameError::QueueClosed)?
    }

    /// True while an operation is executing (not merely waiting). Advisory.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
