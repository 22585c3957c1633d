//! The coordinating context that all cell mutation runs on.
//!
//! A [`MainContext`] names one thread and owns a task queue that any thread may
//! post into. The owning thread drains the queue with
//! [`MainContext::run_pending`], typically once per turn of its event loop.

use crate::error::CellError;
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

type Task = Box<dyn FnOnce() + Send>;

struct ContextInner {
    thread: ThreadId,
    tx: mpsc::UnboundedSender<Task>,
    rx: Mutex<mpsc::UnboundedReceiver<Task>>,
    queued: AtomicUsize,
}

/// Handle to a coordinating context.
///
/// Cloning the handle is cheap and all clones refer to the same queue. The
/// handle is `Send + Sync`, so worker threads can hold one to post tasks back.
#[derive(Clone)]
pub struct MainContext {
    inner: Arc<ContextInner>,
}

thread_local! {
    static CURRENT: MainContext = MainContext::for_current_thread();
}

impl MainContext {
    fn for_current_thread() -> Self {
        // The channel never closes: both ends live in the same allocation.
        let (tx, rx) = mpsc::unbounded::<Task>();
        Self {
            inner: Arc::new(ContextInner {
                thread: thread::current().id(),
                tx,
                rx: Mutex::new(rx),
                queued: AtomicUsize::new(0),
            }),
        }
    }

    /// The context of the calling thread, created on first use.
    pub fn current() -> Self {
        CURRENT.with(|ctx| ctx.clone())
    }

    /// Whether the calling thread is this context's thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread
    }

    /// Fail with [`CellError::OffContextMutation`] unless called on this context.
    pub fn ensure_current(&self, operation: &'static str) -> Result<(), CellError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(CellError::OffContextMutation { operation })
        }
    }

    /// Queue a task to run on this context. May be called from any thread.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.queued.fetch_add(1, Ordering::AcqRel);
        if self.inner.tx.unbounded_send(Box::new(task)).is_err() {
            self.inner.queued.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!("Task queue closed, dropping posted task");
        }
    }

    /// Number of posted tasks that have not run yet.
    pub fn pending_tasks(&self) -> usize {
        self.inner.queued.load(Ordering::Acquire)
    }

    /// Run queued tasks until the queue is empty.
    ///
    /// Tasks posted while draining run in the same call. Returns how many
    /// tasks ran.
    pub fn run_pending(&self) -> Result<usize, CellError> {
        self.ensure_current("run_pending")?;
        let mut ran = 0;
        while let Some(task) = self.next_task() {
            task();
            ran += 1;
        }
        if ran > 0 {
            tracing::trace!(ran, "drained coordinating context queue");
        }
        Ok(ran)
    }

    // `try_recv` replaces `try_next` only in newer futures-channel releases.
    #[allow(deprecated)]
    fn next_task(&self) -> Option<Task> {
        // The receiver lock is released before the task runs so it can post.
        let task = self.inner.rx.lock().try_next().ok().flatten();
        if task.is_some() {
            self.inner.queued.fetch_sub(1, Ordering::AcqRel);
        }
        task
    }
}

impl PartialEq for MainContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MainContext {}

impl fmt::Debug for MainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainContext")
            .field("thread", &self.inner.thread)
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}
