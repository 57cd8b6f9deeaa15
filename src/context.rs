//! # Execution Contexts: One Serial Queue per Store
//!
//! Every opened store is owned by exactly one [`ExecutionContext`]: a dedicated
//! thread that holds the store's connection and processes units of work one at
//! a time, in submission order.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     Callers (any thread)                             │
//! └───────────────┬──────────────────────────────────┬───────────────────┘
//!                 │ submit (fire-and-forget)         │ call (submit + wait)
//!                 ▼                                  ▼
//!        ┌──────────────────────────────────────────────────────┐
//!        │        channel of request values (enum per store)     │
//!        └──────────────────────────┬───────────────────────────┘
//!                                   ▼
//!                        ┌─────────────────────┐
//!                        │  context thread     │
//!                        │  Worker (owns conn) │──► SQLite
//!                        └─────────────────────┘
//! ```
//!
//! ## Why a Thread and Not a Lock?
//!
//! A single consumer gives linearizability for free: two operations on the
//! same store can never interleave, and there is no lock to forget. The two
//! stores have separate contexts and proceed independently.
//!
//! ## Units of Work Are Values
//!
//! A request is an enum variant carrying its inputs and, when the caller wants
//! an answer, a [`Reply`] sender. Nothing the worker runs captures caller
//! state, so the worker's fields are only ever touched by its own thread.
//!
//! ## One-Shot Background Contexts
//!
//! Heavy maintenance (memory-pressure prune, age expiry, the flush performed
//! inside an OS background grant) runs on a [`OneShot`] context: its own thread
//! with its own connection, so it does not queue behind normal traffic. A
//! [`RunGuard`] keeps two runs of the same task from overlapping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rusqlite::Transaction;

use crate::error::{Error, Result};

// =============================================================================
// Worker
// =============================================================================

/// State and behaviour living on a context thread.
pub trait Worker: Send + 'static {
    /// The unit of work this worker understands.
    type Request: Send + 'static;

    /// Runs one unit of work to completion.
    fn handle(&mut self, request: Self::Request);

    /// Called once after the last request, before the thread exits.
    fn finish(&mut self) {}
}

/// Sender half handed to a caller that waits for an answer.
pub type Reply<T> = Sender<Result<T>>;

enum Envelope<R> {
    Work(R),
    Stop,
}

/// Lets a worker queue follow-up work behind the requests already waiting.
pub struct Scheduler<R> {
    tx: Sender<Envelope<R>>,
}

impl<R> Clone for Scheduler<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<R> Scheduler<R> {
    /// Queues `request`; returns false if the context is stopping.
    pub fn schedule(&self, request: R) -> bool {
        self.tx.send(Envelope::Work(request)).is_ok()
    }
}

// =============================================================================
// Execution Context
// =============================================================================

/// A serial task queue bound to one store.
///
/// Dropping the context stops it after every already-submitted request has
/// run, then joins the thread.
pub struct ExecutionContext<R: Send + 'static> {
    name: String,
    tx: Sender<Envelope<R>>,
    thread: Option<JoinHandle<()>>,
}

impl<R: Send + 'static> ExecutionContext<R> {
    /// Spawns a context running `worker`.
    pub fn spawn<W>(name: &str, worker: W) -> Result<Self>
    where
        W: Worker<Request = R>,
    {
        Self::spawn_with(name, |_| worker)
    }

    /// Spawns a context whose worker needs a [`Scheduler`] for its own queue.
    pub fn spawn_with<W, F>(name: &str, build: F) -> Result<Self>
    where
        W: Worker<Request = R>,
        F: FnOnce(Scheduler<R>) -> W,
    {
        let (tx, rx) = mpsc::channel();
        let worker = build(Scheduler { tx: tx.clone() });

        let thread = thread::Builder::new()
            .name(format!("pulsestore-{name}"))
            .spawn(move || run_worker(worker, rx))
            .map_err(Error::Io)?;

        tracing::debug!(context = name, "execution context started");

        Ok(Self {
            name: name.to_string(),
            tx,
            thread: Some(thread),
        })
    }

    /// Name given at spawn time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A handle that queues work from other threads without owning the context.
    pub fn scheduler(&self) -> Scheduler<R> {
        Scheduler {
            tx: self.tx.clone(),
        }
    }

    /// Queues `request` without waiting for it to run.
    pub fn submit(&self, request: R) -> Result<()> {
        self.tx
            .send(Envelope::Work(request))
            .map_err(|_| Error::ContextClosed(self.name.clone()))
    }

    /// Queues a request carrying a [`Reply`] and blocks until it answers.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let count = context.call(|reply| QueueRequest::Count { reply })?;
    /// ```
    pub fn call<T>(&self, make: impl FnOnce(Reply<T>) -> R) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.submit(make(reply_tx))?;
        reply_rx
            .recv()
            .map_err(|_| Error::ContextClosed(self.name.clone()))?
    }

    /// Stops the context after queued work and waits for the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.tx.send(Envelope::Stop);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!(context = %self.name, "execution context thread panicked");
            }
        }
    }
}

impl<R: Send + 'static> Drop for ExecutionContext<R> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<W: Worker>(mut worker: W, rx: Receiver<Envelope<W::Request>>) {
    while let Ok(envelope) = rx.recv() {
        match envelope {
            Envelope::Work(request) => worker.handle(request),
            Envelope::Stop => break,
        }
    }
    worker.finish();
}

// =============================================================================
// One-Shot Background Contexts
// =============================================================================

/// Prevents overlapping runs of one kind of one-shot task.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    running: Arc<AtomicBool>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a run holds the guard.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Claims the guard; `None` if a run is already in progress.
    pub fn try_claim(&self) -> Option<RunClaim> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunClaim {
                running: Arc::clone(&self.running),
            })
    }
}

/// Releases its [`RunGuard`] when dropped, even if the task panics.
#[derive(Debug)]
pub struct RunClaim {
    running: Arc<AtomicBool>,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// A task running once on its own thread.
#[derive(Debug)]
pub struct OneShot<T> {
    name: String,
    handle: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> OneShot<T> {
    /// Starts `task` on a new thread named after `name`.
    pub fn spawn<F>(name: &str, task: F) -> Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("pulsestore-{name}"))
            .spawn(task)
            .map_err(Error::Io)?;
        Ok(Self {
            name: name.to_string(),
            handle,
        })
    }

    /// True once the task has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task and returns its result.
    pub fn join(self) -> Result<T> {
        self.handle
            .join()
            .map_err(|_| Error::ContextClosed(self.name))?
    }
}

// =============================================================================
// Saving
// =============================================================================

/// Commits `tx`, rolling back on failure.
///
/// The error is returned to the caller of the mutating operation. A full disk
/// gets its own log line first, since it calls for a different fix than any
/// other commit failure.
pub fn save(tx: Transaction<'_>, store: &str) -> Result<()> {
    match tx.commit() {
        Ok(()) => Ok(()),
        Err(e) => {
            // The failed transaction was dropped inside commit(), which rolls it
            // back; the connection is back at its last committed state.
            let err = Error::Sqlite(e);
            if err.is_disk_full() {
                tracing::error!(store, "save failed: disk is full, changes rolled back");
            } else {
                tracing::error!(store, error = %err, "save failed, changes rolled back");
            }
            Err(err)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
