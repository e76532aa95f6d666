//! Work context: queue, dedicated workers and the exclusive-work gate.
//!
//! Items are queued on a [`GrowQueue`]. A context either owns a bounded set
//! of dedicated worker threads, spawned lazily as work arrives, or hands each
//! started item to the rayon global pool.
//!
//! Every running item is counted in `executing`. An exclusive item raises the
//! pause flag, which holds back new non-exclusive items at the gate, and then
//! waits until it is the only item counted before its action runs. A thread
//! that pops an item while the gate is closed does not keep it: the item goes
//! to the `held` queue, where the exclusive item's thread runs it inline if it
//! waits on it.

use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tandem_queue::{GrowQueue, QueueOptions, DEFAULT_CAPACITY};
use tracing::{debug, error, trace};

use crate::error::WorkError;
use crate::signal::{Completion, Signal};
use crate::work::{Work, WorkItem};

/// Longest a waiter blocks before checking the queue again.
const WAIT_SLICE: Duration = Duration::from_millis(10);

const HELD_CAPACITY: usize = 8;

thread_local! {
    /// Items running on this thread, innermost last: (context, exclusive).
    static RUNNING: RefCell<Vec<(usize, bool)>> = const { RefCell::new(Vec::new()) };
}

/// Marks an item as running on this thread until dropped.
struct RunningFrame;

impl RunningFrame {
    fn push(context: usize, exclusive: bool) -> Self {
        RUNNING.with(|running| running.borrow_mut().push((context, exclusive)));
        RunningFrame
    }
}

impl Drop for RunningFrame {
    fn drop(&mut self) {
        RUNNING.with(|running| {
            running.borrow_mut().pop();
        });
    }
}

/// State shared by a context, its workers and its work handles.
pub(crate) struct Shared {
    name: String,
    queue: GrowQueue<Arc<WorkItem>>,
    /// Items popped while the gate was closed.
    held: GrowQueue<Arc<WorkItem>>,
    dedicated: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    spawned: AtomicUsize,
    active: AtomicUsize,
    idle: AtomicUsize,
    executing: CachePadded<AtomicUsize>,
    paused: CachePadded<AtomicBool>,
    waiting: AtomicUsize,
    disposed: AtomicBool,
    wake: Signal,
    completion: Completion,
}

impl Shared {
    #[inline]
    fn id(&self) -> usize {
        self as *const Self as usize
    }

    #[inline]
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether this thread is inside an item of this context, and whether
    /// that item is exclusive.
    fn running_here(&self) -> Option<bool> {
        let id = self.id();
        RUNNING.with(|running| {
            running
                .borrow()
                .iter()
                .rev()
                .find(|(context, _)| *context == id)
                .map(|(_, exclusive)| *exclusive)
        })
    }

    /// Queues a started item and gets a thread to run it.
    pub(crate) fn schedule(self: &Arc<Self>, item: Arc<WorkItem>) -> Result<(), WorkError> {
        self.queue.push(item);
        if self.dedicated == 0 {
            let shared = Arc::clone(self);
            rayon::spawn(move || shared.run_one());
            return Ok(());
        }
        // Pairs with the fence in `worker_loop` between going idle and the
        // last queue check.
        fence(Ordering::SeqCst);
        if self.idle.load(Ordering::SeqCst) > 0 {
            self.wake.notify();
            return Ok(());
        }
        self.try_spawn_worker()
    }

    fn try_spawn_worker(self: &Arc<Self>) -> Result<(), WorkError> {
        let mut spawned = self.spawned.load(Ordering::Acquire);
        let index = loop {
            if spawned >= self.dedicated {
                return Ok(());
            }
            match self.spawned.compare_exchange_weak(
                spawned,
                spawned + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break spawned,
                Err(actual) => spawned = actual,
            }
        };

        let shared = Arc::clone(self);
        self.active.fetch_add(1, Ordering::AcqRel);
        let spawn = thread::Builder::new()
            .name(format!("{}-{}", self.name, index))
            .spawn(move || shared.worker_loop(index));
        match spawn {
            Ok(handle) => {
                self.workers.lock().push(handle);
                Ok(())
            }
            Err(e) => {
                self.active.fetch_sub(1, Ordering::AcqRel);
                self.spawned.fetch_sub(1, Ordering::AcqRel);
                error!(context = %self.name, index, error = %e, "failed to spawn worker");
                Err(WorkError::Spawn(e.to_string()))
            }
        }
    }

    fn worker_loop(self: Arc<Self>, index: usize) {
        debug!(context = %self.name, index, "worker started");
        let backoff = Backoff::new();
        while !self.is_disposed() {
            if let Some(item) = self.next_item() {
                if !self.execute(item) {
                    self.wait_unpaused();
                }
                backoff.reset();
                continue;
            }
            if !backoff.is_completed() {
                backoff.snooze();
                continue;
            }

            self.idle.fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            let awake = self.queue.is_empty()
                && self.held.is_empty()
                && !self.is_disposed()
                && self.wake.wait();
            self.idle.fetch_sub(1, Ordering::SeqCst);
            if !awake && self.is_disposed() {
                break;
            }
            backoff.reset();
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
        debug!(context = %self.name, index, "worker exited");
    }

    /// One drain step on the ambient pool.
    fn run_one(&self) {
        while !self.is_disposed() {
            let Some(item) = self.next_item() else {
                return;
            };
            if self.execute(item) {
                return;
            }
            self.wait_unpaused();
        }
    }

    /// Items handed back at the gate come first.
    #[inline]
    fn next_item(&self) -> Option<Arc<WorkItem>> {
        self.held.pop().or_else(|| self.queue.pop())
    }

    /// Runs `item`, or hands it back when the gate is closed. Returns
    /// `false` if the item was handed back.
    fn execute(&self, item: Arc<WorkItem>) -> bool {
        match self.running_here() {
            // Inside an exclusive item every other item runs inline.
            Some(true) => {
                let _frame = RunningFrame::push(self.id(), true);
                item.run();
            }
            _ if item.is_exclusive() => {
                if !self.try_run_exclusive(&item) {
                    self.hand_back(item);
                    return false;
                }
            }
            _ => {
                if !self.try_enter() {
                    self.hand_back(item);
                    return false;
                }
                {
                    let _frame = RunningFrame::push(self.id(), false);
                    item.run();
                }
                self.leave();
            }
        }
        self.notify_completed();
        true
    }

    /// Parks an item that met a closed gate where the exclusive item's
    /// thread can pick it up if it waits on it.
    fn hand_back(&self, item: Arc<WorkItem>) {
        trace!(context = %self.name, exclusive = item.is_exclusive(), "item held at gate");
        self.held.push(item);
        self.notify_completed();
    }

    fn wait_unpaused(&self) {
        let backoff = Backoff::new();
        while self.paused.load(Ordering::SeqCst) && !self.is_disposed() {
            backoff.snooze();
        }
    }

    fn try_run_exclusive(&self, item: &WorkItem) -> bool {
        if self
            .paused
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.executing.fetch_add(1, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.executing.load(Ordering::SeqCst) != 1 {
            backoff.snooze();
        }
        trace!(context = %self.name, "exclusive item running");
        {
            let _frame = RunningFrame::push(self.id(), true);
            item.run();
        }
        self.executing.fetch_sub(1, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        true
    }

    /// Counts this thread as executing unless a pause is requested.
    fn try_enter(&self) -> bool {
        if self.paused.load(Ordering::SeqCst) {
            return false;
        }
        self.executing.fetch_add(1, Ordering::SeqCst);
        if !self.paused.load(Ordering::SeqCst) {
            return true;
        }
        self.executing.fetch_sub(1, Ordering::SeqCst);
        false
    }

    /// Counts this thread as executing, waiting out any pause.
    fn enter(&self) {
        while !self.try_enter() {
            self.wait_unpaused();
        }
    }

    #[inline]
    fn leave(&self) {
        self.executing.fetch_sub(1, Ordering::SeqCst);
    }

    fn notify_completed(&self) {
        if self.waiting.load(Ordering::SeqCst) > 0 {
            self.completion.notify_all();
        }
    }

    /// Runs queued items on this thread until `item` completes.
    pub(crate) fn help_until(&self, item: &WorkItem) -> Result<(), WorkError> {
        // A non-exclusive item waiting on another gives up its count so an
        // exclusive item can still reach quiescence.
        let shared_item = self.running_here() == Some(false);
        if shared_item {
            self.leave();
        }
        let result = self.drain_until(item);
        if shared_item {
            self.enter();
        }
        result
    }

    fn drain_until(&self, item: &WorkItem) -> Result<(), WorkError> {
        let backoff = Backoff::new();
        loop {
            if item.is_completed() {
                return Ok(());
            }
            if self.is_disposed() {
                return Err(WorkError::Disposed);
            }
            if let Some(next) = self.next_item() {
                if self.execute(next) {
                    backoff.reset();
                } else {
                    backoff.snooze();
                }
                continue;
            }
            if !backoff.is_completed() {
                backoff.snooze();
                continue;
            }
            self.waiting.fetch_add(1, Ordering::SeqCst);
            self.completion
                .wait_for(|| item.is_completed() || self.is_disposed(), WAIT_SLICE);
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(context = %self.name, "disposing work context");
        self.wake.close();

        let current = thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(context = %self.name, "worker thread panicked");
            }
        }

        let mut abandoned = 0usize;
        while let Some(item) = self.next_item() {
            item.abandon();
            abandoned += 1;
        }
        if abandoned > 0 {
            debug!(context = %self.name, abandoned, "dropped pending work");
        }
        self.completion.notify_all();
    }
}

/// Builder for [`WorkContext`].
#[derive(Debug, Clone)]
pub struct WorkContextBuilder {
    name: Option<String>,
    dedicated_threads: usize,
    initial_capacity: usize,
}

impl Default for WorkContextBuilder {
    fn default() -> Self {
        Self {
            name: None,
            dedicated_threads: 0,
            initial_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl WorkContextBuilder {
    /// Name used in logs and as the worker thread name prefix.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Number of dedicated worker threads; zero runs on the rayon pool.
    pub fn dedicated_threads(mut self, threads: usize) -> Self {
        self.dedicated_threads = threads;
        self
    }

    /// Initial capacity of the pending-work queue.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Creates the context. No worker starts until work is started.
    pub fn build(self) -> Result<WorkContext, WorkError> {
        let queue = GrowQueue::with_options(QueueOptions {
            capacity: self.initial_capacity,
        })?;
        Ok(self.with_queue(queue))
    }

    fn with_queue(self, queue: GrowQueue<Arc<WorkItem>>) -> WorkContext {
        let name = self.name.unwrap_or_else(|| "tandem-work".to_string());
        debug!(context = %name, dedicated = self.dedicated_threads, "work context created");
        WorkContext {
            shared: Arc::new(Shared {
                name,
                queue,
                held: GrowQueue::with_capacity(HELD_CAPACITY),
                dedicated: self.dedicated_threads,
                workers: Mutex::new(Vec::with_capacity(self.dedicated_threads)),
                spawned: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                executing: CachePadded::new(AtomicUsize::new(0)),
                paused: CachePadded::new(AtomicBool::new(false)),
                waiting: AtomicUsize::new(0),
                disposed: AtomicBool::new(false),
                wake: Signal::new(),
                completion: Completion::new(),
            }),
        }
    }
}

/// A scheduler for [`Work`] items.
///
/// Dropping the context disposes it.
pub struct WorkContext {
    shared: Arc<Shared>,
}

impl Default for WorkContext {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkContext {
    /// Creates a context that runs work on the rayon global pool.
    pub fn new() -> Self {
        Self::builder().with_queue(GrowQueue::new())
    }

    /// Starts configuring a context.
    pub fn builder() -> WorkContextBuilder {
        WorkContextBuilder::default()
    }

    /// Wraps `action` in a work item. The item is not scheduled until
    /// [`Work::start`].
    pub fn add_work<F>(&self, action: F, exclusive: bool) -> Result<Work, WorkError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.is_disposed() {
            return Err(WorkError::Disposed);
        }
        let item = Arc::new(WorkItem::new(Box::new(action), exclusive));
        Ok(Work::new(item, Arc::clone(&self.shared)))
    }

    /// Adds and starts a work item.
    pub fn submit<F>(&self, action: F, exclusive: bool) -> Result<Work, WorkError>
    where
        F: FnOnce() + Send + 'static,
    {
        let work = self.add_work(action, exclusive)?;
        work.start()?;
        Ok(work)
    }

    /// The context name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Configured number of dedicated threads.
    pub fn dedicated_threads(&self) -> usize {
        self.shared.dedicated
    }

    /// Dedicated threads currently alive.
    pub fn active_threads(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Started items not yet picked up by a thread.
    pub fn pending(&self) -> usize {
        self.shared.queue.len() + self.shared.held.len()
    }

    /// Returns `true` once the context is disposed.
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Stops and joins the dedicated workers, abandons pending items and
    /// wakes every waiter. Idempotent.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

impl Drop for WorkContext {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl fmt::Debug for WorkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkContext")
            .field("name", &self.shared.name)
            .field("dedicated", &self.shared.dedicated)
            .field("active", &self.active_threads())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
