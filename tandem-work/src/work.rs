use core::sync::atomic::{AtomicU8, Ordering};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

use crate::context::Shared;
use crate::error::WorkError;

pub(crate) type Action = Box<dyn FnOnce() + Send + 'static>;

const CREATED: u8 = 0;
const QUEUED: u8 = 1;
const COMPLETED: u8 = 2;

/// The scheduled part of a work item, shared between its handle and the
/// queue.
pub(crate) struct WorkItem {
    action: Mutex<Option<Action>>,
    exclusive: bool,
    state: AtomicU8,
    error: Mutex<Option<WorkError>>,
}

impl WorkItem {
    pub(crate) fn new(action: Action, exclusive: bool) -> Self {
        Self {
            action: Mutex::new(Some(action)),
            exclusive,
            state: AtomicU8::new(CREATED),
            error: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    #[inline]
    pub(crate) fn is_completed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == COMPLETED
    }

    fn mark_queued(&self) -> bool {
        self.state
            .compare_exchange(CREATED, QUEUED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_started(&self) -> bool {
        self.state.load(Ordering::Acquire) != CREATED
    }

    /// Runs the action once, recording a panic as the item's error.
    pub(crate) fn run(&self) {
        let action = self.action.lock().take();
        if let Some(action) = action {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
                let message = panic_message(payload.as_ref());
                warn!(%message, exclusive = self.exclusive, "work item panicked");
                self.complete(Some(WorkError::Panicked(message)));
                return;
            }
        }
        self.complete(None);
    }

    /// Completes the item without running it.
    pub(crate) fn abandon(&self) {
        self.action.lock().take();
        self.complete(Some(WorkError::Disposed));
    }

    fn complete(&self, error: Option<WorkError>) {
        if error.is_some() {
            *self.error.lock() = error;
        }
        self.state.store(COMPLETED, Ordering::SeqCst);
    }

    pub(crate) fn error(&self) -> Option<WorkError> {
        self.error.lock().clone()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A unit of work created by [`WorkContext::add_work`].
///
/// The item does nothing until [`start`](Work::start)ed. Handles are cheap
/// to clone; every clone refers to the same item.
///
/// [`WorkContext::add_work`]: crate::WorkContext::add_work
#[derive(Clone)]
pub struct Work {
    item: Arc<WorkItem>,
    context: Arc<Shared>,
}

impl Work {
    pub(crate) fn new(item: Arc<WorkItem>, context: Arc<Shared>) -> Self {
        Self { item, context }
    }

    /// Schedules the item on its context.
    pub fn start(&self) -> Result<(), WorkError> {
        if self.context.is_disposed() {
            return Err(WorkError::Disposed);
        }
        if !self.item.mark_queued() {
            return Err(WorkError::AlreadyStarted);
        }
        self.context.schedule(Arc::clone(&self.item))
    }

    /// Blocks until the item has completed, running other queued items on
    /// this thread in the meantime.
    ///
    /// Returns the error captured from the action, or
    /// [`WorkError::Disposed`] if the context shut down first.
    pub fn wait(&self) -> Result<(), WorkError> {
        if !self.item.is_started() {
            return Err(WorkError::NotStarted);
        }
        self.context.help_until(&self.item)?;
        match self.item.error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Returns `true` once the action has run, or the item was abandoned on
    /// dispose.
    pub fn is_completed(&self) -> bool {
        self.item.is_completed()
    }

    /// Returns `true` if the item runs with no other item in flight.
    pub fn is_exclusive(&self) -> bool {
        self.item.is_exclusive()
    }

    /// The error captured when the item completed, if any.
    pub fn error(&self) -> Option<WorkError> {
        self.item.error()
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("exclusive", &self.item.exclusive)
            .field("state", &self.item.state.load(Ordering::Relaxed))
            .finish()
    }
}
