//! Cooperative resize protocol.
//!
//! Containers built on a fixed buffer grow by swapping in a buffer of double
//! capacity and draining the old one into it. No thread owns the resize: any
//! thread that observes a resize in flight advances it or helps copy.
//!
//! The protocol tracks four shared values:
//!
//! - `status`: the [`ResizeStatus`] machine,
//! - `revision`: bumped on every status transition, for optimistic readers,
//! - `working`: threads currently operating on the current buffer or copying,
//! - `cursor`: next index of the previous buffer to be claimed by a copier.
//!
//! Writers register in `working` through [`ResizeProtocol::enter`]. The swap
//! waits for `working` to reach zero, so no write can land in a buffer that is
//! about to become the previous one. Copiers also register in `working`; the
//! copier whose departure drops it to zero after every index was claimed
//! finalizes the resize.
//!
//! The thread that wins the swap runs with a raised priority until the copy
//! phase opens.
//!
//! Bucket types plug in through the [`Growable`] trait.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crossbeam_epoch::{self as epoch, Guard};
use crossbeam_utils::{Backoff, CachePadded};
use tracing::{debug, error};

use crate::error::Error;
use crate::priority::PriorityBoost;
use crate::status::{ResizeStatus, StatusCell};

/// A container whose buffer can be doubled by the resize protocol.
///
/// The protocol guarantees that `swap_buffers` runs with no writer inside the
/// current buffer, that every index in `0..len` is passed to `copy_index`
/// exactly once, and that `finish_copy` runs once after all copies returned.
pub trait Growable {
    /// Allocates a buffer of double capacity, publishes it as current and
    /// keeps the old one as previous.
    ///
    /// Returns the number of indices the copy phase has to visit.
    fn swap_buffers(&self, guard: &Guard) -> Result<usize, Error>;

    /// Moves the entry at `index` of the previous buffer into the current one.
    fn copy_index(&self, index: usize, guard: &Guard);

    /// Fixes up the current buffer and releases the previous one.
    fn finish_copy(&self, guard: &Guard);
}

/// Shared state of the cooperative resize protocol.
pub struct ResizeProtocol {
    status: CachePadded<StatusCell>,
    revision: CachePadded<AtomicU64>,
    working: CachePadded<AtomicUsize>,
    cursor: CachePadded<AtomicUsize>,
    copy_len: AtomicUsize,
}

impl Default for ResizeProtocol {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration of a thread operating directly on the current buffer.
///
/// While any `Working` is alive the buffers cannot be swapped.
pub struct Working<'a> {
    protocol: &'a ResizeProtocol,
    revision: u64,
}

impl Working<'_> {
    /// Revision observed when entering.
    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

impl Drop for Working<'_> {
    #[inline]
    fn drop(&mut self) {
        self.protocol.working.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Puts the status back to `GrowRequested` unless disarmed.
struct AbortSwap<'a> {
    status: &'a StatusCell,
    armed: bool,
}

impl Drop for AbortSwap<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.status.abort_swap();
        }
    }
}

impl ResizeProtocol {
    /// Creates a protocol in the `Stable` state at revision zero.
    pub fn new() -> Self {
        Self {
            status: CachePadded::new(StatusCell::new()),
            revision: CachePadded::new(AtomicU64::new(0)),
            working: CachePadded::new(AtomicUsize::new(0)),
            cursor: CachePadded::new(AtomicUsize::new(0)),
            copy_len: AtomicUsize::new(0),
        }
    }

    /// Current status.
    #[inline]
    pub fn status(&self) -> ResizeStatus {
        self.status.load()
    }

    /// Current revision.
    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Number of threads registered as working.
    #[inline]
    pub fn working(&self) -> usize {
        self.working.load(Ordering::SeqCst)
    }

    #[inline]
    fn bump(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Registers the caller as a writer on the current buffer.
    ///
    /// Returns `None` when a resize is in flight; the caller should
    /// [`cooperate`](Self::cooperate) and retry.
    #[inline]
    pub fn enter(&self) -> Option<Working<'_>> {
        self.working.fetch_add(1, Ordering::SeqCst);
        let revision = self.revision();
        if self.status.is_stable() {
            Some(Working {
                protocol: self,
                revision,
            })
        } else {
            self.working.fetch_sub(1, Ordering::SeqCst);
            None
        }
    }

    /// Starts an optimistic read: the revision to validate against, or `None`
    /// if a resize is in flight.
    #[inline]
    pub fn snapshot(&self) -> Option<u64> {
        let revision = self.revision();
        self.status.is_stable().then_some(revision)
    }

    /// Returns `true` if nothing structural happened since `snapshot`.
    #[inline]
    pub fn validate(&self, revision: u64) -> bool {
        // Status first: a completed cycle leaves `Stable` but its first bump
        // is already visible by then.
        self.status.is_stable() && self.revision() == revision
    }

    /// Asks for a grow on behalf of a writer that ran out of probes.
    ///
    /// Ignored when the buffer the writer saw has already been replaced.
    pub fn request_grow(&self, revision: u64) -> bool {
        if self.revision() != revision {
            return false;
        }
        if self.status.request_grow() {
            let revision = self.bump();
            debug!(revision, "grow requested");
            true
        } else {
            false
        }
    }

    /// Performs one step of whatever resize is in flight.
    ///
    /// Returns immediately when the status is `Stable`.
    ///
    /// # Panics
    ///
    /// Panics on the thread performing the swap if the doubled buffer cannot
    /// be allocated. The status is restored to `GrowRequested` first, so
    /// another thread may retry.
    pub fn cooperate<G: Growable + ?Sized>(&self, target: &G, backoff: &Backoff) {
        let guard = epoch::pin();
        match self.status.load() {
            ResizeStatus::Stable => {}
            ResizeStatus::GrowRequested => {
                if !self.swap(target, &guard) {
                    backoff.snooze();
                }
            }
            ResizeStatus::Copying => self.help_copy(target, &guard),
            ResizeStatus::SwappingTables | ResizeStatus::Finalizing => backoff.snooze(),
        }
    }

    fn swap<G: Growable + ?Sized>(&self, target: &G, guard: &Guard) -> bool {
        if !self.status.begin_swap() {
            return false;
        }
        self.bump();
        let boost = PriorityBoost::raise();
        let mut abort = AbortSwap {
            status: &self.status,
            armed: true,
        };

        let backoff = Backoff::new();
        while self.working.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }

        let len = match target.swap_buffers(guard) {
            Ok(len) => len,
            Err(err) => {
                error!(%err, "unable to grow buffer");
                drop(abort);
                self.bump();
                panic!("tandem: {err}");
            }
        };

        self.cursor.store(0, Ordering::SeqCst);
        self.copy_len.store(len, Ordering::SeqCst);
        abort.armed = false;
        self.status.begin_copy();
        let revision = self.bump();
        drop(boost);
        debug!(revision, len, "buffers swapped, copying");

        self.help_copy(target, guard);
        true
    }

    fn help_copy<G: Growable + ?Sized>(&self, target: &G, guard: &Guard) {
        let revision = self.revision();
        self.working.fetch_add(1, Ordering::SeqCst);
        let mut joined = None;
        if self.status.load() == ResizeStatus::Copying && self.revision() == revision {
            joined = Some(revision);
            let len = self.copy_len.load(Ordering::SeqCst);
            loop {
                let index = self.cursor.fetch_add(1, Ordering::SeqCst);
                if index >= len {
                    break;
                }
                target.copy_index(index, guard);
            }
        }
        self.leave_copy(joined, target, guard);
    }

    /// Deregisters a copier. The last one out finalizes, but only for the
    /// copy cycle it joined; a copier that joined none checks the current one.
    fn leave_copy<G: Growable + ?Sized>(
        &self,
        joined: Option<u64>,
        target: &G,
        guard: &Guard,
    ) {
        if self.working.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let cycle = joined.unwrap_or_else(|| self.revision());
        let drained = self.cursor.load(Ordering::SeqCst) >= self.copy_len.load(Ordering::SeqCst);
        if drained && self.revision() == cycle {
            self.finalize(target, guard);
        }
    }

    fn finalize<G: Growable + ?Sized>(&self, target: &G, guard: &Guard) {
        if !self.status.begin_finalize() {
            return;
        }
        self.bump();
        target.finish_copy(guard);
        self.status.finish();
        let revision = self.bump();
        debug!(revision, "resize finalized");
    }
}
