//! Pull-based handoff between the admission queue and the execution backend.
//!
//! The queue pushes dispatched requests into an [`IoSink`]; the backend pulls
//! them out with [`IoSink::drain`] and resolves each claimed request through
//! its [`IoCompletion`]. Neither side looks at the other's internals.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::backend::IoBackend;
use crate::error::{QueueError, QueueResult};
use crate::request::IoRequest;

/// One-shot resolution slot shared by a request's cancellation reaction and
/// its completion. Whoever takes the sender first resolves the request.
pub(crate) type CompletionSlot = Rc<RefCell<Option<oneshot::Sender<QueueResult<usize>>>>>;

pub(crate) fn completion_slot() -> (CompletionSlot, oneshot::Receiver<QueueResult<usize>>) {
    let (tx, rx) = oneshot::channel();
    (Rc::new(RefCell::new(Some(tx))), rx)
}

/// Resolves `slot` with `result`. Returns false if it was already resolved.
pub(crate) fn resolve_slot(slot: &CompletionSlot, result: QueueResult<usize>) -> bool {
    let sender = slot.borrow_mut().take();
    match sender {
        Some(tx) => {
            // the caller may have dropped its handle; nothing to report then
            let _ = tx.send(result);
            true
        }
        None => false,
    }
}

/// Completion handle for one claimed request.
///
/// Consumed by [`complete_with`](Self::complete_with) or [`fail`](Self::fail).
/// Dropping a claimed completion without resolving it resolves the caller's
/// handle with [`QueueError::Abandoned`].
pub struct IoCompletion {
    slot: CompletionSlot,
}

impl IoCompletion {
    /// Resolves the request with the number of bytes transferred.
    pub fn complete_with(self, len: usize) {
        if !resolve_slot(&self.slot, Ok(len)) {
            warn!("I/O completion resolved twice; ignoring length {}", len);
        }
    }

    /// Resolves the request with a backend failure.
    pub fn fail(self, err: std::io::Error) {
        if !resolve_slot(&self.slot, Err(QueueError::Backend(err))) {
            warn!("I/O completion resolved twice; ignoring backend error");
        }
    }

    /// Resolves the request with an already-built outcome.
    pub fn resolve(self, result: std::io::Result<usize>) {
        match result {
            Ok(len) => self.complete_with(len),
            Err(err) => self.fail(err),
        }
    }

    /// Returns true once the request has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.slot.borrow().is_none()
    }
}

impl Drop for IoCompletion {
    fn drop(&mut self) {
        if Rc::strong_count(&self.slot) == 1 && !self.is_resolved() {
            warn!("I/O completion dropped without being resolved");
        }
    }
}

impl fmt::Debug for IoCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoCompletion")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

struct PendingIo {
    req: IoRequest,
    slot: CompletionSlot,
}

/// Queue of dispatched requests waiting for the backend.
#[derive(Default)]
pub struct IoSink {
    pending: RefCell<VecDeque<PendingIo>>,
    submitted: Cell<u64>,
    claimed: Cell<u64>,
    abandoned: Cell<u64>,
}

impl IoSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn submit(&self, req: IoRequest, slot: CompletionSlot) {
        self.pending.borrow_mut().push_back(PendingIo { req, slot });
        self.submitted.set(self.submitted.get() + 1);
    }

    /// Offers pending requests to `visitor` in dispatch order.
    ///
    /// Returning `true` claims the request: the visitor must eventually
    /// resolve the completion it was handed. Returning `false` leaves the
    /// request pending and stops the drain. Returns the number claimed.
    pub fn drain<F>(&self, mut visitor: F) -> usize
    where
        F: FnMut(&IoRequest, IoCompletion) -> bool,
    {
        let mut claimed = 0;
        loop {
            // released before the visitor runs, so it may dispatch more work
            let next = self.pending.borrow_mut().pop_front();
            let Some(item) = next else {
                break;
            };

            let completion = IoCompletion {
                slot: Rc::clone(&item.slot),
            };
            if visitor(&item.req, completion) {
                trace!(
                    op = %item.req.op(),
                    fd = item.req.fd(),
                    pos = item.req.pos(),
                    size = item.req.size(),
                    "Drained I/O request"
                );
                claimed += 1;
                let PendingIo { slot, .. } = item;
                // the visitor dropped its completion without resolving it
                if Rc::strong_count(&slot) == 1 && slot.borrow().is_some() {
                    warn!("I/O completion dropped without being resolved");
                    self.abandoned.set(self.abandoned.get() + 1);
                }
            } else {
                self.pending.borrow_mut().push_front(item);
                break;
            }
        }
        self.claimed.set(self.claimed.get() + claimed as u64);
        claimed
    }

    /// Drains everything into `backend`, completing each request with the
    /// backend's result. Returns the number of requests executed.
    pub fn drain_into<B>(&self, backend: &B) -> usize
    where
        B: IoBackend + ?Sized,
    {
        self.drain(|req, completion| {
            completion.resolve(backend.execute(req));
            true
        })
    }

    /// Number of requests waiting to be drained.
    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// True when nothing is waiting to be drained.
    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    /// Requests handed to the sink so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.get()
    }

    /// Requests claimed by the backend so far.
    pub fn claimed(&self) -> u64 {
        self.claimed.get()
    }

    /// Claimed requests whose completion the visitor dropped unresolved.
    pub fn abandoned(&self) -> u64 {
        self.abandoned.get()
    }
}

impl fmt::Debug for IoSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoSink")
            .field("pending", &self.len())
            .field("submitted", &self.submitted())
            .field("claimed", &self.claimed())
            .field("abandoned", &self.abandoned())
            .finish()
    }
}
