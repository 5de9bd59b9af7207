//! Cooperative cancellation of queued requests.
//!
//! An [`Intent`] is owned by the caller and scopes a batch of related requests.
//! Every request tied to it holds a [`SafeRef`], which registers a slot in the
//! intent's table. Cancelling the intent flips every registered slot to
//! cancelled and runs its reaction; dropping the intent detaches the slots
//! instead, so the requests carry on as if no intent had been attached.
//!
//! The reference never points at the intent directly: it keeps a weak handle,
//! its slot id and a shared state cell, so a destroyed intent can never be
//! dereferenced.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::{QueueError, QueueResult};

static NEXT_INTENT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an [`Intent`], returned by [`SafeRef::retrieve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntentId(pub u64);

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "intent#{}", self.0)
    }
}

/// Observable state of a [`SafeRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefState {
    /// Not tied to any intent.
    Empty,
    /// Tied to a live, uncancelled intent.
    Armed,
    /// The intent was cancelled while this reference was registered.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Armed,
    Cancelled,
    Detached,
}

struct Registration {
    state: Rc<Cell<LinkState>>,
    reaction: Option<Box<dyn FnOnce()>>,
}

struct IntentShared {
    id: IntentId,
    cancelled: Cell<bool>,
    next_slot: Cell<u64>,
    slots: RefCell<BTreeMap<u64, Registration>>,
}

impl IntentShared {
    fn register(&self, state: Rc<Cell<LinkState>>, reaction: Option<Box<dyn FnOnce()>>) -> u64 {
        let slot = self.next_slot.get();
        self.next_slot.set(slot + 1);
        self.slots
            .borrow_mut()
            .insert(slot, Registration { state, reaction });
        slot
    }

    fn deregister(&self, slot: u64) {
        self.slots.borrow_mut().remove(&slot);
    }
}

/// Caller-owned cancellation scope.
pub struct Intent {
    shared: Rc<IntentShared>,
}

impl Intent {
    /// Creates a live, uncancelled intent.
    pub fn new() -> Self {
        let id = IntentId(NEXT_INTENT_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            shared: Rc::new(IntentShared {
                id,
                cancelled: Cell::new(false),
                next_slot: Cell::new(0),
                slots: RefCell::new(BTreeMap::new()),
            }),
        }
    }

    /// Identity of this intent.
    #[inline]
    pub fn id(&self) -> IntentId {
        self.shared.id
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.get()
    }

    /// Number of references currently registered.
    pub fn registered(&self) -> usize {
        self.shared.slots.borrow().len()
    }

    /// Cancels every registered reference and runs their reactions.
    ///
    /// References registered afterwards observe the cancellation immediately.
    pub fn cancel(&self) {
        if self.shared.cancelled.replace(true) {
            return;
        }

        let slots = std::mem::take(&mut *self.shared.slots.borrow_mut());
        debug!(intent = %self.id(), refs = slots.len(), "Cancelling intent");

        let mut reactions = Vec::with_capacity(slots.len());
        for (_, reg) in slots {
            reg.state.set(LinkState::Cancelled);
            if let Some(reaction) = reg.reaction {
                reactions.push(reaction);
            }
        }
        for reaction in reactions {
            reaction();
        }
    }
}

impl Default for Intent {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Intent {
    fn drop(&mut self) {
        let slots = std::mem::take(&mut *self.shared.slots.borrow_mut());
        for (_, reg) in slots.iter() {
            reg.state.set(LinkState::Detached);
        }
    }
}

impl fmt::Debug for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intent")
            .field("id", &self.id())
            .field("cancelled", &self.is_cancelled())
            .field("registered", &self.registered())
            .finish()
    }
}

struct RefLink {
    intent: Weak<IntentShared>,
    id: IntentId,
    slot: Option<u64>,
    state: Rc<Cell<LinkState>>,
}

/// Movable, lifetime-safe handle a queued request uses to observe its intent.
///
/// Moving out with [`take`](Self::take) (or `std::mem::take`) transfers the
/// registration and leaves the source empty. Dropping an armed reference
/// deregisters it from the intent.
#[derive(Default)]
pub struct SafeRef {
    link: Option<RefLink>,
}

impl SafeRef {
    /// Creates a reference with no intent.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Ties a new reference to `intent`.
    pub fn new(intent: &Intent) -> Self {
        Self::register(intent, None)
    }

    /// Ties a new reference to `intent`, running `reaction` if the intent is
    /// cancelled while this reference is still registered.
    pub fn with_reaction<F>(intent: &Intent, reaction: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        Self::register(intent, Some(Box::new(reaction)))
    }

    fn register(intent: &Intent, reaction: Option<Box<dyn FnOnce()>>) -> Self {
        let shared = &intent.shared;
        if shared.cancelled.get() {
            return Self {
                link: Some(RefLink {
                    intent: Rc::downgrade(shared),
                    id: shared.id,
                    slot: None,
                    state: Rc::new(Cell::new(LinkState::Cancelled)),
                }),
            };
        }

        let state = Rc::new(Cell::new(LinkState::Armed));
        let slot = shared.register(Rc::clone(&state), reaction);
        Self {
            link: Some(RefLink {
                intent: Rc::downgrade(shared),
                id: shared.id,
                slot: Some(slot),
                state,
            }),
        }
    }

    /// Current state of the reference.
    pub fn state(&self) -> RefState {
        match &self.link {
            None => RefState::Empty,
            Some(link) => match link.state.get() {
                LinkState::Armed => RefState::Armed,
                LinkState::Cancelled => RefState::Cancelled,
                LinkState::Detached => RefState::Empty,
            },
        }
    }

    /// Returns true if the tied intent was cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state() == RefState::Cancelled
    }

    /// Resolves the reference.
    ///
    /// Yields `None` when there is no intent, the intent's identity while it
    /// is live, and [`QueueError::Cancelled`] once it has been cancelled.
    pub fn retrieve(&self) -> QueueResult<Option<IntentId>> {
        match (self.state(), &self.link) {
            (RefState::Armed, Some(link)) => Ok(Some(link.id)),
            (RefState::Cancelled, _) => Err(QueueError::Cancelled),
            _ => Ok(None),
        }
    }

    /// Moves the registration out, leaving this reference empty.
    #[inline]
    pub fn take(&mut self) -> SafeRef {
        std::mem::take(self)
    }
}

impl Drop for SafeRef {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        if link.state.get() != LinkState::Armed {
            return;
        }
        if let (Some(intent), Some(slot)) = (link.intent.upgrade(), link.slot) {
            intent.deregister(slot);
        }
    }
}

impl fmt::Debug for SafeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("SafeRef");
        s.field("state", &self.state());
        if let Some(link) = &self.link {
            s.field("intent", &link.id);
        }
        s.finish()
    }
}
