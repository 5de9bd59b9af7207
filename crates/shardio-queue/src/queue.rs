//! Per-shard admission queue with share-weighted fair dispatch.
//!
//! Requests are admitted into one FIFO per priority class. A scheduling pass
//! ([`IoQueue::poll`]) moves eligible requests into the [`IoSink`], drawing
//! tokens from the shared [`CapacityGroup`]. Classes are served by deficit
//! round robin: each round, every backlogged class is credited a quantum of
//! the currently available tokens in proportion to its shares, and dispatches
//! from its head while the credit covers the head's cost. Rounds in which no
//! head could be afforded are credited in a single step, so a pass never
//! leaves tokens unused while a backlogged head fits them.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::capacity::CapacityGroup;
use crate::error::{QueueError, QueueResult};
use crate::intent::{Intent, SafeRef};
use crate::priority::ClassId;
use crate::request::{IoOp, IoRequest};
use crate::sink::{completion_slot, resolve_slot, CompletionSlot, IoSink};

/// Slack absorbing float rounding when comparing deficits to costs.
const DEFICIT_EPSILON: f64 = 1e-9;

/// Token cost of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoCostModel {
    /// Fixed tokens charged per request.
    pub per_request: u64,
    /// Bytes covered by one additional token; 0 ignores request size.
    pub bytes_per_token: u64,
    /// Multiplier applied to write costs.
    pub write_multiplier: u64,
}

impl Default for IoCostModel {
    fn default() -> Self {
        Self {
            per_request: 1,
            bytes_per_token: 0,
            write_multiplier: 1,
        }
    }
}

impl IoCostModel {
    /// Unclamped cost of a request of `len` bytes in direction `op`.
    pub fn cost(&self, op: IoOp, len: usize) -> u64 {
        let size_tokens = match self.bytes_per_token {
            0 => 0,
            per => (len as u64).div_ceil(per),
        };
        let base = self.per_request.saturating_add(size_tokens);
        match op {
            IoOp::Read => base,
            IoOp::Write => base.saturating_mul(self.write_multiplier),
        }
    }
}

/// Configuration for an admission queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoQueueConfig {
    /// Reads longer than this are split at admission.
    pub max_read_len: usize,
    /// Writes longer than this are split at admission.
    pub max_write_len: usize,
    /// Token cost model.
    pub cost: IoCostModel,
}

impl Default for IoQueueConfig {
    fn default() -> Self {
        Self {
            max_read_len: 128 * 1024,
            max_write_len: 128 * 1024,
            cost: IoCostModel::default(),
        }
    }
}

impl IoQueueConfig {
    /// Split threshold for `op`.
    #[inline]
    pub fn max_len(&self, op: IoOp) -> usize {
        match op {
            IoOp::Read => self.max_read_len,
            IoOp::Write => self.max_write_len,
        }
    }

    /// Checks that both split thresholds are positive.
    pub fn validate(&self) -> QueueResult<()> {
        if self.max_read_len == 0 || self.max_write_len == 0 {
            return Err(QueueError::InvalidConfig {
                reason: "request length limits must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Per-request admission options. Reserved for future per-request policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct AdmitOptions {}

/// Counters for one priority class on one queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassStats {
    /// Requests (or parts) queued.
    pub queued: u64,
    /// Requests handed to the sink.
    pub dispatched: u64,
    /// Requests resolved as cancelled.
    pub cancelled: u64,
    /// Bytes handed to the sink.
    pub bytes_dispatched: u64,
    /// Tokens consumed by dispatch.
    pub tokens_consumed: u64,
    /// Sum of time dispatched requests spent queued, in microseconds.
    pub total_queue_time_us: u64,
}

impl ClassStats {
    /// Mean queueing delay of dispatched requests.
    pub fn mean_queue_time(&self) -> Duration {
        match self.dispatched {
            0 => Duration::ZERO,
            n => Duration::from_micros(self.total_queue_time_us / n),
        }
    }
}

/// Queue-wide counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IoQueueStats {
    /// Calls to `admit` that queued at least one part.
    pub admitted: u64,
    /// Admitted requests that were split into several parts.
    pub split_requests: u64,
    /// Parts handed to the sink.
    pub dispatched: u64,
    /// Parts resolved as cancelled.
    pub cancelled: u64,
    /// Scheduling passes run.
    pub passes: u64,
}

struct QueuedIo {
    req: IoRequest,
    slot: CompletionSlot,
    intent: SafeRef,
    cost: u64,
    enqueued_at: Instant,
}

#[derive(Default)]
struct ClassQueue {
    fifo: VecDeque<QueuedIo>,
    deficit: f64,
    stats: ClassStats,
}

impl ClassQueue {
    /// Drops cancelled entries, resolving any that were not resolved yet.
    fn sweep_cancelled(&mut self) -> u64 {
        let before = self.fifo.len();
        self.fifo.retain(|io| {
            if io.intent.is_cancelled() {
                resolve_slot(&io.slot, Err(QueueError::Cancelled));
                false
            } else {
                true
            }
        });
        let swept = (before - self.fifo.len()) as u64;
        self.stats.cancelled += swept;
        swept
    }
}

/// Suspending handle returned by [`IoQueue::admit`].
///
/// Resolves to the total bytes transferred once every part of the request has
/// resolved, or to the first failure observed.
#[must_use = "the request's buffer must stay alive until the handle resolves"]
pub struct IoHandle {
    parts: Vec<oneshot::Receiver<QueueResult<usize>>>,
    nr_parts: usize,
    total: usize,
    error: Option<QueueError>,
    done: bool,
}

impl IoHandle {
    fn new(parts: Vec<oneshot::Receiver<QueueResult<usize>>>) -> Self {
        Self {
            nr_parts: parts.len(),
            parts,
            total: 0,
            error: None,
            done: false,
        }
    }

    fn failed(err: QueueError) -> Self {
        Self {
            parts: Vec::new(),
            nr_parts: 0,
            total: 0,
            error: Some(err),
            done: false,
        }
    }

    /// Number of parts the request was queued as.
    #[inline]
    pub fn parts(&self) -> usize {
        self.nr_parts
    }
}

impl Future for IoHandle {
    type Output = QueueResult<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(!this.done, "IoHandle polled after completion");

        let mut i = 0;
        while i < this.parts.len() {
            match Pin::new(&mut this.parts[i]).poll(cx) {
                Poll::Pending => i += 1,
                Poll::Ready(res) => {
                    this.parts.swap_remove(i);
                    match res {
                        Ok(Ok(len)) => this.total += len,
                        Ok(Err(e)) => {
                            this.error.get_or_insert(e);
                        }
                        Err(_) => {
                            this.error.get_or_insert(QueueError::Abandoned);
                        }
                    }
                }
            }
        }

        if !this.parts.is_empty() {
            return Poll::Pending;
        }
        this.done = true;
        match this.error.take() {
            Some(e) => Poll::Ready(Err(e)),
            None => Poll::Ready(Ok(this.total)),
        }
    }
}

impl std::fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoHandle")
            .field("parts", &self.nr_parts)
            .field("outstanding", &self.parts.len())
            .finish()
    }
}

/// Per-shard admission queue.
pub struct IoQueue {
    config: IoQueueConfig,
    group: Arc<CapacityGroup>,
    sink: Rc<IoSink>,
    classes: BTreeMap<ClassId, ClassQueue>,
    next_start: usize,
    stats: IoQueueStats,
}

impl IoQueue {
    /// Creates a queue drawing from `group` and dispatching into `sink`.
    pub fn new(config: IoQueueConfig, group: Arc<CapacityGroup>, sink: Rc<IoSink>) -> QueueResult<Self> {
        config.validate()?;
        group.join();
        info!(
            "Creating IoQueue: max_read_len={}, max_write_len={}, group_members={}",
            config.max_read_len,
            config.max_write_len,
            group.members()
        );
        Ok(Self {
            config,
            group,
            sink,
            classes: BTreeMap::new(),
            next_start: 0,
            stats: IoQueueStats::default(),
        })
    }

    /// Returns the configuration.
    #[inline]
    pub fn config(&self) -> &IoQueueConfig {
        &self.config
    }

    /// The capacity group this queue draws from.
    #[inline]
    pub fn group(&self) -> &Arc<CapacityGroup> {
        &self.group
    }

    /// The sink this queue dispatches into.
    #[inline]
    pub fn sink(&self) -> &Rc<IoSink> {
        &self.sink
    }

    /// Queues `req` under `class`.
    ///
    /// Requests longer than the configured limit for their direction are
    /// split, each part queued on its own. If `intent` is cancelled before a
    /// part is dispatched, that part resolves at once with
    /// [`QueueError::Cancelled`]. Fails only for an unregistered class.
    pub fn admit(
        &mut self,
        class: ClassId,
        req: IoRequest,
        intent: Option<&Intent>,
        _options: AdmitOptions,
    ) -> QueueResult<IoHandle> {
        if self.group.shares(class).is_none() {
            return Err(QueueError::UnknownClass { class });
        }

        if intent.is_some_and(Intent::is_cancelled) {
            debug!(class = %class, "Admitted request against cancelled intent");
            self.classes.entry(class).or_default().stats.cancelled += 1;
            self.stats.cancelled += 1;
            return Ok(IoHandle::failed(QueueError::Cancelled));
        }

        let max_len = self.config.max_len(req.op());
        let receivers = if req.size() > max_len {
            let parts = req.split(max_len);
            debug!(
                class = %class,
                size = req.size(),
                parts = parts.len(),
                "Splitting oversized request"
            );
            self.stats.split_requests += 1;
            parts
                .into_iter()
                .map(|part| self.enqueue(class, part.req, intent))
                .collect()
        } else {
            vec![self.enqueue(class, req, intent)]
        };

        self.stats.admitted += 1;
        Ok(IoHandle::new(receivers))
    }

    fn enqueue(
        &mut self,
        class: ClassId,
        req: IoRequest,
        intent: Option<&Intent>,
    ) -> oneshot::Receiver<QueueResult<usize>> {
        let (slot, rx) = completion_slot();
        let safe_ref = match intent {
            Some(intent) => {
                let slot = Rc::clone(&slot);
                SafeRef::with_reaction(intent, move || {
                    resolve_slot(&slot, Err(QueueError::Cancelled));
                })
            }
            None => SafeRef::empty(),
        };

        let cost = self
            .config
            .cost
            .cost(req.op(), req.size())
            .clamp(1, self.group.max_tokens());

        debug!(
            class = %class,
            op = %req.op(),
            pos = req.pos(),
            size = req.size(),
            cost,
            "Queued I/O request"
        );

        let queue = self.classes.entry(class).or_default();
        queue.fifo.push_back(QueuedIo {
            req,
            slot,
            intent: safe_ref,
            cost,
            enqueued_at: Instant::now(),
        });
        queue.stats.queued += 1;
        rx
    }

    /// Replenishes the capacity group for `now`, then runs a scheduling pass.
    pub fn tick(&mut self, now: Instant) -> usize {
        self.group.replenish(now);
        self.poll()
    }

    /// Runs one scheduling pass. Returns the number of requests dispatched.
    pub fn poll(&mut self) -> usize {
        self.stats.passes += 1;

        let swept: u64 = self
            .classes
            .values_mut()
            .map(ClassQueue::sweep_cancelled)
            .sum();
        self.stats.cancelled += swept;

        let max_deficit = self.group.max_tokens() as f64;
        let mut dispatched = 0;
        let mut exhausted = false;

        while !exhausted {
            let mut active: Vec<(ClassId, u32)> = self
                .classes
                .iter()
                .filter(|(_, q)| !q.fifo.is_empty())
                .map(|(&id, _)| (id, self.group.shares(id).unwrap_or(1)))
                .collect();
            let available = self.group.available();
            if active.is_empty() || available == 0 {
                break;
            }
            let start = self.next_start % active.len();
            active.rotate_left(start);
            let total_shares: u64 = active.iter().map(|&(_, s)| s as u64).sum();
            let quantum = move |shares: u32| available as f64 * shares as f64 / total_shares as f64;

            // credit as many rounds at once as it takes for some head to fit
            let Some(rounds) = self.rounds_until_dispatch(&active, available, quantum) else {
                break;
            };

            let mut progress = false;
            for (id, shares) in active {
                let Some(queue) = self.classes.get_mut(&id) else {
                    continue;
                };
                queue.deficit = (queue.deficit + quantum(shares) * rounds).min(max_deficit);

                while let Some(head) = queue.fifo.front() {
                    if head.intent.is_cancelled() {
                        if let Some(io) = queue.fifo.pop_front() {
                            resolve_slot(&io.slot, Err(QueueError::Cancelled));
                        }
                        queue.stats.cancelled += 1;
                        self.stats.cancelled += 1;
                        continue;
                    }
                    if head.cost as f64 > queue.deficit + DEFICIT_EPSILON {
                        break;
                    }
                    if !self.group.try_grab(head.cost) {
                        exhausted = true;
                        break;
                    }
                    let Some(io) = queue.fifo.pop_front() else {
                        break;
                    };
                    queue.deficit = (queue.deficit - io.cost as f64).max(0.0);
                    Self::dispatch(&self.sink, id, io, &mut queue.stats);
                    self.stats.dispatched += 1;
                    dispatched += 1;
                    progress = true;
                }

                if queue.fifo.is_empty() {
                    queue.deficit = 0.0;
                }
                if exhausted {
                    break;
                }
            }

            if !progress {
                break;
            }
        }

        self.next_start = self.next_start.wrapping_add(1);
        if dispatched > 0 {
            debug!(
                dispatched,
                pending = self.pending(),
                available = self.group.available(),
                "Scheduling pass"
            );
        }
        dispatched
    }

    /// Smallest number of rounds after which some backlogged class can afford
    /// its head request, or `None` if no head fits the available tokens.
    fn rounds_until_dispatch<Q>(
        &self,
        active: &[(ClassId, u32)],
        available: u64,
        quantum: Q,
    ) -> Option<f64>
    where
        Q: Fn(u32) -> f64,
    {
        active
            .iter()
            .filter_map(|&(id, shares)| {
                let queue = self.classes.get(&id)?;
                let head = queue.fifo.front()?;
                if head.cost > available {
                    return None;
                }
                let missing = head.cost as f64 - queue.deficit - DEFICIT_EPSILON;
                let q = quantum(shares);
                Some(if missing <= q { 1.0 } else { (missing / q).ceil() })
            })
            .reduce(f64::min)
    }

    fn dispatch(sink: &IoSink, class: ClassId, io: QueuedIo, stats: &mut ClassStats) {
        let QueuedIo {
            req,
            slot,
            intent,
            cost,
            enqueued_at,
        } = io;
        // past this point cancellation can no longer retract the request
        drop(intent);

        let waited = enqueued_at.elapsed();
        stats.dispatched += 1;
        stats.bytes_dispatched += req.size() as u64;
        stats.tokens_consumed += cost;
        stats.total_queue_time_us += waited.as_micros() as u64;

        debug!(
            class = %class,
            op = %req.op(),
            pos = req.pos(),
            size = req.size(),
            waited_us = waited.as_micros() as u64,
            "Dispatched I/O request"
        );
        sink.submit(req, slot);
    }

    /// Number of queued requests across all classes.
    ///
    /// Cancelled entries are counted until the next pass sweeps them out.
    pub fn pending(&self) -> usize {
        self.classes.values().map(|q| q.fifo.len()).sum()
    }

    /// Number of queued requests for one class.
    pub fn pending_in(&self, class: ClassId) -> usize {
        self.classes.get(&class).map_or(0, |q| q.fifo.len())
    }

    /// True when no request is queued.
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Queue-wide statistics.
    #[inline]
    pub fn stats(&self) -> &IoQueueStats {
        &self.stats
    }

    /// Statistics for one class, if it has ever been used on this queue.
    pub fn class_stats(&self, class: ClassId) -> Option<&ClassStats> {
        self.classes.get(&class).map(|q| &q.stats)
    }
}

impl Drop for IoQueue {
    fn drop(&mut self) {
        self.group.leave();
    }
}

impl std::fmt::Debug for IoQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoQueue")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .field("stats", &self.stats)
            .finish()
    }
}
