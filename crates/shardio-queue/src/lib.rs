#![warn(missing_docs)]

//! Shardio admission layer: priority-class fair queueing, request splitting and cooperative cancellation
//!
//! This crate sits between application code issuing block I/O on a single-threaded,
//! per-shard runtime and the backend that executes it. Requests are admitted into
//! per-class FIFOs, dispatched against a shared token budget, and handed to the
//! backend through a pull-based sink.

pub mod backend;
pub mod capacity;
pub mod error;
pub mod intent;
pub mod iovec;
pub mod priority;
pub mod queue;
pub mod request;
pub mod sink;

pub use backend::{FileBackend, IoBackend, IoStats, MemoryBackend};
pub use capacity::{CapacityGroup, CapacityGroupConfig, CapacityGroupStats};
pub use error::{QueueError, QueueResult};
pub use intent::{Intent, IntentId, RefState, SafeRef};
pub use iovec::{iovec_len, IoVec};
pub use priority::{ClassId, ClassRegistry, PriorityClass};
pub use queue::{AdmitOptions, ClassStats, IoCostModel, IoHandle, IoQueue, IoQueueConfig, IoQueueStats};
pub use request::{IoOp, IoRequest, IoRequestPart};
pub use sink::{IoCompletion, IoSink};
