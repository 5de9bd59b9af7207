//! Shared, periodically replenished dispatch capacity.
//!
//! A [`CapacityGroup`] is a token bucket that one or more admission queues
//! (possibly on different shards) draw from. Token accounting is atomic so
//! replenishment and consumption may come from different threads. The group
//! also owns the priority-class registry, making class names unique per group.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{QueueError, QueueResult};
use crate::priority::{ClassId, ClassRegistry, PriorityClass};

/// Configuration for a capacity group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityGroupConfig {
    /// Tokens available before the first replenishment.
    pub initial_tokens: u64,
    /// Length of one replenishment interval in microseconds.
    pub replenish_interval_us: u64,
    /// Tokens added per elapsed interval.
    pub per_interval_increment: u64,
    /// Bucket capacity; replenishment never exceeds it.
    pub max_tokens: u64,
}

impl Default for CapacityGroupConfig {
    fn default() -> Self {
        Self {
            initial_tokens: 0,
            replenish_interval_us: 500,
            per_interval_increment: 64,
            max_tokens: 1024,
        }
    }
}

impl CapacityGroupConfig {
    /// Replenishment interval as a [`Duration`].
    #[inline]
    pub fn replenish_interval(&self) -> Duration {
        Duration::from_micros(self.replenish_interval_us)
    }

    /// Checks that the configuration describes a usable bucket.
    pub fn validate(&self) -> QueueResult<()> {
        if self.replenish_interval_us == 0 {
            return Err(QueueError::InvalidConfig {
                reason: "replenish interval must be non-zero".to_string(),
            });
        }
        if self.max_tokens == 0 {
            return Err(QueueError::InvalidConfig {
                reason: "max_tokens must be non-zero".to_string(),
            });
        }
        if self.initial_tokens > self.max_tokens {
            return Err(QueueError::InvalidConfig {
                reason: format!(
                    "initial_tokens {} exceeds max_tokens {}",
                    self.initial_tokens, self.max_tokens
                ),
            });
        }
        Ok(())
    }

    /// Parses and validates a JSON configuration. Missing fields take defaults.
    pub fn from_json(json: &str) -> QueueResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| QueueError::InvalidConfig {
            reason: format!("capacity group config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Snapshot of capacity group counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapacityGroupStats {
    /// Tokens currently available.
    pub available: u64,
    /// Tokens added by replenishment so far.
    pub replenished: u64,
    /// Tokens consumed by dispatch so far.
    pub consumed: u64,
    /// Number of queues drawing from the group.
    pub members: usize,
}

/// Shared token budget gating dispatch.
pub struct CapacityGroup {
    config: CapacityGroupConfig,
    epoch: Instant,
    available: AtomicU64,
    last_replenish_ns: AtomicU64,
    replenished: AtomicU64,
    consumed: AtomicU64,
    members: AtomicUsize,
    classes: RwLock<ClassRegistry>,
}

impl CapacityGroup {
    /// Creates a group; the replenishment clock starts now.
    pub fn new(config: CapacityGroupConfig) -> QueueResult<Self> {
        Self::with_epoch(config, Instant::now())
    }

    /// Creates a group whose replenishment clock starts at `epoch`.
    pub fn with_epoch(config: CapacityGroupConfig, epoch: Instant) -> QueueResult<Self> {
        config.validate()?;
        info!(
            "Creating capacity group: initial_tokens={}, interval={}us, increment={}, max_tokens={}",
            config.initial_tokens,
            config.replenish_interval_us,
            config.per_interval_increment,
            config.max_tokens
        );
        Ok(Self {
            available: AtomicU64::new(config.initial_tokens),
            config,
            epoch,
            last_replenish_ns: AtomicU64::new(0),
            replenished: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            members: AtomicUsize::new(0),
            classes: RwLock::new(ClassRegistry::new()),
        })
    }

    /// Returns the configuration.
    #[inline]
    pub fn config(&self) -> &CapacityGroupConfig {
        &self.config
    }

    /// Tokens currently available.
    #[inline]
    pub fn available(&self) -> u64 {
        self.available.load(Ordering::Acquire)
    }

    /// Bucket capacity.
    #[inline]
    pub fn max_tokens(&self) -> u64 {
        self.config.max_tokens
    }

    /// Adds tokens for the time elapsed since the previous replenishment.
    ///
    /// Only whole tokens are credited; the unconverted remainder of elapsed
    /// time carries over to the next call. Returns the tokens actually added
    /// after capping at `max_tokens`.
    pub fn replenish(&self, now: Instant) -> u64 {
        let per_interval = self.config.per_interval_increment as u128;
        if per_interval == 0 {
            return 0;
        }
        let interval_ns = self.config.replenish_interval().as_nanos();
        let now_ns = now.saturating_duration_since(self.epoch).as_nanos() as u64;

        let tokens = loop {
            let last = self.last_replenish_ns.load(Ordering::Acquire);
            if now_ns <= last {
                return 0;
            }
            let elapsed = (now_ns - last) as u128;
            let tokens = elapsed * per_interval / interval_ns;
            if tokens == 0 {
                return 0;
            }
            let spent = (tokens * interval_ns).div_ceil(per_interval) as u64;
            if self
                .last_replenish_ns
                .compare_exchange(last, last + spent, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break tokens.min(u64::MAX as u128) as u64;
            }
        };

        let max = self.config.max_tokens;
        let before = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |avail| {
                Some(avail.saturating_add(tokens).min(max))
            })
            .unwrap_or(max);
        let added = before.saturating_add(tokens).min(max) - before.min(max);
        self.replenished.fetch_add(added, Ordering::Relaxed);
        debug!(tokens = added, available = before + added, "Replenished capacity");
        added
    }

    /// Consumes `cost` tokens if that many are available.
    pub fn try_grab(&self, cost: u64) -> bool {
        let grabbed = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |avail| {
                avail.checked_sub(cost)
            })
            .is_ok();
        if grabbed {
            self.consumed.fetch_add(cost, Ordering::Relaxed);
        }
        grabbed
    }

    /// Returns previously grabbed tokens to the bucket.
    pub fn release(&self, cost: u64) {
        let max = self.config.max_tokens;
        let _ = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |avail| {
                Some(avail.saturating_add(cost).min(max))
            });
        let _ = self
            .consumed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(c.saturating_sub(cost))
            });
    }

    pub(crate) fn join(&self) {
        self.members.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn leave(&self) {
        self.members.fetch_sub(1, Ordering::Relaxed);
    }

    /// Number of queues drawing from this group.
    #[inline]
    pub fn members(&self) -> usize {
        self.members.load(Ordering::Relaxed)
    }

    /// Registers a priority class. Re-registering a name updates its shares
    /// and returns the existing handle.
    pub fn register_priority_class(&self, name: &str, shares: u32) -> QueueResult<ClassId> {
        let id = self.classes.write().register(name, shares)?;
        info!(class = %id, name, shares, "Registered priority class");
        Ok(id)
    }

    /// Changes the shares of a registered class.
    pub fn update_shares(&self, id: ClassId, shares: u32) -> QueueResult<()> {
        self.classes.write().update_shares(id, shares)
    }

    /// Renames a registered class.
    pub fn rename_class(&self, id: ClassId, name: &str) -> QueueResult<()> {
        self.classes.write().rename(id, name)
    }

    /// Returns a copy of a registered class.
    pub fn class(&self, id: ClassId) -> Option<PriorityClass> {
        self.classes.read().get(id).cloned()
    }

    /// Returns a copy of the class registered under `name`.
    pub fn class_by_name(&self, name: &str) -> Option<PriorityClass> {
        self.classes.read().by_name(name).cloned()
    }

    /// Current shares of a class.
    pub fn shares(&self, id: ClassId) -> Option<u32> {
        self.classes.read().get(id).map(|c| c.shares)
    }

    /// Snapshot of the group counters.
    pub fn stats(&self) -> CapacityGroupStats {
        CapacityGroupStats {
            available: self.available(),
            replenished: self.replenished.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            members: self.members(),
        }
    }
}

impl std::fmt::Debug for CapacityGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityGroup")
            .field("config", &self.config)
            .field("available", &self.available())
            .field("members", &self.members())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(initial: u64, interval_us: u64, increment: u64, max: u64) -> CapacityGroupConfig {
        CapacityGroupConfig {
            initial_tokens: initial,
            replenish_interval_us: interval_us,
            per_interval_increment: increment,
            max_tokens: max,
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = CapacityGroupConfig::default();
        assert_eq!(config.initial_tokens, 0);
        assert_eq!(config.replenish_interval(), Duration::from_micros(500));
        assert_eq!(config.per_interval_increment, 64);
        assert_eq!(config.max_tokens, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(config(0, 0, 1, 10).validate().is_err());
        assert!(config(0, 100, 1, 0).validate().is_err());
        assert!(config(11, 100, 1, 10).validate().is_err());
        assert!(config(10, 100, 0, 10).validate().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let config =
            CapacityGroupConfig::from_json(r#"{"initial_tokens": 8, "max_tokens": 16}"#).unwrap();
        assert_eq!(config.initial_tokens, 8);
        assert_eq!(config.max_tokens, 16);
        assert_eq!(config.replenish_interval_us, 500);

        assert!(CapacityGroupConfig::from_json("{not json").is_err());
        assert!(CapacityGroupConfig::from_json(r#"{"replenish_interval_us": 0}"#).is_err());
    }

    #[test]
    fn test_initial_tokens() {
        let group = CapacityGroup::new(config(5, 1000, 1, 10)).unwrap();
        assert_eq!(group.available(), 5);
    }

    #[test]
    fn test_replenish_proportional_to_elapsed() {
        let epoch = Instant::now();
        let group = CapacityGroup::with_epoch(config(0, 1000, 4, 1000), epoch).unwrap();

        assert_eq!(group.replenish(epoch + Duration::from_micros(2500)), 10);
        assert_eq!(group.available(), 10);

        // the half interval left over is carried into the next call
        assert_eq!(group.replenish(epoch + Duration::from_micros(3000)), 2);
        assert_eq!(group.available(), 12);
    }

    #[test]
    fn test_replenish_caps_at_max() {
        let epoch = Instant::now();
        let group = CapacityGroup::with_epoch(config(0, 100, 10, 25), epoch).unwrap();
        assert_eq!(group.replenish(epoch + Duration::from_secs(1)), 25);
        assert_eq!(group.available(), 25);
        assert_eq!(group.replenish(epoch + Duration::from_secs(2)), 0);
        assert_eq!(group.available(), 25);
    }

    #[test]
    fn test_replenish_ignores_past_instants() {
        let epoch = Instant::now();
        let group = CapacityGroup::with_epoch(config(0, 100, 1, 100), epoch).unwrap();
        group.replenish(epoch + Duration::from_millis(1));
        let before = group.available();
        assert_eq!(group.replenish(epoch), 0);
        assert_eq!(group.available(), before);
    }

    #[test]
    fn test_replenish_with_zero_increment() {
        let epoch = Instant::now();
        let group = CapacityGroup::with_epoch(config(3, 100, 0, 10), epoch).unwrap();
        assert_eq!(group.replenish(epoch + Duration::from_secs(1)), 0);
        assert_eq!(group.available(), 3);
    }

    #[test]
    fn test_try_grab_never_goes_negative() {
        let group = CapacityGroup::new(config(3, 1000, 1, 10)).unwrap();
        assert!(group.try_grab(2));
        assert!(!group.try_grab(2));
        assert!(group.try_grab(1));
        assert_eq!(group.available(), 0);
        assert!(!group.try_grab(1));
        assert_eq!(group.stats().consumed, 3);
    }

    #[test]
    fn test_release_returns_tokens() {
        let group = CapacityGroup::new(config(4, 1000, 1, 4)).unwrap();
        assert!(group.try_grab(3));
        group.release(3);
        assert_eq!(group.available(), 4);
        group.release(10);
        assert_eq!(group.available(), 4);
    }

    #[test]
    fn test_concurrent_grab_is_exact() {
        let group = Arc::new(CapacityGroup::new(config(1000, 1000, 1, 1000)).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let group = Arc::clone(&group);
                std::thread::spawn(move || (0..400).filter(|_| group.try_grab(1)).count())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1000);
        assert_eq!(group.available(), 0);
    }

    #[test]
    fn test_class_registration_through_group() {
        let group = CapacityGroup::new(CapacityGroupConfig::default()).unwrap();
        let a = group.register_priority_class("a", 100).unwrap();
        let again = group.register_priority_class("a", 250).unwrap();
        assert_eq!(a, again);
        assert_eq!(group.shares(a), Some(250));
        assert_eq!(group.class_by_name("a").unwrap().id, a);

        group.update_shares(a, 10).unwrap();
        assert_eq!(group.class(a).unwrap().shares, 10);

        group.rename_class(a, "b").unwrap();
        assert!(group.class_by_name("a").is_none());
        assert_eq!(group.class_by_name("b").unwrap().id, a);
    }

    #[test]
    fn test_group_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CapacityGroup>();
    }
}
