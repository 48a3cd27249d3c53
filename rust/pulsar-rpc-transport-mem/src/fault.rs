//! Fault injection for the in-memory broker.
//!
//! Faults are applied per published message after the broker accepted it,
//! so publishers always see success; what changes is what subscribers see.
//!
//! # Example
//!
//! ```rust
//! use pulsar_rpc_transport_mem::{FaultAction, FaultInjector};
//!
//! let injector = FaultInjector::new();
//! injector.set_duplicate_rate(500); // 5.00% of messages delivered twice
//!
//! match injector.check() {
//!     FaultAction::Pass => { /* deliver normally */ }
//!     FaultAction::Drop => { /* lose the message */ }
//!     FaultAction::Duplicate => { /* deliver it twice */ }
//!     FaultAction::Delay(duration) => { /* deliver it later */ }
//! }
//! ```

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Rates are in basis points (0-10000 = 0.00%-100.00%).
const MAX_RATE: u32 = 10000;

/// Fault settings, applied with [`FaultInjector::configure`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultConfig {
    /// Messages lost outright.
    pub drop_rate: u32,
    /// Messages delivered twice.
    pub duplicate_rate: u32,
    /// Messages held back by a random delay up to `reorder_jitter`, letting
    /// later messages overtake them.
    pub reorder_rate: u32,
    pub reorder_jitter: Duration,
    /// Fixed delay added to every message.
    pub delay: Duration,
}

impl FaultConfig {
    pub fn with_drop_rate(mut self, rate: u32) -> Self {
        self.drop_rate = rate;
        self
    }

    pub fn with_duplicate_rate(mut self, rate: u32) -> Self {
        self.duplicate_rate = rate;
        self
    }

    pub fn with_reorder(mut self, rate: u32, jitter: Duration) -> Self {
        self.reorder_rate = rate;
        self.reorder_jitter = jitter;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// What to do with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultAction {
    Pass,
    Drop,
    Duplicate,
    Delay(Duration),
}

/// Runtime-adjustable fault injection.
pub struct FaultInjector {
    drop_rate: AtomicU32,
    duplicate_rate: AtomicU32,
    reorder_rate: AtomicU32,
    reorder_jitter_ms: AtomicU32,
    delay_ms: AtomicU32,
    /// Counter for generating pseudo-random values
    counter: AtomicU64,
    random_state: RandomState,
}

impl FaultInjector {
    /// Create an injector with all faults disabled.
    pub fn new() -> Self {
        Self {
            drop_rate: AtomicU32::new(0),
            duplicate_rate: AtomicU32::new(0),
            reorder_rate: AtomicU32::new(0),
            reorder_jitter_ms: AtomicU32::new(0),
            delay_ms: AtomicU32::new(0),
            counter: AtomicU64::new(0),
            random_state: RandomState::new(),
        }
    }

    pub fn configure(&self, config: &FaultConfig) {
        self.set_drop_rate(config.drop_rate);
        self.set_duplicate_rate(config.duplicate_rate);
        self.set_reorder(config.reorder_rate, config.reorder_jitter);
        self.set_delay(config.delay);
    }

    /// Decide the fate of the next message.
    pub fn check(&self) -> FaultAction {
        let drop_rate = self.drop_rate.load(Ordering::Relaxed);
        if drop_rate > 0 && self.rand_below(MAX_RATE) < drop_rate {
            return FaultAction::Drop;
        }

        let duplicate_rate = self.duplicate_rate.load(Ordering::Relaxed);
        if duplicate_rate > 0 && self.rand_below(MAX_RATE) < duplicate_rate {
            return FaultAction::Duplicate;
        }

        let mut delay_ms = self.delay_ms.load(Ordering::Relaxed);
        let reorder_rate = self.reorder_rate.load(Ordering::Relaxed);
        let jitter_ms = self.reorder_jitter_ms.load(Ordering::Relaxed);
        if reorder_rate > 0 && jitter_ms > 0 && self.rand_below(MAX_RATE) < reorder_rate {
            delay_ms = delay_ms.saturating_add(1 + self.rand_below(jitter_ms));
        }
        if delay_ms > 0 {
            return FaultAction::Delay(Duration::from_millis(delay_ms as u64));
        }

        FaultAction::Pass
    }

    /// Values above 10000 are clamped to 10000.
    pub fn set_drop_rate(&self, rate: u32) {
        self.drop_rate.store(rate.min(MAX_RATE), Ordering::Relaxed);
    }

    pub fn set_duplicate_rate(&self, rate: u32) {
        self.duplicate_rate
            .store(rate.min(MAX_RATE), Ordering::Relaxed);
    }

    pub fn set_reorder(&self, rate: u32, jitter: Duration) {
        self.reorder_rate.store(rate.min(MAX_RATE), Ordering::Relaxed);
        self.reorder_jitter_ms
            .store(saturating_ms(jitter), Ordering::Relaxed);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(saturating_ms(delay), Ordering::Relaxed);
    }

    pub fn drop_rate(&self) -> u32 {
        self.drop_rate.load(Ordering::Relaxed)
    }

    pub fn duplicate_rate(&self) -> u32 {
        self.duplicate_rate.load(Ordering::Relaxed)
    }

    pub fn reorder_rate(&self) -> u32 {
        self.reorder_rate.load(Ordering::Relaxed)
    }

    /// Pseudo-random value in `[0, bound)`.
    ///
    /// Hashes a counter, so no RNG dependency is needed.
    fn rand_below(&self, bound: u32) -> u32 {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = self.random_state.build_hasher();
        counter.hash(&mut hasher);
        (hasher.finish() % bound.max(1) as u64) as u32
    }
}

fn saturating_ms(duration: Duration) -> u32 {
    duration.as_millis().min(u32::MAX as u128) as u32
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}
