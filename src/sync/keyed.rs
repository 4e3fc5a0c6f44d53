/*!
 * Keyed Event
 *
 * Keyed park/unpark: threads wait on an arbitrary usize key (normally an
 * address inside the waiting object) and each release wakes exactly one of
 * them in FIFO order.
 *
 * # Design
 *
 * - Fixed array of mutex-protected shards, key hashed with ahash
 * - Each key has a FIFO queue of waiters plus a count of latched releases
 * - A release with nobody queued is latched and consumed by the next waiter,
 *   so release-before-wait never loses a wake
 * - Waiters block on their own thread-local [`Parker`]
 */

use super::config::SyncConfig;
use super::parker::Parker;
use super::traits::WakeResult;
use ahash::RandomState;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::trace;

/// A thread blocked on a key
#[derive(Debug)]
struct KeyedWaiter {
    parker: Parker,
    /// Set under the shard lock by the release that dequeued this waiter
    granted: AtomicBool,
}

impl KeyedWaiter {
    fn new() -> Self {
        Self {
            parker: Parker::new(),
            granted: AtomicBool::new(false),
        }
    }
}

thread_local! {
    static WAITER: Arc<KeyedWaiter> = Arc::new(KeyedWaiter::new());
}

fn current_waiter() -> Arc<KeyedWaiter> {
    WAITER
        .try_with(Arc::clone)
        .unwrap_or_else(|_| Arc::new(KeyedWaiter::new()))
}

/// Queue state for one key
#[derive(Debug, Default)]
struct KeyQueue {
    waiters: VecDeque<Arc<KeyedWaiter>>,
    pending: usize,
}

impl KeyQueue {
    fn is_idle(&self) -> bool {
        self.waiters.is_empty() && self.pending == 0
    }
}

/// Cache-line aligned shard to prevent false sharing
#[repr(C, align(64))]
struct Shard {
    queues: Mutex<HashMap<usize, KeyQueue, RandomState>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::with_hasher(RandomState::new())),
        }
    }
}

/// Keyed park/unpark primitive
///
/// # Performance
///
/// - One short mutex hold per wait and per release
/// - No allocation on the wait path after a thread's first wait
/// - Shards keep unrelated keys from contending
pub struct KeyedEvent {
    shards: Box<[Shard]>,
    hasher: RandomState,
    mask: usize,
}

impl KeyedEvent {
    /// Create a keyed event with the configured shard count
    pub fn new(config: &SyncConfig) -> Self {
        let count = config.effective_shards();
        Self {
            shards: (0..count).map(|_| Shard::new()).collect(),
            hasher: RandomState::new(),
            mask: count - 1,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(&SyncConfig::default())
    }

    /// Process-wide keyed event used by the lock and once primitives
    pub fn global() -> &'static KeyedEvent {
        static GLOBAL: OnceLock<KeyedEvent> = OnceLock::new();
        GLOBAL.get_or_init(KeyedEvent::with_defaults)
    }

    #[inline]
    fn shard(&self, key: usize) -> &Shard {
        let idx = (self.hasher.hash_one(key) as usize) & self.mask;
        &self.shards[idx]
    }

    /// Wait on `key` until released or until `timeout` elapses
    ///
    /// Returns `true` if a release was consumed, `false` on timeout.
    pub fn wait(&self, key: usize, timeout: Option<Duration>) -> bool {
        let waiter = current_waiter();
        let shard = self.shard(key);

        {
            let mut queues = shard.queues.lock();
            let queue = queues.entry(key).or_default();
            if queue.pending > 0 {
                queue.pending -= 1;
                if queue.is_idle() {
                    queues.remove(&key);
                }
                trace!(key = format_args!("{key:#x}"), "keyed wait consumed latched release");
                return true;
            }
            waiter.granted.store(false, Ordering::Relaxed);
            queue.waiters.push_back(waiter.clone());
        }

        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if waiter.granted.load(Ordering::Acquire) {
                return true;
            }

            // A stale unpark from an earlier wait just loops back here
            if waiter.parker.park(deadline) {
                continue;
            }

            let mut queues = shard.queues.lock();
            if waiter.granted.load(Ordering::Acquire) {
                // The release raced with the timeout; it is ours now
                return true;
            }
            if let Some(queue) = queues.get_mut(&key) {
                queue.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
                if queue.is_idle() {
                    queues.remove(&key);
                }
            }
            trace!(key = format_args!("{key:#x}"), "keyed wait timed out");
            return false;
        }
    }

    /// Release one waiter on `key`, or latch the release if none is queued
    pub fn release(&self, key: usize) -> WakeResult {
        let woken = {
            let mut queues = self.shard(key).queues.lock();
            let queue = queues.entry(key).or_default();
            match queue.waiters.pop_front() {
                Some(waiter) => {
                    waiter.granted.store(true, Ordering::Release);
                    if queue.is_idle() {
                        queues.remove(&key);
                    }
                    Some(waiter)
                }
                None => {
                    queue.pending += 1;
                    None
                }
            }
        };

        match woken {
            Some(waiter) => {
                waiter.parker.unpark();
                WakeResult::Woken(1)
            }
            None => {
                trace!(key = format_args!("{key:#x}"), "keyed release latched");
                WakeResult::NoWaiters
            }
        }
    }

    /// Number of threads queued on `key` (for diagnostics)
    pub fn waiter_count(&self, key: usize) -> usize {
        self.shard(key)
            .queues
            .lock()
            .get(&key)
            .map(|q| q.waiters.len())
            .unwrap_or(0)
    }

    /// Number of latched releases on `key` (for diagnostics)
    pub fn pending_releases(&self, key: usize) -> usize {
        self.shard(key)
            .queues
            .lock()
            .get(&key)
            .map(|q| q.pending)
            .unwrap_or(0)
    }
}

impl Default for KeyedEvent {
    fn default() -> Self {
        Self::with_defaults()
    }
}
