/*!
 * Identity-Directed Parker
 *
 * Uses parking_lot_core for futex-like operations on all platforms.
 * On Linux, this maps directly to futex syscalls for minimal overhead.
 *
 * # Design
 *
 * One parker per waiting identity. The parker's own address is the
 * parking_lot_core key, so unparking it targets exactly one thread.
 * - Zero allocations
 * - A wake that arrives while nobody is parked is latched and consumed
 *   by the next park
 * - No spurious returns except a latched wake
 */

use parking_lot_core::{park, unpark_one, ParkResult, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

const EMPTY: u32 = 0;
const PARKED: u32 = 1;
const NOTIFIED: u32 = 2;

/// Latched park/unpark for a single owner thread
///
/// Only the owning thread may call [`Parker::park`]; any thread may call
/// [`Parker::unpark`].
#[derive(Debug)]
#[repr(transparent)]
pub struct Parker {
    state: AtomicU32,
}

impl Parker {
    /// Create an unparked, unlatched parker
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(EMPTY),
        }
    }

    #[inline]
    fn key(&self) -> usize {
        &self.state as *const AtomicU32 as usize
    }

    /// Block until unparked or `deadline` passes
    ///
    /// Returns `true` if woken (including a previously latched wake),
    /// `false` on timeout.
    pub fn park(&self, deadline: Option<Instant>) -> bool {
        // Fast path: consume a latched wake
        if self
            .state
            .compare_exchange(NOTIFIED, EMPTY, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return true;
        }

        // SAFETY: the key is the address of our own state word, which outlives
        // the call. The callbacks neither panic nor call into parking_lot.
        let result = unsafe {
            park(
                self.key(),
                || {
                    // Validate under the bucket lock: only sleep if no wake is latched
                    self.state
                        .compare_exchange(EMPTY, PARKED, Ordering::Relaxed, Ordering::Relaxed)
                        .is_ok()
                },
                || {},
                |_key, _was_last| {},
                DEFAULT_PARK_TOKEN,
                deadline,
            )
        };

        // Whatever woke us, the state tells whether a wake was delivered
        let woken = self.state.swap(EMPTY, Ordering::Acquire) == NOTIFIED;
        debug_assert!(woken || matches!(result, ParkResult::TimedOut));
        woken
    }

    /// Wake the owner, or latch the wake if it is not parked
    ///
    /// Returns `true` if a parked thread was woken.
    pub fn unpark(&self) -> bool {
        if self.state.swap(NOTIFIED, Ordering::Release) == PARKED {
            // SAFETY: same key as in `park`; the callback is trivial
            let result = unsafe { unpark_one(self.key(), |_| DEFAULT_UNPARK_TOKEN) };
            result.unparked_threads > 0
        } else {
            false
        }
    }

    /// Drop a latched wake
    ///
    /// Must only be called by the owner while it is not parked.
    #[inline]
    pub fn reset(&self) {
        let _ = self
            .state
            .compare_exchange(NOTIFIED, EMPTY, Ordering::Relaxed, Ordering::Relaxed);
    }

    /// Whether a wake is latched (for diagnostics)
    pub fn is_notified(&self) -> bool {
        self.state.load(Ordering::Relaxed) == NOTIFIED
    }
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-unique identity of a thread
///
/// Never zero, so zero can mark a free registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadIdentity(NonZeroU64);

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_IDENTITY: ThreadIdentity = ThreadIdentity::new_unique();
}

impl ThreadIdentity {
    /// Allocate a fresh identity that no other caller will receive
    pub fn new_unique() -> Self {
        let id = NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed);
        // The counter starts at 1 and a u64 does not wrap in practice
        Self(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }

    /// Identity of the calling thread (allocated on first use)
    ///
    /// During thread teardown a fresh identity is returned.
    pub fn current() -> Self {
        CURRENT_IDENTITY
            .try_with(|id| *id)
            .unwrap_or_else(|_| Self::new_unique())
    }

    /// Raw non-zero value
    #[inline]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}
