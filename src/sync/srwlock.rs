/*!
 * Slim Reader-Writer Lock
 *
 * Fair shared/exclusive lock packed into one 32-bit word:
 *
 * ```text
 *  31 30           16 15            0
 * +--+---------------+---------------+
 * | X|  #exclusive   |    #shared    |
 * +--+---------------+---------------+
 * ```
 *
 * Notation [X, #exclusive, #shared]:
 *
 * - [0,   0,   N] locked by N shared holders (unlocked when N = 0)
 * - [0, >=1, >=1] exclusive waiters queued while shared holders drain;
 *   #shared must not grow in this state
 * - [1, >=1, >=0] held exclusively; #shared counts queued shared waiters
 *
 * [0, >=1, 0] and [1, 0, *] never occur. Neither counter may reach its
 * all-ones value.
 *
 * A shared acquirer that arrives while the lock drains cannot be counted
 * in #shared, since waiters and holders would be indistinguishable. It
 * queues as exclusive instead; once it receives exclusive rights it moves
 * itself to the shared queue and passes exclusive rights on, so queued
 * writers go first and readers follow as a batch.
 *
 * Blocking goes through the process-wide keyed event: exclusive waiters on
 * the word's address, shared waiters on the address + 2.
 */

use super::keyed::KeyedEvent;
use crate::errors::LockTrap;
use crate::limits::{
    SRW_EXCLUSIVE_QUEUE, SRW_IN_EXCLUSIVE, SRW_ONE_EXCLUSIVE, SRW_ONE_SHARED, SRW_SHARED_QUEUE,
};
use parking_lot::lock_api::{self, GuardSend, RawRwLock};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::error;

/// Snapshot of a lock word with named field accessors
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockWord(u32);

impl LockWord {
    /// Wrap raw bits
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether an exclusive owner is inside
    #[inline]
    pub const fn in_exclusive(self) -> bool {
        self.0 & SRW_IN_EXCLUSIVE != 0
    }

    /// Exclusive holder plus queued exclusive waiters
    #[inline]
    pub const fn exclusive_queue(self) -> u32 {
        (self.0 & SRW_EXCLUSIVE_QUEUE) >> 16
    }

    /// Shared holders, or queued shared waiters while held exclusively
    #[inline]
    pub const fn shared_queue(self) -> u32 {
        self.0 & SRW_SHARED_QUEUE
    }

    /// A counter sits on its reserved all-ones value
    #[inline]
    pub const fn is_overflowed(self) -> bool {
        self.0 & SRW_EXCLUSIVE_QUEUE == SRW_EXCLUSIVE_QUEUE
            || self.0 & SRW_SHARED_QUEUE == SRW_SHARED_QUEUE
    }

    /// One of the combinations valid usage never produces
    #[inline]
    pub const fn is_invalid_combination(self) -> bool {
        let queued = self.exclusive_queue() != 0;
        (!self.in_exclusive() && queued && self.shared_queue() == 0)
            || (self.in_exclusive() && !queued)
    }

    /// Reachable through valid usage
    #[inline]
    pub const fn is_valid(self) -> bool {
        !self.is_overflowed() && !self.is_invalid_combination()
    }

    #[inline]
    fn offset(self, delta: u32) -> Self {
        Self(self.0.wrapping_add(delta))
    }
}

impl fmt::Debug for LockWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockWord")
            .field("in_exclusive", &self.in_exclusive())
            .field("exclusive_queue", &self.exclusive_queue())
            .field("shared_queue", &self.shared_queue())
            .finish()
    }
}

#[cold]
#[inline(never)]
fn trap(reason: LockTrap) -> ! {
    error!(word = format_args!("{:#010x}", reason.word()), "{}", reason);
    // Unit tests observe the trap as a panic
    if cfg!(any(test, feature = "panic_on_trap")) {
        panic!("{}", reason);
    }
    std::process::abort();
}

#[inline]
fn check_observed(word: LockWord) {
    if word.is_overflowed() {
        trap(LockTrap::CounterOverflow(word.bits()));
    }
    if word.is_invalid_combination() {
        trap(LockTrap::InvalidState(word.bits()));
    }
}

#[inline]
fn check_updated(word: LockWord) {
    if word.is_overflowed() {
        trap(LockTrap::CounterOverflow(word.bits()));
    }
}

/// Reader-writer lock in a single atomic word
///
/// No owner is recorded: any thread may release a lock held in the matching
/// mode. Recursion is not supported; acquiring shared twice on one thread
/// deadlocks once a writer queues in between.
///
/// # Examples
///
/// ```
/// use kernel_sync::sync::SrwLock;
///
/// let lock = SrwLock::new();
/// lock.acquire_shared();
/// assert!(lock.try_acquire_shared());
/// assert!(!lock.try_acquire_exclusive());
/// lock.release_shared();
/// lock.release_shared();
///
/// lock.acquire_exclusive();
/// lock.release_exclusive();
/// ```
#[repr(transparent)]
pub struct SrwLock {
    word: AtomicU32,
}

impl SrwLock {
    /// Create an unlocked lock
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    /// Create a lock from raw bits
    ///
    /// Intended for diagnostics and tests of the trap paths; an invalid word
    /// traps on the first operation.
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            word: AtomicU32::new(bits),
        }
    }

    /// Current raw word
    #[inline]
    pub fn bits(&self) -> u32 {
        self.word.load(Ordering::Relaxed)
    }

    /// Current word with field accessors
    #[inline]
    pub fn state(&self) -> LockWord {
        LockWord(self.bits())
    }

    #[inline]
    fn exclusive_key(&self) -> usize {
        &self.word as *const AtomicU32 as usize
    }

    #[inline]
    fn shared_key(&self) -> usize {
        self.exclusive_key() + 2
    }

    /// Add `delta`; mark exclusive ownership once shared holders are gone
    ///
    /// Returns the word before the update.
    fn update_entering(&self, delta: u32) -> LockWord {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let prev = LockWord(current);
            check_observed(prev);

            let mut next = prev.offset(delta);
            check_updated(next);
            if next.exclusive_queue() != 0 && next.shared_queue() == 0 {
                next = LockWord(next.0 | SRW_IN_EXCLUSIVE);
            }

            match self.word.compare_exchange_weak(
                current,
                next.0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return prev,
                Err(actual) => current = actual,
            }
        }
    }

    /// Add `delta`; drop the exclusive mark once no exclusive waiter is left
    ///
    /// Returns the word before the update.
    fn update_leaving(&self, delta: u32) -> LockWord {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let prev = LockWord(current);
            check_observed(prev);

            let mut next = prev.offset(delta);
            check_updated(next);
            if next.exclusive_queue() == 0 {
                next = LockWord(next.0 & SRW_SHARED_QUEUE);
            }

            match self.word.compare_exchange_weak(
                current,
                next.0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return prev,
                Err(actual) => current = actual,
            }
        }
    }

    /// Hand the lock on after an exclusive section
    ///
    /// `remaining` is the word with the leaver already removed. Exclusive
    /// waiters go first; otherwise every queued shared waiter is released.
    fn leave_exclusive(&self, remaining: LockWord) {
        let event = KeyedEvent::global();
        if remaining.exclusive_queue() != 0 {
            event.release(self.exclusive_key());
        } else {
            for _ in 0..remaining.shared_queue() {
                event.release(self.shared_key());
            }
        }
    }

    /// Block until the lock is held exclusively
    pub fn acquire_exclusive(&self) {
        let prev = self.update_entering(SRW_ONE_EXCLUSIVE);
        if prev.bits() != 0 {
            KeyedEvent::global().wait(self.exclusive_key(), None);
        }
    }

    /// Block until the lock is held shared
    pub fn acquire_shared(&self) {
        let mut current = self.word.load(Ordering::Relaxed);
        let prev = loop {
            let prev = LockWord(current);
            check_observed(prev);

            let draining = prev.exclusive_queue() != 0 && !prev.in_exclusive();
            let next = if draining {
                prev.offset(SRW_ONE_EXCLUSIVE)
            } else {
                prev.offset(SRW_ONE_SHARED)
            };
            check_updated(next);

            match self.word.compare_exchange_weak(
                current,
                next.0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break prev,
                Err(actual) => current = actual,
            }
        };

        let event = KeyedEvent::global();
        let mut word = prev;

        if prev.exclusive_queue() != 0 && !prev.in_exclusive() {
            // Queued as exclusive; once woken, move to the shared queue and
            // pass exclusive rights on
            event.wait(self.exclusive_key(), None);
            word = self
                .update_leaving(SRW_ONE_SHARED.wrapping_sub(SRW_ONE_EXCLUSIVE))
                .offset(SRW_ONE_EXCLUSIVE.wrapping_neg());
            self.leave_exclusive(word);
        }

        if word.exclusive_queue() != 0 {
            event.wait(self.shared_key(), None);
        }
    }

    /// Release exclusive ownership
    ///
    /// # Aborts
    ///
    /// Traps if the lock is not held exclusively.
    pub fn release_exclusive(&self) {
        let state = self.state();
        if !state.in_exclusive() && state.is_valid() {
            trap(LockTrap::NotOwned(state.bits()));
        }

        let prev = self.update_leaving(SRW_ONE_EXCLUSIVE.wrapping_neg());
        self.leave_exclusive(prev.offset(SRW_ONE_EXCLUSIVE.wrapping_neg()));
    }

    /// Release shared ownership
    ///
    /// # Aborts
    ///
    /// Traps if the lock is not held shared.
    pub fn release_shared(&self) {
        let state = self.state();
        if (state.in_exclusive() || state.shared_queue() == 0) && state.is_valid() {
            trap(LockTrap::NotOwned(state.bits()));
        }

        let remaining = self
            .update_entering(SRW_ONE_SHARED.wrapping_neg())
            .offset(SRW_ONE_SHARED.wrapping_neg());

        // The last reader out hands over to the first queued writer
        if remaining.exclusive_queue() != 0 && remaining.shared_queue() == 0 {
            KeyedEvent::global().release(self.exclusive_key());
        }
    }

    /// Take exclusive ownership only if the lock is completely free
    pub fn try_acquire_exclusive(&self) -> bool {
        let held = SRW_IN_EXCLUSIVE | SRW_ONE_EXCLUSIVE;
        match self
            .word
            .compare_exchange(0, held, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => true,
            Err(actual) => {
                check_observed(LockWord(actual));
                false
            }
        }
    }

    /// Take shared ownership only if no writer holds or waits for the lock
    pub fn try_acquire_shared(&self) -> bool {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let prev = LockWord(current);
            check_observed(prev);
            if prev.exclusive_queue() != 0 {
                return false;
            }

            let next = prev.offset(SRW_ONE_SHARED);
            check_updated(next);

            match self.word.compare_exchange_weak(
                current,
                next.0,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether anyone holds the lock (shared or exclusive)
    pub fn is_locked(&self) -> bool {
        let state = self.state();
        state.in_exclusive() || state.shared_queue() != 0
    }

    /// Whether the lock is held exclusively
    pub fn is_locked_exclusive(&self) -> bool {
        self.state().in_exclusive()
    }
}

impl Default for SrwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SrwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SrwLock").field(&self.state()).finish()
    }
}

unsafe impl RawRwLock for SrwLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: SrwLock = SrwLock::new();

    // No owner tracking, so guards may be released from any thread
    type GuardMarker = GuardSend;

    #[inline]
    fn lock_shared(&self) {
        self.acquire_shared();
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        self.try_acquire_shared()
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        self.release_shared();
    }

    #[inline]
    fn lock_exclusive(&self) {
        self.acquire_exclusive();
    }

    #[inline]
    fn try_lock_exclusive(&self) -> bool {
        self.try_acquire_exclusive()
    }

    #[inline]
    unsafe fn unlock_exclusive(&self) {
        self.release_exclusive();
    }

    #[inline]
    fn is_locked(&self) -> bool {
        SrwLock::is_locked(self)
    }

    #[inline]
    fn is_locked_exclusive(&self) -> bool {
        SrwLock::is_locked_exclusive(self)
    }
}

/// Data-carrying reader-writer lock backed by [`SrwLock`]
pub type RwLock<T> = lock_api::RwLock<SrwLock, T>;

/// Shared guard for [`RwLock`]
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, SrwLock, T>;

/// Exclusive guard for [`RwLock`]
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, SrwLock, T>;
