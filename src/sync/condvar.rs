/*!
 * Condition Variable
 *
 * A 32-bit token that wakes increment, plus address wait on the token.
 * There is no waiter list: a sleeper snapshots the token before releasing
 * its lock and waits for the token to move away from the snapshot. Any wake
 * issued after the snapshot changes the token, so it cannot be lost.
 *
 * Works with a `parking_lot::Mutex`, with [`SrwLock`] in either mode, and
 * with the [`RwLock`](super::srwlock::RwLock) guards.
 */

use super::registry::AddressWaitRegistry;
use super::srwlock::{RwLockReadGuard, RwLockWriteGuard, SrwLock};
use super::traits::WakeResult;
use crate::errors::WaitResult;
use parking_lot::MutexGuard;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::trace;

/// Mode in which a lock is held across a condition variable sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// Condition variable over the address wait facility
///
/// Wakes may be spurious; callers re-check their predicate in a loop.
///
/// # Examples
///
/// ```
/// use kernel_sync::sync::ConditionVariable;
/// use parking_lot::Mutex;
/// use std::sync::Arc;
/// use std::thread;
///
/// let pair = Arc::new((Mutex::new(false), ConditionVariable::new()));
/// let pair2 = pair.clone();
///
/// thread::spawn(move || {
///     let (ready, cond) = &*pair2;
///     *ready.lock() = true;
///     cond.wake_one();
/// });
///
/// let (ready, cond) = &*pair;
/// let mut guard = ready.lock();
/// while !*guard {
///     cond.wait_mutex(&mut guard, None).unwrap();
/// }
/// ```
pub struct ConditionVariable {
    token: AtomicU32,
    registry: AddressWaitRegistry,
}

impl ConditionVariable {
    /// Create a condition variable on the process-wide registry
    pub fn new() -> Self {
        Self::with_registry(AddressWaitRegistry::global().clone())
    }

    /// Create a condition variable on an explicit registry
    pub fn with_registry(registry: AddressWaitRegistry) -> Self {
        Self {
            token: AtomicU32::new(0),
            registry,
        }
    }

    /// Wake one sleeper
    pub fn wake_one(&self) -> WakeResult {
        self.token.fetch_add(1, Ordering::SeqCst);
        self.registry.wake_address_single(&self.token)
    }

    /// Wake every sleeper
    pub fn wake_all(&self) -> WakeResult {
        self.token.fetch_add(1, Ordering::SeqCst);
        self.registry.wake_address_all(&self.token)
    }

    /// Current token (for diagnostics)
    pub fn token(&self) -> u32 {
        self.token.load(Ordering::Relaxed)
    }

    fn sleep(&self, snapshot: u32, timeout: Option<Duration>) -> WaitResult<()> {
        trace!(token = snapshot, timeout = ?timeout, "condition variable sleep");
        self.registry.wait_on_address(&self.token, snapshot, timeout)
    }

    /// Release `lock` in `mode`, sleep, then reacquire it in `mode`
    ///
    /// The lock is reacquired whatever the outcome; a timeout is reported as
    /// `Err(WaitError::Timeout)` with the lock held again.
    pub fn sleep_with(
        &self,
        lock: &SrwLock,
        timeout: Option<Duration>,
        mode: LockMode,
    ) -> WaitResult<()> {
        let snapshot = self.token.load(Ordering::SeqCst);

        match mode {
            LockMode::Exclusive => lock.release_exclusive(),
            LockMode::Shared => lock.release_shared(),
        }

        let result = self.sleep(snapshot, timeout);

        match mode {
            LockMode::Exclusive => lock.acquire_exclusive(),
            LockMode::Shared => lock.acquire_shared(),
        }

        result
    }

    /// Sleep with a `parking_lot` mutex released
    pub fn wait_mutex<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Option<Duration>,
    ) -> WaitResult<()> {
        let snapshot = self.token.load(Ordering::SeqCst);
        MutexGuard::unlocked(guard, || self.sleep(snapshot, timeout))
    }

    /// Sleep with an exclusively held [`RwLock`](super::srwlock::RwLock) released
    pub fn wait_exclusive<T: ?Sized>(
        &self,
        guard: &mut RwLockWriteGuard<'_, T>,
        timeout: Option<Duration>,
    ) -> WaitResult<()> {
        let snapshot = self.token.load(Ordering::SeqCst);
        RwLockWriteGuard::unlocked(guard, || self.sleep(snapshot, timeout))
    }

    /// Sleep with a shared [`RwLock`](super::srwlock::RwLock) guard released
    pub fn wait_shared<T: ?Sized>(
        &self,
        guard: &mut RwLockReadGuard<'_, T>,
        timeout: Option<Duration>,
    ) -> WaitResult<()> {
        let snapshot = self.token.load(Ordering::SeqCst);
        RwLockReadGuard::unlocked(guard, || self.sleep(snapshot, timeout))
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("token", &self.token())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::WaitError;
    use crate::sync::srwlock::RwLock;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wake_without_sleepers() {
        let cond = ConditionVariable::with_registry(AddressWaitRegistry::with_defaults());
        assert_eq!(cond.wake_one(), WakeResult::NoWaiters);
        assert_eq!(cond.wake_all(), WakeResult::NoWaiters);
        assert_eq!(cond.token(), 2);
    }

    #[test]
    fn test_sleep_timeout_reacquires() {
        let cond = ConditionVariable::with_registry(AddressWaitRegistry::with_defaults());
        let lock = SrwLock::new();
        lock.acquire_exclusive();

        let start = Instant::now();
        let result = cond.sleep_with(&lock, Some(Duration::from_millis(30)), LockMode::Exclusive);
        assert_eq!(result, Err(WaitError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(lock.is_locked_exclusive());
        lock.release_exclusive();
    }

    #[test]
    fn test_wait_mutex_wake_one() {
        let pair = Arc::new((Mutex::new(0u32), ConditionVariable::new()));

        let consumer = {
            let pair = pair.clone();
            thread::spawn(move || {
                let (value, cond) = &*pair;
                let mut guard = value.lock();
                while *guard == 0 {
                    cond.wait_mutex(&mut guard, Some(Duration::from_secs(5))).unwrap();
                }
                *guard
            })
        };

        thread::sleep(Duration::from_millis(20));
        {
            let (value, cond) = &*pair;
            *value.lock() = 7;
            cond.wake_one();
        }

        assert_eq!(consumer.join().unwrap(), 7);
    }

    #[test]
    fn test_wake_all_releases_shared_sleepers() {
        let registry = AddressWaitRegistry::with_defaults();
        let state = Arc::new((RwLock::new(false), ConditionVariable::with_registry(registry)));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let state = state.clone();
                thread::spawn(move || {
                    let (flag, cond) = &*state;
                    let mut guard = flag.read();
                    while !*guard {
                        cond.wait_shared(&mut guard, Some(Duration::from_secs(5))).unwrap();
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(30));
        {
            let (flag, cond) = &*state;
            *flag.write() = true;
            cond.wake_all();
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_wait_exclusive_guard() {
        let state = Arc::new((RwLock::new(Vec::<u32>::new()), ConditionVariable::new()));

        let waiter = {
            let state = state.clone();
            thread::spawn(move || {
                let (items, cond) = &*state;
                let mut guard = items.write();
                while guard.is_empty() {
                    cond.wait_exclusive(&mut guard, Some(Duration::from_secs(5))).unwrap();
                }
                guard.pop()
            })
        };

        thread::sleep(Duration::from_millis(20));
        {
            let (items, cond) = &*state;
            items.write().push(11);
            cond.wake_one();
        }

        assert_eq!(waiter.join().unwrap(), Some(11));
    }
}
