/*!
 * Address Wait/Wake
 *
 * Park until the value at an address changes; wake one or all threads
 * parked on an address. Built on the registry slots and their parkers.
 *
 * # Ordering
 *
 * The waiter publishes its address and then issues a full fence before it
 * compares the live value. Wakers issue a full fence before scanning the
 * registry. Given
 *
 * ```text
 * waiter                          waker
 * slot.watched = addr             *addr = new
 * fence(SeqCst)  <--- paired ---> fence(SeqCst)
 * compare *addr                   scan slots for addr
 * ```
 *
 * at least one side observes the other: either the waiter sees the new
 * value and never parks, or the waker sees the registered slot and unparks
 * it. A wake can therefore never fall between the check and the park.
 */

use super::registry::AddressWaitRegistry;
use super::traits::{Watchable, WakeResult};
use crate::errors::{WaitError, WaitResult};
use std::sync::atomic::{fence, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Read `size` bytes at `addr` atomically and compare with `expected`
///
/// # Safety
///
/// `addr` must be valid for reads of `expected.len()` bytes and aligned to it.
unsafe fn matches_expected(addr: usize, expected: &[u8]) -> bool {
    match expected.len() {
        1 => AtomicU8::from_ptr(addr as *mut u8).load(Ordering::SeqCst).to_ne_bytes() == expected,
        2 => AtomicU16::from_ptr(addr as *mut u16).load(Ordering::SeqCst).to_ne_bytes() == expected,
        4 => AtomicU32::from_ptr(addr as *mut u32).load(Ordering::SeqCst).to_ne_bytes() == expected,
        8 => AtomicU64::from_ptr(addr as *mut u64).load(Ordering::SeqCst).to_ne_bytes() == expected,
        _ => false,
    }
}

impl AddressWaitRegistry {
    /// Wait until `atomic` no longer holds `expected`, a wake arrives, or
    /// `timeout` elapses
    ///
    /// Returns `Ok(())` immediately if the value already differs. A wake
    /// without a value change (spurious or from a shared address) is also
    /// `Ok(())`; callers re-check their condition.
    ///
    /// # Examples
    ///
    /// ```
    /// use kernel_sync::sync::AddressWaitRegistry;
    /// use std::sync::atomic::AtomicU32;
    /// use std::time::Duration;
    ///
    /// let registry = AddressWaitRegistry::with_defaults();
    /// let flag = AtomicU32::new(1);
    ///
    /// // Value differs from the comparand: returns without blocking
    /// assert!(registry.wait_on_address(&flag, 0, Some(Duration::from_secs(1))).is_ok());
    /// ```
    pub fn wait_on_address<A: Watchable>(
        &self,
        atomic: &A,
        expected: A::Value,
        timeout: Option<Duration>,
    ) -> WaitResult<()> {
        self.wait_with(atomic.address(), A::SIZE, timeout, || {
            atomic.current() == expected
        })
    }

    /// Untyped form of [`wait_on_address`](Self::wait_on_address)
    ///
    /// Compares `expected.len()` bytes at `addr`, which must be 1, 2, 4 or 8.
    ///
    /// # Safety
    ///
    /// `addr` must stay valid for atomic reads of `expected.len()` bytes for
    /// the duration of the call.
    pub unsafe fn wait_on_address_raw(
        &self,
        addr: *const u8,
        expected: &[u8],
        timeout: Option<Duration>,
    ) -> WaitResult<()> {
        let size = expected.len();
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(WaitError::InvalidSize(size));
        }

        let addr = addr as usize;
        if addr % size != 0 {
            return Err(WaitError::Misaligned(addr));
        }

        // SAFETY: size and alignment checked above, validity is the caller's
        self.wait_with(addr, size, timeout, || unsafe {
            matches_expected(addr, expected)
        })
    }

    fn wait_with(
        &self,
        addr: usize,
        size: usize,
        timeout: Option<Duration>,
        unchanged: impl Fn() -> bool,
    ) -> WaitResult<()> {
        trace!(
            address = format_args!("{addr:#x}"),
            size,
            timeout = ?timeout,
            "wait on address"
        );

        let deadline = timeout.map(|t| Instant::now() + t);
        let thread_slot = self.thread_slot()?;
        let slot = thread_slot.slot();

        // Wakes aimed at an earlier wait are stale now; any wake for this
        // wait has to find the address stored below
        slot.parker.reset();
        slot.watched.store(addr, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        if !unchanged() {
            slot.watched.store(0, Ordering::SeqCst);
            return Ok(());
        }

        let woken = slot.parker.park(deadline);
        // A single-waker that claimed us has already cleared the address
        let claimed = slot.watched.swap(0, Ordering::SeqCst) != addr;

        if woken || claimed {
            Ok(())
        } else {
            trace!(address = format_args!("{addr:#x}"), "wait on address timed out");
            Err(WaitError::Timeout)
        }
    }

    /// Wake every thread waiting on `addr`
    pub fn wake_address_all<T>(&self, addr: *const T) -> WakeResult {
        let addr = addr as usize;
        if addr == 0 {
            return WakeResult::NoWaiters;
        }

        fence(Ordering::SeqCst);

        let mut woken = 0;
        for slice in self.inner.slices() {
            for slot in slice.slots.iter() {
                if slot.watched.load(Ordering::SeqCst) == addr && slot.owner() != 0 {
                    // A thread that already left just re-checks its condition
                    slot.parker.unpark();
                    woken += 1;
                }
            }
        }

        trace!(address = format_args!("{addr:#x}"), woken, "wake address all");
        WakeResult::from_count(woken)
    }

    /// Wake at most one thread waiting on `addr`
    ///
    /// The waiter is claimed by swapping its watched address to zero, so two
    /// concurrent calls never pick the same waiter.
    pub fn wake_address_single<T>(&self, addr: *const T) -> WakeResult {
        let addr = addr as usize;
        if addr == 0 {
            return WakeResult::NoWaiters;
        }

        fence(Ordering::SeqCst);

        for slice in self.inner.slices() {
            for slot in slice.slots.iter() {
                if slot.watched.load(Ordering::SeqCst) == addr
                    && slot
                        .watched
                        .compare_exchange(addr, 0, Ordering::SeqCst, Ordering::Relaxed)
                        .is_ok()
                {
                    slot.parker.unpark();
                    trace!(address = format_args!("{addr:#x}"), "wake address single");
                    return WakeResult::Woken(1);
                }
            }
        }

        WakeResult::NoWaiters
    }

    /// Number of registered waiters on `addr` (for diagnostics)
    pub fn waiter_count<T>(&self, addr: *const T) -> usize {
        let addr = addr as usize;
        self.inner
            .slices()
            .flat_map(|slice| slice.slots.iter())
            .filter(|slot| addr != 0 && slot.watched.load(Ordering::Acquire) == addr)
            .count()
    }
}
