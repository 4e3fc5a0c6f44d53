/*!
 * Synchronization Traits
 *
 * Shared result types and the set of atomics an address wait can watch.
 */

use std::sync::atomic::{
    AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicU16, AtomicU32, AtomicU64, AtomicU8,
    AtomicUsize, Ordering,
};

/// Result of a wake operation
///
/// Compact representation (single usize) for efficient returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeResult {
    /// Successfully woke N waiters (N >= 1)
    Woken(usize),
    /// No waiters were waiting
    NoWaiters,
}

impl WakeResult {
    #[inline(always)]
    pub(crate) fn from_count(n: usize) -> Self {
        if n == 0 {
            WakeResult::NoWaiters
        } else {
            WakeResult::Woken(n)
        }
    }

    /// Check if any waiters were woken
    #[inline(always)]
    pub fn is_woken(&self) -> bool {
        matches!(self, WakeResult::Woken(_))
    }

    /// Get number of woken waiters (0 if none)
    #[inline(always)]
    pub fn count(&self) -> usize {
        match self {
            WakeResult::Woken(n) => *n,
            WakeResult::NoWaiters => 0,
        }
    }
}

/// An atomic integer that [`wait_on_address`] can watch
///
/// Implemented for the 1, 2, 4 and 8 byte atomics. The comparison is done on
/// the live value with sequentially consistent loads so it pairs with the
/// fences in the wake path.
///
/// [`wait_on_address`]: crate::sync::AddressWaitRegistry::wait_on_address
pub trait Watchable: Sync + Sized {
    /// Plain value stored in the atomic
    type Value: Copy + PartialEq + std::fmt::Debug;

    /// Width of the watched value in bytes
    const SIZE: usize;

    /// Load the current value
    fn current(&self) -> Self::Value;

    /// Address used as the wait key
    fn address(&self) -> usize {
        self as *const Self as *const u8 as usize
    }
}

macro_rules! impl_watchable {
    ($($atomic:ty => $value:ty),* $(,)?) => {
        $(
            impl Watchable for $atomic {
                type Value = $value;
                const SIZE: usize = std::mem::size_of::<$value>();

                #[inline]
                fn current(&self) -> $value {
                    self.load(Ordering::SeqCst)
                }
            }
        )*
    };
}

impl_watchable! {
    AtomicU8 => u8,
    AtomicI8 => i8,
    AtomicU16 => u16,
    AtomicI16 => i16,
    AtomicU32 => u32,
    AtomicI32 => i32,
    AtomicU64 => u64,
    AtomicI64 => i64,
    AtomicUsize => usize,
}
