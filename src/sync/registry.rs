/*!
 * Address Wait Registry
 *
 * Lock-free, append-only table mapping live threads to the address they are
 * waiting on. It underlies address waits and condition variables, so it
 * cannot itself depend on any blocking primitive.
 *
 * # Design
 *
 * - Singly linked list of page-sized slices, linked with a CAS on `next`
 * - A slot is claimed with a single CAS of `owner` from 0 to the identity
 * - Slices never move, shrink or get freed while the registry is alive
 * - Per-thread slot caches hold the registry weakly
 * - Each slot carries the parker used to wake its owner
 */

use super::config::SyncConfig;
use super::parker::{Parker, ThreadIdentity};
use crate::errors::{WaitError, WaitResult};
use crate::limits::PAGE_SIZE;
use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, warn};

/// One registry entry
#[derive(Debug)]
pub(crate) struct Slot {
    /// Address the owner is waiting on (0 when not waiting)
    pub(crate) watched: AtomicUsize,
    /// Owning thread identity (0 when free)
    owner: AtomicU64,
    pub(crate) parker: Parker,
}

impl Slot {
    #[inline]
    fn is_free(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == 0
    }

    #[inline]
    fn try_claim(&self, identity: ThreadIdentity) -> bool {
        self.is_free()
            && self
                .owner
                .compare_exchange(0, identity.get(), Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    #[inline]
    pub(crate) fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    fn release(&self) {
        self.watched.store(0, Ordering::Release);
        self.owner.store(0, Ordering::Release);
    }
}

/// Number of slots that fit in one page next to the link pointer
pub const SLOTS_PER_SLICE: usize =
    (PAGE_SIZE - std::mem::size_of::<AtomicPtr<()>>()) / std::mem::size_of::<Slot>();

/// Fixed-capacity block of slots
#[repr(C)]
pub(crate) struct Slice {
    pub(crate) slots: [Slot; SLOTS_PER_SLICE],
    next: AtomicPtr<Slice>,
}

const _: () = assert!(std::mem::size_of::<Slice>() <= PAGE_SIZE);
const _: () = assert!(SLOTS_PER_SLICE > 0);

impl Slice {
    /// Allocate a zeroed slice, `None` if the allocator is out of memory
    fn allocate() -> Option<NonNull<Slice>> {
        let layout = Layout::new::<Slice>();
        // SAFETY: the layout has non-zero size. All-zero bytes are a valid
        // Slice: every field is an atomic integer or a null AtomicPtr.
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) } as *mut Slice)
    }

    /// # Safety
    ///
    /// `slice` must come from [`Slice::allocate`] and no longer be reachable.
    unsafe fn free(slice: NonNull<Slice>) {
        alloc::dealloc(slice.as_ptr() as *mut u8, Layout::new::<Slice>());
    }

    #[inline]
    pub(crate) fn next(&self) -> Option<&Slice> {
        let next = self.next.load(Ordering::Acquire);
        // SAFETY: linked slices stay allocated until the registry is dropped,
        // which cannot happen while `self` is borrowed.
        unsafe { next.as_ref() }
    }
}

pub(crate) struct RegistryInner {
    head: NonNull<Slice>,
    slices: AtomicUsize,
    max_slices: Option<usize>,
}

// SAFETY: all shared state behind `head` is atomics
unsafe impl Send for RegistryInner {}
unsafe impl Sync for RegistryInner {}

impl RegistryInner {
    #[inline]
    fn head(&self) -> &Slice {
        // SAFETY: the head slice lives as long as the registry
        unsafe { self.head.as_ref() }
    }

    /// Iterate every linked slice, head first
    pub(crate) fn slices(&self) -> impl Iterator<Item = &Slice> {
        std::iter::successors(Some(self.head()), |slice| slice.next())
    }

    /// Reserve room for one more slice under the configured cap
    fn reserve_slice(&self) -> bool {
        self.slices
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match self.max_slices {
                Some(max) if n >= max => None,
                _ => Some(n + 1),
            })
            .is_ok()
    }

    fn acquire(&self, identity: ThreadIdentity) -> WaitResult<NonNull<Slot>> {
        let mut slice = self.head();

        loop {
            // Scan from `slice` to the current tail
            loop {
                if let Some(slot) = slice.slots.iter().find(|slot| slot.try_claim(identity)) {
                    return Ok(NonNull::from(slot));
                }
                match slice.next() {
                    Some(next) => slice = next,
                    None => break,
                }
            }

            if !self.reserve_slice() {
                if let Some(next) = slice.next() {
                    slice = next;
                    continue;
                }
                // A racer holds a reservation it has not linked (or dropped) yet
                if self.slices.load(Ordering::Acquire) > self.slices().count() {
                    std::thread::yield_now();
                    continue;
                }
                let slices = self.slices.load(Ordering::Relaxed);
                warn!(slices, "Address wait registry reached its slice limit");
                return Err(WaitError::OutOfMemory { slices });
            }

            let Some(fresh) = Slice::allocate() else {
                let slices = self.slices.fetch_sub(1, Ordering::AcqRel) - 1;
                warn!(slices, "Address wait registry slice allocation failed");
                return Err(WaitError::OutOfMemory { slices });
            };

            let linked = match slice.next.compare_exchange(
                ptr::null_mut(),
                fresh.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(
                        slices = self.slices.load(Ordering::Relaxed),
                        "Address wait registry grew"
                    );
                    fresh.as_ptr()
                }
                Err(winner) => {
                    // Another thread linked first; drop ours and scan theirs
                    self.slices.fetch_sub(1, Ordering::AcqRel);
                    // SAFETY: `fresh` was never published
                    unsafe { Slice::free(fresh) };
                    winner
                }
            };

            // SAFETY: `linked` is non-null and now reachable from the head
            slice = unsafe { &*linked };
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        // Slots cached by still-running threads may be marked claimed; those
        // caches only hold weak handles and skip the release once we are gone
        let mut current = Some(self.head);
        while let Some(slice) = current {
            // SAFETY: we are the last owner; read the link before freeing
            unsafe {
                current = NonNull::new(slice.as_ref().next.load(Ordering::Acquire));
                Slice::free(slice);
            }
        }
    }
}

/// Reference to a claimed registry slot
///
/// Borrowed from the registry, so the slot cannot outlive it.
#[derive(Debug, Clone, Copy)]
pub struct SlotRef<'a> {
    slot: &'a Slot,
}

impl<'a> SlotRef<'a> {
    /// Identity that owns this slot (0 once released)
    pub fn owner(&self) -> u64 {
        self.slot.owner()
    }

    /// Address currently watched through this slot (0 if none)
    pub fn watched_address(&self) -> usize {
        self.slot.watched.load(Ordering::Acquire)
    }

    /// Stable address of the slot, usable to compare slot identity
    pub fn as_ptr(&self) -> *const () {
        self.slot as *const Slot as *const ()
    }

    pub(crate) fn slot(&self) -> &'a Slot {
        self.slot
    }
}

/// A slot claimed by the current thread and released when the thread exits
///
/// Holds the registry weakly: dropping the last handle frees the slices even
/// while threads that once waited on it are still running.
struct CachedSlot {
    registry: Weak<RegistryInner>,
    slot: NonNull<Slot>,
}

impl CachedSlot {
    #[inline]
    fn is_for(&self, registry: &Arc<RegistryInner>) -> bool {
        std::ptr::eq(self.registry.as_ptr(), Arc::as_ptr(registry))
    }

    #[inline]
    fn is_dead(&self) -> bool {
        self.registry.strong_count() == 0
    }
}

impl Drop for CachedSlot {
    fn drop(&mut self) {
        if let Some(_registry) = self.registry.upgrade() {
            // SAFETY: the upgraded handle keeps the slice holding `slot` alive
            unsafe { self.slot.as_ref() }.release();
        }
    }
}

thread_local! {
    static CACHED_SLOTS: RefCell<Vec<CachedSlot>> = const { RefCell::new(Vec::new()) };
}

/// Slot in use for the duration of one wait
pub(crate) enum ThreadSlot<'a> {
    /// Cached on the thread for its lifetime
    Cached(&'a Slot),
    /// Claimed for this wait only (thread-local storage already torn down)
    Temporary(&'a Slot),
}

impl<'a> ThreadSlot<'a> {
    pub(crate) fn slot(&self) -> &'a Slot {
        match self {
            ThreadSlot::Cached(slot) | ThreadSlot::Temporary(slot) => slot,
        }
    }
}

impl Drop for ThreadSlot<'_> {
    fn drop(&mut self) {
        if let ThreadSlot::Temporary(slot) = self {
            slot.release();
        }
    }
}

/// Lock-free registry of threads waiting on addresses
///
/// Cheap to clone; clones share the same slices.
///
/// # Examples
///
/// ```
/// use kernel_sync::sync::{AddressWaitRegistry, ThreadIdentity};
///
/// let registry = AddressWaitRegistry::with_defaults();
/// let slot = registry.acquire_slot(ThreadIdentity::new_unique()).unwrap();
/// assert_ne!(slot.owner(), 0);
/// registry.release_slot(slot);
/// ```
#[derive(Clone)]
pub struct AddressWaitRegistry {
    pub(crate) inner: Arc<RegistryInner>,
}

impl AddressWaitRegistry {
    /// Create a registry with one pre-allocated slice
    ///
    /// # Panics
    ///
    /// Aborts via `handle_alloc_error` if the first page cannot be allocated.
    pub fn new(config: &SyncConfig) -> Self {
        let head = Slice::allocate()
            .unwrap_or_else(|| alloc::handle_alloc_error(Layout::new::<Slice>()));

        Self {
            inner: Arc::new(RegistryInner {
                head,
                slices: AtomicUsize::new(1),
                max_slices: config.max_registry_slices.map(|n| n.max(1)),
            }),
        }
    }

    /// Create with default configuration (unbounded growth)
    pub fn with_defaults() -> Self {
        Self::new(&SyncConfig::default())
    }

    /// Process-wide registry, configured from the environment on first use
    pub fn global() -> &'static AddressWaitRegistry {
        static GLOBAL: OnceLock<AddressWaitRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| AddressWaitRegistry::new(&SyncConfig::from_env()))
    }

    /// Claim a free slot for `identity`, growing the registry if needed
    pub fn acquire_slot(&self, identity: ThreadIdentity) -> WaitResult<SlotRef<'_>> {
        let slot = self.inner.acquire(identity)?;
        // SAFETY: slots live as long as `self.inner`, which `&self` borrows
        Ok(SlotRef {
            slot: unsafe { slot.as_ref() },
        })
    }

    /// Return a slot to the free state (its memory is kept)
    pub fn release_slot(&self, slot: SlotRef<'_>) {
        slot.slot.release();
    }

    /// Slot cached for the calling thread, claimed on first use
    pub(crate) fn thread_slot(&self) -> WaitResult<ThreadSlot<'_>> {
        let cached = CACHED_SLOTS.try_with(|cache| -> WaitResult<NonNull<Slot>> {
            let mut cache = cache.borrow_mut();
            if let Some(entry) = cache.iter().find(|entry| entry.is_for(&self.inner)) {
                return Ok(entry.slot);
            }

            // Registries dropped since the last miss; their slots went with them
            cache.retain(|entry| !entry.is_dead());

            let identity = ThreadIdentity::current();
            let slot = self.inner.acquire(identity)?;
            debug!(identity = identity.get(), "Thread claimed address wait slot");
            cache.push(CachedSlot {
                registry: Arc::downgrade(&self.inner),
                slot,
            });
            Ok(slot)
        });

        match cached {
            // SAFETY: `&self` holds a strong handle to the registry owning the
            // slot for the whole returned borrow
            Ok(slot) => Ok(ThreadSlot::Cached(unsafe { slot?.as_ref() })),
            Err(_) => {
                let slot = self.inner.acquire(ThreadIdentity::new_unique())?;
                // SAFETY: as above
                Ok(ThreadSlot::Temporary(unsafe { slot.as_ref() }))
            }
        }
    }

    /// Number of linked slices
    pub fn slice_count(&self) -> usize {
        self.inner.slices().count()
    }

    /// Number of slots currently owned by some thread
    pub fn claimed_slots(&self) -> usize {
        self.inner
            .slices()
            .flat_map(|slice| slice.slots.iter())
            .filter(|slot| !slot.is_free())
            .count()
    }

    /// Total slot capacity of the linked slices
    pub fn capacity(&self) -> usize {
        self.slice_count() * SLOTS_PER_SLICE
    }
}

impl std::fmt::Debug for AddressWaitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressWaitRegistry")
            .field("slices", &self.slice_count())
            .field("claimed", &self.claimed_slots())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn cached_registries() -> usize {
        CACHED_SLOTS.with(|cache| cache.borrow().len())
    }

    #[test]
    fn test_slice_fits_page() {
        assert!(std::mem::size_of::<Slice>() <= PAGE_SIZE);
        assert!(SLOTS_PER_SLICE >= 100);
    }

    #[test]
    fn test_acquire_release_reuses_slot() {
        let registry = AddressWaitRegistry::with_defaults();
        let identity = ThreadIdentity::new_unique();

        let slot = registry.acquire_slot(identity).unwrap();
        let first = slot.as_ptr();
        assert_eq!(slot.owner(), identity.get());
        assert_eq!(registry.claimed_slots(), 1);

        registry.release_slot(slot);
        assert_eq!(registry.claimed_slots(), 0);

        let again = registry.acquire_slot(ThreadIdentity::new_unique()).unwrap();
        assert_eq!(again.as_ptr(), first);
    }

    #[test]
    fn test_grows_when_full() {
        let registry = AddressWaitRegistry::with_defaults();
        let mut seen = HashSet::new();

        for _ in 0..SLOTS_PER_SLICE + 1 {
            let slot = registry.acquire_slot(ThreadIdentity::new_unique()).unwrap();
            assert!(seen.insert(slot.as_ptr() as usize));
        }

        assert_eq!(registry.slice_count(), 2);
        assert_eq!(registry.claimed_slots(), SLOTS_PER_SLICE + 1);
    }

    #[test]
    fn test_bounded_registry_reports_exhaustion() {
        let registry = AddressWaitRegistry::new(&SyncConfig::bounded(1));

        for _ in 0..SLOTS_PER_SLICE {
            registry.acquire_slot(ThreadIdentity::new_unique()).unwrap();
        }

        let err = registry
            .acquire_slot(ThreadIdentity::new_unique())
            .unwrap_err();
        assert_eq!(err, WaitError::OutOfMemory { slices: 1 });
        assert_eq!(registry.slice_count(), 1);
    }

    #[test]
    fn test_thread_slot_is_cached_per_registry() {
        let registry = AddressWaitRegistry::with_defaults();
        let other = AddressWaitRegistry::with_defaults();

        let a = registry.thread_slot().unwrap().slot() as *const Slot;
        let b = registry.thread_slot().unwrap().slot() as *const Slot;
        assert_eq!(a, b);

        let c = other.thread_slot().unwrap().slot() as *const Slot;
        assert_ne!(a, c);
        assert_eq!(registry.claimed_slots(), 1);
        assert_eq!(other.claimed_slots(), 1);
    }

    #[test]
    fn test_thread_exit_releases_slot() {
        let registry = AddressWaitRegistry::with_defaults();
        let registry_clone = registry.clone();

        thread::spawn(move || {
            registry_clone.thread_slot().unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(registry.claimed_slots(), 0);
        assert_eq!(registry.slice_count(), 1);
    }

    #[test]
    fn test_dropped_registry_is_freed_despite_thread_cache() {
        let value = AtomicU32::new(1);

        for _ in 0..50 {
            let registry = AddressWaitRegistry::with_defaults();
            registry.wait_on_address(&value, 0, None).unwrap();
            let weak = Arc::downgrade(&registry.inner);
            drop(registry);
            assert!(weak.upgrade().is_none(), "thread cache kept the registry alive");
        }

        // The next miss prunes entries for registries that are gone
        let live = AddressWaitRegistry::with_defaults();
        live.wait_on_address(&value, 0, None).unwrap();
        assert!(cached_registries() <= 2);
        assert_eq!(live.claimed_slots(), 1);
    }

    #[test]
    fn test_bounded_growth_race_never_fails_early() {
        const CLAIMERS: usize = 8;

        for _ in 0..50 {
            let registry = AddressWaitRegistry::new(&SyncConfig::bounded(2));
            for _ in 0..SLOTS_PER_SLICE {
                registry.acquire_slot(ThreadIdentity::new_unique()).unwrap();
            }

            // Head is full; all claimers race for the one remaining slice
            let barrier = Arc::new(Barrier::new(CLAIMERS));
            let handles: Vec<_> = (0..CLAIMERS)
                .map(|_| {
                    let registry = registry.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        registry
                            .acquire_slot(ThreadIdentity::new_unique())
                            .map(|slot| slot.as_ptr() as usize)
                    })
                })
                .collect();

            let mut seen = HashSet::new();
            for handle in handles {
                let slot = handle.join().unwrap().expect("second slice had room");
                assert!(seen.insert(slot));
            }
            assert_eq!(registry.slice_count(), 2);
            assert_eq!(registry.claimed_slots(), SLOTS_PER_SLICE + CLAIMERS);
        }
    }

    #[test]
    fn test_repeated_waits_keep_slot_during_concurrent_claims() {
        const WAITERS: usize = 8;
        const CLAIMERS: usize = 8;
        const ROUNDS: usize = 40;

        let registry = AddressWaitRegistry::with_defaults();
        let barrier = Arc::new(Barrier::new(WAITERS + CLAIMERS));
        // Waiters keep their slots until every claimer is done
        let finished = Arc::new(Barrier::new(WAITERS + CLAIMERS));

        let waiters: Vec<_> = (0..WAITERS)
            .map(|_| {
                let registry = registry.clone();
                let (barrier, finished) = (barrier.clone(), finished.clone());
                thread::spawn(move || {
                    let value = AtomicU32::new(7);
                    let identity = ThreadIdentity::current().get();
                    barrier.wait();

                    let mut slots = HashSet::new();
                    for round in 0..ROUNDS {
                        if round % 2 == 0 {
                            // Value differs, returns at once
                            registry.wait_on_address(&value, 0, None).unwrap();
                        } else {
                            let _ = registry.wait_on_address(
                                &value,
                                7,
                                Some(Duration::from_millis(1)),
                            );
                        }
                        let slot = registry.thread_slot().unwrap();
                        assert_eq!(slot.slot().owner(), identity);
                        slots.insert(slot.slot() as *const Slot as usize);
                    }
                    finished.wait();
                    slots
                })
            })
            .collect();

        let claimers: Vec<_> = (0..CLAIMERS)
            .map(|_| {
                let registry = registry.clone();
                let (barrier, finished) = (barrier.clone(), finished.clone());
                thread::spawn(move || {
                    barrier.wait();
                    let slots = (0..SLOTS_PER_SLICE / 4)
                        .map(|_| {
                            let slot = registry.acquire_slot(ThreadIdentity::new_unique()).unwrap();
                            slot.as_ptr() as usize
                        })
                        .collect::<Vec<_>>();
                    finished.wait();
                    slots
                })
            })
            .collect();

        let mut waiter_slots = HashSet::new();
        for waiter in waiters {
            let slots = waiter.join().unwrap();
            assert_eq!(slots.len(), 1, "waiter moved between slots");
            assert!(waiter_slots.insert(slots.into_iter().next().unwrap()));
        }

        let mut claimed = HashSet::new();
        for claimer in claimers {
            for slot in claimer.join().unwrap() {
                assert!(!waiter_slots.contains(&slot), "claimed a waiter's slot");
                assert!(claimed.insert(slot));
            }
        }
        assert_eq!(claimed.len(), CLAIMERS * (SLOTS_PER_SLICE / 4));
    }
}
