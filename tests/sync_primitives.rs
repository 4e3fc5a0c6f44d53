/*!
 * Synchronization Primitives Integration Tests
 *
 * Cross-primitive tests for address wait/wake, condition variables with the
 * reader-writer lock, and once initialization
 */

use kernel_sync::errors::{OnceError, WaitError};
use kernel_sync::sync::{
    AddressWaitRegistry, ConditionVariable, LockMode, OnceGuard, SrwLock, SyncConfig,
    ThreadIdentity, WakeResult, SLOTS_PER_SLICE,
};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition never became true");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_no_missed_wakeup() {
    let registry = AddressWaitRegistry::with_defaults();

    for _ in 0..200 {
        let flag = Arc::new(AtomicU32::new(0));

        let waiter = {
            let registry = registry.clone();
            let flag = flag.clone();
            thread::spawn(move || {
                let start = Instant::now();
                while flag.load(Ordering::SeqCst) == 0 {
                    registry
                        .wait_on_address(&*flag, 0, Some(Duration::from_secs(5)))
                        .unwrap();
                }
                start.elapsed()
            })
        };

        flag.store(1, Ordering::SeqCst);
        registry.wake_address_all(Arc::as_ptr(&flag));

        // A lost wake would show up as a full timeout
        let elapsed = waiter.join().unwrap();
        assert!(elapsed < Duration::from_secs(5));
    }
}

#[test]
fn test_wake_single_wakes_exactly_one() {
    let registry = AddressWaitRegistry::with_defaults();
    let value = Arc::new(AtomicU64::new(0));
    let woken = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();
            let value = value.clone();
            let woken = woken.clone();
            thread::spawn(move || {
                if registry
                    .wait_on_address(&*value, 0, Some(Duration::from_millis(500)))
                    .is_ok()
                {
                    woken.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    wait_until(|| registry.waiter_count(Arc::as_ptr(&value)) == 4);
    assert_eq!(registry.wake_address_single(Arc::as_ptr(&value)), WakeResult::Woken(1));

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 1);
}

#[test]
fn test_registry_concurrent_claims_are_unique() {
    let registry = AddressWaitRegistry::with_defaults();

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || {
                (0..10)
                    .map(|_| {
                        let slot = registry.acquire_slot(ThreadIdentity::new_unique()).unwrap();
                        slot.as_ptr() as usize
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for slot in handle.join().unwrap() {
            assert!(seen.insert(slot), "slot handed out twice");
        }
    }

    assert_eq!(seen.len(), 1000);
    assert!(registry.slice_count() >= 1000usize.div_ceil(SLOTS_PER_SLICE));
    assert_eq!(registry.claimed_slots(), 1000);
}

#[test]
fn test_registry_claims_with_concurrent_scanner() {
    const CLAIMERS: usize = 1000;

    let registry = AddressWaitRegistry::with_defaults();
    let barrier = Arc::new(Barrier::new(CLAIMERS));
    let done = Arc::new(AtomicBool::new(false));

    let scanner = {
        let registry = registry.clone();
        let done = done.clone();
        thread::spawn(move || {
            let idle = AtomicU32::new(0);
            let mut last_slices = registry.slice_count();
            while !done.load(Ordering::SeqCst) {
                let slices = registry.slice_count();
                assert!(slices >= last_slices, "slice count went backwards");
                last_slices = slices;

                assert_eq!(registry.waiter_count(&idle as *const AtomicU32), 0);
                assert_eq!(
                    registry.wake_address_all(&idle as *const AtomicU32),
                    WakeResult::NoWaiters
                );
                assert!(registry.claimed_slots() <= registry.capacity());
            }
        })
    };

    let handles: Vec<_> = (0..CLAIMERS)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let slot = registry.acquire_slot(ThreadIdentity::new_unique()).unwrap();
                slot.as_ptr() as usize
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        assert!(seen.insert(handle.join().unwrap()), "slot handed out twice");
    }
    done.store(true, Ordering::SeqCst);
    scanner.join().unwrap();

    assert_eq!(seen.len(), CLAIMERS);
    assert!(registry.slice_count() >= CLAIMERS.div_ceil(SLOTS_PER_SLICE));
    assert_eq!(registry.claimed_slots(), CLAIMERS);
}

#[test]
fn test_registries_are_independent() {
    let bounded = AddressWaitRegistry::new(&SyncConfig {
        max_registry_slices: Some(1),
        ..SyncConfig::default()
    });
    let other = AddressWaitRegistry::with_defaults();

    let slots: Vec<_> = (0..SLOTS_PER_SLICE)
        .map(|_| bounded.acquire_slot(ThreadIdentity::new_unique()).unwrap())
        .collect();
    assert!(matches!(
        bounded.acquire_slot(ThreadIdentity::new_unique()),
        Err(WaitError::OutOfMemory { slices: 1 })
    ));

    // Exhausting one registry leaves another untouched
    let value = AtomicU32::new(1);
    assert_eq!(other.wait_on_address(&value, 0, None), Ok(()));

    for slot in slots {
        bounded.release_slot(slot);
    }
    assert_eq!(bounded.claimed_slots(), 0);
}

#[test]
fn test_condvar_shared_sleeper_with_queued_writer() {
    let lock = Arc::new(SrwLock::new());
    let cond = Arc::new(ConditionVariable::with_registry(AddressWaitRegistry::with_defaults()));
    let a_holds = Arc::new(AtomicBool::new(false));
    let go_sleep = Arc::new(AtomicBool::new(false));
    let a_done = Arc::new(AtomicBool::new(false));

    let a = {
        let (lock, cond) = (lock.clone(), cond.clone());
        let (a_holds, go_sleep, a_done) = (a_holds.clone(), go_sleep.clone(), a_done.clone());
        thread::spawn(move || {
            lock.acquire_shared();
            a_holds.store(true, Ordering::SeqCst);
            wait_until(|| go_sleep.load(Ordering::SeqCst));

            let result = cond.sleep_with(&lock, Some(Duration::from_secs(5)), LockMode::Shared);
            a_done.store(true, Ordering::SeqCst);
            lock.release_shared();
            result
        })
    };
    wait_until(|| a_holds.load(Ordering::SeqCst));

    let b = {
        let lock = lock.clone();
        thread::spawn(move || {
            lock.acquire_exclusive();
            lock.release_exclusive();
        })
    };
    // B queues behind A's shared hold
    wait_until(|| lock.state().exclusive_queue() == 1);
    go_sleep.store(true, Ordering::SeqCst);

    let c = {
        let cond = cond.clone();
        let a_done = a_done.clone();
        thread::spawn(move || {
            while !a_done.load(Ordering::SeqCst) {
                cond.wake_all();
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    assert_eq!(a.join().unwrap(), Ok(()));
    b.join().unwrap();
    c.join().unwrap();
    assert_eq!(lock.bits(), 0);
}

#[test]
fn test_condvar_producer_consumer() {
    let lock = Arc::new(SrwLock::new());
    let cond = Arc::new(ConditionVariable::new());
    let items = Arc::new(AtomicU32::new(0));
    let consumed = Arc::new(AtomicU32::new(0));

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let (lock, cond) = (lock.clone(), cond.clone());
            let (items, consumed) = (items.clone(), consumed.clone());
            thread::spawn(move || {
                for _ in 0..25 {
                    lock.acquire_exclusive();
                    while items.load(Ordering::SeqCst) == 0 {
                        let _ = cond.sleep_with(
                            &lock,
                            Some(Duration::from_millis(100)),
                            LockMode::Exclusive,
                        );
                    }
                    items.fetch_sub(1, Ordering::SeqCst);
                    consumed.fetch_add(1, Ordering::SeqCst);
                    lock.release_exclusive();
                }
            })
        })
        .collect();

    for _ in 0..100 {
        lock.acquire_exclusive();
        items.fetch_add(1, Ordering::SeqCst);
        lock.release_exclusive();
        cond.wake_one();
    }

    for consumer in consumers {
        consumer.join().unwrap();
    }
    assert_eq!(consumed.load(Ordering::SeqCst), 100);
    assert_eq!(items.load(Ordering::SeqCst), 0);
}

#[test]
fn test_once_concurrent_initialization() {
    static GUARD: OnceGuard = OnceGuard::new();
    static RUNS: AtomicU32 = AtomicU32::new(0);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            thread::spawn(|| {
                GUARD.execute_once(|| {
                    RUNS.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    Ok::<_, OnceError>(0xbeef0)
                })
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Ok(0xbeef0));
    }
    assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    assert!(GUARD.is_completed());
}

#[test]
fn test_once_failure_hands_over_to_waiter() {
    let guard = Arc::new(OnceGuard::new());
    let attempts = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let guard = guard.clone();
            let attempts = attempts.clone();
            thread::spawn(move || {
                guard.execute_once(|| {
                    // First attempt fails, the next one succeeds
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        thread::sleep(Duration::from_millis(20));
                        Err(OnceError::NotCompleted)
                    } else {
                        Ok(0x80)
                    }
                })
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    assert_eq!(results.iter().filter(|r| **r == Ok(0x80)).count(), 3);
}
