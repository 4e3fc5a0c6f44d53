/*!
 * Once Guard
 *
 * One-time initialization in a single pointer-sized word. The low two bits
 * hold the state tag:
 *
 * - `0` uninitialized
 * - `1` pending (synchronous); upper bits head a list of waiter nodes
 * - `2` done; upper bits carry the completion context
 * - `3` pending (asynchronous)
 *
 * Blocking waiters push a node living on their own stack onto the list and
 * sleep on the keyed event under the node's address. Completion detaches the
 * whole list and releases every node. A failed synchronous initializer
 * resets the guard and wakes the waiters so one of them retries.
 */

use super::keyed::KeyedEvent;
use crate::errors::{OnceError, OnceResult};
use crate::limits::ONCE_STATE_MASK;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace};

const UNINITIALIZED: usize = 0;
const PENDING: usize = 1;
const DONE: usize = 2;
const PENDING_ASYNC: usize = 3;

/// How [`OnceGuard::begin`] behaves while another caller initializes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginMode {
    /// Block until the pending initializer completes or fails
    Blocking,
    /// Never block; concurrent initializers race and the first completion wins
    Async,
    /// Only report a finished initialization
    CheckOnly,
}

/// How [`OnceGuard::complete`] publishes the result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteMode {
    /// Finish a [`BeginMode::Blocking`] initialization and wake the waiters
    Blocking,
    /// Finish a [`BeginMode::Async`] initialization
    Async,
}

/// Outcome of [`OnceGuard::begin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnceBegin {
    /// Caller won the right to initialize and must complete (or fail)
    Pending,
    /// Async initialization already running; caller may race to complete it
    PendingAgain,
    /// Initialization finished with this context
    Done(usize),
}

/// Waiter node linked through the guard word
///
/// Lives on the waiting thread's stack until its keyed wait returns. The
/// alignment keeps the state tag bits free.
#[repr(C, align(4))]
struct WaitNode {
    next: AtomicUsize,
}

/// One-time initialization guard
///
/// # Examples
///
/// ```
/// use kernel_sync::errors::OnceError;
/// use kernel_sync::sync::OnceGuard;
///
/// static SETUP: OnceGuard = OnceGuard::new();
///
/// let ctx = SETUP.execute_once(|| Ok::<_, OnceError>(0x1000)).unwrap();
/// assert_eq!(ctx, 0x1000);
///
/// // Later calls observe the stored context without running anything
/// let again = SETUP.execute_once(|| -> Result<usize, OnceError> { unreachable!() });
/// assert_eq!(again, Ok(0x1000));
/// ```
pub struct OnceGuard {
    state: AtomicUsize,
}

impl OnceGuard {
    /// Create an uninitialized guard
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(UNINITIALIZED),
        }
    }

    /// Start (or join) initialization
    pub fn begin(&self, mode: BeginMode) -> OnceResult<OnceBegin> {
        if mode == BeginMode::CheckOnly {
            let value = self.state.load(Ordering::Acquire);
            return if value & ONCE_STATE_MASK == DONE {
                Ok(OnceBegin::Done(value & !ONCE_STATE_MASK))
            } else {
                Err(OnceError::NotCompleted)
            };
        }

        let is_async = mode == BeginMode::Async;
        let mut value = self.state.load(Ordering::Acquire);

        loop {
            match value & ONCE_STATE_MASK {
                UNINITIALIZED => {
                    let claimed = if is_async { PENDING_ASYNC } else { PENDING };
                    match self.state.compare_exchange(
                        UNINITIALIZED,
                        claimed,
                        Ordering::Acquire,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Ok(OnceBegin::Pending),
                        Err(actual) => value = actual,
                    }
                }

                PENDING => {
                    if is_async {
                        return Err(OnceError::ModeMismatch);
                    }

                    let node = WaitNode {
                        next: AtomicUsize::new(value & !ONCE_STATE_MASK),
                    };
                    let node_addr = &node as *const WaitNode as usize;

                    match self.state.compare_exchange(
                        value,
                        node_addr | PENDING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            trace!(node = format_args!("{node_addr:#x}"), "once guard wait");
                            // Completion or failure releases exactly this key once
                            KeyedEvent::global().wait(node_addr, None);
                            value = self.state.load(Ordering::Acquire);
                        }
                        Err(actual) => value = actual,
                    }
                }

                DONE => return Ok(OnceBegin::Done(value & !ONCE_STATE_MASK)),

                _ => {
                    return if is_async {
                        Ok(OnceBegin::PendingAgain)
                    } else {
                        Err(OnceError::ModeMismatch)
                    };
                }
            }
        }
    }

    /// Publish `context` and finish initialization
    ///
    /// `context` must have its two low bits clear.
    pub fn complete(&self, mode: CompleteMode, context: usize) -> OnceResult<()> {
        if context & ONCE_STATE_MASK != 0 {
            return Err(OnceError::MisalignedContext(context));
        }
        self.transition(mode, context | DONE)
    }

    /// Abandon a blocking initialization so another caller may retry
    pub fn fail(&self) -> OnceResult<()> {
        debug!("once guard initializer failed, resetting");
        self.transition(CompleteMode::Blocking, UNINITIALIZED)
    }

    fn transition(&self, mode: CompleteMode, target: usize) -> OnceResult<()> {
        let expected_tag = match mode {
            CompleteMode::Blocking => PENDING,
            CompleteMode::Async => PENDING_ASYNC,
        };

        let mut value = self.state.load(Ordering::Acquire);
        loop {
            match value & ONCE_STATE_MASK {
                tag if tag == expected_tag => {}
                PENDING | PENDING_ASYNC => return Err(OnceError::ModeMismatch),
                _ => return Err(OnceError::NotPending),
            }

            match self
                .state
                .compare_exchange(value, target, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => value = actual,
            }
        }

        Self::release_waiters(value & !ONCE_STATE_MASK);
        Ok(())
    }

    /// Wake every node of a detached waiter list
    fn release_waiters(mut head: usize) {
        let event = KeyedEvent::global();
        while head != 0 {
            // SAFETY: the node stays alive until its owner's keyed wait
            // returns, which needs the release below; read `next` first
            let next = unsafe { (*(head as *const WaitNode)).next.load(Ordering::Relaxed) };
            event.release(head);
            head = next;
        }
    }

    /// Run `init` exactly once and return its context
    ///
    /// Concurrent callers block until the running initializer finishes. When
    /// `init` fails (or panics) the guard resets, one blocked caller retries,
    /// and this caller gets the error.
    pub fn execute_once<F, E>(&self, init: F) -> Result<usize, E>
    where
        F: FnOnce() -> Result<usize, E>,
        E: From<OnceError>,
    {
        match self.begin(BeginMode::Blocking)? {
            OnceBegin::Done(context) => Ok(context),
            OnceBegin::Pending | OnceBegin::PendingAgain => {
                let reset = ResetOnDrop { guard: self };
                let context = init()?;
                self.complete(CompleteMode::Blocking, context)?;
                std::mem::forget(reset);
                Ok(context)
            }
        }
    }

    /// Whether initialization finished
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) & ONCE_STATE_MASK == DONE
    }

    /// Reset to uninitialized
    ///
    /// Exclusive access guarantees nobody is waiting.
    pub fn reinitialize(&mut self) {
        *self.state.get_mut() = UNINITIALIZED;
    }
}

/// Resets a pending guard unless disarmed with `mem::forget`
struct ResetOnDrop<'a> {
    guard: &'a OnceGuard,
}

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        let _ = self.guard.fail();
    }
}

impl Default for OnceGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OnceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.state.load(Ordering::Relaxed);
        let state = match value & ONCE_STATE_MASK {
            UNINITIALIZED => "uninitialized",
            PENDING => "pending",
            DONE => "done",
            _ => "pending_async",
        };
        f.debug_struct("OnceGuard").field("state", &state).finish()
    }
}
