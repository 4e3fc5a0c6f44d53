/*!
 * Error Types
 * Centralized error handling with thiserror and miette
 */

use miette::Diagnostic;
use thiserror::Error;

/// Result type for address waits and registry operations
pub type WaitResult<T> = Result<T, WaitError>;

/// Result type for one-time initialization
pub type OnceResult<T> = Result<T, OnceError>;

/// Wait operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum WaitError {
    #[error("Wait operation timed out")]
    #[diagnostic(
        code(wait::timeout),
        help("The watched value did not change and no wake arrived before the deadline.")
    )]
    Timeout,

    #[error("Unsupported comparand size: {0} bytes")]
    #[diagnostic(
        code(wait::invalid_size),
        help("Address waits compare exactly 1, 2, 4 or 8 bytes.")
    )]
    InvalidSize(usize),

    #[error("Address {0:#x} is not aligned to the comparand size")]
    #[diagnostic(
        code(wait::misaligned),
        help("The watched address must be naturally aligned for its width.")
    )]
    Misaligned(usize),

    #[error("Address wait registry exhausted after {slices} slices")]
    #[diagnostic(
        code(wait::out_of_memory),
        help("No slot is free and a new registry slice could not be allocated.")
    )]
    OutOfMemory { slices: usize },
}

/// One-time initialization errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum OnceError {
    #[error("Once guard is pending in a different mode")]
    #[diagnostic(
        code(once::mode_mismatch),
        help("Blocking and async initialization cannot be mixed on the same guard.")
    )]
    ModeMismatch,

    #[error("Once guard has not completed")]
    #[diagnostic(code(once::not_completed))]
    NotCompleted,

    #[error("Once guard is not pending")]
    #[diagnostic(
        code(once::not_pending),
        help("complete() and fail() are only valid after begin() returned Pending.")
    )]
    NotPending,

    #[error("Completion context {0:#x} uses the reserved low bits")]
    #[diagnostic(
        code(once::misaligned_context),
        help("Contexts must be at least 4-byte aligned; the low two bits carry the guard state.")
    )]
    MisalignedContext(usize),
}

/// Fatal lock-word conditions
///
/// Never returned to callers. Formatted into the trap message when a lock
/// word is found in a state that valid usage cannot produce.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Diagnostic)]
pub enum LockTrap {
    #[error("Lock counter overflow (word {0:#010x})")]
    #[diagnostic(
        code(srwlock::counter_overflow),
        help("More waiters than the packed counters can represent.")
    )]
    CounterOverflow(u32),

    #[error("Invalid lock state (word {0:#010x})")]
    #[diagnostic(code(srwlock::invalid_state))]
    InvalidState(u32),

    #[error("Lock released in a mode it is not held in (word {0:#010x})")]
    #[diagnostic(
        code(srwlock::not_owned),
        help("Check for unbalanced acquire/release pairs.")
    )]
    NotOwned(u32),
}

impl LockTrap {
    /// Raw lock word that triggered the trap
    pub fn word(&self) -> u32 {
        match *self {
            LockTrap::CounterOverflow(w) | LockTrap::InvalidState(w) | LockTrap::NotOwned(w) => w,
        }
    }
}
