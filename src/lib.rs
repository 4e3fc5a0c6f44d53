/*!
 * Kernel Sync Library
 * User-space synchronization primitives: once guard, reader-writer lock,
 * condition variable and address wait/wake
 */

pub mod errors;
pub mod limits;
pub mod sync;
pub mod tracer;

// Re-exports
pub use errors::*;
pub use sync::{
    AddressWaitRegistry, BeginMode, CompleteMode, ConditionVariable, KeyedEvent, LockMode,
    OnceBegin, OnceGuard, RwLock, SrwLock, SyncConfig, WakeResult,
};
pub use tracer::init_tracing;
