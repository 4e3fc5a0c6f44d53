/*!
 * Synchronization Primitives
 *
 * - [`OnceGuard`]: one-time initialization in a single word
 * - [`SrwLock`]: fair reader-writer lock packed into 32 bits
 * - [`ConditionVariable`]: token-based condition variable
 * - [`AddressWaitRegistry`]: wait until a value changes, wake by address
 *
 * The lock and once guard block through the process-wide [`KeyedEvent`];
 * address waits block on the parker inside the caller's registry slot.
 */

mod address;
mod condvar;
mod config;
mod keyed;
mod once;
mod parker;
mod registry;
mod srwlock;
mod traits;

pub use condvar::{ConditionVariable, LockMode};
pub use config::{SyncConfig, ENV_KEYED_SHARDS, ENV_MAX_SLICES};
pub use keyed::KeyedEvent;
pub use once::{BeginMode, CompleteMode, OnceBegin, OnceGuard};
pub use parker::{Parker, ThreadIdentity};
pub use registry::{AddressWaitRegistry, SlotRef, SLOTS_PER_SLICE};
pub use srwlock::{LockWord, RwLock, RwLockReadGuard, RwLockWriteGuard, SrwLock};
pub use traits::{WakeResult, Watchable};
