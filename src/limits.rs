/*!
 * System Limits and Constants
 *
 * Sizes, masks and defaults shared by the synchronization primitives.
 */

// =============================================================================
// ADDRESS WAIT REGISTRY
// =============================================================================

/// Size of one registry slice (one virtual-memory page)
pub const PAGE_SIZE: usize = 4096;

// =============================================================================
// KEYED EVENT
// =============================================================================

/// Default number of keyed-event shards
/// [PERF] Power of 2 for fast modulo via bitwise AND
pub const DEFAULT_KEYED_SHARDS: usize = 64;

/// Upper bound accepted for the shard count
pub const MAX_KEYED_SHARDS: usize = 4096;

// =============================================================================
// SRW LOCK WORD LAYOUT
// =============================================================================

/// Bit 31: an exclusive owner is inside
pub const SRW_IN_EXCLUSIVE: u32 = 0x8000_0000;

/// Bits 30-16: exclusive holder plus queued exclusive waiters
pub const SRW_EXCLUSIVE_QUEUE: u32 = 0x7fff_0000;

/// Bits 15-0: shared holders, or queued shared waiters while exclusive
pub const SRW_SHARED_QUEUE: u32 = 0x0000_ffff;

/// One unit of the exclusive queue field
pub const SRW_ONE_EXCLUSIVE: u32 = 0x0001_0000;

/// One unit of the shared queue field
pub const SRW_ONE_SHARED: u32 = 0x0000_0001;

// =============================================================================
// ONCE GUARD
// =============================================================================

/// Low bits of the once word that carry the state tag
pub const ONCE_STATE_MASK: usize = 3;
