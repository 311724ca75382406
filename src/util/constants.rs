/// log2 of the size of a marked block.
pub const LOG_BYTES_IN_BLOCK: usize = 14;
/// The size of a marked block.  Every non-oversized cell lives inside one.
pub const BYTES_IN_BLOCK: usize = 1 << LOG_BYTES_IN_BLOCK;

/// Alignment of every cell.  The header relies on this.
pub const CELL_ALIGNMENT: usize = 16;

/// Cell sizes (header included) served by the size-classed block directories.
/// Anything larger is an oversized cell with its own allocation.
pub const SIZE_CLASSES: [usize; 7] = [32, 64, 128, 256, 512, 1024, 2048];

/// How many cells a visitor processes between deadline checks while draining.
pub const DRAIN_CHECK_INTERVAL: usize = 64;

/// A visitor donates the lower half of its local mark stack to the shared
/// stack once the local stack grows beyond this.
pub const DONATION_THRESHOLD: usize = 128;

/// Largest number of cells handed to a drainer in one batch.
pub const MARK_BATCH_SIZE: usize = 64;

/// Half-life of the GC rate limiting value.  The value decays towards zero
/// with this half-life while the mutator runs, and is bumped by the pause
/// ratio of each completed cycle.
pub const GC_RATE_LIMITING_HALF_LIFE_MS: f64 = 1000.0;

/// Default for `min_bytes_per_cycle`: below this eden limit we do not bother
/// collecting at all.
pub const DEFAULT_MIN_BYTES_PER_CYCLE: usize = 1 << 20;

/// Default stress factor (0 disables stress collections).
pub const DEFAULT_STRESS_FACTOR: usize = 0;
