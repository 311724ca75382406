//! Per-cell mark state.  A cell is "marked in the current cycle" when its
//! stamped version equals the heap's current mark version; bumping the heap
//! version at the start of a full collection implicitly unmarks every cell
//! without a clear-all pass.

use atomic::Atomic;
use bytemuck::NoUninit;
use std::sync::atomic::{AtomicU32, Ordering};

use super::CellKind;
use crate::heap::CollectionScope;

/// The generational classification of a cell, kept in a single byte so the
/// write barrier's fast path is one unordered load and compare: the slow
/// path is taken when the byte is *below* the heap's barrier threshold.
///
/// - `PossiblyBlack`: old and clean; a store into such a cell must run the
///   barrier's slow path.
/// - `DefinitelyWhite`: allocated since the last collection began; not yet
///   traced this cycle.
/// - `PossiblyGrey`: remembered, or sitting on a mark stack.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit)]
pub enum CellState {
    PossiblyBlack = 0,
    DefinitelyWhite = 1,
    PossiblyGrey = 2,
}

/// The normal barrier threshold: only stores into `PossiblyBlack` cells take
/// the slow path.
pub const BLACK_THRESHOLD: u8 = 1;

/// The threshold installed while the collector is marking concurrently: the
/// comparison becomes tautological and every store takes the slow path,
/// which re-checks the state under the required fence.
pub const TAUTOLOGICAL_THRESHOLD: u8 = 100;

/// A version stamp no live heap ever uses; freshly allocated cells carry it
/// until first marked.
pub const STALE_MARK_VERSION: u32 = 0;

/// Size of [`CellHeader`].  Payload starts at this offset.
pub const CELL_HEADER_SIZE: usize = 16;

/// The heap's monotonically increasing mark version.
pub struct HeapVersion(AtomicU32);

impl HeapVersion {
    pub fn new() -> Self {
        // Start above the stale stamp so nothing is born marked.
        HeapVersion(AtomicU32::new(STALE_MARK_VERSION + 1))
    }

    pub fn current(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Bump the version at the start of a full collection.  All cells become
    /// implicitly unmarked.
    pub fn bump(&self) -> u32 {
        let next = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        assert_ne!(next, STALE_MARK_VERSION, "heap version wrapped");
        next
    }
}

impl Default for HeapVersion {
    fn default() -> Self {
        Self::new()
    }
}

/// The header at the front of every cell.
#[repr(C)]
pub struct CellHeader {
    state: Atomic<CellState>,
    _pad: [u8; 3],
    kind: u32,
    mark_version: AtomicU32,
    size: u32,
}

assert_eq_size!(CellHeader, [u8; CELL_HEADER_SIZE]);

impl CellHeader {
    pub fn new(kind: CellKind, size: usize, state: CellState, mark_version: u32) -> Self {
        CellHeader {
            state: Atomic::new(state),
            _pad: [0; 3],
            kind: kind.0,
            mark_version: AtomicU32::new(mark_version),
            size: size as u32,
        }
    }

    pub fn kind(&self) -> CellKind {
        CellKind(self.kind)
    }

    /// Intrinsic size of the cell, header included.
    pub fn cell_size(&self) -> usize {
        self.size as usize
    }

    pub fn state(&self) -> CellState {
        self.state.load(Ordering::Relaxed)
    }

    /// The raw state byte, for the barrier's unordered fast-path compare.
    pub fn state_byte(&self) -> u8 {
        self.state.load(Ordering::Relaxed) as u8
    }

    pub fn store_state(&self, state: CellState) {
        self.state.store(state, Ordering::SeqCst);
    }

    /// Atomically transition the state.  Returns true if this call made the
    /// transition.
    pub fn cas_state(&self, old: CellState, new: CellState) -> bool {
        self.state
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_marked(&self, version: u32) -> bool {
        self.mark_version.load(Ordering::SeqCst) == version
    }

    /// The atomic white-to-grey transition.  Stamps the cell with `version`
    /// and returns whether the cell was already marked; the caller pushes the
    /// cell onto a mark stack only on a `false` return.
    pub fn test_and_set_marked(&self, version: u32) -> bool {
        self.mark_version.swap(version, Ordering::SeqCst) == version
    }

    /// Liveness at the end of a marking cycle.  Old cells are not candidates
    /// in an Eden collection.
    pub fn is_dead_at_cycle_end(&self, scope: CollectionScope, version: u32) -> bool {
        match scope {
            CollectionScope::Full => !self.is_marked(version),
            CollectionScope::Eden => {
                self.state() == CellState::DefinitelyWhite && !self.is_marked(version)
            }
        }
    }
}
