//! Shared memory layout of the fast-forward queue.
//!
//! The queue is one contiguous region: a header holding the cursors and the
//! region lock, followed by `capacity` cells. Every participant maps the same
//! bytes, either through a file or through an anonymous mapping shared by
//! threads.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         QueueHeader                              │
//! │  magic │ version │ capacity │ elem_size │ lock │ producer flag   │
//! │  head  │ tail    │ completed │ gaps                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Cell[0]   sequence_tag (8B) │ gap_mark (8B) │ payload: T        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                          ...                                     │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Cell[capacity-1]                                                │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Apart from `magic`, `lock` and the producer flag, every field is read and
//! written only while the region lock is held (see `sync`). The cursors and
//! cell tags are atomics so that those accesses are data-race free; the lock
//! supplies the ordering, so they are used with `Relaxed`.

use std::cell::UnsafeCell;
use std::mem::{MaybeUninit, align_of, size_of};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// ASCII "FFQUEUE1". Written last during initialization.
pub const QUEUE_MAGIC: u64 = 0x4646_5155_4555_4531;

/// Bump on any incompatible layout change.
pub const QUEUE_VERSION: u64 = 1;

/// Sequence tag / gap mark of a cell that holds nothing.
pub const EMPTY: i64 = -1;

#[repr(C, align(64))]
pub struct QueueHeader {
    /// Equals `QUEUE_MAGIC` once the region is fully initialized.
    pub magic: AtomicU64,
    pub version: u64,
    /// Number of cells. Fixed at creation.
    pub capacity: u64,
    /// `size_of::<T>()` of the payload, checked on open.
    pub elem_size: u64,
    /// Region lock word, see `sync`.
    pub lock: AtomicU64,
    /// 1 while a producer handle is attached.
    pub producer_attached: AtomicU32,
    /// Next sequence number a consumer may claim.
    pub head: AtomicI64,
    /// Next sequence number the producer will try to deposit.
    pub tail: AtomicI64,
    /// Matched dequeues so far.
    pub completed: AtomicU64,
    /// Producer attempts that ended in a gap mark.
    pub gaps: AtomicU64,
}

impl QueueHeader {
    /// Checks the header of a region we did not initialize ourselves.
    pub fn validate<T: Copy>(&self) -> Result<(), &'static str> {
        if self.magic.load(Ordering::Acquire) != QUEUE_MAGIC {
            return Err("Bad magic (region not initialized)");
        }
        if self.version != QUEUE_VERSION {
            return Err("Wrong version");
        }
        if self.capacity == 0 {
            return Err("Zero capacity");
        }
        if self.elem_size as usize != size_of::<T>() {
            return Err("Element size mismatch");
        }

        Ok(())
    }
}

/// One ring slot.
#[repr(C)]
pub struct Cell<T: Copy> {
    /// Sequence number of the item held here, or `EMPTY`.
    pub sequence_tag: AtomicI64,
    /// Highest sequence number the producer abandoned at this slot, or `EMPTY`.
    pub gap_mark: AtomicI64,
    /// Initialized once `sequence_tag` has been set for the first time.
    pub payload: UnsafeCell<MaybeUninit<T>>,
}

impl<T: Copy> Cell<T> {
    pub fn empty() -> Self {
        Self {
            sequence_tag: AtomicI64::new(EMPTY),
            gap_mark: AtomicI64::new(EMPTY),
            payload: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Point-in-time copy of the header counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatus {
    pub head: i64,
    pub tail: i64,
    pub completed: u64,
    pub gaps: u64,
}

/// Byte offset of the first cell.
#[inline(always)]
pub const fn cells_offset() -> usize {
    size_of::<QueueHeader>()
}

/// Cells are placed right after the 64-byte aligned header, so their
/// alignment cannot exceed the header's.
pub const fn cell_align_fits<T: Copy>() -> bool {
    align_of::<Cell<T>>() <= align_of::<QueueHeader>()
}

/// Total bytes needed for a region of `capacity` cells of `T`.
pub fn bytes_for_queue<T: Copy>(capacity: usize) -> usize {
    cells_offset() + capacity * size_of::<Cell<T>>()
}
