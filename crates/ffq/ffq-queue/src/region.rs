//! Typed view over a mapped queue region.

use crate::error::QueueError;
use crate::layout::{
    Cell, QUEUE_MAGIC, QUEUE_VERSION, QueueHeader, bytes_for_queue, cell_align_fits, cells_offset,
};
use ffq_mmap::MmapFileMut;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering, fence};

/// Owns one mapping of the region and hands out references into it.
///
/// Only the lock word, the magic and the producer flag may be touched
/// directly; everything else goes through the sections in `sync`.
pub(crate) struct Region<T: Copy> {
    /// Keeps the mapping alive; never accessed after setup.
    mm: MmapFileMut,
    base: *mut u8,
    /// Capacity as validated at init/attach time. Bounds every cell access.
    capacity: usize,
    _pd: PhantomData<T>,
}

// SAFETY: the region is plain shared memory. Every field a participant may
// write is an atomic or sits behind the region lock, and the payload `T` is
// `Copy` and moved in and out by value.
unsafe impl<T: Copy + Send> Send for Region<T> {}
unsafe impl<T: Copy + Send> Sync for Region<T> {}

impl<T: Copy> Region<T> {
    /// Lays out a fresh region: zeroed counters, every cell `EMPTY`/`EMPTY`.
    /// The magic is written last so that `attach` never sees a half-built header.
    pub(crate) fn init(mut mm: MmapFileMut, capacity: usize) -> Result<Self, QueueError> {
        if capacity < 1 {
            return Err(QueueError::InvalidCapacity(capacity));
        }
        if !cell_align_fits::<T>() {
            return Err(QueueError::Layout("Payload alignment exceeds 64 bytes"));
        }
        if mm.len() < bytes_for_queue::<T>(capacity) {
            return Err(QueueError::Layout("Mapping smaller than the queue"));
        }
        let base = mm.as_mut_ptr();

        // SAFETY: the mapping is ours alone until the magic is published, and
        // it is large enough for the header and `capacity` cells.
        unsafe {
            ptr::write(
                base as *mut QueueHeader,
                QueueHeader {
                    magic: AtomicU64::new(0),
                    version: QUEUE_VERSION,
                    capacity: capacity as u64,
                    elem_size: size_of::<T>() as u64,
                    lock: AtomicU64::new(0),
                    producer_attached: AtomicU32::new(0),
                    head: AtomicI64::new(0),
                    tail: AtomicI64::new(0),
                    completed: AtomicU64::new(0),
                    gaps: AtomicU64::new(0),
                },
            );

            let cells = base.add(cells_offset()) as *mut Cell<T>;
            for i in 0..capacity {
                ptr::write(cells.add(i), Cell::empty());
            }
        }

        let region = Self {
            mm,
            base,
            capacity,
            _pd: PhantomData,
        };
        fence(Ordering::SeqCst);
        region.header().magic.store(QUEUE_MAGIC, Ordering::Release);
        tracing::debug!(capacity, bytes = bytes_for_queue::<T>(capacity), "queue region initialized");
        Ok(region)
    }

    /// Maps onto a region initialized elsewhere.
    pub(crate) fn attach(mut mm: MmapFileMut) -> Result<Self, QueueError> {
        if mm.len() < size_of::<QueueHeader>() {
            return Err(QueueError::Layout("Mapping smaller than the header"));
        }
        let base = mm.as_mut_ptr();

        // SAFETY: the mapping holds at least a header; `validate` rejects it
        // unless the initializer has published the magic.
        let h = unsafe { &*(base as *const QueueHeader) };
        h.validate::<T>().map_err(QueueError::Layout)?;

        let capacity = h.capacity as usize;
        if mm.len() < bytes_for_queue::<T>(capacity) {
            return Err(QueueError::Layout("Mapping truncated"));
        }
        tracing::debug!(capacity, "attached to queue region");

        Ok(Self {
            mm,
            base,
            capacity,
            _pd: PhantomData,
        })
    }

    #[inline(always)]
    pub(crate) fn header(&self) -> &QueueHeader {
        // SAFETY: base points to the header written by `init` and checked by `attach`.
        unsafe { &*(self.base as *const QueueHeader) }
    }

    #[inline(always)]
    pub(crate) fn cell(&self, idx: usize) -> &Cell<T> {
        assert!(idx < self.capacity, "cell index {idx} out of bounds");
        // SAFETY: idx is within the cells validated at init/attach time.
        unsafe {
            let cells = self.base.add(cells_offset()) as *const Cell<T>;
            &*cells.add(idx)
        }
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn is_file_backed(&self) -> bool {
        self.mm.is_file_backed()
    }

    /// Claims the single producer role for this region.
    pub(crate) fn attach_producer(&self) -> Result<(), QueueError> {
        self.header()
            .producer_attached
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| QueueError::ProducerAttached)
    }

    pub(crate) fn detach_producer(&self) {
        self.header().producer_attached.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::EMPTY;

    fn anon<T: Copy>(capacity: usize) -> Region<T> {
        let mm = MmapFileMut::anonymous(bytes_for_queue::<T>(capacity)).unwrap();
        Region::init(mm, capacity).unwrap()
    }

    #[test]
    fn init_empties_every_cell() {
        let r = anon::<u64>(5);
        assert_eq!(r.capacity(), 5);
        for i in 0..5 {
            assert_eq!(r.cell(i).sequence_tag.load(Ordering::Relaxed), EMPTY);
            assert_eq!(r.cell(i).gap_mark.load(Ordering::Relaxed), EMPTY);
        }
        assert_eq!(r.header().head.load(Ordering::Relaxed), 0);
        assert_eq!(r.header().tail.load(Ordering::Relaxed), 0);
        assert_eq!(r.header().completed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn attach_rejects_uninitialized_and_mistyped_regions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q");

        let blank = MmapFileMut::create_rw(&path, bytes_for_queue::<u64>(4) as u64).unwrap();
        assert!(matches!(
            Region::<u64>::attach(blank),
            Err(QueueError::Layout(_))
        ));

        let mm = MmapFileMut::open_rw(&path).unwrap();
        let _owner = Region::<u64>::init(mm, 4).unwrap();

        let ok = MmapFileMut::open_rw(&path).unwrap();
        assert_eq!(Region::<u64>::attach(ok).unwrap().capacity(), 4);

        let wrong = MmapFileMut::open_rw(&path).unwrap();
        assert!(matches!(
            Region::<u32>::attach(wrong),
            Err(QueueError::Layout("Element size mismatch"))
        ));
    }

    #[test]
    fn second_producer_is_refused_until_first_detaches() {
        let r = anon::<u32>(2);
        r.attach_producer().unwrap();
        assert!(matches!(r.attach_producer(), Err(QueueError::ProducerAttached)));
        r.detach_producer();
        assert!(r.attach_producer().is_ok());
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn cell_access_is_bounds_checked() {
        let r = anon::<u32>(2);
        let _ = r.cell(2);
    }
}
