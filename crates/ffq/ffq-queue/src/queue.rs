//! The queue handle shared by all participants of one process.

use crate::backoff::Doorbell;
use crate::consumer::Consumer;
use crate::error::QueueError;
use crate::layout::{QueueStatus, bytes_for_queue};
use crate::producer::Producer;
use crate::region::Region;
use crate::ring::{QueueConfig, SyncOptions};
use crate::sync::{ExclusiveSection, SharedSection};
use ffq_mmap::MmapFileMut;
use std::path::Path;
use std::sync::Arc;

pub(crate) struct Shared<T: Copy> {
    pub(crate) region: Region<T>,
    pub(crate) options: SyncOptions,
    /// Rung after every deposit and every release.
    pub(crate) bell: Doorbell,
}

impl<T: Copy> Shared<T> {
    fn new(region: Region<T>, options: SyncOptions) -> Arc<Self> {
        Arc::new(Self {
            region,
            options,
            bell: Doorbell::new(),
        })
    }

    #[inline]
    pub(crate) fn shared(&self) -> Result<SharedSection<'_, T>, QueueError> {
        SharedSection::enter(&self.region, self.options.lock_timeout)
    }

    #[inline]
    pub(crate) fn exclusive(&self) -> Result<ExclusiveSection<'_, T>, QueueError> {
        ExclusiveSection::enter(
            &self.region,
            self.options.lock_timeout,
            self.options.strategy.flush_each_write(),
        )
    }

    /// Atomic fetch-and-add on `head`: the claimed sequence number belongs to
    /// the caller and to no one else.
    pub(crate) fn claim(&self) -> Result<i64, QueueError> {
        let mut s = self.exclusive()?;
        let seq = s.fetch_add_head();
        s.flush();
        Ok(seq)
    }
}

/// Handle onto one fast-forward queue region.
///
/// Cloning is cheap; all clones share one mapping. Processes that want their
/// own mapping call [`FfQueue::open`] on the region's path.
pub struct FfQueue<T: Copy> {
    shared: Arc<Shared<T>>,
}

impl<T: Copy> Clone for FfQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Copy + Send> FfQueue<T> {
    /// Creates a queue in anonymous memory, for threads of this process.
    pub fn anonymous(cfg: &QueueConfig) -> Result<Self, QueueError> {
        cfg.validate()?;
        let mm = MmapFileMut::anonymous(bytes_for_queue::<T>(cfg.capacity))?;
        Self::from_region(Region::init(mm, cfg.capacity)?, cfg.options)
    }

    /// Creates (or truncates and re-creates) a file-backed queue at `path`.
    ///
    /// The region is fully initialized when this returns; other processes
    /// may then [`open`](Self::open) it.
    pub fn create<P: AsRef<Path>>(path: P, cfg: &QueueConfig) -> Result<Self, QueueError> {
        cfg.validate()?;
        let bytes = bytes_for_queue::<T>(cfg.capacity) as u64;
        let mm = MmapFileMut::create_rw(path.as_ref(), bytes)?;
        tracing::debug!(path = %path.as_ref().display(), capacity = cfg.capacity, "created queue file");
        Self::from_region(Region::init(mm, cfg.capacity)?, cfg.options)
    }

    /// Maps an existing file-backed queue.
    ///
    /// Fails with [`QueueError::Layout`] while the creator has not finished
    /// initializing the region; callers waiting for a creator retry.
    pub fn open<P: AsRef<Path>>(path: P, options: SyncOptions) -> Result<Self, QueueError> {
        let mm = MmapFileMut::open_rw(path)?;
        Self::from_region(Region::attach(mm)?, options)
    }

    fn from_region(region: Region<T>, options: SyncOptions) -> Result<Self, QueueError> {
        Ok(Self {
            shared: Shared::new(region, options),
        })
    }

    /// Attaches the one producer. Fails while another producer, in this or
    /// any other process, is attached.
    pub fn producer(&self) -> Result<Producer<T>, QueueError> {
        Producer::attach(Arc::clone(&self.shared))
    }

    pub fn consumer(&self, id: usize) -> Consumer<T> {
        Consumer::new(Arc::clone(&self.shared), id)
    }
}

impl<T: Copy> FfQueue<T> {
    pub fn capacity(&self) -> usize {
        self.shared.region.capacity()
    }

    pub fn options(&self) -> SyncOptions {
        self.shared.options
    }

    /// Whether other processes can reach this region through a file.
    pub fn is_file_backed(&self) -> bool {
        self.shared.region.is_file_backed()
    }

    /// All header counters, read in one shared section.
    pub fn status(&self) -> Result<QueueStatus, QueueError> {
        Ok(self.shared.shared()?.status())
    }

    /// Matched dequeues so far, sentinels included.
    pub fn completed_count(&self) -> Result<u64, QueueError> {
        Ok(self.status()?.completed)
    }

    pub fn head(&self) -> Result<i64, QueueError> {
        Ok(self.status()?.head)
    }

    pub fn tail(&self) -> Result<i64, QueueError> {
        Ok(self.status()?.tail)
    }

    /// Producer attempts that found their slot occupied and left a gap mark.
    pub fn gap_count(&self) -> Result<u64, QueueError> {
        Ok(self.status()?.gaps)
    }
}
