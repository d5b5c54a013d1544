//! External seams: extent placement manager and commit observer.

use crate::extent::PageBuf;
use silt_error::Result;
use silt_types::{ExtentType, JournalSeq, Paddr, PlacementHint, TransactionSource};

/// A fresh allocation handed back by the placement manager.
///
/// The address may be relative; it is resolved to an absolute address
/// when the owning transaction commits.
#[derive(Debug)]
pub struct Allocation {
    pub paddr: Paddr,
    pub buffer: PageBuf,
}

/// Extent placement manager: performs device reads and decides where
/// new extents land. The cache consumes it; policy lives elsewhere.
pub trait ExtentPlacementManager: Send + Sync {
    /// Allocate a buffer and a (possibly relative) address for a new
    /// extent.
    fn alloc_new_extent(
        &self,
        src: TransactionSource,
        ext_type: ExtentType,
        length: u32,
        hint: PlacementHint,
    ) -> Result<Allocation>;

    /// Read exactly `out.len()` bytes at `paddr`.
    fn read(&self, paddr: Paddr, out: &mut [u8]) -> Result<()>;
}

/// Commit-event listener for space accounting (the segment cleaner).
pub trait SpaceObserver: Send + Sync {
    fn on_fresh_extent(&self, paddr: Paddr, length: u32, ext_type: ExtentType, seq: JournalSeq);

    fn on_retired_extent(&self, paddr: Paddr, length: u32, ext_type: ExtentType, seq: JournalSeq);
}
