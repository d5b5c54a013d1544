//! Cached extents and their lifecycle.
//!
//! A `CachedExtent` is the unit the cache trades in: a contiguous,
//! page-aligned byte region identified by a physical address. Extents
//! move through a small state machine (pending read, clean, pending
//! write, dirty, invalid) and carry a one-shot I/O latch on which
//! concurrent readers of an absent block rendezvous.

use parking_lot::{Condvar, Mutex};
use silt_types::{ExtentType, JournalSeq, Laddr, Paddr, TransactionSource};
use std::sync::Arc;

/// Shared handle to a cached extent.
pub type ExtentRef = Arc<CachedExtent>;

const PAGE_ALIGNMENT: usize = 4096;

/// Owned byte buffer whose exposed slice starts page-aligned.
///
/// Remains fully safe by keeping the original backing allocation and
/// exposing an aligned subslice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBuf {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl PageBuf {
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        if len == 0 {
            return Self {
                storage: Vec::new(),
                start: 0,
                len: 0,
            };
        }
        let storage = vec![0_u8; len + PAGE_ALIGNMENT - 1];
        let base = storage.as_ptr() as usize;
        let misalignment = base & (PAGE_ALIGNMENT - 1);
        let start = if misalignment == 0 {
            0
        } else {
            PAGE_ALIGNMENT - misalignment
        };
        debug_assert!(start + len <= storage.len());
        Self {
            storage,
            start,
            len,
        }
    }

    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = Self::zeroed(bytes.len());
        buf.as_mut_slice().copy_from_slice(bytes);
        buf
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        let end = start + self.len;
        &mut self.storage[start..end]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Lifecycle state of a cached extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentState {
    /// Absent block being read in; readers park on the I/O latch.
    CleanPending,
    /// Resident and unmodified; eligible for the LRU.
    Clean,
    /// Transaction-local mutable copy awaiting commit.
    MutationPending,
    /// Freshly allocated block awaiting its first commit.
    InitialWritePending,
    /// Committed mutation not yet written back; on the dirty list.
    Dirty,
    /// Unreachable for new readers; pinned only by existing references.
    Invalid,
}

impl ExtentState {
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::MutationPending | Self::InitialWritePending)
    }
}

#[derive(Debug)]
struct ExtentCore {
    state: ExtentState,
    paddr: Paddr,
    laddr: Option<Laddr>,
    buffer: PageBuf,
    last_committed_crc: u32,
    dirty_from: Option<JournalSeq>,
    last_modified: u64,
    /// Source of the transaction whose commit invalidated this extent,
    /// consumed for conflict accounting.
    invalidated_by: Option<TransactionSource>,
    /// Forwarding reference installed when a retired placeholder is
    /// promoted to a real extent; transactions resolve it lazily.
    promoted_to: Option<ExtentRef>,
}

/// A contiguous run of bytes addressed by a `Paddr`, loaded as one unit.
#[derive(Debug)]
pub struct CachedExtent {
    ext_type: ExtentType,
    length: u32,
    core: Mutex<ExtentCore>,
    io_pending: Mutex<bool>,
    io_done: Condvar,
}

impl CachedExtent {
    pub(crate) fn new(
        ext_type: ExtentType,
        length: u32,
        paddr: Paddr,
        laddr: Option<Laddr>,
        state: ExtentState,
        buffer: PageBuf,
    ) -> ExtentRef {
        debug_assert!(
            ext_type.is_placeholder() || buffer.len() == length as usize,
            "buffer length must match extent length"
        );
        Arc::new(Self {
            ext_type,
            length,
            core: Mutex::new(ExtentCore {
                state,
                paddr,
                laddr,
                buffer,
                last_committed_crc: 0,
                dirty_from: None,
                last_modified: 0,
                invalidated_by: None,
                promoted_to: None,
            }),
            io_pending: Mutex::new(false),
            io_done: Condvar::new(),
        })
    }

    #[must_use]
    pub fn ext_type(&self) -> ExtentType {
        self.ext_type
    }

    #[must_use]
    pub fn length(&self) -> u32 {
        self.length
    }

    #[must_use]
    pub fn paddr(&self) -> Paddr {
        self.core.lock().paddr
    }

    #[must_use]
    pub fn laddr(&self) -> Option<Laddr> {
        self.core.lock().laddr
    }

    #[must_use]
    pub fn state(&self) -> ExtentState {
        self.core.lock().state
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.core.lock().state != ExtentState::Invalid
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.core.lock().state == ExtentState::Clean
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.core.lock().state == ExtentState::Dirty
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.core.lock().state.is_pending()
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.ext_type.is_placeholder()
    }

    #[must_use]
    pub fn dirty_from(&self) -> Option<JournalSeq> {
        self.core.lock().dirty_from
    }

    #[must_use]
    pub fn last_committed_crc(&self) -> u32 {
        self.core.lock().last_committed_crc
    }

    /// Monotonic logical stamp of the last content change.
    #[must_use]
    pub fn last_modified(&self) -> u64 {
        self.core.lock().last_modified
    }

    /// Run `f` over the extent's current contents.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.core.lock().buffer.as_slice())
    }

    /// Copy out the extent's current contents.
    #[must_use]
    pub fn buffer_bytes(&self) -> Vec<u8> {
        self.core.lock().buffer.as_slice().to_vec()
    }

    /// Mutate the buffer of a write-pending extent.
    ///
    /// Only `MutationPending` and `InitialWritePending` extents may be
    /// written through this path; committed extents change only via
    /// `duplicate_for_write` copies or replay.
    pub fn update_buffer<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut core = self.core.lock();
        debug_assert!(
            core.state.is_pending(),
            "buffer writes require a write-pending extent, state={:?}",
            core.state
        );
        f(core.buffer.as_mut_slice())
    }

    /// Set the logical address of a not-yet-committed extent.
    pub fn set_laddr(&self, laddr: Laddr) {
        let mut core = self.core.lock();
        debug_assert!(core.state.is_pending() || core.state == ExtentState::CleanPending);
        core.laddr = Some(laddr);
    }

    /// Source of the commit that invalidated this extent, if known.
    #[must_use]
    pub fn invalidated_by(&self) -> Option<TransactionSource> {
        self.core.lock().invalidated_by
    }

    /// The promoted successor of a retired placeholder, if any.
    #[must_use]
    pub fn promoted_target(&self) -> Option<ExtentRef> {
        self.core.lock().promoted_to.clone()
    }

    // ── I/O latch ──────────────────────────────────────────────────

    /// Arm the latch ahead of a device read or a commit write.
    pub(crate) fn set_io_wait(&self) {
        let mut pending = self.io_pending.lock();
        debug_assert!(!*pending, "extent already has an I/O in flight");
        *pending = true;
    }

    /// Release the latch and wake every parked waiter.
    pub(crate) fn complete_io(&self) {
        let mut pending = self.io_pending.lock();
        *pending = false;
        self.io_done.notify_all();
    }

    /// Park until any in-flight I/O on this extent completes.
    ///
    /// No-op when nothing is in flight. The extent may have become
    /// `Invalid` by the time a waiter resumes; callers revalidate at
    /// commit.
    pub fn wait_io(&self) {
        let mut pending = self.io_pending.lock();
        while *pending {
            self.io_done.wait(&mut pending);
        }
    }

    // ── crate-internal state transitions ───────────────────────────

    /// Install the bytes of a completed device read and move to
    /// `Clean`.
    ///
    /// Returns `false` without touching the buffer when the extent was
    /// invalidated while the read was in flight; waiters then observe
    /// `Invalid` and revalidate at commit.
    pub(crate) fn complete_clean_read(&self, bytes: &[u8], crc: u32, stamp: u64) -> bool {
        let mut core = self.core.lock();
        if core.state != ExtentState::CleanPending {
            return false;
        }
        core.buffer.as_mut_slice().copy_from_slice(bytes);
        core.state = ExtentState::Clean;
        core.last_committed_crc = crc;
        core.last_modified = stamp;
        true
    }

    pub(crate) fn mark_invalid(&self, by: Option<TransactionSource>) {
        let mut core = self.core.lock();
        core.state = ExtentState::Invalid;
        if core.invalidated_by.is_none() {
            core.invalidated_by = by;
        }
    }

    pub(crate) fn set_promoted_to(&self, next: ExtentRef) {
        let mut core = self.core.lock();
        debug_assert!(self.ext_type.is_placeholder());
        core.promoted_to = Some(next);
    }

    pub(crate) fn set_paddr(&self, paddr: Paddr) {
        self.core.lock().paddr = paddr;
    }

    pub(crate) fn set_dirty_from(&self, seq: JournalSeq) {
        self.core.lock().dirty_from = Some(seq);
    }

    pub(crate) fn inherit_dirty_from(&self, from: Option<JournalSeq>) {
        self.core.lock().dirty_from = from;
    }

    pub(crate) fn mark_state(&self, state: ExtentState) {
        self.core.lock().state = state;
    }

    pub(crate) fn stamp_commit(&self, crc: u32, stamp: u64) {
        let mut core = self.core.lock();
        core.last_committed_crc = crc;
        core.last_modified = stamp;
    }

    /// Overwrite the buffer from a replayed delta.
    ///
    /// Replay targets committed extents, so `Clean` and `Dirty` are the
    /// accepted states here.
    pub(crate) fn apply_replay_delta(&self, bytes: &[u8], stamp: u64) {
        let mut core = self.core.lock();
        debug_assert!(
            matches!(core.state, ExtentState::Clean | ExtentState::Dirty),
            "replay targets committed extents, state={:?}",
            core.state
        );
        core.buffer.as_mut_slice().copy_from_slice(bytes);
        core.last_committed_crc = crc32c::crc32c(core.buffer.as_slice());
        core.last_modified = stamp;
    }

    /// Current CRC of the buffer contents.
    #[must_use]
    pub fn compute_crc(&self) -> u32 {
        crc32c::crc32c(self.core.lock().buffer.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_extent(state: ExtentState) -> ExtentRef {
        CachedExtent::new(
            ExtentType::Data,
            4096,
            Paddr::Absolute(0x1000),
            None,
            state,
            PageBuf::zeroed(4096),
        )
    }

    #[test]
    fn page_buf_is_aligned_and_sized() {
        let buf = PageBuf::zeroed(4096);
        assert_eq!(buf.len(), 4096);
        assert_eq!(buf.as_slice().as_ptr() as usize % PAGE_ALIGNMENT, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn page_buf_from_slice_round_trips() {
        let bytes: Vec<u8> = (0..=255).collect();
        let buf = PageBuf::from_slice(&bytes);
        assert_eq!(buf.as_slice(), bytes.as_slice());
    }

    #[test]
    fn latch_is_noop_when_idle() {
        let extent = data_extent(ExtentState::Clean);
        extent.wait_io();
        assert!(extent.is_clean());
    }

    #[test]
    fn latch_blocks_until_completed() {
        let extent = data_extent(ExtentState::CleanPending);
        extent.set_io_wait();

        let waiter = {
            let extent = Arc::clone(&extent);
            std::thread::spawn(move || {
                extent.wait_io();
                extent.state()
            })
        };

        assert!(extent.complete_clean_read(&[7_u8; 4096], crc32c::crc32c(&[7_u8; 4096]), 1));
        extent.complete_io();

        let observed = waiter.join().expect("waiter thread");
        assert_eq!(observed, ExtentState::Clean);
        assert_eq!(extent.last_committed_crc(), crc32c::crc32c(&[7_u8; 4096]));
    }

    #[test]
    fn invalidation_records_first_source_only() {
        let extent = data_extent(ExtentState::Clean);
        extent.mark_invalid(Some(TransactionSource::Mutate));
        extent.mark_invalid(Some(TransactionSource::Read));
        assert!(!extent.is_valid());
        assert_eq!(extent.invalidated_by(), Some(TransactionSource::Mutate));
    }
}
