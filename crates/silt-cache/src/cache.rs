//! The cache façade and commit pipeline.
//!
//! Transactions are an atomic combination of newly written blocks,
//! mutations to existing blocks, and retirements:
//!
//! 1. construction: `create_transaction`, then reads/allocs/mutations
//!    populate the transaction's sets;
//! 2. submission: `prepare_record` validates the read set against
//!    concurrent invalidations and builds the journal record;
//! 3. completion: once the record is durable, `complete_commit`
//!    stamps final addresses, merges the write set into the index, and
//!    stages back-references under the commit seq.
//!
//! Log levels follow the house rule: `info!` for init/close, `debug!`
//! for major extent operations, `trace!` for details.

use crate::backref::{BackrefEntry, BackrefOp, BufferedBackref};
use crate::epm::{ExtentPlacementManager, SpaceObserver};
use crate::extent::{CachedExtent, ExtentRef, ExtentState, PageBuf};
use crate::index::ExtentIndex;
use crate::lru::LruQueue;
use crate::record::{Delta, DeltaEntry, FreshBlock, Record, Retirement};
use crate::stats::{CacheStats, Gauges, StatsState};
use crate::transaction::{Transaction, TxnLookup};
use parking_lot::Mutex;
use silt_error::{Result, SiltError};
use silt_types::{ExtentType, JournalSeq, Laddr, Paddr, PlacementHint, TransactionSource};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Length of the root extent installed by `init_root`.
const ROOT_LENGTH: u32 = 4096;

/// Cache construction options.
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    /// Eviction threshold for the clean-extent LRU, in bytes.
    pub lru_capacity_bytes: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            lru_capacity_bytes: 64 << 20,
        }
    }
}

struct CacheInner {
    index: ExtentIndex,
    lru: LruQueue,
    /// Committed-but-unflushed extents ordered by `(dirty_from, paddr)`.
    dirty: BTreeMap<(JournalSeq, Paddr), ExtentRef>,
    root: Option<ExtentRef>,
    last_commit: JournalSeq,
    backrefs: crate::backref::BackrefBuffer,
    /// Live backref-tree extents by address, for index rebuild scans.
    backref_extents: BTreeMap<Paddr, ExtentType>,
    stats: StatsState,
    /// Monotonic logical stamp for `last_modified`.
    clock: u64,
}

impl CacheInner {
    fn bump_clock(&mut self) -> u64 {
        self.clock = self.clock.saturating_add(1);
        self.clock
    }

    fn remove_from_dirty(&mut self, extent: &ExtentRef) {
        if let Some(dirty_from) = extent.dirty_from() {
            self.dirty.remove(&(dirty_from, extent.paddr()));
        }
    }

    fn trim_lru(&mut self) {
        while let Some(victim) = self.lru.pop_victim() {
            self.index.erase(&victim);
            self.stats.evictions = self.stats.evictions.saturating_add(1);
            debug!(
                target: "silt::cache",
                paddr = %victim.paddr(),
                length = victim.length(),
                "evicted clean extent"
            );
        }
    }
}

/// The transactional buffer cache.
///
/// Shard-local: one cache instance mediates every read and write of
/// its shard's substrate through the extent placement manager.
pub struct Cache {
    epm: Arc<dyn ExtentPlacementManager>,
    inner: Mutex<CacheInner>,
}

impl Cache {
    pub fn new(epm: Arc<dyn ExtentPlacementManager>, options: CacheOptions) -> Self {
        info!(
            target: "silt::cache",
            lru_capacity_bytes = options.lru_capacity_bytes,
            "cache initialized"
        );
        Self {
            epm,
            inner: Mutex::new(CacheInner {
                index: ExtentIndex::default(),
                lru: LruQueue::new(options.lru_capacity_bytes),
                dirty: BTreeMap::new(),
                root: None,
                last_commit: JournalSeq::MIN,
                backrefs: crate::backref::BackrefBuffer::default(),
                backref_extents: BTreeMap::new(),
                stats: StatsState::default(),
                clock: 0,
            }),
        }
    }

    // ── transactions ───────────────────────────────────────────────

    /// Open an empty transaction viewing the current `last_commit`.
    pub fn create_transaction(&self, src: TransactionSource, is_weak: bool) -> Transaction {
        let mut inner = self.inner.lock();
        inner.stats.trans_created_by_src[src.as_index()] =
            inner.stats.trans_created_by_src[src.as_index()].saturating_add(1);
        let view_seq = inner.last_commit;
        drop(inner);
        debug!(target: "silt::cache", %src, is_weak, %view_seq, "transaction created");
        Transaction::new(src, is_weak, view_seq)
    }

    /// Re-arm a conflicted transaction in place for retry, preserving
    /// its identity.
    pub fn reset_transaction(&self, txn: &mut Transaction) {
        let mut inner = self.inner.lock();
        inner.stats.trans_created_by_src[txn.src().as_index()] =
            inner.stats.trans_created_by_src[txn.src().as_index()].saturating_add(1);
        let view_seq = inner.last_commit;
        drop(inner);
        txn.reset(view_seq);
    }

    // ── reads ──────────────────────────────────────────────────────

    /// Return the extent at `paddr`, from the transaction's own sets,
    /// the index, or the device.
    ///
    /// Concurrent readers of an absent block coalesce on one device
    /// read. Fails with `RetiredInTxn` when the transaction itself
    /// retired the address.
    pub fn get_extent(
        &self,
        txn: &mut Transaction,
        paddr: Paddr,
        length: u32,
        ext_type: ExtentType,
        laddr: Option<Laddr>,
    ) -> Result<ExtentRef> {
        self.get_extent_with_init(txn, paddr, length, ext_type, laddr, |_| {})
    }

    /// `get_extent` with an init hook run on a newly allocated extent
    /// before its read is submitted.
    pub fn get_extent_with_init(
        &self,
        txn: &mut Transaction,
        paddr: Paddr,
        length: u32,
        ext_type: ExtentType,
        laddr: Option<Laddr>,
        init: impl FnOnce(&CachedExtent),
    ) -> Result<ExtentRef> {
        debug_assert!(paddr.is_absolute(), "reads require an absolute paddr");
        debug_assert!(!ext_type.is_root() && !ext_type.is_placeholder());

        match txn.lookup(paddr) {
            TxnLookup::Retired => {
                debug!(target: "silt::cache", %paddr, "address retired in transaction");
                return Err(SiltError::RetiredInTxn { paddr });
            }
            TxnLookup::Present(extent) => {
                trace!(target: "silt::cache", %paddr, "extent present on transaction");
                extent.wait_io();
                return Ok(extent);
            }
            TxnLookup::Absent => {}
        }

        let (extent, needs_read) = {
            let mut inner = self.inner.lock();
            let query = &mut inner.stats.query_by_src[txn.src().as_index()];
            query.access = query.access.saturating_add(1);
            match inner.index.find(paddr) {
                None => {
                    let extent = CachedExtent::new(
                        ext_type,
                        length,
                        paddr,
                        laddr,
                        ExtentState::CleanPending,
                        PageBuf::zeroed(length as usize),
                    );
                    extent.set_io_wait();
                    inner.index.insert(extent.clone());
                    txn.add_to_read_set(extent.clone());
                    debug!(
                        target: "silt::cache",
                        %paddr, length, ty = ?ext_type,
                        "extent absent, reading"
                    );
                    (extent, true)
                }
                Some(cached) if cached.is_placeholder() => {
                    // A retired placeholder is not really cached yet:
                    // promote it to a real extent of the caller's type.
                    let next = CachedExtent::new(
                        ext_type,
                        length,
                        paddr,
                        laddr,
                        ExtentState::CleanPending,
                        PageBuf::zeroed(length as usize),
                    );
                    next.set_io_wait();
                    inner.index.replace(next.clone(), &cached);
                    cached.set_promoted_to(next.clone());
                    cached.mark_invalid(None);
                    txn.add_to_read_set(next.clone());
                    debug!(
                        target: "silt::cache",
                        %paddr, length, ty = ?ext_type,
                        "retired placeholder promoted, reading"
                    );
                    (next, true)
                }
                Some(cached) => {
                    let query = &mut inner.stats.query_by_src[txn.src().as_index()];
                    query.hit = query.hit.saturating_add(1);
                    debug_assert_eq!(cached.ext_type(), ext_type);
                    debug_assert_eq!(cached.length(), length);
                    txn.add_to_read_set(cached.clone());
                    inner.lru.touch(&cached);
                    trace!(target: "silt::cache", %paddr, "extent present in cache");
                    (cached, false)
                }
            }
        };

        if needs_read {
            init(&extent);
            self.read_extent(&extent)?;
        } else {
            extent.wait_io();
        }
        Ok(extent)
    }

    /// Return the extent at `paddr` only if resident; never touches the
    /// device. `None` on miss, on a retired placeholder, and on an
    /// address this transaction retired.
    pub fn get_extent_if_cached(
        &self,
        txn: &mut Transaction,
        paddr: Paddr,
        ext_type: ExtentType,
    ) -> Option<ExtentRef> {
        match txn.lookup(paddr) {
            TxnLookup::Retired => {
                debug!(target: "silt::cache", %paddr, "retired on transaction");
                return None;
            }
            TxnLookup::Present(extent) => {
                extent.wait_io();
                return Some(extent);
            }
            TxnLookup::Absent => {}
        }

        let cached = {
            let mut inner = self.inner.lock();
            let query = &mut inner.stats.query_by_src[txn.src().as_index()];
            query.access = query.access.saturating_add(1);
            match inner.index.find(paddr) {
                None => {
                    debug!(target: "silt::cache", %paddr, "absent");
                    return None;
                }
                Some(cached) if cached.is_placeholder() => {
                    debug!(target: "silt::cache", %paddr, "absent (placeholder)");
                    return None;
                }
                Some(cached) => {
                    let query = &mut inner.stats.query_by_src[txn.src().as_index()];
                    query.hit = query.hit.saturating_add(1);
                    debug_assert_eq!(cached.ext_type(), ext_type);
                    txn.add_to_read_set(cached.clone());
                    inner.lru.touch(&cached);
                    cached
                }
            }
        };
        cached.wait_io();
        Some(cached)
    }

    /// The transaction's view of the root extent.
    pub fn get_root(&self, txn: &mut Transaction) -> Result<ExtentRef> {
        if let Some(root) = txn.root() {
            trace!(target: "silt::cache", "root already on transaction");
            return Ok(root.clone());
        }
        let root = {
            let inner = self.inner.lock();
            inner
                .root
                .clone()
                .ok_or_else(|| SiltError::State("root not initialized".to_owned()))?
        };
        txn.add_to_read_set(root.clone());
        txn.set_root(root.clone());
        Ok(root)
    }

    /// Install a fresh, dirty root extent. Once installed, the root is
    /// always present in the dirty list.
    pub fn init_root(&self) -> ExtentRef {
        let mut inner = self.inner.lock();
        debug_assert!(inner.root.is_none(), "root already initialized");
        let root = CachedExtent::new(
            ExtentType::Root,
            ROOT_LENGTH,
            Paddr::Null,
            None,
            ExtentState::Dirty,
            PageBuf::zeroed(ROOT_LENGTH as usize),
        );
        root.set_dirty_from(JournalSeq::MIN);
        inner
            .dirty
            .insert((JournalSeq::MIN, Paddr::Null), root.clone());
        inner.root = Some(root.clone());
        info!(target: "silt::cache", "root installed");
        root
    }

    // ── writes ─────────────────────────────────────────────────────

    /// Allocate a fresh extent. Its address may stay relative until
    /// commit; the extent is not indexed before `complete_commit`.
    pub fn alloc_new_extent(
        &self,
        txn: &mut Transaction,
        ext_type: ExtentType,
        length: u32,
        hint: PlacementHint,
    ) -> Result<ExtentRef> {
        debug_assert!(!txn.is_weak(), "weak transactions cannot allocate");
        debug_assert!(!ext_type.is_root() && !ext_type.is_placeholder());
        let allocation = self
            .epm
            .alloc_new_extent(txn.src(), ext_type, length, hint)?;
        debug_assert_eq!(allocation.buffer.len(), length as usize);
        let extent = CachedExtent::new(
            ext_type,
            length,
            allocation.paddr,
            None,
            ExtentState::InitialWritePending,
            allocation.buffer,
        );
        {
            let mut inner = self.inner.lock();
            inner.stats.fresh_by_ext[ext_type.as_index()].increment(u64::from(length));
        }
        txn.add_fresh(extent.clone());
        debug!(
            target: "silt::cache",
            ty = ?ext_type, length, paddr = %extent.paddr(), hint = ?hint,
            "allocated fresh extent"
        );
        Ok(extent)
    }

    /// Produce (or return) the transaction's mutable copy of `extent`.
    ///
    /// Write-pending extents are already exclusive to this transaction
    /// and return themselves; otherwise the source stays in the read
    /// set and a `MutationPending` copy receives further writes.
    pub fn duplicate_for_write(
        &self,
        txn: &mut Transaction,
        extent: &ExtentRef,
    ) -> Result<ExtentRef> {
        debug_assert!(!txn.is_weak(), "weak transactions cannot mutate");
        debug_assert!(!extent.is_placeholder());
        if extent.is_pending() {
            debug_assert!(txn.is_in_txn(extent));
            return Ok(extent.clone());
        }
        if let Some(next) = txn.find_mutated_by_prev(extent.paddr()) {
            trace!(target: "silt::cache", paddr = %extent.paddr(), "already mutating");
            return Ok(next);
        }

        let buffer = extent.with_buffer(PageBuf::from_slice);
        let next = CachedExtent::new(
            extent.ext_type(),
            extent.length(),
            extent.paddr(),
            extent.laddr(),
            ExtentState::MutationPending,
            buffer,
        );
        next.inherit_dirty_from(extent.dirty_from());
        txn.add_mutated(extent.clone(), next.clone());
        debug!(
            target: "silt::cache",
            paddr = %extent.paddr(), ty = ?extent.ext_type(),
            "duplicated for write"
        );
        Ok(next)
    }

    /// Declare `extent` retired in `txn`; takes effect at commit.
    pub fn retire_extent(&self, txn: &mut Transaction, extent: ExtentRef) {
        debug_assert!(!txn.is_weak(), "weak transactions cannot retire");
        debug_assert!(extent.is_valid());
        debug!(
            target: "silt::cache",
            paddr = %extent.paddr(), ty = ?extent.ext_type(),
            "retire extent"
        );
        txn.add_retired(extent);
    }

    /// Declare the address range `paddr ~ length` retired in `txn`.
    ///
    /// When nothing is resident, a `RetiredPlaceholder` enters the
    /// index immediately so that concurrent readers of the address
    /// rendezvous on it.
    pub fn retire_extent_addr(
        &self,
        txn: &mut Transaction,
        paddr: Paddr,
        length: u32,
    ) -> Result<()> {
        debug_assert!(!txn.is_weak(), "weak transactions cannot retire");
        debug_assert!(paddr.is_absolute());
        match txn.lookup(paddr) {
            TxnLookup::Retired => return Err(SiltError::RetiredInTxn { paddr }),
            TxnLookup::Present(extent) => {
                txn.add_retired(extent);
                return Ok(());
            }
            TxnLookup::Absent => {}
        }

        let mut inner = self.inner.lock();
        let retired = match inner.index.find(paddr) {
            Some(cached) => {
                debug_assert_eq!(cached.length(), length);
                cached
            }
            None => {
                let placeholder = CachedExtent::new(
                    ExtentType::RetiredPlaceholder,
                    length,
                    paddr,
                    None,
                    ExtentState::Clean,
                    PageBuf::zeroed(0),
                );
                inner.index.insert(placeholder.clone());
                debug!(
                    target: "silt::cache",
                    %paddr, length,
                    "installed retired placeholder"
                );
                placeholder
            }
        };
        drop(inner);
        txn.add_retired(retired);
        Ok(())
    }

    // ── commit pipeline ────────────────────────────────────────────

    /// Validate the transaction's reads and build the journal record.
    ///
    /// Fails with `TransactionConflict` when any read-set or
    /// retired-set extent was invalidated by a concurrent commit; the
    /// caller resets and retries.
    pub fn prepare_record(&self, txn: &mut Transaction) -> Result<Record> {
        debug_assert!(!txn.is_weak(), "weak transactions never commit");
        let mut inner = self.inner.lock();
        txn.resolve_promotions();

        let conflict = txn
            .read_set()
            .chain(txn.retired_set())
            .find(|(_, extent)| !extent.is_valid())
            .map(|(paddr, extent)| (*paddr, extent.invalidated_by()));
        if let Some((paddr, theirs)) = conflict {
            inner.stats.account_conflict(txn.src(), theirs);
            drop(inner);
            txn.mark_conflicted();
            debug!(
                target: "silt::cache",
                %paddr, ours = %txn.src(), theirs = ?theirs,
                "transaction conflicted"
            );
            return Err(SiltError::TransactionConflict {
                ours: txn.src(),
                theirs,
                paddr,
            });
        }

        let mut record = Record::default();
        for (prev, next) in txn.mutated_list() {
            next.set_io_wait();
            inner.stats.mutate_by_ext[prev.ext_type().as_index()]
                .increment(u64::from(prev.length()));
            record.deltas.push(DeltaEntry {
                paddr: prev.paddr(),
                laddr: prev.laddr(),
                ext_type: prev.ext_type(),
                length: prev.length(),
                payload: next.buffer_bytes(),
            });
        }
        for fresh in txn.fresh_list() {
            fresh.set_io_wait();
            record.fresh_blocks.push(FreshBlock {
                ext_type: fresh.ext_type(),
                laddr: fresh.laddr(),
                length: fresh.length(),
                data: fresh.buffer_bytes(),
            });
        }
        for (paddr, extent) in txn.retired_set() {
            record.retirements.push(Retirement {
                paddr: *paddr,
                laddr: extent.laddr(),
                ext_type: extent.ext_type(),
                length: extent.length(),
            });
        }
        drop(inner);
        debug!(
            target: "silt::cache",
            src = %txn.src(),
            deltas = record.deltas.len(),
            fresh = record.fresh_blocks.len(),
            retirements = record.retirements.len(),
            "record prepared"
        );
        Ok(record)
    }

    /// Apply a durably journaled transaction to the live cache.
    ///
    /// Retires, stamps final addresses into fresh extents, splices
    /// mutation copies into the index, stages back-references under
    /// `seq`, and finally publishes `last_commit = seq`.
    pub fn complete_commit(
        &self,
        txn: &mut Transaction,
        final_block_start: Paddr,
        seq: JournalSeq,
        observer: Option<&dyn SpaceObserver>,
    ) {
        debug_assert!(final_block_start.is_absolute());
        let mut inner = self.inner.lock();
        debug_assert!(inner.last_commit < seq || inner.last_commit == JournalSeq::MIN);
        let src = txn.src();
        let mut backref_batch: Vec<BufferedBackref> = Vec::new();

        // 1. Retirements. Real extents leave the index; placeholders
        // stay behind as tombstones for concurrent readers.
        for (paddr, extent) in txn.retired_set() {
            if !extent.is_placeholder() {
                inner.lru.remove(extent);
                if extent.is_dirty() {
                    inner.remove_from_dirty(extent);
                }
                if !inner.index.erase(extent) {
                    // The retired extent was evicted; a later read may
                    // have repopulated the address, and that resident
                    // dies with it.
                    if let Some(resident) = inner.index.find(*paddr) {
                        inner.lru.remove(&resident);
                        inner.index.erase(&resident);
                        resident.mark_invalid(Some(src));
                    }
                }
                extent.mark_invalid(Some(src));
            }
            if extent.ext_type().is_backref_node() {
                inner.backref_extents.remove(paddr);
            }
            inner.stats.retire_by_ext[extent.ext_type().as_index()]
                .increment(u64::from(extent.length()));
            backref_batch.push(BufferedBackref {
                op: BackrefOp::Remove,
                entry: BackrefEntry {
                    paddr: *paddr,
                    laddr: extent.laddr(),
                    length: extent.length(),
                    ext_type: extent.ext_type(),
                    seq,
                },
            });
            if let Some(observer) = observer {
                observer.on_retired_extent(*paddr, extent.length(), extent.ext_type(), seq);
            }
            trace!(target: "silt::cache", %paddr, "retired at commit");
        }

        // 2. Fresh extents: final address is the record position.
        let mut cursor = final_block_start;
        for fresh in txn.fresh_list() {
            fresh.set_paddr(cursor);
            let advanced = cursor.checked_add(u64::from(fresh.length()));
            debug_assert!(advanced.is_some(), "record cursor overflow");
            cursor = advanced.unwrap_or(cursor);

            let stamp = inner.bump_clock();
            fresh.stamp_commit(fresh.compute_crc(), stamp);
            if fresh.ext_type().is_root() {
                fresh.mark_state(ExtentState::Dirty);
                fresh.set_dirty_from(seq);
                inner.dirty.insert((seq, fresh.paddr()), fresh.clone());
            } else {
                fresh.mark_state(ExtentState::Clean);
                // A tombstone may linger where the journal reuses
                // space; displace it.
                if let Some(resident) = inner.index.find(fresh.paddr()) {
                    inner.index.replace(fresh.clone(), &resident);
                    resident.mark_invalid(Some(src));
                } else {
                    inner.index.insert(fresh.clone());
                }
                inner.lru.add(fresh.clone());
                backref_batch.push(BufferedBackref {
                    op: BackrefOp::Insert,
                    entry: BackrefEntry {
                        paddr: fresh.paddr(),
                        laddr: fresh.laddr(),
                        length: fresh.length(),
                        ext_type: fresh.ext_type(),
                        seq,
                    },
                });
            }
            if fresh.ext_type().is_backref_node() {
                inner
                    .backref_extents
                    .insert(fresh.paddr(), fresh.ext_type());
            }
            if let Some(observer) = observer {
                observer.on_fresh_extent(fresh.paddr(), fresh.length(), fresh.ext_type(), seq);
            }
            fresh.complete_io();
            trace!(
                target: "silt::cache",
                paddr = %fresh.paddr(), ty = ?fresh.ext_type(),
                "fresh extent committed"
            );
        }

        // 3. Mutations: splice the copy in under the same address.
        for (prev, next) in txn.mutated_list() {
            let stamp = inner.bump_clock();
            if next.dirty_from().is_none() {
                next.set_dirty_from(seq);
            }
            next.stamp_commit(next.compute_crc(), stamp);

            if next.ext_type().is_root() {
                inner.remove_from_dirty(prev);
                prev.mark_invalid(Some(src));
                next.mark_state(ExtentState::Dirty);
                inner
                    .dirty
                    .insert((next.dirty_from().unwrap_or(seq), next.paddr()), next.clone());
                inner.root = Some(next.clone());
            } else {
                inner.lru.remove(prev);
                if prev.is_dirty() {
                    inner.remove_from_dirty(prev);
                }
                match inner.index.find(next.paddr()) {
                    Some(resident) if Arc::ptr_eq(&resident, prev) => {
                        inner.index.replace(next.clone(), prev);
                    }
                    Some(resident) => {
                        // The predecessor was evicted and the address
                        // re-read; the newer resident is superseded
                        // all the same.
                        inner.lru.remove(&resident);
                        inner.index.replace(next.clone(), &resident);
                        resident.mark_invalid(Some(src));
                    }
                    None => inner.index.insert(next.clone()),
                }
                prev.mark_invalid(Some(src));
                next.mark_state(ExtentState::Dirty);
                inner
                    .dirty
                    .insert((next.dirty_from().unwrap_or(seq), next.paddr()), next.clone());
                // The delta's journal position is a fresh reverse
                // mapping version for this address.
                backref_batch.push(BufferedBackref {
                    op: BackrefOp::Insert,
                    entry: BackrefEntry {
                        paddr: next.paddr(),
                        laddr: next.laddr(),
                        length: next.length(),
                        ext_type: next.ext_type(),
                        seq,
                    },
                });
            }
            next.complete_io();
            trace!(
                target: "silt::cache",
                paddr = %next.paddr(), ty = ?next.ext_type(),
                "mutation committed"
            );
        }

        // 4. Stage back-references under this commit's seq.
        inner.backrefs.append(seq, backref_batch);

        // 5. Publish. A later transaction's view_seq observes this
        // commit only from here on.
        inner.last_commit = seq;
        inner.stats.trans_committed_by_src[src.as_index()] =
            inner.stats.trans_committed_by_src[src.as_index()].saturating_add(1);
        inner.trim_lru();
        debug!(
            target: "silt::cache",
            %src, %seq,
            fresh = txn.fresh_len(),
            mutated = txn.mutated_len(),
            retired = txn.retired_len(),
            "commit complete"
        );
    }

    // ── dirty list / flush source ──────────────────────────────────

    /// Dirty extents with `dirty_from < upto_seq` in `(dirty_from,
    /// paddr)` order, up to `max_bytes`, each added to `txn`'s read
    /// set.
    pub fn get_next_dirty_extents(
        &self,
        txn: &mut Transaction,
        upto_seq: JournalSeq,
        max_bytes: u64,
    ) -> Vec<ExtentRef> {
        let out = {
            let inner = self.inner.lock();
            let mut out = Vec::new();
            let mut bytes = 0_u64;
            for ((dirty_from, _), extent) in &inner.dirty {
                if *dirty_from >= upto_seq || bytes >= max_bytes {
                    break;
                }
                bytes = bytes.saturating_add(u64::from(extent.length()));
                out.push(extent.clone());
            }
            out
        };
        for extent in &out {
            txn.add_to_read_set(extent.clone());
        }
        trace!(
            target: "silt::cache",
            upto = %upto_seq,
            count = out.len(),
            "collected dirty extents"
        );
        out
    }

    /// `dirty_from` of the oldest dirty extent, or `None`.
    #[must_use]
    pub fn get_oldest_dirty_from(&self) -> Option<JournalSeq> {
        let inner = self.inner.lock();
        inner.dirty.keys().next().map(|(seq, _)| *seq)
    }

    // ── back-references ────────────────────────────────────────────

    /// Pending back-reference insertions over `[start, end)`.
    #[must_use]
    pub fn get_backrefs_in_range(&self, start: Paddr, end: Paddr) -> Vec<BackrefEntry> {
        self.inner.lock().backrefs.in_range(start, end)
    }

    /// Pending back-reference removals over `[start, end)`.
    #[must_use]
    pub fn get_del_backrefs_in_range(&self, start: Paddr, end: Paddr) -> Vec<BackrefEntry> {
        self.inner.lock().backrefs.del_in_range(start, end)
    }

    /// Whether a removal is staged for `paddr`.
    #[must_use]
    pub fn backref_should_be_removed(&self, paddr: Paddr) -> bool {
        self.inner.lock().backrefs.is_marked_removed(paddr)
    }

    /// Drop staged batches with seq ≤ `trim_to`, tracking journal
    /// truncation.
    pub fn trim_backref_bufs(&self, trim_to: JournalSeq) {
        self.inner.lock().backrefs.trim_to(trim_to);
    }

    /// Smallest staged back-reference seq, or `None`.
    #[must_use]
    pub fn oldest_backref_from(&self) -> Option<JournalSeq> {
        self.inner.lock().backrefs.oldest_from()
    }

    /// Live backref-tree extents over `[start, end)`, for rebuild.
    #[must_use]
    pub fn backref_extents_in_range(&self, start: Paddr, end: Paddr) -> Vec<(Paddr, ExtentType)> {
        let inner = self.inner.lock();
        inner
            .backref_extents
            .range((
                std::ops::Bound::Included(start),
                std::ops::Bound::Excluded(end),
            ))
            .map(|(paddr, ty)| (*paddr, *ty))
            .collect()
    }

    // ── replay ─────────────────────────────────────────────────────

    /// Apply one journaled delta during recovery.
    ///
    /// Root deltas update the root in place; extent deltas read the
    /// target in if necessary and re-dirty it at `seq`; allocation
    /// info re-populates the back-reference buffer only from
    /// `alloc_replay_from` onward.
    pub fn replay_delta(
        &self,
        seq: JournalSeq,
        record_base: Paddr,
        delta: &Delta,
        alloc_replay_from: JournalSeq,
    ) -> Result<()> {
        match delta {
            Delta::Alloc(items) => {
                if seq < alloc_replay_from {
                    trace!(
                        target: "silt::cache",
                        %seq, from = %alloc_replay_from,
                        "alloc delta below replay horizon, skipped"
                    );
                    return Ok(());
                }
                let mut inner = self.inner.lock();
                let batch: Vec<BufferedBackref> = items
                    .iter()
                    .map(|item| {
                        let mut item = *item;
                        item.entry.seq = seq;
                        item
                    })
                    .collect();
                for item in &batch {
                    if item.entry.ext_type.is_backref_node() {
                        match item.op {
                            BackrefOp::Insert => {
                                inner
                                    .backref_extents
                                    .insert(item.entry.paddr, item.entry.ext_type);
                            }
                            BackrefOp::Remove => {
                                inner.backref_extents.remove(&item.entry.paddr);
                            }
                        }
                    }
                }
                inner.backrefs.append(seq, batch);
                debug!(target: "silt::cache", %seq, entries = items.len(), "alloc delta replayed");
                Ok(())
            }
            Delta::Extent(entry) if entry.ext_type.is_root() => {
                let (root, stamp) = {
                    let mut inner = self.inner.lock();
                    let root = inner
                        .root
                        .clone()
                        .ok_or_else(|| SiltError::State("root not initialized".to_owned()))?;
                    let stamp = inner.bump_clock();
                    (root, stamp)
                };
                root.apply_replay_delta(&entry.payload, stamp);
                debug!(target: "silt::cache", %seq, base = %record_base, "root delta replayed");
                Ok(())
            }
            Delta::Extent(entry) => {
                debug_assert!(entry.paddr.is_absolute());
                let (extent, needs_read) = {
                    let mut inner = self.inner.lock();
                    match inner.index.find(entry.paddr) {
                        Some(extent) => {
                            debug_assert!(!extent.is_placeholder());
                            (extent, false)
                        }
                        None => {
                            let extent = CachedExtent::new(
                                entry.ext_type,
                                entry.length,
                                entry.paddr,
                                entry.laddr,
                                ExtentState::CleanPending,
                                PageBuf::zeroed(entry.length as usize),
                            );
                            extent.set_io_wait();
                            inner.index.insert(extent.clone());
                            (extent, true)
                        }
                    }
                };
                if needs_read {
                    self.read_extent(&extent)?;
                } else {
                    extent.wait_io();
                }
                if !extent.is_valid() {
                    return Err(SiltError::State(format!(
                        "replay target at {} is invalid",
                        entry.paddr
                    )));
                }

                let stamp = {
                    let mut inner = self.inner.lock();
                    let stamp = inner.bump_clock();
                    if !extent.is_dirty() {
                        inner.lru.remove(&extent);
                        extent.mark_state(ExtentState::Dirty);
                        extent.set_dirty_from(seq);
                        inner.dirty.insert((seq, entry.paddr), extent.clone());
                    }
                    stamp
                };
                extent.apply_replay_delta(&entry.payload, stamp);
                debug!(
                    target: "silt::cache",
                    %seq, paddr = %entry.paddr, base = %record_base,
                    "extent delta replayed"
                );
                Ok(())
            }
        }
    }

    /// Walk every cached extent after replay, letting `f` decide
    /// liveness; dead extents are dropped from the cache.
    pub fn init_cached_extents(
        &self,
        txn: &mut Transaction,
        mut f: impl FnMut(&mut Transaction, &ExtentRef) -> bool,
    ) {
        let extents: Vec<ExtentRef> = {
            let inner = self.inner.lock();
            debug_assert!(
                inner.root.as_ref().is_none_or(|root| root.is_dirty()),
                "root must be dirty after replay"
            );
            inner.index.iter().cloned().collect()
        };
        info!(
            target: "silt::cache",
            extents = extents.len(),
            "init cached extents"
        );
        let mut removed = 0_usize;
        for extent in extents {
            if f(txn, &extent) {
                trace!(target: "silt::cache", paddr = %extent.paddr(), "extent alive");
                continue;
            }
            let mut inner = self.inner.lock();
            inner.lru.remove(&extent);
            if extent.is_dirty() {
                inner.remove_from_dirty(&extent);
            }
            inner.index.erase(&extent);
            extent.mark_invalid(None);
            removed += 1;
            debug!(target: "silt::cache", paddr = %extent.paddr(), "dead extent removed");
        }
        info!(target: "silt::cache", removed, "init cached extents done");
    }

    // ── introspection / shutdown ───────────────────────────────────

    /// `last_commit`: the publish point observed by new transactions.
    #[must_use]
    pub fn last_commit(&self) -> JournalSeq {
        self.inner.lock().last_commit
    }

    /// Point-in-time statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let dirty_bytes = inner
            .dirty
            .values()
            .map(|e| u64::from(e.length()))
            .sum::<u64>();
        inner.stats.snapshot(Gauges {
            lru_bytes: inner.lru.bytes(),
            lru_extents: inner.lru.len(),
            lru_capacity: inner.lru.capacity(),
            index_bytes: inner.index.bytes(),
            index_extents: inner.index.len(),
            dirty_extents: inner.dirty.len(),
            dirty_bytes,
            last_commit: inner.last_commit,
            backref_batches: inner.backrefs.batch_count(),
            backref_inserts: inner.backrefs.inserted_len(),
            backref_removes: inner.backrefs.removed_len(),
        })
    }

    /// Release the LRU's references. Dirty extents are the flusher's
    /// responsibility and are intentionally left in place.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.lru.clear();
        info!(
            target: "silt::cache",
            remaining_dirty = inner.dirty.len(),
            "cache closed"
        );
    }

    // ── internals ──────────────────────────────────────────────────

    /// Perform the device read for a `CleanPending` extent and release
    /// its latch. On failure the extent is invalidated and erased so
    /// later readers re-enter the miss path.
    fn read_extent(&self, extent: &ExtentRef) -> Result<()> {
        debug_assert_eq!(extent.state(), ExtentState::CleanPending);
        let mut buf = vec![0_u8; extent.length() as usize];
        match self.epm.read(extent.paddr(), &mut buf) {
            Ok(()) => {
                let crc = crc32c::crc32c(&buf);
                let mut inner = self.inner.lock();
                inner.stats.device_reads_by_ext[extent.ext_type().as_index()]
                    .increment(u64::from(extent.length()));
                let stamp = inner.bump_clock();
                if extent.complete_clean_read(&buf, crc, stamp) {
                    // Still the resident entry unless a concurrent
                    // commit displaced it mid-read.
                    if inner
                        .index
                        .find(extent.paddr())
                        .is_some_and(|resident| Arc::ptr_eq(&resident, extent))
                    {
                        inner.lru.add(extent.clone());
                        inner.trim_lru();
                    }
                }
                drop(inner);
                extent.complete_io();
                trace!(
                    target: "silt::cache",
                    paddr = %extent.paddr(),
                    "read extent done"
                );
                Ok(())
            }
            Err(err) => {
                {
                    let mut inner = self.inner.lock();
                    inner.index.erase(extent);
                }
                extent.mark_invalid(None);
                extent.complete_io();
                warn!(
                    target: "silt::cache",
                    paddr = %extent.paddr(),
                    length = extent.length(),
                    error = %err,
                    "read extent failed"
                );
                Err(err)
            }
        }
    }
}
