//! Transactions: read/write/retire bookkeeping over cached extents.
//!
//! A transaction is an atomic combination of newly written blocks,
//! mutations to existing blocks, and retirements. Reads populate the
//! read set with the extent reference observed; the commit pipeline
//! validates that none of those references were invalidated by a
//! concurrent commit before building a journal record.

use crate::extent::ExtentRef;
use silt_types::{JournalSeq, Paddr, TransactionSource};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Outcome of a transaction-local address lookup.
#[derive(Debug)]
pub(crate) enum TxnLookup {
    Absent,
    Present(ExtentRef),
    Retired,
}

/// A single in-flight transaction against the cache.
///
/// Created by `Cache::create_transaction`; dropped to cancel. Pending
/// reads owned by the cache still complete after a drop — only the
/// transaction's bookkeeping is released.
#[derive(Debug)]
pub struct Transaction {
    src: TransactionSource,
    is_weak: bool,
    view_seq: JournalSeq,
    read_set: BTreeMap<Paddr, ExtentRef>,
    fresh_list: Vec<ExtentRef>,
    /// `(prev, next)` pairs: the clean predecessor stays in the read
    /// set; the pending copy receives further mutations.
    mutated_list: Vec<(ExtentRef, ExtentRef)>,
    retired_set: BTreeMap<Paddr, ExtentRef>,
    root: Option<ExtentRef>,
    conflicted: bool,
    resets: u64,
}

impl Transaction {
    pub(crate) fn new(src: TransactionSource, is_weak: bool, view_seq: JournalSeq) -> Self {
        Self {
            src,
            is_weak,
            view_seq,
            read_set: BTreeMap::new(),
            fresh_list: Vec::new(),
            mutated_list: Vec::new(),
            retired_set: BTreeMap::new(),
            root: None,
            conflicted: false,
            resets: 0,
        }
    }

    #[must_use]
    pub fn src(&self) -> TransactionSource {
        self.src
    }

    /// Weak transactions are read-only and advisory; their conflicts
    /// are never fatal to peers.
    #[must_use]
    pub fn is_weak(&self) -> bool {
        self.is_weak
    }

    /// `last_commit` observed when the transaction was opened or reset.
    #[must_use]
    pub fn view_seq(&self) -> JournalSeq {
        self.view_seq
    }

    #[must_use]
    pub fn is_conflicted(&self) -> bool {
        self.conflicted
    }

    /// Number of times this transaction was re-armed after a conflict.
    #[must_use]
    pub fn resets(&self) -> u64 {
        self.resets
    }

    #[must_use]
    pub fn read_set_len(&self) -> usize {
        self.read_set.len()
    }

    #[must_use]
    pub fn fresh_len(&self) -> usize {
        self.fresh_list.len()
    }

    #[must_use]
    pub fn mutated_len(&self) -> usize {
        self.mutated_list.len()
    }

    #[must_use]
    pub fn retired_len(&self) -> usize {
        self.retired_set.len()
    }

    /// The transaction's view of the root extent, if consulted.
    #[must_use]
    pub fn root(&self) -> Option<&ExtentRef> {
        self.root.as_ref()
    }

    /// Clear every set and re-arm at a fresh view seq, preserving the
    /// transaction's identity for retry loops.
    pub(crate) fn reset(&mut self, view_seq: JournalSeq) {
        trace!(
            target: "silt::cache::txn",
            src = %self.src,
            resets = self.resets + 1,
            "transaction reset"
        );
        self.view_seq = view_seq;
        self.read_set.clear();
        self.fresh_list.clear();
        self.mutated_list.clear();
        self.retired_set.clear();
        self.root = None;
        self.conflicted = false;
        self.resets = self.resets.saturating_add(1);
    }

    /// Resolve `paddr` against this transaction's own sets.
    ///
    /// Pending writes shadow the read set; retirements shadow both.
    /// Read-set entries pointing at promoted placeholders are rewritten
    /// to the promoted extent before being returned.
    pub(crate) fn lookup(&mut self, paddr: Paddr) -> TxnLookup {
        if self.retired_set.contains_key(&paddr) {
            return TxnLookup::Retired;
        }
        for (prev, next) in &self.mutated_list {
            if prev.paddr() == paddr {
                return TxnLookup::Present(next.clone());
            }
        }
        for fresh in &self.fresh_list {
            if fresh.paddr() == paddr {
                return TxnLookup::Present(fresh.clone());
            }
        }
        if let Some(entry) = self.read_set.get_mut(&paddr) {
            let resolved = resolve_promotion(entry);
            return TxnLookup::Present(resolved);
        }
        TxnLookup::Absent
    }

    /// First read of an address wins; later reads keep the original
    /// reference so a transaction observes one version per address.
    pub(crate) fn add_to_read_set(&mut self, extent: ExtentRef) {
        let paddr = extent.paddr();
        self.read_set.entry(paddr).or_insert(extent);
    }

    pub(crate) fn add_fresh(&mut self, extent: ExtentRef) {
        debug_assert!(!self.is_weak, "weak transactions cannot allocate");
        self.fresh_list.push(extent);
    }

    pub(crate) fn add_mutated(&mut self, prev: ExtentRef, next: ExtentRef) {
        debug_assert!(!self.is_weak, "weak transactions cannot mutate");
        self.add_to_read_set(prev.clone());
        self.mutated_list.push((prev, next));
    }

    pub(crate) fn add_retired(&mut self, extent: ExtentRef) {
        debug_assert!(!self.is_weak, "weak transactions cannot retire");
        let paddr = extent.paddr();
        let prev = self.retired_set.insert(paddr, extent);
        debug_assert!(prev.is_none(), "double retire of {paddr} in one transaction");
    }

    pub(crate) fn find_mutated_by_prev(&self, paddr: Paddr) -> Option<ExtentRef> {
        self.mutated_list
            .iter()
            .find(|(prev, _)| prev.paddr() == paddr)
            .map(|(_, next)| next.clone())
    }

    pub(crate) fn is_in_txn(&self, extent: &ExtentRef) -> bool {
        self.fresh_list.iter().any(|e| Arc::ptr_eq(e, extent))
            || self
                .mutated_list
                .iter()
                .any(|(prev, next)| Arc::ptr_eq(prev, extent) || Arc::ptr_eq(next, extent))
    }

    pub(crate) fn set_root(&mut self, root: ExtentRef) {
        self.root = Some(root);
    }

    pub(crate) fn mark_conflicted(&mut self) {
        self.conflicted = true;
    }

    /// Rewrite read-set entries whose placeholder was promoted since
    /// the read. Called before read-set validation.
    pub(crate) fn resolve_promotions(&mut self) {
        for entry in self.read_set.values_mut() {
            resolve_promotion(entry);
        }
    }

    pub(crate) fn read_set(&self) -> impl Iterator<Item = (&Paddr, &ExtentRef)> {
        self.read_set.iter()
    }

    pub(crate) fn fresh_list(&self) -> &[ExtentRef] {
        &self.fresh_list
    }

    pub(crate) fn mutated_list(&self) -> &[(ExtentRef, ExtentRef)] {
        &self.mutated_list
    }

    pub(crate) fn retired_set(&self) -> impl Iterator<Item = (&Paddr, &ExtentRef)> {
        self.retired_set.iter()
    }
}

/// Follow a placeholder's forwarding chain, rewriting `entry` in place.
fn resolve_promotion(entry: &mut ExtentRef) -> ExtentRef {
    while let Some(promoted) = entry.promoted_target() {
        *entry = promoted;
    }
    entry.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{CachedExtent, ExtentState, PageBuf};
    use silt_types::ExtentType;

    fn extent_at(paddr: u64, state: ExtentState) -> ExtentRef {
        CachedExtent::new(
            ExtentType::Data,
            4096,
            Paddr::Absolute(paddr),
            None,
            state,
            PageBuf::zeroed(4096),
        )
    }

    fn placeholder_at(paddr: u64) -> ExtentRef {
        CachedExtent::new(
            ExtentType::RetiredPlaceholder,
            4096,
            Paddr::Absolute(paddr),
            None,
            ExtentState::Clean,
            PageBuf::zeroed(0),
        )
    }

    #[test]
    fn first_read_wins() {
        let mut txn = Transaction::new(TransactionSource::Read, false, JournalSeq::MIN);
        let first = extent_at(0x1000, ExtentState::Clean);
        let second = extent_at(0x1000, ExtentState::Clean);
        txn.add_to_read_set(first.clone());
        txn.add_to_read_set(second);
        match txn.lookup(Paddr::Absolute(0x1000)) {
            TxnLookup::Present(e) => assert!(Arc::ptr_eq(&e, &first)),
            other => panic!("expected present, got {other:?}"),
        }
    }

    #[test]
    fn retired_shadows_read_set() {
        let mut txn = Transaction::new(TransactionSource::Mutate, false, JournalSeq::MIN);
        let extent = extent_at(0x2000, ExtentState::Clean);
        txn.add_to_read_set(extent.clone());
        txn.add_retired(extent);
        assert!(matches!(
            txn.lookup(Paddr::Absolute(0x2000)),
            TxnLookup::Retired
        ));
    }

    #[test]
    fn mutated_copy_shadows_prev() {
        let mut txn = Transaction::new(TransactionSource::Mutate, false, JournalSeq::MIN);
        let prev = extent_at(0x3000, ExtentState::Clean);
        let next = extent_at(0x3000, ExtentState::MutationPending);
        txn.add_mutated(prev, next.clone());
        match txn.lookup(Paddr::Absolute(0x3000)) {
            TxnLookup::Present(e) => assert!(Arc::ptr_eq(&e, &next)),
            other => panic!("expected mutated copy, got {other:?}"),
        }
    }

    #[test]
    fn promotion_resolves_lazily_in_lookup() {
        let mut txn = Transaction::new(TransactionSource::Read, false, JournalSeq::MIN);
        let placeholder = placeholder_at(0x4000);
        let promoted = extent_at(0x4000, ExtentState::Clean);
        txn.add_to_read_set(placeholder.clone());

        placeholder.set_promoted_to(promoted.clone());
        placeholder.mark_invalid(None);

        match txn.lookup(Paddr::Absolute(0x4000)) {
            TxnLookup::Present(e) => assert!(Arc::ptr_eq(&e, &promoted)),
            other => panic!("expected promoted extent, got {other:?}"),
        }
    }

    #[test]
    fn reset_clears_sets_and_bumps_counter() {
        let mut txn = Transaction::new(TransactionSource::Mutate, false, JournalSeq(3));
        txn.add_to_read_set(extent_at(0x5000, ExtentState::Clean));
        txn.add_fresh(extent_at(0x6000, ExtentState::InitialWritePending));
        txn.mark_conflicted();

        txn.reset(JournalSeq(9));
        assert_eq!(txn.view_seq(), JournalSeq(9));
        assert_eq!(txn.read_set_len(), 0);
        assert_eq!(txn.fresh_len(), 0);
        assert!(!txn.is_conflicted());
        assert_eq!(txn.resets(), 1);
    }
}
