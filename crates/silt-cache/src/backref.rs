//! Back-reference buffering.
//!
//! Every commit emits reverse mappings (physical address → logical
//! address, length, type) batched under the commit's journal seq. The
//! index trees later drain the insert/remove query sets; journal
//! truncation trims the seq-keyed batches in step.

use serde::{Deserialize, Serialize};
use silt_types::{ExtentType, JournalSeq, Laddr, Paddr};
use std::collections::BTreeMap;
use std::ops::Bound;
use tracing::{debug, trace};

/// Reverse mapping from a physical extent back to its logical identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackrefEntry {
    pub paddr: Paddr,
    pub laddr: Option<Laddr>,
    pub length: u32,
    pub ext_type: ExtentType,
    pub seq: JournalSeq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackrefOp {
    Insert,
    Remove,
}

/// A back-reference update staged in journal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedBackref {
    pub op: BackrefOp,
    pub entry: BackrefEntry,
}

/// Seq-keyed batches of back-reference updates plus the paddr-ordered
/// insert/remove query sets derived from them.
#[derive(Debug, Default)]
pub(crate) struct BackrefBuffer {
    by_seq: BTreeMap<JournalSeq, Vec<BufferedBackref>>,
    inserted: BTreeMap<Paddr, BackrefEntry>,
    removed: BTreeMap<Paddr, BackrefEntry>,
}

impl BackrefBuffer {
    /// Stage one commit's worth of updates under `seq`.
    pub(crate) fn append(&mut self, seq: JournalSeq, batch: Vec<BufferedBackref>) {
        if batch.is_empty() {
            return;
        }
        trace!(
            target: "silt::cache::backref",
            %seq,
            entries = batch.len(),
            "backref batch staged"
        );
        for item in &batch {
            debug_assert_eq!(item.entry.seq, seq);
            match item.op {
                BackrefOp::Insert => {
                    self.inserted.insert(item.entry.paddr, item.entry);
                    self.removed.remove(&item.entry.paddr);
                }
                BackrefOp::Remove => {
                    self.removed.insert(item.entry.paddr, item.entry);
                    self.inserted.remove(&item.entry.paddr);
                }
            }
        }
        self.by_seq.entry(seq).or_default().extend(batch);
    }

    /// Drop every batch with key ≤ `seq`.
    ///
    /// A trim may not skip ahead of the newest committed batch; in
    /// debug that is fatal, in release the trim still only removes what
    /// exists.
    pub(crate) fn trim_to(&mut self, seq: JournalSeq) {
        if let Some((&max, _)) = self.by_seq.iter().next_back() {
            debug_assert!(max >= seq, "backref trim past high-water: {seq} > {max}");
        }
        let keep = self.by_seq.split_off(&JournalSeq(seq.0.saturating_add(1)));
        let dropped = std::mem::replace(&mut self.by_seq, keep);
        let mut scrubbed = 0_usize;
        for (_, batch) in dropped {
            for item in batch {
                scrubbed += 1;
                let set = match item.op {
                    BackrefOp::Insert => &mut self.inserted,
                    BackrefOp::Remove => &mut self.removed,
                };
                // A later batch may have superseded this paddr; only
                // drop the exact staged entry.
                if set.get(&item.entry.paddr).map(|e| e.seq) == Some(item.entry.seq) {
                    set.remove(&item.entry.paddr);
                }
            }
        }
        debug!(
            target: "silt::cache::backref",
            trim_to = %seq,
            scrubbed,
            remaining_batches = self.by_seq.len(),
            "backref buffer trimmed"
        );
    }

    /// Pending insertions over the half-open range `[start, end)`.
    pub(crate) fn in_range(&self, start: Paddr, end: Paddr) -> Vec<BackrefEntry> {
        self.inserted
            .range((Bound::Included(start), Bound::Excluded(end)))
            .map(|(_, entry)| *entry)
            .collect()
    }

    /// Pending removals over the half-open range `[start, end)`.
    pub(crate) fn del_in_range(&self, start: Paddr, end: Paddr) -> Vec<BackrefEntry> {
        self.removed
            .range((Bound::Included(start), Bound::Excluded(end)))
            .map(|(_, entry)| *entry)
            .collect()
    }

    /// Whether a pending removal is staged for `paddr`.
    pub(crate) fn is_marked_removed(&self, paddr: Paddr) -> bool {
        self.removed.contains_key(&paddr)
    }

    /// Smallest staged seq, or `None` when the buffer is empty.
    pub(crate) fn oldest_from(&self) -> Option<JournalSeq> {
        self.by_seq.keys().next().copied()
    }

    pub(crate) fn batch_count(&self) -> usize {
        self.by_seq.len()
    }

    pub(crate) fn inserted_len(&self) -> usize {
        self.inserted.len()
    }

    pub(crate) fn removed_len(&self) -> usize {
        self.removed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_at(paddr: u64, seq: u64) -> BufferedBackref {
        BufferedBackref {
            op: BackrefOp::Insert,
            entry: BackrefEntry {
                paddr: Paddr::Absolute(paddr),
                laddr: Some(Laddr(paddr >> 4)),
                length: 4096,
                ext_type: ExtentType::Data,
                seq: JournalSeq(seq),
            },
        }
    }

    fn remove_at(paddr: u64, seq: u64) -> BufferedBackref {
        BufferedBackref {
            op: BackrefOp::Remove,
            entry: BackrefEntry {
                paddr: Paddr::Absolute(paddr),
                laddr: None,
                length: 4096,
                ext_type: ExtentType::Data,
                seq: JournalSeq(seq),
            },
        }
    }

    #[test]
    fn trim_drops_only_batches_at_or_below_seq() {
        let mut buf = BackrefBuffer::default();
        buf.append(JournalSeq(10), vec![insert_at(0x1000, 10)]);
        buf.append(JournalSeq(20), vec![insert_at(0x2000, 20)]);
        buf.append(JournalSeq(30), vec![insert_at(0x3000, 30)]);

        buf.trim_to(JournalSeq(20));
        assert_eq!(buf.oldest_from(), Some(JournalSeq(30)));
        assert_eq!(buf.batch_count(), 1);
        let remaining = buf.in_range(Paddr::Absolute(0), Paddr::Absolute(u64::MAX));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].paddr, Paddr::Absolute(0x3000));
    }

    #[test]
    fn trim_keeps_superseding_entries() {
        let mut buf = BackrefBuffer::default();
        buf.append(JournalSeq(5), vec![insert_at(0x1000, 5)]);
        buf.append(JournalSeq(8), vec![insert_at(0x1000, 8)]);

        buf.trim_to(JournalSeq(5));
        // The seq-8 re-insert of the same paddr must survive.
        let remaining = buf.in_range(Paddr::Absolute(0x1000), Paddr::Absolute(0x1001));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].seq, JournalSeq(8));
    }

    #[test]
    fn removal_displaces_pending_insert() {
        let mut buf = BackrefBuffer::default();
        buf.append(JournalSeq(3), vec![insert_at(0x2000, 3)]);
        buf.append(JournalSeq(4), vec![remove_at(0x2000, 4)]);

        assert!(buf.is_marked_removed(Paddr::Absolute(0x2000)));
        assert_eq!(buf.inserted_len(), 0);
        let dels = buf.del_in_range(Paddr::Absolute(0x2000), Paddr::Absolute(0x2001));
        assert_eq!(dels.len(), 1);
    }

    #[test]
    fn range_scans_are_half_open() {
        let mut buf = BackrefBuffer::default();
        buf.append(
            JournalSeq(1),
            vec![insert_at(0x1000, 1), insert_at(0x2000, 1), insert_at(0x3000, 1)],
        );
        let mid = buf.in_range(Paddr::Absolute(0x1000), Paddr::Absolute(0x3000));
        assert_eq!(mid.len(), 2);
        assert!(mid.iter().all(|e| e.paddr < Paddr::Absolute(0x3000)));
    }

    #[test]
    fn oldest_from_empty_is_none() {
        let buf = BackrefBuffer::default();
        assert_eq!(buf.oldest_from(), None);
    }
}
