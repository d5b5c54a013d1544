//! Byte-bounded recency queue over clean extents.

use crate::extent::ExtentRef;
use silt_types::Paddr;
use std::collections::{BTreeMap, HashMap};

/// Eviction queue for clean, non-placeholder extents.
///
/// Recency is a monotonic tick; the ordered map keyed by tick gives a
/// deterministic LRU-to-MRU walk without intrusive links. The queue
/// holds a strong reference to each member, released on eviction.
#[derive(Debug)]
pub(crate) struct LruQueue {
    capacity: u64,
    bytes: u64,
    next_tick: u64,
    by_recency: BTreeMap<u64, ExtentRef>,
    ticks: HashMap<Paddr, u64>,
}

impl LruQueue {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            capacity,
            bytes: 0,
            next_tick: 0,
            by_recency: BTreeMap::new(),
            ticks: HashMap::new(),
        }
    }

    /// Add an extent at the MRU end; re-adding an existing member is a
    /// `touch`.
    pub(crate) fn add(&mut self, extent: ExtentRef) {
        debug_assert!(extent.is_clean() && !extent.is_placeholder());
        let paddr = extent.paddr();
        if self.ticks.contains_key(&paddr) {
            self.touch(&extent);
            return;
        }
        let tick = self.bump();
        self.ticks.insert(paddr, tick);
        self.bytes = self.bytes.saturating_add(u64::from(extent.length()));
        self.by_recency.insert(tick, extent);
    }

    /// Move a member to the MRU end; idempotent, no-op for non-members.
    pub(crate) fn touch(&mut self, extent: &ExtentRef) {
        let paddr = extent.paddr();
        let Some(&tick) = self.ticks.get(&paddr) else {
            return;
        };
        let entry = self
            .by_recency
            .remove(&tick)
            .unwrap_or_else(|| extent.clone());
        let tick = self.bump();
        self.ticks.insert(paddr, tick);
        self.by_recency.insert(tick, entry);
    }

    pub(crate) fn remove(&mut self, extent: &ExtentRef) {
        let paddr = extent.paddr();
        if let Some(tick) = self.ticks.remove(&paddr) {
            if self.by_recency.remove(&tick).is_some() {
                self.bytes = self.bytes.saturating_sub(u64::from(extent.length()));
            }
        }
    }

    /// Pop the least-recently-used member while over capacity.
    pub(crate) fn pop_victim(&mut self) -> Option<ExtentRef> {
        if self.bytes <= self.capacity {
            return None;
        }
        let (&tick, _) = self.by_recency.iter().next()?;
        let victim = self.by_recency.remove(&tick)?;
        self.ticks.remove(&victim.paddr());
        self.bytes = self.bytes.saturating_sub(u64::from(victim.length()));
        Some(victim)
    }

    /// Drop every member, releasing the queue's references.
    pub(crate) fn clear(&mut self) {
        self.by_recency.clear();
        self.ticks.clear();
        self.bytes = 0;
    }

    pub(crate) fn contains(&self, paddr: Paddr) -> bool {
        self.ticks.contains_key(&paddr)
    }

    /// Paddr of the current LRU-end member, for tests and tracing.
    pub(crate) fn mru(&self) -> Option<Paddr> {
        self.by_recency
            .iter()
            .next_back()
            .map(|(_, extent)| extent.paddr())
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.by_recency.len()
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }

    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick = self.next_tick.saturating_add(1);
        tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{CachedExtent, ExtentState, PageBuf};
    use silt_types::ExtentType;

    fn clean_extent(paddr: u64, len: u32) -> ExtentRef {
        CachedExtent::new(
            ExtentType::Data,
            len,
            Paddr::Absolute(paddr),
            None,
            ExtentState::Clean,
            PageBuf::zeroed(len as usize),
        )
    }

    #[test]
    fn byte_accounting_tracks_membership() {
        let mut lru = LruQueue::new(1 << 20);
        let a = clean_extent(0x1000, 4096);
        let b = clean_extent(0x2000, 8192);
        lru.add(a.clone());
        lru.add(b.clone());
        assert_eq!(lru.bytes(), 4096 + 8192);
        lru.remove(&a);
        assert_eq!(lru.bytes(), 8192);
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn trim_evicts_lru_end_first() {
        let mut lru = LruQueue::new(8192);
        let a = clean_extent(0x1000, 4096);
        let b = clean_extent(0x2000, 4096);
        let c = clean_extent(0x3000, 4096);
        lru.add(a.clone());
        lru.add(b.clone());
        lru.add(c.clone());

        let victim = lru.pop_victim().expect("over capacity");
        assert_eq!(victim.paddr(), Paddr::Absolute(0x1000));
        assert!(lru.pop_victim().is_none());
        assert_eq!(lru.bytes(), 8192);
    }

    #[test]
    fn touch_moves_to_mru_and_is_idempotent() {
        let mut lru = LruQueue::new(1 << 20);
        let a = clean_extent(0x1000, 4096);
        let b = clean_extent(0x2000, 4096);
        lru.add(a.clone());
        lru.add(b.clone());

        lru.touch(&a);
        assert_eq!(lru.mru(), Some(Paddr::Absolute(0x1000)));
        lru.touch(&a);
        assert_eq!(lru.mru(), Some(Paddr::Absolute(0x1000)));
        assert_eq!(lru.bytes(), 8192);
    }

    #[test]
    fn touch_of_nonmember_is_noop() {
        let mut lru = LruQueue::new(1 << 20);
        let a = clean_extent(0x1000, 4096);
        lru.touch(&a);
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.bytes(), 0);
    }
}
