//! Address-ordered index of live cached extents.

use crate::extent::ExtentRef;
use silt_types::Paddr;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Maps absolute physical addresses to live extents with byte
/// accounting. Strictly an address index; ordering across `Paddr`
/// values supports the range walks the back-reference machinery needs.
#[derive(Debug, Default)]
pub(crate) struct ExtentIndex {
    by_paddr: BTreeMap<Paddr, ExtentRef>,
    bytes: u64,
}

impl ExtentIndex {
    pub(crate) fn find(&self, paddr: Paddr) -> Option<ExtentRef> {
        self.by_paddr.get(&paddr).cloned()
    }

    /// Insert an extent under its absolute address.
    pub(crate) fn insert(&mut self, extent: ExtentRef) {
        let paddr = extent.paddr();
        debug_assert!(paddr.is_absolute(), "index keys must be absolute: {paddr}");
        let bytes = u64::from(extent.length());
        let prev = self.by_paddr.insert(paddr, extent);
        debug_assert!(prev.is_none(), "index collision at {paddr}");
        self.bytes = self.bytes.saturating_add(bytes);
    }

    /// Atomically swap `next` in under the address `prev` occupies.
    pub(crate) fn replace(&mut self, next: ExtentRef, prev: &ExtentRef) {
        let paddr = prev.paddr();
        debug_assert_eq!(paddr, next.paddr());
        let removed = self.by_paddr.insert(paddr, next);
        match removed {
            Some(old) => {
                debug_assert!(Arc::ptr_eq(&old, prev), "replace displaced a stranger at {paddr}");
                self.bytes = self.bytes.saturating_sub(u64::from(old.length()));
            }
            None => debug_assert!(false, "replace target absent at {paddr}"),
        }
        let entry = &self.by_paddr[&paddr];
        self.bytes = self.bytes.saturating_add(u64::from(entry.length()));
    }

    /// Remove an extent if it is the resident entry for its address.
    pub(crate) fn erase(&mut self, extent: &ExtentRef) -> bool {
        let paddr = extent.paddr();
        if let Some(resident) = self.by_paddr.get(&paddr) {
            if Arc::ptr_eq(resident, extent) {
                self.by_paddr.remove(&paddr);
                self.bytes = self.bytes.saturating_sub(u64::from(extent.length()));
                return true;
            }
        }
        false
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ExtentRef> {
        self.by_paddr.values()
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.by_paddr.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{CachedExtent, ExtentState, PageBuf};
    use silt_types::ExtentType;

    fn extent_at(paddr: u64, len: u32) -> ExtentRef {
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
    fn insert_find_erase_accounting() {
        let mut index = ExtentIndex::default();
        let a = extent_at(0x1000, 4096);
        let b = extent_at(0x2000, 8192);
        index.insert(Arc::clone(&a));
        index.insert(Arc::clone(&b));
        assert_eq!(index.len(), 2);
        assert_eq!(index.bytes(), 4096 + 8192);
        assert!(Arc::ptr_eq(
            &index.find(Paddr::Absolute(0x1000)).expect("a resident"),
            &a
        ));

        assert!(index.erase(&a));
        assert_eq!(index.len(), 1);
        assert_eq!(index.bytes(), 8192);
        assert!(index.find(Paddr::Absolute(0x1000)).is_none());
    }

    #[test]
    fn erase_ignores_displaced_reference() {
        let mut index = ExtentIndex::default();
        let resident = extent_at(0x3000, 4096);
        let stranger = extent_at(0x3000, 4096);
        index.insert(Arc::clone(&resident));
        assert!(!index.erase(&stranger));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn replace_swaps_under_same_address() {
        let mut index = ExtentIndex::default();
        let prev = extent_at(0x4000, 4096);
        let next = extent_at(0x4000, 4096);
        index.insert(Arc::clone(&prev));
        index.replace(Arc::clone(&next), &prev);
        assert!(Arc::ptr_eq(
            &index.find(Paddr::Absolute(0x4000)).expect("next resident"),
            &next
        ));
        assert_eq!(index.bytes(), 4096);
    }
}
