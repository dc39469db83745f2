use std::{
    cell::{Cell, RefCell},
    collections::BTreeSet,
    rc::{Rc, Weak},
};

pub const INVALID_REPLICATED_INDEX: u16 = u16::MAX;

/// Dirty-state sink of one replicated host object.
#[derive(Debug, Default)]
pub struct ReplicationProxy {
    dirty_mark: RefCell<BTreeSet<u16>>,
    assign_times: Cell<u32>,
}

impl ReplicationProxy {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn mark(&self, index: u16) {
        self.dirty_mark.borrow_mut().insert(index);
        self.assign_times.set(self.assign_times.get().wrapping_add(1));
    }

    pub fn is_dirty(&self, index: u16) -> bool {
        self.dirty_mark.borrow().contains(&index)
    }

    pub fn assign_times(&self) -> u32 {
        self.assign_times.get()
    }

    /// Dirty indices in ascending order; clears the marks.
    pub fn take_dirty(&self) -> Vec<u16> {
        std::mem::take(&mut *self.dirty_mark.borrow_mut()).into_iter().collect()
    }
}

/// A container's link to the replicated field it mirrors.
#[derive(Debug, Clone)]
pub struct ReplicationLink {
    proxy: Weak<ReplicationProxy>,
    index: u16,
}

impl ReplicationLink {
    pub fn new(proxy: &Rc<ReplicationProxy>, index: u16) -> Self {
        Self {
            proxy: Rc::downgrade(proxy),
            index,
        }
    }

    /// Returns `false` when the sink is gone or the index is unset.
    pub fn mark_dirty(&self) -> bool {
        if self.index == INVALID_REPLICATED_INDEX {
            return false;
        }
        match self.proxy.upgrade() {
            Some(proxy) => {
                proxy.mark(self.index);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_accumulate_until_taken() {
        let proxy = ReplicationProxy::new();
        let a = ReplicationLink::new(&proxy, 3);
        let b = ReplicationLink::new(&proxy, 1);
        assert!(a.mark_dirty());
        assert!(b.mark_dirty());
        assert!(a.mark_dirty());
        assert_eq!(proxy.assign_times(), 3);
        assert_eq!(proxy.take_dirty(), vec![1, 3]);
        assert!(!proxy.is_dirty(3));
    }

    #[test]
    fn dead_sinks_and_invalid_indices_are_ignored() {
        let proxy = ReplicationProxy::new();
        let invalid = ReplicationLink::new(&proxy, INVALID_REPLICATED_INDEX);
        assert!(!invalid.mark_dirty());
        let link = ReplicationLink::new(&proxy, 0);
        drop(proxy);
        assert!(!link.mark_dirty());
    }
}
