use std::{
    cell::{Cell, RefCell},
    num::NonZeroU32,
    rc::{Rc, Weak},
};

use log::{debug, trace};

use crate::{CollectibleRegistry, ReferenceCollector, Traceable};

/// Handle to an object living in the host heap.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(NonZeroU32);

impl ObjectRef {
    fn from_slot(slot: usize) -> Self {
        // slot + 1 is never zero
        Self(NonZeroU32::MIN.saturating_add(slot as u32))
    }

    fn slot(self) -> usize {
        self.0.get() as usize - 1
    }

    pub fn raw(self) -> u32 {
        self.0.get()
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjectState {
    Live,
    PendingKill,
    Freed,
}

#[derive(Debug)]
struct ObjectEntry {
    name: String,
    state: ObjectState,
    rooted: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GarbageCollectionStats {
    pub collectibles: usize,
    pub marked: usize,
    pub nulled: usize,
    pub freed: usize,
}

/// Reference host heap: named objects, explicit roots and a mark phase that
/// asks every registered collectible for its references.
/// Object slots are never reused, so a stale `ObjectRef` can't alias a new object.
#[derive(Default)]
pub struct ObjectHeap {
    objects: RefCell<Vec<ObjectEntry>>,
    collectibles: RefCell<Vec<Weak<dyn Traceable>>>,
    collections: Cell<usize>,
}

impl ObjectHeap {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn allocate(&self, name: impl Into<String>) -> ObjectRef {
        let mut objects = self.objects.borrow_mut();
        objects.push(ObjectEntry {
            name: name.into(),
            state: ObjectState::Live,
            rooted: false,
        });
        ObjectRef::from_slot(objects.len() - 1)
    }

    pub fn add_root(&self, object: ObjectRef) {
        if let Some(entry) = self.objects.borrow_mut().get_mut(object.slot()) {
            entry.rooted = true;
        }
    }

    /// The object is freed by the next collection and every traced reference to it is nulled.
    pub fn mark_pending_kill(&self, object: ObjectRef) {
        if let Some(entry) = self.objects.borrow_mut().get_mut(object.slot()) {
            if entry.state == ObjectState::Live {
                entry.state = ObjectState::PendingKill;
            }
        }
    }

    pub fn state(&self, object: ObjectRef) -> ObjectState {
        self.objects
            .borrow()
            .get(object.slot())
            .map_or(ObjectState::Freed, |entry| entry.state)
    }

    pub fn is_alive(&self, object: ObjectRef) -> bool {
        self.state(object) == ObjectState::Live
    }

    pub fn name(&self, object: ObjectRef) -> Option<String> {
        self.objects.borrow().get(object.slot()).map(|entry| entry.name.clone())
    }

    pub fn live_objects(&self) -> usize {
        self.objects
            .borrow()
            .iter()
            .filter(|entry| entry.state == ObjectState::Live)
            .count()
    }

    pub fn collections(&self) -> usize {
        self.collections.get()
    }

    /// A collector over the current object states, for tracing outside a collection.
    pub fn mark_collector(&self) -> MarkCollector {
        MarkCollector::new(&self.objects.borrow())
    }

    pub fn collect_garbage(&self) -> GarbageCollectionStats {
        let collectibles: Vec<Rc<dyn Traceable>> = {
            let mut list = self.collectibles.borrow_mut();
            list.retain(|collectible| collectible.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };

        let marks = {
            let objects = self.objects.borrow();
            let mut collector = MarkCollector::new(&objects);
            objects
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.rooted && entry.state == ObjectState::Live)
                .for_each(|(slot, _)| collector.marks[slot] = true);
            for collectible in &collectibles {
                trace!("tracing {}", collectible.referencer_name());
                collectible.add_referenced_objects(&mut collector);
            }
            collector
        };

        let mut stats = GarbageCollectionStats {
            collectibles: collectibles.len(),
            marked: marks.marks.iter().filter(|&&mark| mark).count(),
            nulled: marks.nulled,
            freed: 0,
        };

        let mut objects = self.objects.borrow_mut();
        for (entry, &marked) in objects.iter_mut().zip(&marks.marks) {
            if entry.state != ObjectState::Freed && !marked {
                trace!("freeing {}", entry.name);
                entry.state = ObjectState::Freed;
                stats.freed += 1;
            }
        }
        self.collections.set(self.collections.get() + 1);
        debug!("host collection: {stats:?}");
        stats
    }
}

impl CollectibleRegistry for ObjectHeap {
    fn register_collectible(&self, collectible: Weak<dyn Traceable>) {
        self.collectibles.borrow_mut().push(collectible);
    }
}

/// Marks live references and nulls the ones pointing at dead or pending-kill objects.
pub struct MarkCollector {
    states: Vec<ObjectState>,
    marks: Vec<bool>,
    nulled: usize,
}

impl MarkCollector {
    fn new(objects: &[ObjectEntry]) -> Self {
        Self {
            states: objects.iter().map(|entry| entry.state).collect(),
            marks: vec![false; objects.len()],
            nulled: 0,
        }
    }
}

impl ReferenceCollector for MarkCollector {
    fn add_referenced_object(&mut self, object: &mut Option<ObjectRef>) -> bool {
        let Some(reference) = *object else {
            return false;
        };
        match self.states.get(reference.slot()) {
            Some(ObjectState::Live) => {
                self.marks[reference.slot()] = true;
                false
            }
            _ => {
                *object = None;
                self.nulled += 1;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Holder {
        refs: RefCell<Vec<Option<ObjectRef>>>,
    }

    impl Traceable for Holder {
        fn add_referenced_objects(&self, collector: &mut dyn ReferenceCollector) {
            for reference in self.refs.borrow_mut().iter_mut() {
                collector.add_referenced_object(reference);
            }
        }

        fn referencer_name(&self) -> &'static str {
            "Holder"
        }
    }

    #[test]
    fn unreferenced_objects_are_freed() {
        let heap = ObjectHeap::new();
        let root = heap.allocate("root");
        let loose = heap.allocate("loose");
        heap.add_root(root);

        let stats = heap.collect_garbage();
        assert!(heap.is_alive(root));
        assert_eq!(heap.state(loose), ObjectState::Freed);
        assert_eq!(stats.freed, 1);
    }

    #[test]
    fn collectibles_keep_objects_and_see_kills() {
        let heap = ObjectHeap::new();
        let kept = heap.allocate("kept");
        let killed = heap.allocate("killed");
        let holder = Rc::new(Holder {
            refs: RefCell::new(vec![Some(kept), Some(killed), None]),
        });
        let weak: Weak<dyn Traceable> = Rc::downgrade(&holder) as Weak<dyn Traceable>;
        heap.register_collectible(weak);

        heap.mark_pending_kill(killed);
        let stats = heap.collect_garbage();

        assert_eq!(*holder.refs.borrow(), vec![Some(kept), None, None]);
        assert_eq!(stats.nulled, 1, "only the killed reference is nulled");
        assert!(heap.is_alive(kept));
        assert!(!heap.is_alive(killed));
    }

    #[test]
    fn dropped_collectibles_are_forgotten() {
        let heap = ObjectHeap::new();
        let holder = Rc::new(Holder {
            refs: RefCell::new(Vec::new()),
        });
        heap.register_collectible(Rc::downgrade(&holder) as Weak<dyn Traceable>);
        drop(holder);
        assert_eq!(heap.collect_garbage().collectibles, 0);
    }
}
