use std::{
    any::Any,
    cell::RefCell,
    ptr::{self, NonNull},
    rc::{Rc, Weak},
};

use log::{debug, trace, warn};

use crate::{
    BridgeSettings, Descriptor, MapLayout, ReferenceCollector, ReplicationLink, ScriptError,
    ScriptFinalizable, ScriptMap, ScriptVm, Traceable,
    bridge::{register_collectible, settings_of},
    clone_map_pairs, destroy_items, destroy_map_pairs,
};

pub const MAP_TYPE_NAME: &str = "Map";

enum MapStorage {
    Borrowed(NonNull<ScriptMap>),
    Owned(Box<ScriptMap>),
}

impl MapStorage {
    fn map(&self) -> &ScriptMap {
        match self {
            // SAFETY: borrowed maps outlive the proxy, see `MapProxy::new_borrowed`
            MapStorage::Borrowed(map) => unsafe { map.as_ref() },
            MapStorage::Owned(map) => map,
        }
    }

    fn map_mut(&mut self) -> &mut ScriptMap {
        match self {
            // SAFETY: borrowed maps outlive the proxy, see `MapProxy::new_borrowed`
            MapStorage::Borrowed(map) => unsafe { map.as_mut() },
            MapStorage::Owned(map) => map,
        }
    }

    fn is_borrowed(&self) -> bool {
        matches!(self, MapStorage::Borrowed(_))
    }
}

/// Script-facing view of a host map, with the same borrowed/owned split as
/// [`crate::ArrayProxy`].
pub struct MapProxy {
    key: Rc<dyn Descriptor>,
    value: Rc<dyn Descriptor>,
    storage: RefCell<Option<MapStorage>>,
    // keeps the storage of a borrowed map alive
    _holder: Option<Rc<dyn Any>>,
    replication: Option<ReplicationLink>,
    settings: BridgeSettings,
}

impl MapProxy {
    pub fn new_owned(
        key: Rc<dyn Descriptor>,
        value: Rc<dyn Descriptor>,
        settings: BridgeSettings,
    ) -> Self {
        let layout = MapLayout::new(&*key, &*value);
        let map = ScriptMap::with_buckets(layout, settings.map_initial_buckets);
        Self {
            key,
            value,
            storage: RefCell::new(Some(MapStorage::Owned(Box::new(map)))),
            _holder: None,
            replication: None,
            settings,
        }
    }

    /// # Safety
    /// `map` holds initialized pairs of the given types and stays valid until
    /// the proxy is released.
    pub unsafe fn new_borrowed(
        key: Rc<dyn Descriptor>,
        value: Rc<dyn Descriptor>,
        map: NonNull<ScriptMap>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            key,
            value,
            storage: RefCell::new(Some(MapStorage::Borrowed(map))),
            _holder: None,
            replication: None,
            settings,
        }
    }

    /// # Safety
    /// `source` holds initialized pairs of the given types.
    pub unsafe fn new_copy(
        key: Rc<dyn Descriptor>,
        value: Rc<dyn Descriptor>,
        source: &ScriptMap,
        settings: BridgeSettings,
    ) -> Self {
        let mut proxy = Self::new_owned(key, value, settings);
        if let Some(storage) = proxy.storage.get_mut() {
            // SAFETY: forwarded contract; the fresh map is distinct from `source`
            unsafe { clone_map_pairs(&*proxy.key, &*proxy.value, storage.map_mut(), source) };
        }
        proxy
    }

    pub fn with_replication(mut self, link: ReplicationLink) -> Self {
        self.replication = Some(link);
        self
    }

    pub fn push(self, vm: &mut dyn ScriptVm) -> Rc<Self> {
        let proxy = Rc::new(self);
        register_collectible(vm, Rc::downgrade(&proxy) as Weak<dyn Traceable>);
        vm.push_userdata(proxy.clone());
        proxy
    }

    /// # Safety
    /// see [`MapProxy::new_copy`]
    pub unsafe fn push_copy(
        vm: &mut dyn ScriptVm,
        key: Rc<dyn Descriptor>,
        value: Rc<dyn Descriptor>,
        source: &ScriptMap,
    ) -> Rc<Self> {
        let settings = settings_of(vm);
        // SAFETY: forwarded contract
        unsafe { Self::new_copy(key, value, source, settings) }.push(vm)
    }

    /// Push a view of `map`, which lives inside `holder`.
    ///
    /// # Safety
    /// see [`MapProxy::new_borrowed`]; `holder` owns the map.
    pub unsafe fn push_borrowed(
        vm: &mut dyn ScriptVm,
        key: Rc<dyn Descriptor>,
        value: Rc<dyn Descriptor>,
        map: NonNull<ScriptMap>,
        holder: Rc<dyn Any>,
    ) -> Rc<Self> {
        let settings = settings_of(vm);
        // SAFETY: forwarded contract
        let mut proxy = unsafe { Self::new_borrowed(key, value, map, settings) };
        proxy._holder = Some(holder);
        proxy.push(vm)
    }

    pub fn key_descriptor(&self) -> &Rc<dyn Descriptor> {
        &self.key
    }

    pub fn value_descriptor(&self) -> &Rc<dyn Descriptor> {
        &self.value
    }

    pub fn settings(&self) -> BridgeSettings {
        self.settings
    }

    pub fn is_released(&self) -> bool {
        self.storage.try_borrow().is_ok_and(|storage| storage.is_none())
    }

    fn with_storage<R>(
        &self,
        body: impl FnOnce(&mut MapStorage) -> Result<R, ScriptError>,
    ) -> Result<R, ScriptError> {
        let mut guard = self
            .storage
            .try_borrow_mut()
            .map_err(|_| ScriptError::Reentrant(MAP_TYPE_NAME))?;
        let storage = guard.as_mut().ok_or(ScriptError::Released(MAP_TYPE_NAME))?;
        body(storage)
    }

    pub fn mark_dirty(&self) {
        if let Some(link) = &self.replication {
            link.mark_dirty();
        }
    }

    pub fn num(&self) -> Result<usize, ScriptError> {
        self.with_storage(|storage| Ok(storage.map().len()))
    }

    /// Run `body` on the value stored under `key`; `None` when absent.
    ///
    /// # Safety
    /// `key` holds an initialized key.
    pub unsafe fn find_with<R>(
        &self,
        key: *const u8,
        body: impl FnOnce(&Rc<dyn Descriptor>, *mut u8) -> Result<R, ScriptError>,
    ) -> Result<Option<R>, ScriptError> {
        self.with_storage(|storage| {
            // SAFETY: forwarded contract
            match unsafe { storage.map().find_value(key, &*self.key) } {
                Some(value) => body(&self.value, value).map(Some),
                None => Ok(None),
            }
        })
    }

    /// Insert or overwrite. Returns the slot index.
    ///
    /// # Safety
    /// `key` and `value` hold initialized values of the proxy's types.
    pub unsafe fn add_pair(&self, key: *const u8, value: *const u8) -> Result<usize, ScriptError> {
        let index = self.with_storage(|storage| {
            // SAFETY: forwarded contract
            Ok(unsafe { storage.map_mut().add_pair(key, value, &*self.key, &*self.value) })
        })?;
        self.mark_dirty();
        Ok(index)
    }

    /// Remove the pair stored under `key`. Returns whether one existed.
    ///
    /// # Safety
    /// `key` holds an initialized key.
    pub unsafe fn remove_key(&self, key: *const u8) -> Result<bool, ScriptError> {
        if self.settings.dirty_on_noop_remove {
            self.mark_dirty();
        }
        let removed = self.with_storage(|storage| {
            // SAFETY: forwarded contract
            let Some(index) = (unsafe { storage.map().find_index(key, &*self.key) }) else {
                return Ok(false);
            };
            self.destroy_and_free(storage, index);
            Ok(true)
        })?;
        if removed && !self.settings.dirty_on_noop_remove {
            self.mark_dirty();
        }
        Ok(removed)
    }

    /// Remove `count` occupied pairs starting at slot `index`, skipping holes.
    /// Returns how many were removed.
    pub fn remove_at(&self, index: i64, count: usize) -> Result<usize, ScriptError> {
        let removed = self.with_storage(|storage| {
            if !storage.map().is_valid_index(index) {
                return Err(ScriptError::IndexOutOfRange {
                    container: MAP_TYPE_NAME,
                    operation: "remove",
                    index,
                });
            }
            let mut removed = 0;
            let mut slot = index as usize;
            while removed < count && slot < storage.map().max_index() {
                if storage.map().is_valid_index(slot as i64) {
                    self.destroy_and_free(storage, slot);
                    removed += 1;
                }
                slot += 1;
            }
            Ok(removed)
        })?;
        self.mark_dirty();
        Ok(removed)
    }

    fn destroy_and_free(&self, storage: &mut MapStorage, index: usize) {
        let borrowed = storage.is_borrowed();
        let map = storage.map_mut();
        if !borrowed {
            // SAFETY: occupied slot holds an initialized pair
            unsafe {
                destroy_items(&*self.key, map.key_ptr(index), 1);
                destroy_items(&*self.value, map.value_ptr(index), 1);
            }
        }
        map.remove_at(index);
    }

    pub fn clear(&self) -> Result<(), ScriptError> {
        self.with_storage(|storage| {
            if !storage.is_borrowed() {
                self.destroy_all(storage.map());
            }
            storage.map_mut().empty(self.settings.clear_slack);
            Ok(())
        })?;
        self.mark_dirty();
        Ok(())
    }

    fn destroy_all(&self, map: &ScriptMap) {
        // SAFETY: occupied slots hold initialized pairs
        unsafe { destroy_map_pairs(&*self.key, &*self.value, map) };
    }

    /// Replace the pairs of `dest` with copies of this map's.
    ///
    /// # Safety
    /// `dest` holds initialized pairs whose types match this proxy's.
    pub unsafe fn copy_into(&self, dest: *mut ScriptMap) -> Result<(), ScriptError> {
        self.with_storage(|storage| {
            let source = storage.map();
            if ptr::eq(source, dest.cast_const()) {
                return Ok(());
            }
            // SAFETY: distinct maps of matching types
            unsafe { clone_map_pairs(&*self.key, &*self.value, &mut *dest, source) };
            Ok(())
        })
    }

    /// Run `body` on the first occupied slot at or after `start`.
    /// The callback receives the slot index and the key and value addresses.
    pub fn with_pair_from<R>(
        &self,
        start: usize,
        body: impl FnOnce(usize, *mut u8, *mut u8) -> Result<R, ScriptError>,
    ) -> Result<Option<R>, ScriptError> {
        self.with_storage(|storage| {
            let map = storage.map();
            let occupied = (start..map.max_index()).find(|&index| map.is_valid_index(index as i64));
            let Some(index) = occupied else {
                return Ok(None);
            };
            body(index, map.key_ptr(index), map.value_ptr(index)).map(Some)
        })
    }

    pub fn release(&self) {
        let Ok(mut guard) = self.storage.try_borrow_mut() else {
            warn!("map proxy released while in use");
            return;
        };
        if let Some(MapStorage::Owned(mut map)) = guard.take() {
            trace!("releasing owned map of {} pairs", map.len());
            self.destroy_all(&map);
            map.empty(0);
        }
    }
}

impl Drop for MapProxy {
    fn drop(&mut self) {
        self.release();
    }
}

impl Traceable for MapProxy {
    fn add_referenced_objects(&self, collector: &mut dyn ReferenceCollector) {
        let mut key_owner = self.key.owner();
        collector.add_referenced_object(&mut key_owner);
        let mut value_owner = self.value.owner();
        collector.add_referenced_object(&mut value_owner);

        let Ok(mut guard) = self.storage.try_borrow_mut() else {
            return;
        };
        let Some(MapStorage::Owned(map)) = guard.as_mut() else {
            return;
        };
        let trace_keys = self.key.has_object_references();
        let trace_values = self.value.has_object_references();
        if map.is_empty() || !(trace_keys || trace_values) {
            return;
        }

        let mut removed = 0;
        for index in (0..map.max_index()).rev() {
            if !map.is_valid_index(index as i64) {
                continue;
            }
            // SAFETY: occupied slots hold initialized pairs
            let nulled = unsafe {
                let key_nulled =
                    trace_keys && self.key.trace(map.key_ptr(index), collector);
                let value_nulled =
                    trace_values && self.value.trace(map.value_ptr(index), collector);
                key_nulled || value_nulled
            };
            if nulled {
                // SAFETY: the pair is initialized and removed right after
                unsafe {
                    destroy_items(&*self.key, map.key_ptr(index), 1);
                    destroy_items(&*self.value, map.value_ptr(index), 1);
                }
                map.free_slot_unlinked(index);
                removed += 1;
            }
        }
        if removed > 0 {
            // SAFETY: the remaining occupied slots hold initialized keys
            unsafe { map.rehash(&*self.key) };
            debug!("host collection removed {removed} map pairs");
        }
    }

    fn referencer_name(&self) -> &'static str {
        "MapProxy"
    }
}

impl ScriptFinalizable for MapProxy {
    fn type_name(&self) -> &'static str {
        MAP_TYPE_NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }

    fn finalize(&self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectHeap, ObjectRef, Property, descriptor::testing::CountingDescriptor};

    fn mk_int_map(settings: BridgeSettings) -> MapProxy {
        MapProxy::new_owned(Property::int(), Property::int(), settings)
    }

    fn add(proxy: &MapProxy, key: i64, value: i64) {
        let (key, value) = ((&raw const key).cast(), (&raw const value).cast());
        unsafe { proxy.add_pair(key, value) }.expect("add succeeds");
    }

    fn get(proxy: &MapProxy, key: i64) -> Option<i64> {
        let key = (&raw const key).cast();
        unsafe { proxy.find_with(key, |_, value| Ok(value.cast::<i64>().read())) }
            .expect("live proxy")
    }

    fn remove(proxy: &MapProxy, key: i64) -> bool {
        unsafe { proxy.remove_key((&raw const key).cast()) }.expect("live proxy")
    }

    #[test]
    fn add_then_get_and_overwrite() {
        let proxy = mk_int_map(BridgeSettings::default());
        add(&proxy, 1, 10);
        add(&proxy, 2, 20);
        add(&proxy, 1, 11);
        assert_eq!(get(&proxy, 1), Some(11));
        assert_eq!(get(&proxy, 2), Some(20));
        assert_eq!(get(&proxy, 3), None);
        assert_eq!(proxy.num().ok(), Some(2));
    }

    #[test]
    fn remove_destroys_owned_pairs() {
        let counting = CountingDescriptor::new();
        let settings = BridgeSettings::default();
        let proxy = MapProxy::new_owned(Property::int(), counting.clone(), settings);
        let value = crate::ValueBuffer::new(counting.clone());
        for key in 0..3i64 {
            unsafe { proxy.add_pair((&raw const key).cast(), value.as_ptr()) }
                .expect("add succeeds");
        }
        assert!(remove(&proxy, 1));
        assert!(!remove(&proxy, 1));
        assert_eq!(counting.destroyed.get(), 1);
        drop(proxy);
        assert_eq!(counting.live(), 1, "only the standalone value is left");
    }

    #[test]
    fn remove_dirty_policy_is_configurable() {
        let replication = crate::ReplicationProxy::new();
        let marking = mk_int_map(BridgeSettings::default())
            .with_replication(ReplicationLink::new(&replication, 0));
        assert!(!remove(&marking, 42));
        assert!(replication.is_dirty(0), "absent key still marks dirty by default");

        let replication = crate::ReplicationProxy::new();
        let strict = mk_int_map(BridgeSettings {
            dirty_on_noop_remove: false,
            ..Default::default()
        })
        .with_replication(ReplicationLink::new(&replication, 0));
        assert!(!remove(&strict, 42));
        assert!(!replication.is_dirty(0));
        add(&strict, 42, 1);
        replication.take_dirty();
        assert!(remove(&strict, 42));
        assert!(replication.is_dirty(0));
    }

    #[test]
    fn remove_at_skips_holes() {
        let proxy = mk_int_map(BridgeSettings::default());
        for key in 0..6 {
            add(&proxy, key, key);
        }
        assert!(remove(&proxy, 2));
        // slots 1, 3 and 4 are the next three occupied ones
        assert_eq!(proxy.remove_at(1, 3).ok(), Some(3));
        assert_eq!(proxy.num().ok(), Some(2));
        assert_eq!(get(&proxy, 0), Some(0));
        assert_eq!(get(&proxy, 5), Some(5));
        assert!(proxy.remove_at(2, 1).is_err(), "holes are not valid start indices");
    }

    #[test]
    fn pairs_are_visited_in_slot_order() {
        let proxy = mk_int_map(BridgeSettings::default());
        for key in [10, 20, 30, 40] {
            add(&proxy, key, key + 1);
        }
        assert!(remove(&proxy, 20));
        let mut keys = Vec::new();
        let mut start = 0;
        while let Some(next) = proxy
            .with_pair_from(start, |index, key, _| {
                keys.push(unsafe { key.cast::<i64>().read() });
                Ok(index + 1)
            })
            .expect("live proxy")
        {
            start = next;
        }
        assert_eq!(keys, vec![10, 30, 40]);
    }

    #[test]
    fn owned_copy_duplicates_host_pairs() {
        let int = Property::int();
        let mut host = ScriptMap::for_descriptors(&*int, &*int);
        for key in 0..20i64 {
            let value = key * 2;
            let (key, value) = ((&raw const key).cast(), (&raw const value).cast());
            unsafe { host.add_pair(key, value, &*int, &*int) };
        }
        let settings = BridgeSettings::default();
        let copy = unsafe { MapProxy::new_copy(int.clone(), int.clone(), &host, settings) };
        let capacity = copy.with_storage(|storage| Ok(storage.map().capacity()));
        assert_eq!(capacity, Ok(20), "sized to the source up front");
        add(&copy, 99, 9);
        assert_eq!(copy.num().ok(), Some(21));
        assert_eq!(host.len(), 20);
        assert_eq!(get(&copy, 3), Some(6));
    }

    #[test]
    fn trace_drops_pairs_with_dead_values_and_rehashes() {
        let heap = ObjectHeap::new();
        let settings = BridgeSettings::default();
        let proxy = MapProxy::new_owned(Property::int(), Property::object(), settings);
        let objects: Vec<ObjectRef> =
            (0..8).map(|i| heap.allocate(format!("obj{i}"))).collect();
        for (key, object) in objects.iter().enumerate() {
            let key = key as i64;
            let value = Some(*object);
            let (key, value) = ((&raw const key).cast(), (&raw const value).cast());
            unsafe { proxy.add_pair(key, value) }.expect("add succeeds");
        }
        heap.mark_pending_kill(objects[1]);
        heap.mark_pending_kill(objects[6]);
        proxy.add_referenced_objects(&mut heap.mark_collector());

        assert_eq!(proxy.num().ok(), Some(6));
        for key in 0..8i64 {
            let found = unsafe {
                proxy.find_with((&raw const key).cast(), |_, value| {
                    Ok(*value.cast::<Option<ObjectRef>>())
                })
            }
            .expect("live proxy");
            if key == 1 || key == 6 {
                assert_eq!(found, None, "key {key} was removed");
            } else {
                assert_eq!(found, Some(Some(objects[key as usize])), "key {key} still resolves");
            }
        }
    }
}
