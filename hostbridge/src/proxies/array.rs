use std::{
    any::Any,
    cell::RefCell,
    ptr::{self, NonNull},
    rc::{Rc, Weak},
};

use log::{debug, trace, warn};

use crate::{
    BridgeSettings, Descriptor, ReferenceCollector, ReplicationLink, ScriptArray, ScriptError,
    ScriptFinalizable, ScriptVm, Traceable,
    bridge::{register_collectible, settings_of},
    clone_array_elements, construct_items, destroy_items,
};

pub const ARRAY_TYPE_NAME: &str = "Array";

enum ArrayStorage {
    // host owns the array and its elements
    Borrowed(NonNull<ScriptArray>),
    Owned(Box<ScriptArray>),
}

impl ArrayStorage {
    fn array(&self) -> &ScriptArray {
        match self {
            // SAFETY: borrowed arrays outlive the proxy, see `ArrayProxy::new_borrowed`
            ArrayStorage::Borrowed(array) => unsafe { array.as_ref() },
            ArrayStorage::Owned(array) => array,
        }
    }

    fn array_mut(&mut self) -> &mut ScriptArray {
        match self {
            // SAFETY: borrowed arrays outlive the proxy, see `ArrayProxy::new_borrowed`
            ArrayStorage::Borrowed(array) => unsafe { array.as_mut() },
            ArrayStorage::Owned(array) => array,
        }
    }

    fn is_borrowed(&self) -> bool {
        matches!(self, ArrayStorage::Borrowed(_))
    }
}

/// Script-facing view of a host array.
///
/// Borrowed proxies alias host memory and never destroy elements they did not
/// construct themselves. Owned proxies hold a deep copy and destroy every
/// element on release.
pub struct ArrayProxy {
    inner: Rc<dyn Descriptor>,
    storage: RefCell<Option<ArrayStorage>>,
    // keeps the storage of a borrowed array alive
    _holder: Option<Rc<dyn Any>>,
    replication: Option<ReplicationLink>,
    settings: BridgeSettings,
}

impl ArrayProxy {
    pub fn new_owned(inner: Rc<dyn Descriptor>, settings: BridgeSettings) -> Self {
        let array = ScriptArray::for_descriptor(&*inner);
        Self {
            inner,
            storage: RefCell::new(Some(ArrayStorage::Owned(Box::new(array)))),
            _holder: None,
            replication: None,
            settings,
        }
    }

    /// # Safety
    /// `array` holds initialized elements of `inner`'s type and stays valid
    /// until the proxy is released.
    pub unsafe fn new_borrowed(
        inner: Rc<dyn Descriptor>,
        array: NonNull<ScriptArray>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            inner,
            storage: RefCell::new(Some(ArrayStorage::Borrowed(array))),
            _holder: None,
            replication: None,
            settings,
        }
    }

    /// # Safety
    /// `source` holds initialized elements of `inner`'s type.
    pub unsafe fn new_copy(
        inner: Rc<dyn Descriptor>,
        source: &ScriptArray,
        settings: BridgeSettings,
    ) -> Self {
        let mut proxy = Self::new_owned(inner, settings);
        if let Some(storage) = proxy.storage.get_mut() {
            // SAFETY: forwarded contract; the fresh array is distinct from `source`
            unsafe { clone_array_elements(&*proxy.inner, storage.array_mut(), source) };
        }
        proxy
    }

    pub fn with_replication(mut self, link: ReplicationLink) -> Self {
        self.replication = Some(link);
        self
    }

    /// Hand the proxy to the script side and register it with the host collector.
    pub fn push(self, vm: &mut dyn ScriptVm) -> Rc<Self> {
        let proxy = Rc::new(self);
        register_collectible(vm, Rc::downgrade(&proxy) as Weak<dyn Traceable>);
        vm.push_userdata(proxy.clone());
        proxy
    }

    /// # Safety
    /// see [`ArrayProxy::new_copy`]
    pub unsafe fn push_copy(
        vm: &mut dyn ScriptVm,
        inner: Rc<dyn Descriptor>,
        source: &ScriptArray,
    ) -> Rc<Self> {
        let settings = settings_of(vm);
        // SAFETY: forwarded contract
        unsafe { Self::new_copy(inner, source, settings) }.push(vm)
    }

    /// Push a view of `array`, which lives inside `holder`.
    ///
    /// # Safety
    /// see [`ArrayProxy::new_borrowed`]; `holder` owns the array.
    pub unsafe fn push_borrowed(
        vm: &mut dyn ScriptVm,
        inner: Rc<dyn Descriptor>,
        array: NonNull<ScriptArray>,
        holder: Rc<dyn Any>,
    ) -> Rc<Self> {
        let settings = settings_of(vm);
        // SAFETY: forwarded contract
        let mut proxy = unsafe { Self::new_borrowed(inner, array, settings) };
        proxy._holder = Some(holder);
        proxy.push(vm)
    }

    pub fn inner(&self) -> &Rc<dyn Descriptor> {
        &self.inner
    }

    pub fn settings(&self) -> BridgeSettings {
        self.settings
    }

    pub fn is_borrowed(&self) -> bool {
        self.storage
            .try_borrow()
            .is_ok_and(|storage| storage.as_ref().is_some_and(ArrayStorage::is_borrowed))
    }

    pub fn is_released(&self) -> bool {
        self.storage.try_borrow().is_ok_and(|storage| storage.is_none())
    }

    fn with_storage<R>(
        &self,
        body: impl FnOnce(&mut ArrayStorage) -> Result<R, ScriptError>,
    ) -> Result<R, ScriptError> {
        let mut guard = self
            .storage
            .try_borrow_mut()
            .map_err(|_| ScriptError::Reentrant(ARRAY_TYPE_NAME))?;
        let storage = guard.as_mut().ok_or(ScriptError::Released(ARRAY_TYPE_NAME))?;
        body(storage)
    }

    pub fn mark_dirty(&self) {
        if let Some(link) = &self.replication {
            link.mark_dirty();
        }
    }

    pub fn num(&self) -> Result<usize, ScriptError> {
        self.with_storage(|storage| Ok(storage.array().len()))
    }

    /// Run `body` on element `index`, failing with "`operation` index out of range".
    pub fn with_element<R>(
        &self,
        index: i64,
        operation: &'static str,
        body: impl FnOnce(&Rc<dyn Descriptor>, *mut u8) -> Result<R, ScriptError>,
    ) -> Result<R, ScriptError> {
        self.try_element(index, body)?.ok_or(ScriptError::IndexOutOfRange {
            container: ARRAY_TYPE_NAME,
            operation,
            index,
        })
    }

    /// Like [`ArrayProxy::with_element`], but an invalid index yields `None`.
    pub fn try_element<R>(
        &self,
        index: i64,
        body: impl FnOnce(&Rc<dyn Descriptor>, *mut u8) -> Result<R, ScriptError>,
    ) -> Result<Option<R>, ScriptError> {
        self.with_storage(|storage| {
            let array = storage.array();
            if !array.is_valid_index(index) {
                return Ok(None);
            }
            body(&self.inner, array.get_raw_ptr(index as usize)).map(Some)
        })
    }

    /// Append a constructed element and let `fill` write it. The element is
    /// dropped again if `fill` fails. Returns the new index.
    pub fn add_with(
        &self,
        fill: impl FnOnce(&Rc<dyn Descriptor>, *mut u8) -> Result<(), ScriptError>,
    ) -> Result<usize, ScriptError> {
        let index = self.with_storage(|storage| {
            let array = storage.array_mut();
            let index = array.add_uninit(1);
            self.fill_new_slot(array, index, fill)?;
            Ok(index)
        })?;
        self.mark_dirty();
        Ok(index)
    }

    /// Insert at `0 <= index <= num`; `index == num` appends.
    pub fn insert_with(
        &self,
        index: i64,
        fill: impl FnOnce(&Rc<dyn Descriptor>, *mut u8) -> Result<(), ScriptError>,
    ) -> Result<(), ScriptError> {
        self.with_storage(|storage| {
            let array = storage.array_mut();
            if index < 0 || index as u64 > array.len() as u64 {
                return Err(ScriptError::IndexOutOfRange {
                    container: ARRAY_TYPE_NAME,
                    operation: "insert",
                    index,
                });
            }
            array.insert_uninit(index as usize, 1);
            self.fill_new_slot(array, index as usize, fill)
        })?;
        self.mark_dirty();
        Ok(())
    }

    fn fill_new_slot(
        &self,
        array: &mut ScriptArray,
        index: usize,
        fill: impl FnOnce(&Rc<dyn Descriptor>, *mut u8) -> Result<(), ScriptError>,
    ) -> Result<(), ScriptError> {
        let slot = array.get_raw_ptr(index);
        // SAFETY: the slot was just opened and is uninitialized
        unsafe { construct_items(&*self.inner, slot, 1) };
        fill(&self.inner, slot).inspect_err(|_| {
            // SAFETY: constructed above, never exposed
            unsafe { destroy_items(&*self.inner, slot, 1) };
            array.remove_raw(index, 1);
        })
    }

    /// Append unless an identical element exists. Returns the index of the
    /// new or the existing element. Marks dirty either way.
    pub fn add_unique_with(
        &self,
        fill: impl FnOnce(&Rc<dyn Descriptor>, *mut u8) -> Result<(), ScriptError>,
    ) -> Result<usize, ScriptError> {
        let index = self.with_storage(|storage| {
            let array = storage.array_mut();
            let index = array.add_uninit(1);
            self.fill_new_slot(array, index, fill)?;
            let candidate = array.get_raw_ptr(index);
            // SAFETY: all elements below `num` are initialized
            let existing = (0..index)
                .find(|&i| unsafe { self.inner.identical(array.get_raw_ptr(i), candidate) });
            match existing {
                Some(existing) => {
                    // SAFETY: the candidate was constructed here and never exposed
                    unsafe { destroy_items(&*self.inner, candidate, 1) };
                    array.remove_raw(index, 1);
                    Ok(existing)
                }
                None => Ok(index),
            }
        })?;
        self.mark_dirty();
        Ok(index)
    }

    pub fn remove(&self, index: i64) -> Result<(), ScriptError> {
        self.with_storage(|storage| {
            let borrowed = storage.is_borrowed();
            let array = storage.array_mut();
            if !array.is_valid_index(index) {
                return Err(ScriptError::IndexOutOfRange {
                    container: ARRAY_TYPE_NAME,
                    operation: "remove",
                    index,
                });
            }
            if !borrowed {
                // SAFETY: valid index holds an initialized element
                unsafe { destroy_items(&*self.inner, array.get_raw_ptr(index as usize), 1) };
            }
            array.remove_raw(index as usize, 1);
            Ok(())
        })?;
        self.mark_dirty();
        Ok(())
    }

    pub fn clear(&self) -> Result<(), ScriptError> {
        self.with_storage(|storage| {
            let borrowed = storage.is_borrowed();
            let array = storage.array_mut();
            if !borrowed {
                // SAFETY: the first `num` elements are initialized
                unsafe { destroy_items(&*self.inner, array.get_raw_ptr(0), array.len()) };
            }
            array.empty(self.settings.clear_slack);
            Ok(())
        })?;
        self.mark_dirty();
        Ok(())
    }

    /// Replace the elements of `dest` with copies of this array's.
    ///
    /// # Safety
    /// `dest` holds initialized elements of `descriptor`'s type, which must
    /// match this proxy's element kind.
    pub unsafe fn copy_into(
        &self,
        descriptor: &dyn Descriptor,
        dest: *mut ScriptArray,
    ) -> Result<(), ScriptError> {
        self.with_storage(|storage| {
            let source = storage.array();
            if ptr::eq(source, dest.cast_const()) {
                return Ok(());
            }
            // SAFETY: distinct arrays of matching element kinds
            unsafe { clone_array_elements(descriptor, &mut *dest, source) };
            Ok(())
        })
    }

    /// Drop owned storage. Later operations fail with "already released".
    pub fn release(&self) {
        let Ok(mut guard) = self.storage.try_borrow_mut() else {
            warn!("array proxy released while in use");
            return;
        };
        if let Some(ArrayStorage::Owned(mut array)) = guard.take() {
            trace!("releasing owned array of {} {}", array.len(), self.inner.name());
            // SAFETY: the first `num` elements are initialized
            unsafe { destroy_items(&*self.inner, array.get_raw_ptr(0), array.len()) };
            array.empty(0);
        }
    }
}

impl Drop for ArrayProxy {
    fn drop(&mut self) {
        self.release();
    }
}

impl Traceable for ArrayProxy {
    fn add_referenced_objects(&self, collector: &mut dyn ReferenceCollector) {
        let mut owner = self.inner.owner();
        collector.add_referenced_object(&mut owner);

        let Ok(mut guard) = self.storage.try_borrow_mut() else {
            return;
        };
        let Some(ArrayStorage::Owned(array)) = guard.as_mut() else {
            return;
        };
        if array.is_empty() || !self.inner.has_object_references() {
            return;
        }
        let mut removed = 0;
        for index in (0..array.len()).rev() {
            let slot = array.get_raw_ptr(index);
            // SAFETY: every index below `num` holds an initialized element
            if unsafe { self.inner.trace(slot, collector) } {
                unsafe { destroy_items(&*self.inner, slot, 1) };
                array.remove_raw(index, 1);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("host collection removed {removed} {} elements", self.inner.name());
        }
    }

    fn referencer_name(&self) -> &'static str {
        "ArrayProxy"
    }
}

impl ScriptFinalizable for ArrayProxy {
    fn type_name(&self) -> &'static str {
        ARRAY_TYPE_NAME
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
    use crate::{
        ObjectHeap, Property, ReplicationProxy, StructDef, StructValue,
        descriptor::testing::CountingDescriptor,
    };

    fn write_i64(
        value: i64,
    ) -> impl FnOnce(&Rc<dyn Descriptor>, *mut u8) -> Result<(), ScriptError> {
        move |_, slot| {
            unsafe { slot.cast::<i64>().write(value) };
            Ok(())
        }
    }

    fn read_all(proxy: &ArrayProxy) -> Vec<i64> {
        (0..proxy.num().expect("live proxy") as i64)
            .map(|i| {
                proxy.with_element(i, "get", |_, slot| {
                    Ok(unsafe { slot.cast::<i64>().read() })
                })
            })
            .collect::<Result<_, _>>()
            .expect("valid indices")
    }

    fn mk_owned(values: &[i64]) -> (ArrayProxy, Rc<CountingDescriptor>) {
        let counting = CountingDescriptor::new();
        let proxy = ArrayProxy::new_owned(counting.clone(), BridgeSettings::default());
        for &value in values {
            proxy.add_with(write_i64(value)).expect("add succeeds");
        }
        (proxy, counting)
    }

    #[test]
    fn add_constructs_each_new_element() {
        let (proxy, counting) = mk_owned(&[1, 2, 3]);
        assert_eq!(counting.constructed.get(), 3);
        assert_eq!(read_all(&proxy), vec![1, 2, 3]);
    }

    #[test]
    fn failed_fill_rolls_the_element_back() {
        let (proxy, counting) = mk_owned(&[1]);
        let result = proxy.add_with(|_, _| Err(ScriptError::Runtime("bad value".into())));
        assert!(result.is_err());
        assert_eq!(proxy.num().ok(), Some(1));
        assert_eq!(counting.live(), 1, "rolled back element is destroyed");
    }

    #[test]
    fn remove_destroys_exactly_once_when_owned() {
        let (proxy, counting) = mk_owned(&[1, 2, 3]);
        proxy.remove(1).expect("valid index");
        assert_eq!(counting.destroyed.get(), 1);
        assert_eq!(read_all(&proxy), vec![1, 3]);

        let error = proxy.remove(5).expect_err("out of range");
        assert_eq!(error.to_string(), "Array remove index 5 out of range");
    }

    #[test]
    fn borrowed_proxy_never_destroys_host_elements() {
        let counting = CountingDescriptor::new();
        let mut host = ScriptArray::for_descriptor(&*counting);
        host.add_uninit(2);
        unsafe { construct_items(&*counting, host.get_raw_ptr(0), 2) };

        let settings = BridgeSettings::default();
        let proxy = unsafe {
            ArrayProxy::new_borrowed(counting.clone(), NonNull::from(&mut host), settings)
        };
        proxy.remove(0).expect("valid index");
        proxy.add_with(write_i64(7)).expect("add succeeds");
        proxy.clear().expect("clear succeeds");
        drop(proxy);

        assert_eq!(counting.destroyed.get(), 0);
        assert_eq!(counting.constructed.get(), 3, "added slots are still constructed");
        assert!(host.is_empty());
    }

    #[test]
    fn insert_accepts_the_end_position() {
        let (proxy, _) = mk_owned(&[1, 3]);
        proxy.insert_with(1, write_i64(2)).expect("middle insert");
        proxy.insert_with(3, write_i64(4)).expect("insert at num appends");
        assert_eq!(read_all(&proxy), vec![1, 2, 3, 4]);
        assert!(proxy.insert_with(6, write_i64(0)).is_err());
        assert!(proxy.insert_with(-1, write_i64(0)).is_err());
    }

    #[test]
    fn add_unique_returns_existing_index() {
        let (proxy, counting) = mk_owned(&[]);
        assert_eq!(proxy.add_unique_with(write_i64(5)).ok(), Some(0));
        assert_eq!(proxy.add_unique_with(write_i64(5)).ok(), Some(0));
        assert_eq!(proxy.add_unique_with(write_i64(6)).ok(), Some(1));
        assert_eq!(proxy.num().ok(), Some(2));
        assert_eq!(counting.live(), 2, "duplicate candidate was destroyed");
    }

    #[test]
    fn clear_keeps_configured_slack() {
        let counting = CountingDescriptor::new();
        let settings = BridgeSettings {
            clear_slack: 4,
            ..Default::default()
        };
        let proxy = ArrayProxy::new_owned(counting.clone(), settings);
        for value in 0..10 {
            proxy.add_with(write_i64(value)).expect("add succeeds");
        }
        proxy.clear().expect("clear succeeds");
        assert_eq!(counting.live(), 0);
        let capacity = proxy.with_storage(|storage| Ok(storage.array().capacity()));
        assert_eq!(capacity.ok(), Some(4));
    }

    #[test]
    fn owned_copy_destroys_only_its_own_elements() {
        let counting = CountingDescriptor::new();
        let mut host = ScriptArray::for_descriptor(&*counting);
        host.add_uninit(3);
        unsafe { construct_items(&*counting, host.get_raw_ptr(0), 3) };
        let before = counting.constructed.get();

        let settings = BridgeSettings::default();
        let copy = unsafe { ArrayProxy::new_copy(counting.clone(), &host, settings) };
        assert_eq!(counting.constructed.get() - before, 3);
        drop(copy);
        assert_eq!(counting.destroyed.get(), 3, "one destroy per copied element");
        assert_eq!(host.len(), 3, "source untouched");
    }

    #[test]
    fn released_proxy_reports_errors() {
        let (proxy, counting) = mk_owned(&[1, 2]);
        proxy.finalize();
        assert_eq!(counting.live(), 0);
        assert!(proxy.is_released());
        assert_eq!(proxy.num(), Err(ScriptError::Released(ARRAY_TYPE_NAME)));
    }

    #[test]
    fn trace_removes_nulled_elements_in_order() {
        let heap = ObjectHeap::new();
        let owner = heap.allocate("owner");
        heap.add_root(owner);
        let def = StructDef::builder("Slot")
            .field("id", Property::int())
            .field("target", Property::object())
            .owner(owner)
            .build();
        let proxy =
            ArrayProxy::new_owned(Property::structure(def.clone()), BridgeSettings::default());
        let targets: Vec<_> = (0..4).map(|i| heap.allocate(format!("target{i}"))).collect();
        for (id, &target) in targets.iter().enumerate() {
            let value = StructValue::new(def.clone());
            value.set_integer("id", id as i64);
            value.set_object("target", Some(target));
            proxy
                .add_with(|inner, slot| {
                    unsafe { inner.copy_value(slot, value.as_ptr()) };
                    Ok(())
                })
                .expect("add succeeds");
        }

        heap.mark_pending_kill(targets[2]);
        let mut collector = heap.mark_collector();
        proxy.add_referenced_objects(&mut collector);

        assert_eq!(read_all(&proxy), vec![0, 1, 3], "ids of the survivors");
    }

    #[test]
    fn mutations_mark_the_replicated_field() {
        let replication = ReplicationProxy::new();
        let proxy = ArrayProxy::new_owned(Property::int(), BridgeSettings::default())
            .with_replication(ReplicationLink::new(&replication, 4));
        proxy.add_with(write_i64(1)).expect("add succeeds");
        assert!(replication.is_dirty(4));
        assert_eq!(replication.assign_times(), 1);
        proxy.remove(0).expect("remove succeeds");
        assert_eq!(replication.assign_times(), 2);
    }

    #[test]
    fn add_unique_marks_dirty_even_on_a_hit() {
        let replication = ReplicationProxy::new();
        let proxy = ArrayProxy::new_owned(Property::int(), BridgeSettings::default())
            .with_replication(ReplicationLink::new(&replication, 1));
        proxy.add_unique_with(write_i64(3)).expect("first add");
        proxy.add_unique_with(write_i64(3)).expect("duplicate add");
        assert_eq!(proxy.num().ok(), Some(1));
        assert_eq!(replication.assign_times(), 2);
    }
}
