use crate::{Descriptor, ElementLayout, ScriptArray, destroy_items};

const INDEX_NONE: u32 = u32::MAX;

/// Placement of key and value inside one map pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MapLayout {
    pub value_offset: usize,
    pub pair: ElementLayout,
}

impl MapLayout {
    pub fn new(key: &dyn Descriptor, value: &dyn Descriptor) -> Self {
        let key_layout = ElementLayout::of(key);
        let value_layout = ElementLayout::of(value);
        let align = key_layout.align.max(value_layout.align);
        let value_offset = key_layout.size.next_multiple_of(value_layout.align);
        let size = (value_offset + value_layout.size).next_multiple_of(align);
        Self {
            value_offset,
            pair: ElementLayout { size, align },
        }
    }
}

/// Host-native hash map: a sparse array of key/value pairs with a free list
/// and hash chains threaded through the slots.
///
/// Slots freed by removal become holes that iteration must skip. Like
/// [`ScriptArray`], the map never constructs or destroys pairs itself except
/// in [`ScriptMap::add_pair`], which constructs the pair it creates.
#[derive(Debug)]
pub struct ScriptMap {
    layout: MapLayout,
    pairs: ScriptArray,
    occupied: Vec<bool>,
    hashes: Vec<u64>,
    next: Vec<u32>,
    free: Vec<u32>,
    buckets: Vec<u32>,
    num: usize,
    initial_buckets: usize,
}

impl ScriptMap {
    pub fn new(layout: MapLayout) -> Self {
        Self::with_buckets(layout, 8)
    }

    pub fn with_buckets(layout: MapLayout, initial_buckets: usize) -> Self {
        Self {
            layout,
            pairs: ScriptArray::new(layout.pair),
            occupied: Vec::new(),
            hashes: Vec::new(),
            next: Vec::new(),
            free: Vec::new(),
            buckets: Vec::new(),
            num: 0,
            initial_buckets: initial_buckets.max(1).next_power_of_two(),
        }
    }

    pub fn for_descriptors(key: &dyn Descriptor, value: &dyn Descriptor) -> Self {
        Self::new(MapLayout::new(key, value))
    }

    pub fn layout(&self) -> MapLayout {
        self.layout
    }

    /// Number of occupied pairs.
    #[inline]
    pub fn len(&self) -> usize {
        self.num
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    /// One past the highest slot index, holes included.
    pub fn max_index(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_valid_index(&self, index: i64) -> bool {
        index >= 0 && self.occupied.get(index as usize).copied().unwrap_or(false)
    }

    #[inline]
    pub fn key_ptr(&self, index: usize) -> *mut u8 {
        self.pairs.get_raw_ptr(index)
    }

    #[inline]
    pub fn value_ptr(&self, index: usize) -> *mut u8 {
        self.pairs.get_raw_ptr(index).wrapping_add(self.layout.value_offset)
    }

    fn bucket(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// # Safety
    /// `key` holds an initialized key and every occupied slot holds a key of
    /// `key_descriptor`'s type.
    pub unsafe fn find_index(
        &self,
        key: *const u8,
        key_descriptor: &dyn Descriptor,
    ) -> Option<usize> {
        if self.buckets.is_empty() {
            return None;
        }
        // SAFETY: caller guarantees an initialized key
        let hash = unsafe { key_descriptor.hash(key) };
        let mut cursor = self.buckets[self.bucket(hash)];
        while cursor != INDEX_NONE {
            let index = cursor as usize;
            // SAFETY: occupied slots hold initialized keys
            if self.occupied[index]
                && self.hashes[index] == hash
                && unsafe { key_descriptor.identical(self.key_ptr(index), key) }
            {
                return Some(index);
            }
            cursor = self.next[index];
        }
        None
    }

    /// # Safety
    /// see [`ScriptMap::find_index`]
    pub unsafe fn find_value(
        &self,
        key: *const u8,
        key_descriptor: &dyn Descriptor,
    ) -> Option<*mut u8> {
        // SAFETY: forwarded contract
        unsafe { self.find_index(key, key_descriptor) }
            .map(|index| self.value_ptr(index))
    }

    /// Insert a copy of `key`/`value`, or overwrite the value of an existing key.
    /// Returns the slot index.
    ///
    /// # Safety
    /// `key` and `value` hold initialized values of the given descriptors'
    /// types, matching the types already stored in the map.
    pub unsafe fn add_pair(
        &mut self,
        key: *const u8,
        value: *const u8,
        key_descriptor: &dyn Descriptor,
        value_descriptor: &dyn Descriptor,
    ) -> usize {
        // SAFETY: forwarded contract
        if let Some(index) = unsafe { self.find_index(key, key_descriptor) } {
            // SAFETY: occupied slot holds an initialized value
            unsafe { value_descriptor.copy_value(self.value_ptr(index), value) };
            return index;
        }

        let index = match self.free.pop() {
            Some(index) => index as usize,
            None => {
                let index = self.pairs.add_uninit(1);
                self.occupied.push(false);
                self.hashes.push(0);
                self.next.push(INDEX_NONE);
                index
            }
        };
        // SAFETY: the slot is vacant storage for one pair
        let hash = unsafe {
            crate::construct_items(key_descriptor, self.key_ptr(index), 1);
            crate::construct_items(value_descriptor, self.value_ptr(index), 1);
            key_descriptor.copy_value(self.key_ptr(index), key);
            value_descriptor.copy_value(self.value_ptr(index), value);
            key_descriptor.hash(key)
        };
        self.occupied[index] = true;
        self.hashes[index] = hash;
        self.num += 1;

        if self.num > self.buckets.len() {
            let count = (self.buckets.len() * 2).max(self.initial_buckets);
            self.buckets = vec![INDEX_NONE; count];
            self.relink();
        } else {
            let bucket = self.bucket(hash);
            self.next[index] = self.buckets[bucket];
            self.buckets[bucket] = index as u32;
        }
        index
    }

    /// Unlink and free an occupied slot. The pair must already be destroyed
    /// or be owned elsewhere.
    pub fn remove_at(&mut self, index: usize) {
        if !self.occupied.get(index).copied().unwrap_or(false) {
            return;
        }
        let bucket = self.bucket(self.hashes[index]);
        let mut cursor = self.buckets[bucket];
        let mut previous = INDEX_NONE;
        while cursor != INDEX_NONE {
            if cursor as usize == index {
                let next = self.next[index];
                if previous == INDEX_NONE {
                    self.buckets[bucket] = next;
                } else {
                    self.next[previous as usize] = next;
                }
                break;
            }
            previous = cursor;
            cursor = self.next[cursor as usize];
        }
        self.free_slot_unlinked(index);
    }

    /// Free a slot but leave the hash chains untouched. Call
    /// [`ScriptMap::rehash`] before the next lookup or insertion.
    pub fn free_slot_unlinked(&mut self, index: usize) {
        if !self.occupied.get(index).copied().unwrap_or(false) {
            return;
        }
        self.occupied[index] = false;
        self.next[index] = INDEX_NONE;
        self.free.push(index as u32);
        self.num -= 1;
    }

    /// Recompute every hash and rebuild the chains.
    ///
    /// # Safety
    /// every occupied slot holds a key of `key_descriptor`'s type.
    pub unsafe fn rehash(&mut self, key_descriptor: &dyn Descriptor) {
        for index in 0..self.max_index() {
            if self.occupied[index] {
                // SAFETY: occupied slots hold initialized keys
                self.hashes[index] = unsafe { key_descriptor.hash(self.key_ptr(index)) };
            }
        }
        self.relink();
    }

    fn relink(&mut self) {
        self.buckets.iter_mut().for_each(|bucket| *bucket = INDEX_NONE);
        if self.buckets.is_empty() {
            return;
        }
        for index in 0..self.max_index() {
            if self.occupied[index] {
                let bucket = self.bucket(self.hashes[index]);
                self.next[index] = self.buckets[bucket];
                self.buckets[bucket] = index as u32;
            }
        }
    }

    /// Make room for `additional` more pairs without growing storage or buckets.
    pub fn reserve(&mut self, additional: usize) {
        let required = self.num + additional;
        // holes are refilled before new slots are opened
        self.pairs.reserve(additional.saturating_sub(self.free.len()));
        self.occupied.reserve(additional);
        self.hashes.reserve(additional);
        self.next.reserve(additional);
        if required > self.buckets.len() {
            let count = required.next_power_of_two().max(self.initial_buckets);
            self.buckets = vec![INDEX_NONE; count];
            self.relink();
        }
    }

    pub fn capacity(&self) -> usize {
        self.pairs.capacity()
    }

    /// Forget every pair and shrink storage to `slack` slots.
    pub fn empty(&mut self, slack: usize) {
        self.pairs.empty(slack);
        self.occupied.clear();
        self.hashes.clear();
        self.next.clear();
        self.free.clear();
        self.buckets.clear();
        self.num = 0;
    }

    /// Occupied slot indices in ascending order.
    pub fn occupied_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.occupied
            .iter()
            .enumerate()
            .filter_map(|(index, &occupied)| occupied.then_some(index))
    }
}

/// Destroy every pair. The slots stay occupied.
///
/// # Safety
/// occupied slots hold initialized pairs of the given types, which are dead afterwards.
pub unsafe fn destroy_map_pairs(key: &dyn Descriptor, value: &dyn Descriptor, map: &ScriptMap) {
    for index in map.occupied_indices() {
        // SAFETY: forwarded contract
        unsafe {
            destroy_items(key, map.key_ptr(index), 1);
            destroy_items(value, map.value_ptr(index), 1);
        }
    }
}

/// Replace `dest`'s pairs with copies of `src`'s.
///
/// # Safety
/// both maps hold initialized pairs of the given types and are distinct.
pub unsafe fn clone_map_pairs(
    key: &dyn Descriptor,
    value: &dyn Descriptor,
    dest: &mut ScriptMap,
    src: &ScriptMap,
) {
    // SAFETY: forwarded contract
    unsafe {
        destroy_map_pairs(key, value, dest);
        dest.empty(0);
        dest.reserve(src.len());
        for index in src.occupied_indices() {
            dest.add_pair(src.key_ptr(index), src.value_ptr(index), key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::{Property, descriptor::testing::CountingDescriptor};

    fn int_map() -> (ScriptMap, Rc<Property>) {
        let int = Property::int();
        (ScriptMap::for_descriptors(&*int, &*int), int)
    }

    fn add(map: &mut ScriptMap, int: &Property, key: i64, value: i64) -> usize {
        unsafe { map.add_pair((&raw const key).cast(), (&raw const value).cast(), int, int) }
    }

    fn find(map: &ScriptMap, int: &Property, key: i64) -> Option<i64> {
        unsafe { map.find_value((&raw const key).cast(), int) }
            .map(|value| unsafe { value.cast::<i64>().read() })
    }

    #[test]
    fn layout_aligns_value_after_key() {
        let layout = MapLayout::new(&*Property::bool(), &*Property::int());
        assert_eq!(layout.value_offset, 8);
        assert_eq!(layout.pair.size, 16);
    }

    #[test]
    fn add_overwrites_existing_keys() {
        let (mut map, int) = int_map();
        let first = add(&mut map, &int, 1, 10);
        let again = add(&mut map, &int, 1, 11);
        assert_eq!(first, again);
        assert_eq!(map.len(), 1);
        assert_eq!(find(&map, &int, 1), Some(11));
        assert_eq!(find(&map, &int, 2), None);
    }

    #[test]
    fn removal_leaves_reusable_holes() {
        let (mut map, int) = int_map();
        for key in 0..20 {
            add(&mut map, &int, key, key * 100);
        }
        map.remove_at(3);
        map.remove_at(7);
        assert_eq!(map.len(), 18);
        assert_eq!(map.max_index(), 20);
        assert!(!map.is_valid_index(3));
        assert_eq!(find(&map, &int, 3), None);
        assert_eq!(find(&map, &int, 19), Some(1900));

        let reused = add(&mut map, &int, 99, 1);
        assert!(reused == 3 || reused == 7, "new pairs fill holes first");
        assert_eq!(map.max_index(), 20);
    }

    #[test]
    fn unlinked_frees_are_repaired_by_rehash() {
        let (mut map, int) = int_map();
        for key in 0..10 {
            add(&mut map, &int, key, key);
        }
        map.free_slot_unlinked(2);
        map.free_slot_unlinked(5);
        unsafe { map.rehash(&*int) };
        assert_eq!(map.occupied_indices().count(), 8);
        for key in [0, 1, 3, 4, 6, 7, 8, 9] {
            assert_eq!(find(&map, &int, key), Some(key), "key {key} survives rehash");
        }
    }

    #[test]
    fn reserve_presizes_pairs_and_buckets() {
        let (mut map, int) = int_map();
        map.reserve(20);
        assert_eq!(map.capacity(), 20);
        for key in 0..20 {
            add(&mut map, &int, key, key);
        }
        assert_eq!(map.capacity(), 20, "no growth while filling the reservation");
        assert_eq!(find(&map, &int, 13), Some(13));
    }

    #[test]
    fn add_pair_constructs_key_and_value() {
        let counting = CountingDescriptor::new();
        let mut map = ScriptMap::for_descriptors(&*counting, &*counting);
        let (key, value) = (5i64, 6i64);
        let (key, value) = ((&raw const key).cast(), (&raw const value).cast());
        unsafe { map.add_pair(key, value, &*counting, &*counting) };
        assert_eq!(counting.constructed.get(), 2);
    }
}
