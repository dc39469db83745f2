use std::{
    alloc::{self, Layout},
    ptr::{self, NonNull},
};

use crate::{Descriptor, construct_items, destroy_items};

/// Size and alignment of one element of a type-erased container.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ElementLayout {
    pub size: usize,
    pub align: usize,
}

impl ElementLayout {
    pub fn of(descriptor: &dyn Descriptor) -> Self {
        Self {
            size: descriptor.element_size().max(1),
            align: descriptor.alignment().max(1),
        }
    }

    /// calculate the layout of a buffer holding `count` elements
    pub fn buffer(self, count: usize) -> Layout {
        Layout::from_size_align(self.size * count, self.align).expect("create valid layout")
    }
}

/// Host-native dynamically sized array: a raw buffer plus element count.
///
/// The array never constructs or destroys elements; whoever owns it does so
/// through the element descriptor. Dropping it only frees the buffer.
#[derive(Debug)]
pub struct ScriptArray {
    data: NonNull<u8>,
    num: usize,
    max: usize,
    element: ElementLayout,
}

impl ScriptArray {
    pub fn new(element: ElementLayout) -> Self {
        Self {
            data: NonNull::dangling(),
            num: 0,
            max: 0,
            element,
        }
    }

    pub fn for_descriptor(descriptor: &dyn Descriptor) -> Self {
        Self::new(ElementLayout::of(descriptor))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.num
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    pub fn element_layout(&self) -> ElementLayout {
        self.element
    }

    pub fn is_valid_index(&self, index: i64) -> bool {
        index >= 0 && (index as u64) < self.num as u64
    }

    /// Address of slot `index`; only dereferenceable below `capacity`.
    #[inline]
    pub fn get_raw_ptr(&self, index: usize) -> *mut u8 {
        self.data.as_ptr().wrapping_add(index * self.element.size)
    }

    /// Grow by `count` uninitialized slots, returning the first new index.
    pub fn add_uninit(&mut self, count: usize) -> usize {
        self.reserve(count);
        let index = self.num;
        self.num += count;
        index
    }

    /// Open `count` uninitialized slots at `index`, shifting the tail up.
    pub fn insert_uninit(&mut self, index: usize, count: usize) {
        assert!(index <= self.num, "insert index {index} past end {}", self.num);
        self.reserve(count);
        let size = self.element.size;
        // SAFETY: both ranges lie within the reserved buffer; `copy` handles overlap
        unsafe {
            ptr::copy(
                self.get_raw_ptr(index),
                self.get_raw_ptr(index + count),
                (self.num - index) * size,
            )
        };
        self.num += count;
    }

    /// Close `count` slots at `index` without destroying them.
    pub fn remove_raw(&mut self, index: usize, count: usize) {
        assert!(index + count <= self.num, "remove range past end {}", self.num);
        let size = self.element.size;
        // SAFETY: both ranges lie within the initialized prefix
        unsafe {
            ptr::copy(
                self.get_raw_ptr(index + count),
                self.get_raw_ptr(index),
                (self.num - index - count) * size,
            )
        };
        self.num -= count;
    }

    /// Forget every element and shrink the buffer to `slack` slots.
    pub fn empty(&mut self, slack: usize) {
        self.num = 0;
        if self.max != slack {
            self.resize_allocation(slack);
        }
    }

    pub fn reserve(&mut self, additional: usize) {
        let required = self.num + additional;
        if required > self.max {
            self.resize_allocation(required.max(self.max * 2).max(4));
        }
    }

    fn resize_allocation(&mut self, new_max: usize) {
        let old_layout = self.element.buffer(self.max);
        let new_layout = self.element.buffer(new_max);
        if new_max == 0 {
            if self.max != 0 {
                // SAFETY: allocated by us with `old_layout`
                unsafe { alloc::dealloc(self.data.as_ptr(), old_layout) };
            }
            self.data = NonNull::dangling();
        } else {
            let data = if self.max == 0 {
                // SAFETY: non-zero size
                unsafe { alloc::alloc(new_layout) }
            } else {
                // SAFETY: allocated by us with `old_layout`, non-zero new size
                unsafe { alloc::realloc(self.data.as_ptr(), old_layout, new_layout.size()) }
            };
            self.data = NonNull::new(data).unwrap_or_else(|| alloc::handle_alloc_error(new_layout));
        }
        self.max = new_max;
    }
}

impl Drop for ScriptArray {
    fn drop(&mut self) {
        if self.max != 0 {
            // SAFETY: allocated by us with this layout
            unsafe { alloc::dealloc(self.data.as_ptr(), self.element.buffer(self.max)) };
        }
    }
}

/// Replace `dest`'s elements with copies of `src`'s.
///
/// # Safety
/// both arrays hold initialized elements of `descriptor`'s type and are distinct.
pub unsafe fn clone_array_elements(
    descriptor: &dyn Descriptor,
    dest: &mut ScriptArray,
    src: &ScriptArray,
) {
    // SAFETY: forwarded contract; new slots are constructed before the copy
    unsafe {
        destroy_items(descriptor, dest.get_raw_ptr(0), dest.len());
        dest.remove_raw(0, dest.len());
        dest.add_uninit(src.len());
        construct_items(descriptor, dest.get_raw_ptr(0), src.len());
        for i in 0..src.len() {
            descriptor.copy_value(dest.get_raw_ptr(i), src.get_raw_ptr(i));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_array() -> ScriptArray {
        ScriptArray::new(ElementLayout { size: 8, align: 8 })
    }

    fn write(array: &ScriptArray, index: usize, value: i64) {
        unsafe { array.get_raw_ptr(index).cast::<i64>().write(value) };
    }

    fn read(array: &ScriptArray, index: usize) -> i64 {
        unsafe { array.get_raw_ptr(index).cast::<i64>().read() }
    }

    #[test]
    fn insert_and_remove_shift_the_tail() {
        let mut array = mk_array();
        for value in [1, 2, 4] {
            let index = array.add_uninit(1);
            write(&array, index, value);
        }
        array.insert_uninit(2, 1);
        write(&array, 2, 3);
        assert_eq!((0..4).map(|i| read(&array, i)).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

        array.remove_raw(0, 2);
        assert_eq!(array.len(), 2);
        assert_eq!(read(&array, 0), 3);
        assert_eq!(read(&array, 1), 4);
    }

    #[test]
    fn empty_keeps_requested_slack() {
        let mut array = mk_array();
        array.add_uninit(10);
        array.empty(3);
        assert!(array.is_empty());
        assert_eq!(array.capacity(), 3);
        array.empty(0);
        assert_eq!(array.capacity(), 0);
    }

    #[test]
    fn index_validity() {
        let mut array = mk_array();
        array.add_uninit(2);
        assert!(array.is_valid_index(1));
        assert!(!array.is_valid_index(2));
        assert!(!array.is_valid_index(-1));
    }
}
