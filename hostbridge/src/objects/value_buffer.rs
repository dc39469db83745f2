use std::{
    alloc::{self, Layout},
    ptr::NonNull,
    rc::Rc,
};

use crate::{Descriptor, construct_items, destroy_items};

/// A standalone value of a descriptor's type: constructed on creation,
/// destroyed on drop.
pub struct ValueBuffer {
    descriptor: Rc<dyn Descriptor>,
    data: NonNull<u8>,
    layout: Layout,
}

impl ValueBuffer {
    pub fn new(descriptor: Rc<dyn Descriptor>) -> Self {
        let layout = Layout::from_size_align(
            descriptor.element_size().max(1),
            descriptor.alignment().max(1),
        )
        .expect("create valid layout");
        // SAFETY: non-zero size
        let data = unsafe { alloc::alloc(layout) };
        let data = NonNull::new(data).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        // SAFETY: fresh storage sized and aligned for one value
        unsafe { construct_items(&*descriptor, data.as_ptr(), 1) };
        Self {
            descriptor,
            data,
            layout,
        }
    }

    /// # Safety
    /// `src` holds an initialized value of `descriptor`'s type.
    pub unsafe fn copy_of(descriptor: Rc<dyn Descriptor>, src: *const u8) -> Self {
        let buffer = Self::new(descriptor);
        // SAFETY: both values are initialized
        unsafe { buffer.descriptor.copy_value(buffer.as_ptr(), src) };
        buffer
    }

    pub fn descriptor(&self) -> &Rc<dyn Descriptor> {
        &self.descriptor
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }
}

impl Drop for ValueBuffer {
    fn drop(&mut self) {
        // SAFETY: the value was constructed in `new` and is destroyed exactly once
        unsafe {
            destroy_items(&*self.descriptor, self.data.as_ptr(), 1);
            alloc::dealloc(self.data.as_ptr(), self.layout);
        }
    }
}
