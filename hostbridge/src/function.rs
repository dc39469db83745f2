use std::{
    alloc::{self, Layout},
    ptr::NonNull,
    rc::Rc,
};

use bitflags::bitflags;

use crate::{Descriptor, construct_items, destroy_items};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ParamFlags: u8 {
        const PARM = 1 << 0;
        const OUT_PARM = 1 << 1;
        const RETURN_PARM = 1 << 2;
        const CONST_PARM = 1 << 3;
        const REFERENCE_PARM = 1 << 4;
        const READ_ONLY = 1 << 5;
    }
}

impl ParamFlags {
    /// Written back after a script call. Const references and the return
    /// value are not.
    pub fn is_real_out(self) -> bool {
        self.contains(ParamFlags::OUT_PARM)
            && !self.intersects(ParamFlags::CONST_PARM | ParamFlags::RETURN_PARM)
    }
}

pub struct FunctionParam {
    pub name: String,
    pub descriptor: Rc<dyn Descriptor>,
    pub offset: usize,
    pub flags: ParamFlags,
}

/// Signature of a reflected host function, with every parameter laid out in
/// one parameter frame.
pub struct HostFunction {
    owner: String,
    name: String,
    // implemented natively rather than in script
    native: bool,
    params: Vec<FunctionParam>,
    frame_size: usize,
    frame_align: usize,
}

pub struct HostFunctionBuilder {
    owner: String,
    name: String,
    native: bool,
    params: Vec<(String, Rc<dyn Descriptor>, ParamFlags)>,
}

impl HostFunctionBuilder {
    pub fn native(mut self, native: bool) -> Self {
        self.native = native;
        self
    }

    pub fn param(
        mut self,
        name: impl Into<String>,
        descriptor: Rc<dyn Descriptor>,
        flags: ParamFlags,
    ) -> Self {
        self.params.push((name.into(), descriptor, flags | ParamFlags::PARM));
        self
    }

    pub fn returns(self, descriptor: Rc<dyn Descriptor>) -> Self {
        self.param("ReturnValue", descriptor, ParamFlags::OUT_PARM | ParamFlags::RETURN_PARM)
    }

    pub fn build(self) -> Rc<HostFunction> {
        let mut cursor: usize = 0;
        let mut align = 1;
        let params = self
            .params
            .into_iter()
            .map(|(name, descriptor, flags)| {
                let offset = cursor.next_multiple_of(descriptor.alignment().max(1));
                cursor = offset + descriptor.element_size();
                align = align.max(descriptor.alignment());
                FunctionParam {
                    name,
                    descriptor,
                    offset,
                    flags,
                }
            })
            .collect();
        Rc::new(HostFunction {
            owner: self.owner,
            name: self.name,
            native: self.native,
            params,
            frame_size: cursor.next_multiple_of(align),
            frame_align: align,
        })
    }
}

impl HostFunction {
    pub fn builder(owner: impl Into<String>, name: impl Into<String>) -> HostFunctionBuilder {
        HostFunctionBuilder {
            owner: owner.into(),
            name: name.into(),
            native: true,
            params: Vec::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_native(&self) -> bool {
        self.native
    }

    pub fn params(&self) -> &[FunctionParam] {
        &self.params
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn return_param(&self) -> Option<(usize, &FunctionParam)> {
        self.params
            .iter()
            .enumerate()
            .find(|(_, param)| param.flags.contains(ParamFlags::RETURN_PARM))
    }
}

/// Address a caller supplies for an out parameter instead of the frame slot.
#[derive(Debug, Copy, Clone)]
pub struct OutParam {
    pub param: usize,
    pub address: *mut u8,
}

/// Storage for one call's parameters, constructed on creation and destroyed on drop.
pub struct ParamFrame {
    function: Rc<HostFunction>,
    data: NonNull<u8>,
    layout: Layout,
}

impl ParamFrame {
    pub fn new(function: Rc<HostFunction>) -> Self {
        let layout = Layout::from_size_align(function.frame_size.max(1), function.frame_align)
            .expect("create valid layout");
        // SAFETY: non-zero size
        let data = unsafe { alloc::alloc(layout) };
        let data = NonNull::new(data).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        for param in &function.params {
            // SAFETY: each parameter has its own aligned slot inside the frame
            unsafe { construct_items(&*param.descriptor, data.as_ptr().add(param.offset), 1) };
        }
        Self {
            function,
            data,
            layout,
        }
    }

    pub fn function(&self) -> &Rc<HostFunction> {
        &self.function
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub fn param_ptr(&self, index: usize) -> Option<*mut u8> {
        self.function
            .params
            .get(index)
            .map(|param| self.data.as_ptr().wrapping_add(param.offset))
    }
}

impl Drop for ParamFrame {
    fn drop(&mut self) {
        for param in &self.function.params {
            // SAFETY: constructed in `new`
            unsafe { destroy_items(&*param.descriptor, self.data.as_ptr().add(param.offset), 1) };
        }
        // SAFETY: allocated in `new` with this layout
        unsafe { alloc::dealloc(self.data.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Property;

    #[test]
    fn out_classification() {
        assert!(ParamFlags::OUT_PARM.is_real_out());
        assert!(!(ParamFlags::OUT_PARM | ParamFlags::CONST_PARM).is_real_out());
        assert!(!(ParamFlags::OUT_PARM | ParamFlags::RETURN_PARM).is_real_out());
        assert!(!ParamFlags::PARM.is_real_out());
    }

    #[test]
    fn frame_lays_out_params_in_order() {
        let function = HostFunction::builder("Actor", "Move")
            .param("flag", Property::bool(), ParamFlags::empty())
            .param("distance", Property::float(), ParamFlags::empty())
            .returns(Property::string())
            .build();
        let offsets: Vec<_> = function.params().iter().map(|param| param.offset).collect();
        assert_eq!(offsets, vec![0, 8, 16]);
        assert_eq!(function.return_param().map(|(index, _)| index), Some(2));

        let frame = ParamFrame::new(function);
        let label = frame.param_ptr(2).expect("return slot");
        assert_eq!(unsafe { &*label.cast::<String>() }, "", "string slot is constructed");
    }
}
