use std::{
    any::Any,
    ptr::{self, NonNull},
    rc::Rc,
};

use bitflags::bitflags;

use crate::{ObjectRef, ReferenceCollector, ScriptError, ScriptVm};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DescriptorFlags: u8 {
        // all-zero bytes are a valid default value
        const ZERO_CONSTRUCT = 1 << 0;
        const NO_DESTRUCTOR = 1 << 1;
        // has named sub-fields
        const AGGREGATE = 1 << 2;
        // values may embed host object references
        const OBJECT_REFERENCE = 1 << 3;
    }
}

/// Sub-field of an aggregate value, relative to the aggregate's address.
#[derive(Clone)]
pub struct FieldRef {
    pub descriptor: Rc<dyn Descriptor>,
    pub offset: usize,
}

/// Layout and lifetime operations of one host value type.
///
/// Descriptors are compared by identity; two `Rc`s pointing at the same
/// descriptor describe the same element kind.
///
/// # Safety
/// Every `unsafe` method takes addresses that must be aligned to
/// [`Descriptor::alignment`] and span [`Descriptor::element_size`] bytes.
/// Apart from `construct_in_place`, the value behind them must be initialized.
pub trait Descriptor: Any {
    fn name(&self) -> &str;

    fn element_size(&self) -> usize;

    fn alignment(&self) -> usize;

    fn flags(&self) -> DescriptorFlags;

    fn as_any(&self) -> &dyn Any;

    /// # Safety
    /// `dest` must be writable, uninitialized storage.
    unsafe fn construct_in_place(&self, dest: *mut u8);

    /// # Safety
    /// `dest` holds an initialized value which is dead afterwards.
    unsafe fn destroy_in_place(&self, dest: *mut u8);

    /// # Safety
    /// both addresses hold initialized values.
    unsafe fn copy_value(&self, dest: *mut u8, src: *const u8);

    /// # Safety
    /// both addresses hold initialized values.
    unsafe fn identical(&self, a: *const u8, b: *const u8) -> bool;

    /// # Safety
    /// `value` holds an initialized value.
    unsafe fn hash(&self, value: *const u8) -> u64;

    fn field_by_name(&self, _name: &str) -> Option<FieldRef> {
        None
    }

    /// Host object that owns this type, kept alive by whoever uses the descriptor.
    fn owner(&self) -> Option<ObjectRef> {
        None
    }

    /// Report embedded object references. Returns `true` when any was nulled.
    ///
    /// # Safety
    /// `value` holds an initialized value.
    unsafe fn trace(&self, _value: *mut u8, _collector: &mut dyn ReferenceCollector) -> bool {
        false
    }

    /// Push the value at `value` onto the VM. `out` names a stack slot holding
    /// an existing script value that aggregates may be copied into.
    ///
    /// # Safety
    /// `value` holds an initialized value.
    unsafe fn push_value(
        &self,
        vm: &mut dyn ScriptVm,
        value: *const u8,
        out: Option<i32>,
    ) -> Result<i32, ScriptError>;

    /// Push a view that writes through to the value at `value`. Kinds without
    /// such a view push a copy. `holder` owns the storage behind `value`.
    ///
    /// # Safety
    /// `value` holds an initialized value that stays in place while `holder` lives.
    unsafe fn push_borrowed(
        &self,
        vm: &mut dyn ScriptVm,
        value: NonNull<u8>,
        out: Option<i32>,
        _holder: &Rc<dyn Any>,
    ) -> Result<i32, ScriptError> {
        // SAFETY: forwarded contract
        unsafe { self.push_value(vm, value.as_ptr(), out) }
    }

    fn is_aggregate(&self) -> bool {
        self.flags().contains(DescriptorFlags::AGGREGATE)
    }

    fn has_object_references(&self) -> bool {
        self.flags().contains(DescriptorFlags::OBJECT_REFERENCE)
    }

    fn is_zero_constructible(&self) -> bool {
        self.flags().contains(DescriptorFlags::ZERO_CONSTRUCT)
    }

    fn needs_destructor(&self) -> bool {
        !self.flags().contains(DescriptorFlags::NO_DESTRUCTOR)
    }

    /// Convert the script value at `index` and store it into `dest`.
    ///
    /// # Safety
    /// `dest` holds an initialized value.
    unsafe fn check_value(
        &self,
        vm: &mut dyn ScriptVm,
        index: i32,
        dest: *mut u8,
    ) -> Result<(), ScriptError>;
}

/// Construct `count` consecutive values, zero-filling when that is a valid default.
///
/// # Safety
/// `dest` is writable, aligned storage for `count` values.
pub unsafe fn construct_items(descriptor: &dyn Descriptor, dest: *mut u8, count: usize) {
    let size = descriptor.element_size();
    if descriptor.is_zero_constructible() {
        // SAFETY: caller guarantees `count * size` writable bytes
        unsafe { ptr::write_bytes(dest, 0, count * size) };
        return;
    }
    for i in 0..count {
        // SAFETY: caller guarantees `count` slots
        unsafe { descriptor.construct_in_place(dest.add(i * size)) };
    }
}

/// # Safety
/// `dest` holds `count` initialized values which are dead afterwards.
pub unsafe fn destroy_items(descriptor: &dyn Descriptor, dest: *mut u8, count: usize) {
    if !descriptor.needs_destructor() {
        return;
    }
    let size = descriptor.element_size();
    for i in 0..count {
        // SAFETY: caller guarantees `count` initialized values
        unsafe { descriptor.destroy_in_place(dest.add(i * size)) };
    }
}

/// Walk `path` through nested aggregates starting at `address`.
///
/// # Safety
/// `address` holds an initialized value of `descriptor`'s type.
pub unsafe fn resolve_field_path(
    descriptor: &Rc<dyn Descriptor>,
    address: *mut u8,
    path: &[String],
) -> Result<(Rc<dyn Descriptor>, *mut u8), ScriptError> {
    let mut current = descriptor.clone();
    let mut address = address;
    for name in path {
        if !current.is_aggregate() {
            return Err(ScriptError::NotAggregate(current.name().to_owned()));
        }
        let field = current.field_by_name(name).ok_or_else(|| ScriptError::FieldNotFound {
            field: name.clone(),
            owner: current.name().to_owned(),
        })?;
        // SAFETY: field offsets lie within the aggregate
        address = unsafe { address.add(field.offset) };
        current = field.descriptor;
    }
    Ok((current, address))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Property, StructDef};

    #[test]
    fn path_walks_nested_aggregates() {
        let inner = StructDef::builder("Inner").field("x", Property::int()).build();
        let outer = StructDef::builder("Outer")
            .field("flag", Property::bool())
            .field("inner", Property::structure(inner))
            .build();
        let descriptor: Rc<dyn Descriptor> = outer.clone();
        let value = crate::ValueBuffer::new(descriptor.clone());

        let path = ["inner".to_owned(), "x".to_owned()];
        let (leaf, address) = unsafe { resolve_field_path(&descriptor, value.as_ptr(), &path) }
            .expect("path resolves");
        assert_eq!(leaf.name(), "int");
        let inner_offset = outer.field("inner").map(|field| field.offset).unwrap_or_default();
        assert_eq!(address as usize - value.as_ptr() as usize, inner_offset);
    }

    #[test]
    fn path_reports_missing_fields_and_scalars() {
        let def = StructDef::builder("Point").field("x", Property::int()).build();
        let descriptor: Rc<dyn Descriptor> = def;
        let value = crate::ValueBuffer::new(descriptor.clone());

        let missing = unsafe { resolve_field_path(&descriptor, value.as_ptr(), &["y".to_owned()]) };
        assert_eq!(
            missing.err().map(|error| error.to_string()).as_deref(),
            Some("y of Point's member not found.")
        );

        let path = ["x".to_owned(), "z".to_owned()];
        let through_scalar = unsafe { resolve_field_path(&descriptor, value.as_ptr(), &path) };
        assert!(matches!(through_scalar, Err(ScriptError::NotAggregate(_))));
    }
}
