use std::{any::Any, ptr::NonNull, rc::Rc};

use crate::{
    Descriptor, STRUCT_TYPE_NAME, ScriptError, ScriptVm, StructValue, check_userdata,
    resolve_field_path,
};

use super::field_path;

fn check_struct(vm: &dyn ScriptVm) -> Result<Rc<StructValue>, ScriptError> {
    check_userdata::<StructValue>(vm, 1, STRUCT_TYPE_NAME)
}

/// Resolve `path` inside `value` and run `body` on the leaf field.
fn with_field<R>(
    vm: &mut dyn ScriptVm,
    value: &StructValue,
    path: &[String],
    body: impl FnOnce(
        &mut dyn ScriptVm,
        &Rc<dyn Descriptor>,
        NonNull<u8>,
    ) -> Result<R, ScriptError>,
) -> Result<R, ScriptError> {
    if path.is_empty() {
        return Err(ScriptError::bad_argument(2, "string", vm.type_at(2)));
    }
    let descriptor: Rc<dyn Descriptor> = value.def().clone();
    // SAFETY: the buffer holds an initialized struct
    let (leaf, address) = unsafe { resolve_field_path(&descriptor, value.as_ptr(), path) }?;
    // SAFETY: field addresses lie inside the live buffer
    body(vm, &leaf, unsafe { NonNull::new_unchecked(address) })
}

/// `Get(field...[, out])`. Container fields come back as views that write
/// through to this struct; everything else is copied.
pub fn get(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let value = check_struct(vm)?;
    let top = vm.top();
    let (path, out) = field_path(vm, 2, top)?;
    let holder: Rc<dyn Any> = value.clone();
    with_field(vm, &value, &path, |vm, leaf, address| {
        // SAFETY: the struct buffer never moves and `holder` keeps it alive
        unsafe { leaf.push_borrowed(vm, address, out, &holder) }
    })
}

/// `Set(field..., value)`
pub fn set(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let value = check_struct(vm)?;
    let top = vm.top();
    if top < 3 {
        return Err(ScriptError::bad_argument(3, "value", vm.type_at(3)));
    }
    let (path, _) = field_path(vm, 2, top - 1)?;
    with_field(vm, &value, &path, |vm, leaf, address| {
        // SAFETY: the field is initialized
        unsafe { leaf.check_value(vm, top, address.as_ptr()) }
    })?;
    Ok(0)
}
