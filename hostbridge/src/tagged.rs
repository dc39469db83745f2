use std::rc::Rc;

use crate::{RegistryRef, ScriptType, ScriptVm, StateHandle};

/// Registry reference owned by the host. Dropping the last handle queues the
/// reference for release on the VM it came from.
#[derive(Debug)]
pub struct RegistryHandle {
    reference: RegistryRef,
    state: StateHandle,
}

impl RegistryHandle {
    /// Pops the value on top of the stack into the registry.
    pub fn new(vm: &mut dyn ScriptVm) -> Self {
        let reference = vm.new_ref();
        Self {
            reference,
            state: vm.state(),
        }
    }

    /// Anchors the value at `index` without disturbing the stack.
    pub fn from_index(vm: &mut dyn ScriptVm, index: i32) -> Self {
        vm.push_value(index);
        Self::new(vm)
    }

    pub fn reference(&self) -> RegistryRef {
        self.reference
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    pub fn push(&self, vm: &mut dyn ScriptVm) {
        vm.push_ref(self.reference);
    }
}

impl Drop for RegistryHandle {
    fn drop(&mut self) {
        self.state.release(self.reference);
    }
}

/// Type of a dynamic value, as reported to host code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VarType {
    Nil,
    Integer,
    Number,
    Boolean,
    String,
    Function,
    Table,
    Userdata,
    LightUserdata,
    Tuple,
}

/// One tagged storage cell of a dynamic value.
/// Cloning shares string buffers and registry handles.
#[derive(Debug, Clone, Default)]
pub enum TypedSlot {
    #[default]
    Nil,
    Integer(i64),
    Number(f64),
    Boolean(bool),
    LightUserdata(*mut ()),
    String(Rc<[u8]>),
    Function(Rc<RegistryHandle>),
    Table(Rc<RegistryHandle>),
    Userdata(Rc<RegistryHandle>),
}

impl TypedSlot {
    pub fn from_stack(vm: &mut dyn ScriptVm, index: i32) -> Self {
        let index = vm.abs_index(index);
        match vm.type_at(index) {
            ScriptType::Nil => TypedSlot::Nil,
            ScriptType::Boolean => TypedSlot::Boolean(vm.to_boolean(index)),
            ScriptType::Number if vm.is_integer(index) => {
                TypedSlot::Integer(vm.to_integer(index).unwrap_or_default())
            }
            ScriptType::Number => TypedSlot::Number(vm.to_number(index).unwrap_or_default()),
            ScriptType::String => {
                TypedSlot::String(vm.to_bytes(index).unwrap_or_else(|| Rc::from(&[][..])))
            }
            ScriptType::LightUserdata => TypedSlot::LightUserdata(
                vm.to_light_userdata(index).unwrap_or(std::ptr::null_mut()),
            ),
            ScriptType::Function => {
                TypedSlot::Function(Rc::new(RegistryHandle::from_index(vm, index)))
            }
            ScriptType::Table => TypedSlot::Table(Rc::new(RegistryHandle::from_index(vm, index))),
            ScriptType::Userdata => {
                TypedSlot::Userdata(Rc::new(RegistryHandle::from_index(vm, index)))
            }
        }
    }

    pub fn var_type(&self) -> VarType {
        match self {
            TypedSlot::Nil => VarType::Nil,
            TypedSlot::Integer(_) => VarType::Integer,
            TypedSlot::Number(_) => VarType::Number,
            TypedSlot::Boolean(_) => VarType::Boolean,
            TypedSlot::LightUserdata(_) => VarType::LightUserdata,
            TypedSlot::String(_) => VarType::String,
            TypedSlot::Function(_) => VarType::Function,
            TypedSlot::Table(_) => VarType::Table,
            TypedSlot::Userdata(_) => VarType::Userdata,
        }
    }

    pub fn handle(&self) -> Option<&Rc<RegistryHandle>> {
        match self {
            TypedSlot::Function(handle)
            | TypedSlot::Table(handle)
            | TypedSlot::Userdata(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn push(&self, vm: &mut dyn ScriptVm) {
        match self {
            TypedSlot::Nil => vm.push_nil(),
            TypedSlot::Integer(value) => vm.push_integer(*value),
            TypedSlot::Number(value) => vm.push_number(*value),
            TypedSlot::Boolean(value) => vm.push_boolean(*value),
            TypedSlot::LightUserdata(ptr) => vm.push_light_userdata(*ptr),
            TypedSlot::String(bytes) => vm.push_bytes(bytes),
            TypedSlot::Function(handle)
            | TypedSlot::Table(handle)
            | TypedSlot::Userdata(handle) => handle.push(vm),
        }
    }

    /// Tag mismatch is never equal; references compare through the VM.
    pub fn same_value(&self, other: &TypedSlot, vm: &mut dyn ScriptVm) -> bool {
        match (self, other) {
            (TypedSlot::Nil, TypedSlot::Nil) => true,
            (TypedSlot::Integer(a), TypedSlot::Integer(b)) => a == b,
            (TypedSlot::Number(a), TypedSlot::Number(b)) => a == b,
            (TypedSlot::Boolean(a), TypedSlot::Boolean(b)) => a == b,
            (TypedSlot::LightUserdata(a), TypedSlot::LightUserdata(b)) => a == b,
            (TypedSlot::String(a), TypedSlot::String(b)) => a == b,
            (TypedSlot::Function(a), TypedSlot::Function(b))
            | (TypedSlot::Table(a), TypedSlot::Table(b))
            | (TypedSlot::Userdata(a), TypedSlot::Userdata(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                a.push(vm);
                b.push(vm);
                let equal = vm.raw_equal(-1, -2);
                vm.pop(2);
                equal
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ScriptValue, StackVm, StackVmCreateInfo};

    #[test]
    fn slots_follow_stack_types() {
        let mut vm = StackVm::new(&StackVmCreateInfo::default());
        vm.push(ScriptValue::Integer(7));
        vm.push(ScriptValue::Number(1.5));
        vm.push(ScriptValue::string("hi"));
        vm.push(ScriptValue::table(vec![]));

        assert!(matches!(TypedSlot::from_stack(&mut vm, 1), TypedSlot::Integer(7)));
        assert!(matches!(TypedSlot::from_stack(&mut vm, 2), TypedSlot::Number(v) if v == 1.5));
        assert_eq!(TypedSlot::from_stack(&mut vm, -2).var_type(), VarType::String);
        assert_eq!(TypedSlot::from_stack(&mut vm, -1).var_type(), VarType::Table);
        assert_eq!(vm.top(), 4, "reading slots never changes the stack");
    }

    #[test]
    fn registry_reference_released_with_last_clone() {
        let mut vm = StackVm::new(&StackVmCreateInfo::default());
        vm.push(ScriptValue::table(vec![]));
        let slot = TypedSlot::from_stack(&mut vm, -1);
        let copy = slot.clone();
        assert_eq!(vm.live_refs(), 1);

        drop(slot);
        assert_eq!(vm.shared().pending_releases(), 0, "copy still holds the handle");
        drop(copy);
        assert_eq!(vm.shared().pending_releases(), 1);
        vm.drain_released();
        assert_eq!(vm.live_refs(), 0);
    }

    #[test]
    fn references_compare_through_the_vm() {
        let mut vm = StackVm::new(&StackVmCreateInfo::default());
        let table = ScriptValue::table(vec![]);
        vm.push(table.clone());
        vm.push(table);
        vm.push(ScriptValue::table(vec![]));
        let a = TypedSlot::from_stack(&mut vm, 1);
        let b = TypedSlot::from_stack(&mut vm, 2);
        let c = TypedSlot::from_stack(&mut vm, 3);
        assert!(a.same_value(&b, &mut vm));
        assert!(!a.same_value(&c, &mut vm));
        assert_eq!(vm.top(), 3);
    }
}
