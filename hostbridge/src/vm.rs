use std::{
    any::Any,
    cell::RefCell,
    rc::{Rc, Weak},
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{BridgeShared, ScriptError};

/// Type tag of a value sitting in a VM stack slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ScriptType {
    Nil,
    Boolean,
    LightUserdata,
    Number,
    String,
    Table,
    Function,
    Userdata,
}

impl ScriptType {
    pub fn name(self) -> &'static str {
        match self {
            ScriptType::Nil => "nil",
            ScriptType::Boolean => "boolean",
            ScriptType::LightUserdata => "lightuserdata",
            ScriptType::Number => "number",
            ScriptType::String => "string",
            ScriptType::Table => "table",
            ScriptType::Function => "function",
            ScriptType::Userdata => "userdata",
        }
    }
}

/// Slot in the VM registry. Negative values never refer to a stored value.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RegistryRef(pub i32);

impl RegistryRef {
    pub const NIL: RegistryRef = RegistryRef(-1);

    pub fn is_nil(self) -> bool {
        self.0 < 0
    }
}

pub type StateId = u32;

static NEXT_STATE_ID: AtomicU32 = AtomicU32::new(1);

/// Per-VM bookkeeping shared with every handle bound to that VM.
///
/// Registry references dropped on the host side are queued here and released
/// by the VM the next time it runs, so a handle never needs the VM itself.
#[derive(Debug)]
pub struct StateShared {
    id: StateId,
    released: RefCell<Vec<RegistryRef>>,
}

impl StateShared {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            released: RefCell::new(Vec::new()),
        })
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn take_released(&self) -> Vec<RegistryRef> {
        std::mem::take(&mut *self.released.borrow_mut())
    }

    pub fn pending_releases(&self) -> usize {
        self.released.borrow().len()
    }
}

/// Identifies one VM instance; goes invalid once the VM is torn down.
#[derive(Debug, Clone)]
pub struct StateHandle {
    id: StateId,
    shared: Weak<StateShared>,
}

impl StateHandle {
    pub fn new(shared: &Rc<StateShared>) -> Self {
        Self {
            id: shared.id,
            shared: Rc::downgrade(shared),
        }
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.shared.strong_count() > 0
    }

    pub fn same_state(&self, other: &StateHandle) -> bool {
        self.id == other.id && self.is_valid()
    }

    /// Queue a registry reference for release. Does nothing once the VM is gone.
    pub fn release(&self, reference: RegistryRef) {
        if reference.is_nil() {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.released.borrow_mut().push(reference);
        }
    }
}

/// Host object exposed to scripts as userdata.
/// `finalize` runs when the script collector frees the last wrapper.
pub trait ScriptFinalizable: Any {
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;

    fn finalize(&self) {}
}

pub type NativeFunction = Rc<dyn Fn(&mut dyn ScriptVm) -> Result<i32, ScriptError>>;

/// The slice of an embedded script VM the bridge relies on.
///
/// Indices follow the usual embedding convention: positive indices count from
/// the bottom of the current frame starting at 1, negative ones from the top.
pub trait ScriptVm {
    fn state(&self) -> StateHandle;

    fn bridge(&self) -> Option<Rc<BridgeShared>>;
    fn set_bridge(&mut self, bridge: Rc<BridgeShared>);

    fn top(&self) -> i32;
    fn abs_index(&self, index: i32) -> i32;
    fn set_top(&mut self, top: i32);
    fn remove(&mut self, index: i32);
    fn pop(&mut self, count: i32) {
        self.set_top(-count - 1);
    }

    fn type_at(&self, index: i32) -> ScriptType;
    fn is_integer(&self, index: i32) -> bool;
    fn to_integer(&self, index: i32) -> Option<i64>;
    fn to_number(&self, index: i32) -> Option<f64>;
    fn to_boolean(&self, index: i32) -> bool;
    /// Strings and numbers convert; everything else is `None`.
    fn to_bytes(&self, index: i32) -> Option<Rc<[u8]>>;
    fn to_light_userdata(&self, index: i32) -> Option<*mut ()>;
    fn to_userdata(&self, index: i32) -> Option<Rc<dyn ScriptFinalizable>>;
    fn raw_len(&self, index: i32) -> usize;
    fn raw_equal(&self, a: i32, b: i32) -> bool;

    fn push_nil(&mut self);
    fn push_boolean(&mut self, value: bool);
    fn push_integer(&mut self, value: i64);
    fn push_number(&mut self, value: f64);
    fn push_bytes(&mut self, value: &[u8]);
    fn push_light_userdata(&mut self, value: *mut ());
    fn push_userdata(&mut self, object: Rc<dyn ScriptFinalizable>);
    fn push_function(&mut self, function: NativeFunction);
    /// Push a copy of the value at `index`.
    fn push_value(&mut self, index: i32);
    /// Push element `n` (1-based) of the table at `index`, nil when absent.
    fn raw_geti(&mut self, index: i32, n: i64) -> ScriptType;

    /// Pop the top value into the registry.
    fn new_ref(&mut self) -> RegistryRef;
    fn push_ref(&mut self, reference: RegistryRef);
    fn release_ref(&mut self, reference: RegistryRef);

    /// Push the message handler used by protected calls; returns its absolute index.
    fn push_error_handler(&mut self) -> i32;
    /// Call the function below `argc` arguments; results replace them.
    fn call(&mut self, argc: i32) -> Result<i32, ScriptError>;
    /// Like `call`, but a failure leaves the handled error message on the stack.
    fn pcall(&mut self, argc: i32, handler: i32) -> Result<i32, ScriptError>;
    /// Run host code inside a fresh protected context.
    fn run_protected(
        &mut self,
        body: &mut dyn FnMut(&mut dyn ScriptVm) -> Result<(), ScriptError>,
    ) -> Result<(), ScriptError>;
    fn in_protected_call(&self) -> bool;

    /// Pop the top value into the global `name`.
    fn set_global(&mut self, name: &str);
    fn set_method(&mut self, type_name: &'static str, name: &'static str, function: NativeFunction);
}

pub fn downcast_userdata<T: ScriptFinalizable>(object: Rc<dyn ScriptFinalizable>) -> Option<Rc<T>> {
    object.into_any().downcast::<T>().ok()
}

pub fn check_integer(vm: &dyn ScriptVm, index: i32) -> Result<i64, ScriptError> {
    vm.to_integer(index)
        .ok_or_else(|| ScriptError::bad_argument(index, "integer", vm.type_at(index)))
}

pub fn check_string(vm: &dyn ScriptVm, index: i32) -> Result<String, ScriptError> {
    vm.to_bytes(index)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .ok_or_else(|| ScriptError::bad_argument(index, "string", vm.type_at(index)))
}

/// Fetch userdata of type `T` at `index`, naming `expected` in the error.
pub fn check_userdata<T: ScriptFinalizable>(
    vm: &dyn ScriptVm,
    index: i32,
    expected: &'static str,
) -> Result<Rc<T>, ScriptError> {
    vm.to_userdata(index)
        .and_then(downcast_userdata::<T>)
        .ok_or_else(|| ScriptError::bad_argument(index, expected, vm.type_at(index)))
}

/// Protected call returning the number of results, or zero after logging the
/// failure. The handler slot is removed in both cases.
pub fn protected_call(vm: &mut dyn ScriptVm, argc: i32, handler: i32) -> i32 {
    match vm.pcall(argc, handler) {
        Ok(count) => {
            vm.remove(handler);
            count
        }
        Err(error) => {
            log::error!("script call failed: {error}");
            vm.pop(1);
            vm.remove(handler);
            0
        }
    }
}
