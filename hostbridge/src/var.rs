use std::rc::Rc;

use log::error;

use crate::{
    HostFunction, OutParam, ParamFlags, ScriptError, ScriptVm, StateHandle, TypedSlot, VarType,
    protected_call,
};

/// Dynamic value captured from a script VM: nil, a single slot, or a tuple
/// of slots taken from a stack range.
///
/// Copies share string buffers and registry handles; the registry entries
/// are released when the last copy drops.
#[derive(Debug, Clone, Default)]
pub struct ScriptVar {
    state: Option<StateHandle>,
    slots: Box<[TypedSlot]>,
}

impl ScriptVar {
    pub fn new() -> Self {
        Self::default()
    }

    fn single(state: StateHandle, slot: TypedSlot) -> Self {
        let slots: Box<[TypedSlot]> = match slot {
            TypedSlot::Nil => Box::new([]),
            slot => Box::new([slot]),
        };
        Self {
            state: Some(state),
            slots,
        }
    }

    pub fn from_stack(vm: &mut dyn ScriptVm, index: i32) -> Self {
        let slot = TypedSlot::from_stack(vm, index);
        Self::single(vm.state(), slot)
    }

    /// Capture `count` values starting at stack index `first`.
    pub fn from_range(vm: &mut dyn ScriptVm, first: i32, count: i32) -> Self {
        let first = vm.abs_index(first);
        match count {
            ..=0 => Self {
                state: Some(vm.state()),
                slots: Box::new([]),
            },
            1 => Self::from_stack(vm, first),
            _ => Self {
                state: Some(vm.state()),
                slots: (0..count).map(|offset| TypedSlot::from_stack(vm, first + offset)).collect(),
            },
        }
    }

    pub fn from_integer(vm: &dyn ScriptVm, value: i64) -> Self {
        Self::single(vm.state(), TypedSlot::Integer(value))
    }

    pub fn from_number(vm: &dyn ScriptVm, value: f64) -> Self {
        Self::single(vm.state(), TypedSlot::Number(value))
    }

    pub fn from_bool(vm: &dyn ScriptVm, value: bool) -> Self {
        Self::single(vm.state(), TypedSlot::Boolean(value))
    }

    pub fn from_string(vm: &dyn ScriptVm, value: &str) -> Self {
        Self::single(vm.state(), TypedSlot::String(Rc::from(value.as_bytes())))
    }

    pub fn state(&self) -> Option<&StateHandle> {
        self.state.as_ref()
    }

    /// Bound to a VM that is still alive.
    pub fn is_valid(&self) -> bool {
        self.state.as_ref().is_some_and(StateHandle::is_valid)
    }

    fn is_valid_in(&self, vm: &dyn ScriptVm) -> bool {
        self.state.as_ref().is_some_and(|state| state.same_state(&vm.state()))
    }

    pub fn slots(&self) -> &[TypedSlot] {
        &self.slots
    }

    pub fn var_type(&self) -> VarType {
        match &*self.slots {
            [] => VarType::Nil,
            [slot] => slot.var_type(),
            _ => VarType::Tuple,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_tuple(&self) -> bool {
        self.slots.len() > 1
    }

    pub fn is_function(&self) -> bool {
        self.var_type() == VarType::Function
    }

    pub fn is_table(&self) -> bool {
        self.var_type() == VarType::Table
    }

    pub fn is_int(&self) -> bool {
        self.var_type() == VarType::Integer
    }

    pub fn is_number(&self) -> bool {
        matches!(self.var_type(), VarType::Integer | VarType::Number)
    }

    pub fn is_string(&self) -> bool {
        self.var_type() == VarType::String
    }

    pub fn is_bool(&self) -> bool {
        self.var_type() == VarType::Boolean
    }

    pub fn is_light_userdata(&self) -> bool {
        self.var_type() == VarType::LightUserdata
    }

    /// Userdata whose host type is `type_name`.
    pub fn is_userdata(&self, vm: &mut dyn ScriptVm, type_name: &str) -> bool {
        let [TypedSlot::Userdata(handle)] = &*self.slots else {
            return false;
        };
        handle.push(vm);
        let matches = vm.to_userdata(-1).is_some_and(|object| object.type_name() == type_name);
        vm.pop(1);
        matches
    }

    /// Tuple width, raw length for tables, otherwise 0 for nil and 1 for scalars.
    pub fn count(&self, vm: &mut dyn ScriptVm) -> usize {
        match &*self.slots {
            [TypedSlot::Table(handle)] => {
                handle.push(vm);
                let len = vm.raw_len(-1);
                vm.pop(1);
                len
            }
            slots => slots.len(),
        }
    }

    /// Element `index` (1-based) of a tuple or table.
    pub fn get_at(&self, vm: &mut dyn ScriptVm, index: usize) -> ScriptVar {
        match &*self.slots {
            [TypedSlot::Table(handle)] => {
                handle.push(vm);
                vm.raw_geti(-1, index as i64);
                let value = ScriptVar::from_stack(vm, -1);
                vm.pop(2);
                value
            }
            slots => match index.checked_sub(1).and_then(|i| slots.get(i)) {
                Some(slot) => Self {
                    state: self.state.clone(),
                    slots: Box::new([slot.clone()]),
                },
                _ => ScriptVar::new(),
            },
        }
    }

    /// Push every slot; nil pushes a single nil. Returns the number pushed.
    pub fn push(&self, vm: &mut dyn ScriptVm) -> i32 {
        if self.slots.is_empty() {
            vm.push_nil();
            return 1;
        }
        for slot in self.slots.iter() {
            slot.push(vm);
        }
        self.slots.len() as i32
    }

    fn scalar(&self) -> Option<&TypedSlot> {
        match &*self.slots {
            [slot] => Some(slot),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match *self.scalar()? {
            TypedSlot::Integer(value) => Some(value),
            TypedSlot::Number(value) => Some(value as i64),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match *self.scalar()? {
            TypedSlot::Integer(value) => Some(value as f64),
            TypedSlot::Number(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self.scalar()? {
            TypedSlot::Boolean(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<Rc<[u8]>> {
        match self.scalar()? {
            TypedSlot::String(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<String> {
        self.as_bytes().map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn as_light_userdata(&self) -> Option<*mut ()> {
        match *self.scalar()? {
            TypedSlot::LightUserdata(ptr) => Some(ptr),
            _ => None,
        }
    }

    fn assign(&mut self, slot: TypedSlot) {
        self.clear();
        self.slots = Box::new([slot]);
    }

    pub fn set_integer(&mut self, value: i64) {
        self.assign(TypedSlot::Integer(value));
    }

    pub fn set_number(&mut self, value: f64) {
        self.assign(TypedSlot::Number(value));
    }

    pub fn set_bool(&mut self, value: bool) {
        self.assign(TypedSlot::Boolean(value));
    }

    pub fn set_str(&mut self, value: &str) {
        self.assign(TypedSlot::String(Rc::from(value.as_bytes())));
    }

    pub fn set_light_userdata(&mut self, value: *mut ()) {
        self.assign(TypedSlot::LightUserdata(value));
    }

    pub fn set_from_stack(&mut self, vm: &mut dyn ScriptVm, index: i32) {
        *self = Self::from_stack(vm, index);
    }

    /// Release every payload. The VM binding is kept.
    pub fn clear(&mut self) {
        self.slots = Box::new([]);
    }

    /// Vars from different VMs never compare equal.
    pub fn equals(&self, other: &ScriptVar, vm: &mut dyn ScriptVm) -> bool {
        let (Some(a), Some(b)) = (&self.state, &other.state) else {
            return false;
        };
        if !a.same_state(b) || self.slots.len() != other.slots.len() {
            return false;
        }
        self.slots
            .iter()
            .zip(other.slots.iter())
            .all(|(a, b)| a.same_value(b, vm))
    }

    /// Call this value with the arguments `fill` pushes. Results are left on
    /// the stack and counted; a failed call is logged and counts zero.
    pub fn docall(
        &self,
        vm: &mut dyn ScriptVm,
        fill: impl FnOnce(&mut dyn ScriptVm) -> i32,
    ) -> i32 {
        if !self.is_valid_in(vm) {
            error!("State of script function is invalid");
            return 0;
        }
        let handler = vm.push_error_handler();
        self.push(vm);
        let argc = fill(vm);
        protected_call(vm, argc, handler)
    }

    /// Call with `args`, collecting the results into a new var.
    pub fn call(&self, vm: &mut dyn ScriptVm, args: &[ScriptVar]) -> ScriptVar {
        let count = self.docall(vm, |vm| args.iter().map(|arg| arg.push(vm)).sum());
        let results = ScriptVar::from_range(vm, -count.max(1), count);
        vm.pop(count);
        results
    }

    /// Call a script implementation of `function` with the parameter frame at
    /// `parms`, then write the return value and real out parameters back.
    ///
    /// Returns `false` when this var isn't callable.
    pub fn call_by_host_function(
        &self,
        vm: &mut dyn ScriptVm,
        function: &HostFunction,
        parms: *mut u8,
        out_params: &[OutParam],
        receiver: Option<&ScriptVar>,
    ) -> bool {
        if !self.is_function() {
            return false;
        }
        if !self.is_valid_in(vm) {
            error!("State of script function {} is invalid", function.name());
            return false;
        }

        let out_address = |index: usize, offset: usize| {
            out_params
                .iter()
                .find(|out| out.param == index)
                .map_or_else(|| parms.wrapping_add(offset), |out| out.address)
        };

        let count = self.docall(vm, |vm| {
            let mut argc = receiver.map_or(0, |receiver| receiver.push(vm));
            for (index, param) in function.params().iter().enumerate() {
                let flags = param.flags;
                let skip = flags.contains(ParamFlags::RETURN_PARM)
                    || (!function.is_native() && flags.is_real_out());
                if skip {
                    continue;
                }
                let read_only_out = flags.contains(ParamFlags::OUT_PARM)
                    && flags.intersects(ParamFlags::CONST_PARM | ParamFlags::READ_ONLY);
                let address = if read_only_out {
                    out_address(index, param.offset)
                } else {
                    parms.wrapping_add(param.offset)
                };
                // SAFETY: the frame holds initialized parameters
                match unsafe { param.descriptor.push_value(vm, address, None) } {
                    Ok(pushed) => argc += pushed,
                    Err(err) => {
                        error!(
                            "Class[{}] function[{}] param {}: {err}",
                            function.owner(),
                            function.name(),
                            param.name
                        );
                        vm.push_nil();
                        argc += 1;
                    }
                }
            }
            argc
        });

        let mut remain = count;
        let mut write_back = |vm: &mut dyn ScriptVm| -> Result<(), ScriptError> {
            let real_outs = function
                .params()
                .iter()
                .enumerate()
                .filter(|(_, param)| param.flags.is_real_out());
            let outs = function.return_param().into_iter().chain(real_outs);
            for (index, param) in outs {
                if remain <= 0 {
                    break;
                }
                let slot = vm.abs_index(-remain);
                remain -= 1;
                let address = out_address(index, param.offset);
                // SAFETY: out addresses hold initialized values of the parameter type
                unsafe { param.descriptor.check_value(vm, slot, address) }?;
            }
            Ok(())
        };
        let result = if vm.in_protected_call() {
            write_back(&mut *vm)
        } else {
            vm.run_protected(&mut write_back)
        };
        if let Err(err) = result {
            error!(
                "Class[{}] function[{}] return type mismatch! error: {err}",
                function.owner(),
                function.name()
            );
        }
        vm.pop(count);
        true
    }
}
