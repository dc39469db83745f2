use std::{cell::RefCell, collections::HashMap, fmt, rc::Rc};

use log::{debug, trace};

use crate::{
    BridgeShared, NativeFunction, RegistryRef, ScriptError, ScriptFinalizable, ScriptType,
    ScriptVm, StateHandle, StateShared,
};

/// Userdata box. Dropping the last box is the script collector finalizing it.
pub struct Userdata {
    object: Rc<dyn ScriptFinalizable>,
}

impl Userdata {
    pub fn object(&self) -> &Rc<dyn ScriptFinalizable> {
        &self.object
    }
}

impl Drop for Userdata {
    fn drop(&mut self) {
        trace!("finalizing {} userdata", self.object.type_name());
        self.object.finalize();
    }
}

#[derive(Clone, Default)]
pub enum ScriptValue {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(Rc<[u8]>),
    LightUserdata(*mut ()),
    Table(Rc<RefCell<Vec<ScriptValue>>>),
    Function(NativeFunction),
    Userdata(Rc<Userdata>),
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Nil => write!(f, "nil"),
            ScriptValue::Boolean(value) => write!(f, "{value}"),
            ScriptValue::Integer(value) => write!(f, "{value}"),
            ScriptValue::Number(value) => write!(f, "{value:?}"),
            ScriptValue::String(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            ScriptValue::LightUserdata(ptr) => write!(f, "lightuserdata({:p})", *ptr),
            ScriptValue::Table(table) => write!(f, "table(#{})", table.borrow().len()),
            ScriptValue::Function(function) => write!(f, "function({:p})", Rc::as_ptr(function)),
            ScriptValue::Userdata(data) => {
                write!(f, "{}({:p})", data.object.type_name(), Rc::as_ptr(data))
            }
        }
    }
}

impl ScriptValue {
    pub fn string(value: &str) -> Self {
        ScriptValue::String(Rc::from(value.as_bytes()))
    }

    pub fn table(values: Vec<ScriptValue>) -> Self {
        ScriptValue::Table(Rc::new(RefCell::new(values)))
    }

    pub fn function(
        function: impl Fn(&mut dyn ScriptVm) -> Result<i32, ScriptError> + 'static,
    ) -> Self {
        ScriptValue::Function(Rc::new(function))
    }

    pub fn userdata(object: Rc<dyn ScriptFinalizable>) -> Self {
        ScriptValue::Userdata(Rc::new(Userdata { object }))
    }

    pub fn type_of(&self) -> ScriptType {
        match self {
            ScriptValue::Nil => ScriptType::Nil,
            ScriptValue::Boolean(_) => ScriptType::Boolean,
            ScriptValue::Integer(_) | ScriptValue::Number(_) => ScriptType::Number,
            ScriptValue::String(_) => ScriptType::String,
            ScriptValue::LightUserdata(_) => ScriptType::LightUserdata,
            ScriptValue::Table(_) => ScriptType::Table,
            ScriptValue::Function(_) => ScriptType::Function,
            ScriptValue::Userdata(_) => ScriptType::Userdata,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match *self {
            ScriptValue::Integer(value) => Some(value),
            ScriptValue::Number(value) if value.fract() == 0.0 => Some(value as i64),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match *self {
            ScriptValue::Integer(value) => Some(value as f64),
            ScriptValue::Number(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<String> {
        match self {
            ScriptValue::String(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, ScriptValue::Nil | ScriptValue::Boolean(false))
    }

    pub fn as_userdata(&self) -> Option<Rc<dyn ScriptFinalizable>> {
        match self {
            ScriptValue::Userdata(data) => Some(data.object.clone()),
            _ => None,
        }
    }

    pub fn raw_equal(&self, other: &ScriptValue) -> bool {
        match (self, other) {
            (ScriptValue::Nil, ScriptValue::Nil) => true,
            (ScriptValue::Boolean(a), ScriptValue::Boolean(b)) => a == b,
            (ScriptValue::Integer(a), ScriptValue::Integer(b)) => a == b,
            (ScriptValue::String(a), ScriptValue::String(b)) => a == b,
            (ScriptValue::LightUserdata(a), ScriptValue::LightUserdata(b)) => a == b,
            (ScriptValue::Table(a), ScriptValue::Table(b)) => Rc::ptr_eq(a, b),
            (ScriptValue::Function(a), ScriptValue::Function(b)) => Rc::ptr_eq(a, b),
            (ScriptValue::Userdata(a), ScriptValue::Userdata(b)) => Rc::ptr_eq(a, b),
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StackVmCreateInfo {
    pub stack_size: usize,
}

/// In-memory tagged-value stack machine. Native closures play the role of
/// script functions; dropping the VM invalidates every handle bound to it.
pub struct StackVm {
    shared: Rc<StateShared>,
    stack: Vec<ScriptValue>,
    base: usize,
    registry: Vec<Option<ScriptValue>>,
    free_refs: Vec<usize>,
    globals: HashMap<String, ScriptValue, ahash::RandomState>,
    methods: HashMap<&'static str, MethodTable, ahash::RandomState>,
    protected_depth: usize,
    bridge: Option<Rc<BridgeShared>>,
}

type MethodTable = HashMap<&'static str, NativeFunction, ahash::RandomState>;

impl StackVm {
    #[must_use]
    pub fn new(info: &StackVmCreateInfo) -> Self {
        Self {
            shared: StateShared::new(),
            stack: Vec::with_capacity(info.stack_size),
            base: 0,
            registry: Vec::new(),
            free_refs: Vec::new(),
            globals: HashMap::default(),
            methods: HashMap::default(),
            protected_depth: 0,
            bridge: None,
        }
    }

    pub fn shared(&self) -> &Rc<StateShared> {
        &self.shared
    }

    fn slot(&self, index: i32) -> Option<usize> {
        if index > 0 {
            let slot = self.base + index as usize - 1;
            (slot < self.stack.len()).then_some(slot)
        } else if index < 0 {
            let back = index.unsigned_abs() as usize;
            (back <= self.stack.len() - self.base).then(|| self.stack.len() - back)
        } else {
            None
        }
    }

    fn value(&self, index: i32) -> Option<&ScriptValue> {
        self.slot(index).map(|slot| &self.stack[slot])
    }

    /// Release registry slots whose host handles were dropped.
    pub fn drain_released(&mut self) {
        for reference in self.shared.take_released() {
            self.release_ref(reference);
        }
    }

    pub fn live_refs(&self) -> usize {
        self.registry.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn push(&mut self, value: ScriptValue) {
        self.stack.push(value);
    }

    pub fn value_at(&self, index: i32) -> ScriptValue {
        self.value(index).cloned().unwrap_or_default()
    }

    pub fn global(&self, name: &str) -> ScriptValue {
        self.globals.get(name).cloned().unwrap_or_default()
    }

    /// Call `callee` with `args` and collect every result.
    pub fn invoke(
        &mut self,
        callee: &ScriptValue,
        args: &[ScriptValue],
    ) -> Result<Vec<ScriptValue>, ScriptError> {
        let top = self.stack.len();
        self.stack.push(callee.clone());
        self.stack.extend(args.iter().cloned());
        let count = self.call(args.len() as i32)?;
        let results = self.stack.split_off(self.stack.len() - count as usize);
        self.stack.truncate(top);
        Ok(results)
    }

    pub fn call_global(
        &mut self,
        name: &str,
        args: &[ScriptValue],
    ) -> Result<Vec<ScriptValue>, ScriptError> {
        let callee = self.global(name);
        self.invoke(&callee, args)
    }

    /// `target:name(args...)`
    pub fn call_method(
        &mut self,
        target: &ScriptValue,
        name: &str,
        args: &[ScriptValue],
    ) -> Result<Vec<ScriptValue>, ScriptError> {
        let function = target
            .as_userdata()
            .and_then(|object| self.methods.get(object.type_name()))
            .and_then(|methods| methods.get(name))
            .cloned()
            .ok_or_else(|| {
                ScriptError::Runtime(format!("attempt to call a nil value (method '{name}')"))
            })?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(target.clone());
        full.extend(args.iter().cloned());
        self.invoke(&ScriptValue::Function(function), &full)
    }

    /// Drive a generic `for` loop over the triple returned by `target:name(args...)`.
    pub fn for_each_pair(
        &mut self,
        target: &ScriptValue,
        name: &str,
        args: &[ScriptValue],
        mut body: impl FnMut(&ScriptValue, &ScriptValue),
    ) -> Result<usize, ScriptError> {
        let triple = self.call_method(target, name, args)?;
        let mut iter = triple.into_iter();
        let next = iter.next().unwrap_or_default();
        let state = iter.next().unwrap_or_default();
        let mut control = iter.next().unwrap_or_default();
        let mut steps = 0;
        loop {
            let results = self.invoke(&next, &[state.clone(), control.clone()])?;
            let key = results.first().cloned().unwrap_or_default();
            if key.is_nil() {
                break;
            }
            let value = results.get(1).cloned().unwrap_or_default();
            body(&key, &value);
            control = key;
            steps += 1;
        }
        Ok(steps)
    }
}

impl ScriptVm for StackVm {
    fn state(&self) -> StateHandle {
        StateHandle::new(&self.shared)
    }

    fn bridge(&self) -> Option<Rc<BridgeShared>> {
        self.bridge.clone()
    }

    fn set_bridge(&mut self, bridge: Rc<BridgeShared>) {
        self.bridge = Some(bridge);
    }

    fn top(&self) -> i32 {
        (self.stack.len() - self.base) as i32
    }

    fn abs_index(&self, index: i32) -> i32 {
        if index > 0 { index } else { self.top() + index + 1 }
    }

    fn set_top(&mut self, top: i32) {
        let len = if top >= 0 {
            self.base + top as usize
        } else {
            (self.stack.len() + 1).saturating_sub(top.unsigned_abs() as usize).max(self.base)
        };
        self.stack.resize(len, ScriptValue::Nil);
    }

    fn remove(&mut self, index: i32) {
        if let Some(slot) = self.slot(index) {
            self.stack.remove(slot);
        }
    }

    fn type_at(&self, index: i32) -> ScriptType {
        self.value(index).map_or(ScriptType::Nil, ScriptValue::type_of)
    }

    fn is_integer(&self, index: i32) -> bool {
        matches!(self.value(index), Some(ScriptValue::Integer(_)))
    }

    fn to_integer(&self, index: i32) -> Option<i64> {
        self.value(index).and_then(ScriptValue::as_integer)
    }

    fn to_number(&self, index: i32) -> Option<f64> {
        self.value(index).and_then(ScriptValue::as_number)
    }

    fn to_boolean(&self, index: i32) -> bool {
        self.value(index).is_some_and(ScriptValue::is_truthy)
    }

    fn to_bytes(&self, index: i32) -> Option<Rc<[u8]>> {
        match self.value(index)? {
            ScriptValue::String(bytes) => Some(bytes.clone()),
            ScriptValue::Integer(value) => Some(Rc::from(value.to_string().as_bytes())),
            ScriptValue::Number(value) => Some(Rc::from(value.to_string().as_bytes())),
            _ => None,
        }
    }

    fn to_light_userdata(&self, index: i32) -> Option<*mut ()> {
        match self.value(index)? {
            ScriptValue::LightUserdata(ptr) => Some(*ptr),
            _ => None,
        }
    }

    fn to_userdata(&self, index: i32) -> Option<Rc<dyn ScriptFinalizable>> {
        self.value(index).and_then(ScriptValue::as_userdata)
    }

    fn raw_len(&self, index: i32) -> usize {
        match self.value(index) {
            Some(ScriptValue::Table(table)) => table.borrow().len(),
            Some(ScriptValue::String(bytes)) => bytes.len(),
            _ => 0,
        }
    }

    fn raw_equal(&self, a: i32, b: i32) -> bool {
        match (self.value(a), self.value(b)) {
            (Some(a), Some(b)) => a.raw_equal(b),
            _ => false,
        }
    }

    fn push_nil(&mut self) {
        self.stack.push(ScriptValue::Nil);
    }

    fn push_boolean(&mut self, value: bool) {
        self.stack.push(ScriptValue::Boolean(value));
    }

    fn push_integer(&mut self, value: i64) {
        self.stack.push(ScriptValue::Integer(value));
    }

    fn push_number(&mut self, value: f64) {
        self.stack.push(ScriptValue::Number(value));
    }

    fn push_bytes(&mut self, value: &[u8]) {
        self.stack.push(ScriptValue::String(Rc::from(value)));
    }

    fn push_light_userdata(&mut self, value: *mut ()) {
        self.stack.push(ScriptValue::LightUserdata(value));
    }

    fn push_userdata(&mut self, object: Rc<dyn ScriptFinalizable>) {
        self.stack.push(ScriptValue::userdata(object));
    }

    fn push_function(&mut self, function: NativeFunction) {
        self.stack.push(ScriptValue::Function(function));
    }

    fn push_value(&mut self, index: i32) {
        let value = self.value_at(index);
        self.stack.push(value);
    }

    fn raw_geti(&mut self, index: i32, n: i64) -> ScriptType {
        let value = match self.value(index) {
            Some(ScriptValue::Table(table)) if n >= 1 => {
                table.borrow().get(n as usize - 1).cloned().unwrap_or_default()
            }
            _ => ScriptValue::Nil,
        };
        let kind = value.type_of();
        self.stack.push(value);
        kind
    }

    fn new_ref(&mut self) -> RegistryRef {
        self.drain_released();
        let value = self.stack.pop().unwrap_or_default();
        if value.is_nil() {
            return RegistryRef::NIL;
        }
        let slot = match self.free_refs.pop() {
            Some(slot) => {
                self.registry[slot] = Some(value);
                slot
            }
            None => {
                self.registry.push(Some(value));
                self.registry.len() - 1
            }
        };
        RegistryRef(slot as i32)
    }

    fn push_ref(&mut self, reference: RegistryRef) {
        let value = usize::try_from(reference.0)
            .ok()
            .and_then(|slot| self.registry.get(slot))
            .and_then(Option::clone)
            .unwrap_or_default();
        self.stack.push(value);
    }

    fn release_ref(&mut self, reference: RegistryRef) {
        let Ok(slot) = usize::try_from(reference.0) else {
            return;
        };
        if let Some(entry) = self.registry.get_mut(slot) {
            if entry.take().is_some() {
                self.free_refs.push(slot);
            }
        }
    }

    fn push_error_handler(&mut self) -> i32 {
        self.stack.push(ScriptValue::function(|vm| {
            let message = vm
                .to_bytes(1)
                .unwrap_or_else(|| Rc::from(&b"(error object is not a string)"[..]));
            debug!("script error: {}", String::from_utf8_lossy(&message));
            vm.push_bytes(&message);
            Ok(1)
        }));
        self.top()
    }

    fn call(&mut self, argc: i32) -> Result<i32, ScriptError> {
        self.drain_released();
        let argc = argc.max(0) as usize;
        if self.stack.len() < self.base + argc + 1 {
            return Err(ScriptError::Runtime("stack underflow in call".into()));
        }
        let func_slot = self.stack.len() - argc - 1;
        let function = match &self.stack[func_slot] {
            ScriptValue::Function(function) => function.clone(),
            other => {
                let name = other.type_of().name();
                self.stack.truncate(func_slot);
                return Err(ScriptError::NotCallable(name));
            }
        };

        let saved_base = self.base;
        self.base = func_slot + 1;
        let result = {
            let vm: &mut dyn ScriptVm = self;
            function(vm)
        };
        self.base = saved_base;

        match result {
            Ok(count) => {
                let available = self.stack.len().saturating_sub(func_slot + 1);
                let count = (count.max(0) as usize).min(available);
                let results = self.stack.split_off(self.stack.len() - count);
                self.stack.truncate(func_slot);
                self.stack.extend(results);
                Ok(count as i32)
            }
            Err(error) => {
                self.stack.truncate(func_slot);
                Err(error)
            }
        }
    }

    fn pcall(&mut self, argc: i32, handler: i32) -> Result<i32, ScriptError> {
        let handler = match self.value(handler) {
            Some(ScriptValue::Function(function)) => Some(function.clone()),
            _ => None,
        };
        self.protected_depth += 1;
        let result = self.call(argc);
        self.protected_depth -= 1;

        let error = match result {
            Ok(count) => return Ok(count),
            Err(error) => error,
        };
        let mut message = error.to_string();
        if let Some(handler) = handler {
            self.stack.push(ScriptValue::Function(handler));
            self.push_bytes(message.as_bytes());
            if let Ok(count) = self.call(1) {
                if count > 0 {
                    if let Some(bytes) = self.to_bytes(-1) {
                        message = String::from_utf8_lossy(&bytes).into_owned();
                    }
                }
                self.pop(count);
            }
        }
        self.push_bytes(message.as_bytes());
        Err(ScriptError::Runtime(message))
    }

    fn run_protected(
        &mut self,
        body: &mut dyn FnMut(&mut dyn ScriptVm) -> Result<(), ScriptError>,
    ) -> Result<(), ScriptError> {
        let top = self.stack.len();
        self.protected_depth += 1;
        let result = {
            let vm: &mut dyn ScriptVm = self;
            body(vm)
        };
        self.protected_depth -= 1;
        if result.is_err() {
            self.stack.truncate(top);
        }
        result
    }

    fn in_protected_call(&self) -> bool {
        self.protected_depth > 0
    }

    fn set_global(&mut self, name: &str) {
        let value = self.stack.pop().unwrap_or_default();
        self.globals.insert(name.to_owned(), value);
    }

    fn set_method(
        &mut self,
        type_name: &'static str,
        name: &'static str,
        function: NativeFunction,
    ) {
        self.methods.entry(type_name).or_default().insert(name, function);
    }
}
