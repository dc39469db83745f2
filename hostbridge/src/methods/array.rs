use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::{
    ARRAY_TYPE_NAME, ArrayProxy, NativeFunction, ScriptError, ScriptVar, ScriptVm, ValueBuffer,
    bridge::settings_of, check_integer, check_userdata, resolve_field_path,
};

use super::{field_path, synthesize};

fn check_array(vm: &dyn ScriptVm) -> Result<Rc<ArrayProxy>, ScriptError> {
    check_userdata::<ArrayProxy>(vm, 1, ARRAY_TYPE_NAME)
}

/// `Array(typeTag[, structType])`
pub fn construct(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let tag = check_integer(vm, 1)?;
    let inner = synthesize(vm, tag, 2, ARRAY_TYPE_NAME)?;
    ArrayProxy::new_owned(inner, settings_of(vm)).push(vm);
    Ok(1)
}

pub fn num(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let array = check_array(vm)?;
    vm.push_integer(array.num()? as i64);
    Ok(1)
}

/// `Get(index[, field...][, out])`
pub fn get(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let array = check_array(vm)?;
    let index = check_integer(vm, 2)?;
    let top = vm.top();
    let (path, out) = field_path(vm, 3, top)?;
    array.with_element(index, "get", |inner, element| {
        if !path.is_empty() && !inner.is_aggregate() {
            return Ok(0);
        }
        // SAFETY: valid index holds an initialized element
        unsafe {
            let (descriptor, address) = resolve_field_path(inner, element, &path)?;
            descriptor.push_value(vm, address, out)
        }
    })
}

/// `Set(index[, field...], value)`
pub fn set(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let array = check_array(vm)?;
    let index = check_integer(vm, 2)?;
    let top = vm.top();
    if top < 3 {
        return Err(ScriptError::bad_argument(3, "value", vm.type_at(3)));
    }
    let (path, _) = field_path(vm, 3, top - 1)?;
    array.with_element(index, "set", |inner, element| {
        // SAFETY: valid index holds an initialized element
        unsafe {
            let (descriptor, address) = resolve_field_path(inner, element, &path)?;
            descriptor.check_value(vm, top, address)
        }
    })?;
    array.mark_dirty();
    Ok(0)
}

/// `Add(value)`, returning the new count.
pub fn add(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let array = check_array(vm)?;
    // SAFETY: the new slot is constructed before the fill
    array.add_with(|inner, slot| unsafe { inner.check_value(vm, 2, slot) })?;
    vm.push_integer(array.num()? as i64);
    Ok(1)
}

/// `Insert(index, value)`, returning the new count.
pub fn insert(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let array = check_array(vm)?;
    let index = check_integer(vm, 2)?;
    // SAFETY: the new slot is constructed before the fill
    array.insert_with(index, |inner, slot| unsafe { inner.check_value(vm, 3, slot) })?;
    vm.push_integer(array.num()? as i64);
    Ok(1)
}

pub fn remove(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let array = check_array(vm)?;
    let index = check_integer(vm, 2)?;
    array.remove(index)?;
    Ok(0)
}

pub fn clear(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    check_array(vm)?.clear()?;
    Ok(0)
}

/// `AddUnique(value)`, returning the index of the new or existing element.
pub fn add_unique(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let array = check_array(vm)?;
    // SAFETY: the new slot is constructed before the fill
    let index = array.add_unique_with(|inner, slot| unsafe { inner.check_value(vm, 2, slot) })?;
    vm.push_integer(index as i64);
    Ok(1)
}

/// `Pairs([reverse])`: `(step, array, control)` for a generic `for`.
pub fn pairs(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let array = check_array(vm)?;
    let reverse = vm.to_boolean(2);
    let control = if reverse { array.num()? as i64 } else { -1 };
    let step: NativeFunction = if reverse {
        Rc::new(step_backward)
    } else {
        Rc::new(step_forward)
    };
    vm.push_function(step);
    vm.push_value(1);
    vm.push_integer(control);
    Ok(3)
}

fn step_forward(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let array = check_array(vm)?;
    let index = check_integer(vm, 2)? + 1;
    push_pair(vm, &array, index)
}

fn step_backward(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let array = check_array(vm)?;
    let index = check_integer(vm, 2)? - 1;
    push_pair(vm, &array, index)
}

// nothing is pushed once `index` leaves the array, ending the loop
fn push_pair(vm: &mut dyn ScriptVm, array: &ArrayProxy, index: i64) -> Result<i32, ScriptError> {
    let pushed = array.try_element(index, |inner, element| {
        vm.push_integer(index);
        // SAFETY: valid index holds an initialized element
        unsafe { inner.push_value(vm, element, None) }
    })?;
    Ok(pushed.map_or(0, |count| count + 1))
}

/// Iteration state of one `PairsLessGC` loop. Every step copies the current
/// element into the same script value.
struct LessGcCursor {
    array: Rc<ArrayProxy>,
    // keeps the script wrapper alive for the whole loop
    _holder: ScriptVar,
    scratch: RefCell<ScriptVar>,
    next: Cell<i64>,
    reverse: bool,
}

impl LessGcCursor {
    fn step(&self, vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
        let index = self.next.get();
        let pushed = self.array.try_element(index, |inner, element| {
            vm.push_integer(index);
            let scratch = self.scratch.borrow().clone();
            if scratch.is_nil() {
                // SAFETY: valid index holds an initialized element
                unsafe { inner.push_value(vm, element, None) }?;
                self.scratch.borrow_mut().set_from_stack(vm, -1);
            } else {
                scratch.push(vm);
                let slot = vm.top();
                // SAFETY: valid index holds an initialized element
                unsafe { inner.push_value(vm, element, Some(slot)) }?;
                vm.remove(slot);
            }
            Ok(2)
        })?;
        self.next.set(if self.reverse { index - 1 } else { index + 1 });
        Ok(pushed.unwrap_or(0))
    }
}

/// `PairsLessGC([reverse])`: like `Pairs` for struct arrays, reusing one
/// script value for every element. Short arrays use `Pairs`.
pub fn pairs_less_gc(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let array = check_array(vm)?;
    if !array.inner().is_aggregate() {
        return Err(ScriptError::LessGcUnsupported(array.inner().name().to_owned()));
    }
    let num = array.num()?;
    if num < array.settings().less_gc_min_len {
        return pairs(vm);
    }
    let reverse = vm.to_boolean(2);
    let cursor = LessGcCursor {
        _holder: ScriptVar::from_stack(vm, 1),
        scratch: RefCell::default(),
        next: Cell::new(if reverse { num as i64 - 1 } else { 0 }),
        reverse,
        array,
    };
    vm.push_function(Rc::new(move |vm: &mut dyn ScriptVm| cursor.step(vm)));
    vm.push_nil();
    vm.push_nil();
    Ok(3)
}

/// Push a default-constructed element.
pub fn create_value_type_object(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let array = check_array(vm)?;
    let value = ValueBuffer::new(array.inner().clone());
    // SAFETY: the buffer holds a constructed value
    unsafe { array.inner().push_value(vm, value.as_ptr(), None) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Bridge, BridgeCreateInfo, Property, PropertyClass, ScriptValue, StackVm,
        StackVmCreateInfo, StructDef, StructType, StructValue, downcast_userdata,
    };

    fn mk_vm() -> StackVm {
        let mut vm = StackVm::new(&StackVmCreateInfo::default());
        Bridge::new(&BridgeCreateInfo::default(), None).install(&mut vm);
        vm
    }

    fn int_array(vm: &mut StackVm, values: &[i64]) -> ScriptValue {
        let array = vm
            .call_global("Array", &[ScriptValue::Integer(PropertyClass::Int.tag())])
            .expect("int arrays are supported")
            .remove(0);
        for &value in values {
            vm.call_method(&array, "Add", &[ScriptValue::Integer(value)]).expect("add int");
        }
        array
    }

    fn collect(
        vm: &mut StackVm,
        array: &ScriptValue,
        method: &str,
        args: &[ScriptValue],
    ) -> Vec<(i64, i64)> {
        let mut seen = Vec::new();
        vm.for_each_pair(array, method, args, |key, value| {
            seen.push((key.as_integer().unwrap_or(-1), value.as_integer().unwrap_or(-1)));
        })
        .expect("iteration succeeds");
        seen
    }

    #[test]
    fn pairs_walks_both_directions() {
        let mut vm = mk_vm();
        let array = int_array(&mut vm, &[10, 20, 30]);
        assert_eq!(collect(&mut vm, &array, "Pairs", &[]), [(0, 10), (1, 20), (2, 30)]);
        assert_eq!(
            collect(&mut vm, &array, "Pairs", &[ScriptValue::Boolean(true)]),
            [(2, 30), (1, 20), (0, 10)]
        );
        assert_eq!(collect(&mut vm, &array, "__pairs", &[]).len(), 3);
    }

    #[test]
    fn add_returns_the_new_count() {
        let mut vm = mk_vm();
        let array = int_array(&mut vm, &[1]);
        let count = vm.call_method(&array, "Add", &[ScriptValue::Integer(2)]).expect("add");
        assert_eq!(count[0].as_integer(), Some(2));
    }

    #[test]
    fn insert_at_count_appends() {
        let mut vm = mk_vm();
        let array = int_array(&mut vm, &[1, 2]);
        let count = vm
            .call_method(&array, "Insert", &[ScriptValue::Integer(2), ScriptValue::Integer(3)])
            .expect("insert at count");
        assert_eq!(count[0].as_integer(), Some(3));
        vm.call_method(&array, "Insert", &[ScriptValue::Integer(0), ScriptValue::Integer(0)])
            .expect("insert at front");
        assert_eq!(collect(&mut vm, &array, "Pairs", &[]), [(0, 0), (1, 1), (2, 2), (3, 3)]);

        let err = vm
            .call_method(&array, "Insert", &[ScriptValue::Integer(9), ScriptValue::Integer(0)])
            .expect_err("past the end");
        assert_eq!(err.to_string(), "Array insert index 9 out of range");
    }

    #[test]
    fn get_and_set_check_bounds() {
        let mut vm = mk_vm();
        let array = int_array(&mut vm, &[5]);
        vm.call_method(&array, "Set", &[ScriptValue::Integer(0), ScriptValue::Integer(6)])
            .expect("set in range");
        let value = vm.call_method(&array, "Get", &[ScriptValue::Integer(0)]).expect("get");
        assert_eq!(value[0].as_integer(), Some(6));

        let err = vm
            .call_method(&array, "Get", &[ScriptValue::Integer(1)])
            .expect_err("get past end");
        assert_eq!(err.to_string(), "Array get index 1 out of range");
        assert!(vm
            .call_method(&array, "Set", &[ScriptValue::Integer(-1), ScriptValue::Integer(0)])
            .is_err());
        assert!(vm.call_method(&array, "Remove", &[ScriptValue::Integer(1)]).is_err());
    }

    #[test]
    fn get_with_a_path_on_scalars_returns_nothing() {
        let mut vm = mk_vm();
        let array = int_array(&mut vm, &[5]);
        let results = vm
            .call_method(&array, "Get", &[ScriptValue::Integer(0), ScriptValue::string("field")])
            .expect("no-op");
        assert!(results.is_empty());
    }

    #[test]
    fn add_unique_keeps_one_copy() {
        let mut vm = mk_vm();
        let array = int_array(&mut vm, &[]);
        for _ in 0..2 {
            let index = vm
                .call_method(&array, "AddUnique", &[ScriptValue::Integer(7)])
                .expect("add unique");
            assert_eq!(index[0].as_integer(), Some(0));
        }
        let num = vm.call_method(&array, "Num", &[]).expect("num");
        assert_eq!(num[0].as_integer(), Some(1));
    }

    #[test]
    fn less_gc_on_scalar_arrays_is_an_error() {
        let mut vm = mk_vm();
        let cases: [&[i64]; 3] = [&[], &[1], &[1, 2, 3]];
        for values in cases {
            let array = int_array(&mut vm, values);
            let err = vm.call_method(&array, "PairsLessGC", &[]).expect_err("scalar elements");
            let expected = ScriptError::LessGcUnsupported("int".into());
            assert_eq!(err, expected, "{} elements", values.len());
        }
    }

    #[test]
    fn short_arrays_fall_back_to_pairs() {
        let mut vm = mk_vm();
        let def = StructDef::builder("Cell").field("v", Property::int()).build();
        let struct_type = ScriptValue::userdata(Rc::new(StructType::new(def.clone())));
        let array = vm
            .call_global("Array", &[ScriptValue::Integer(PropertyClass::Struct.tag()), struct_type])
            .expect("struct arrays are supported")
            .remove(0);
        let cell = StructValue::new(def);
        cell.set_integer("v", 4);
        vm.call_method(&array, "Add", &[ScriptValue::userdata(Rc::new(cell))]).expect("add cell");

        let mut seen = Vec::new();
        vm.for_each_pair(&array, "PairsLessGC", &[], |key, value| {
            let cell = value.as_userdata().and_then(downcast_userdata::<StructValue>);
            seen.push((key.as_integer(), cell.and_then(|cell| cell.integer("v"))));
        })
        .expect("one element iterates through Pairs");
        assert_eq!(seen, [(Some(0), Some(4))]);
    }

    #[test]
    fn bad_receiver_names_the_expected_type() {
        let mut vm = mk_vm();
        vm.push_nil();
        let err = num(&mut vm).expect_err("nil receiver");
        assert_eq!(err.to_string(), "arg 1 expect Array, but got nil");
    }

    #[test]
    fn value_type_objects_default_construct() {
        let mut vm = mk_vm();
        let array = int_array(&mut vm, &[]);
        let value = vm.call_method(&array, "CreateValueTypeObject", &[]).expect("default value");
        assert_eq!(value[0].as_integer(), Some(0));
    }
}
