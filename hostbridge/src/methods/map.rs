use std::{any::Any, cell::Cell, rc::Rc};

use log::trace;

use crate::{
    MAP_TYPE_NAME, MapProxy, ScriptError, ScriptFinalizable, ScriptVar, ScriptVm, ValueBuffer,
    bridge::settings_of, check_integer, check_userdata, resolve_field_path,
};

use super::{field_path, synthesize};

pub const MAP_ENUMERATOR_TYPE_NAME: &str = "MapEnumerator";

fn check_map(vm: &dyn ScriptVm) -> Result<Rc<MapProxy>, ScriptError> {
    check_userdata::<MapProxy>(vm, 1, MAP_TYPE_NAME)
}

/// Convert the argument at `index` into a temporary key.
fn check_key(
    vm: &mut dyn ScriptVm,
    map: &MapProxy,
    index: i32,
) -> Result<ValueBuffer, ScriptError> {
    let key = ValueBuffer::new(map.key_descriptor().clone());
    // SAFETY: the buffer holds a constructed key
    unsafe { map.key_descriptor().check_value(vm, index, key.as_ptr()) }?;
    Ok(key)
}

fn describe_key(vm: &dyn ScriptVm, index: i32) -> String {
    vm.to_bytes(index).map_or_else(
        || vm.type_at(index).name().to_owned(),
        |bytes| String::from_utf8_lossy(&bytes).into_owned(),
    )
}

/// `Map(keyTag, valueTag[, keyStructType, valueStructType])`
pub fn construct(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let key_tag = check_integer(vm, 1)?;
    let value_tag = check_integer(vm, 2)?;
    let key = synthesize(vm, key_tag, 3, MAP_TYPE_NAME)?;
    let value = synthesize(vm, value_tag, 4, MAP_TYPE_NAME)?;
    MapProxy::new_owned(key, value, settings_of(vm)).push(vm);
    Ok(1)
}

pub fn num(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let map = check_map(vm)?;
    vm.push_integer(map.num()? as i64);
    Ok(1)
}

/// `Get(key[, field...][, out])` returns `(value, true)`, or `(nil, false)`
/// when the key is absent.
pub fn get(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let map = check_map(vm)?;
    let key = check_key(vm, &map, 2)?;
    let top = vm.top();
    let (path, out) = field_path(vm, 3, top)?;
    // SAFETY: `key` is initialized
    let found = unsafe {
        map.find_with(key.as_ptr(), |descriptor, value| {
            if !path.is_empty() && !descriptor.is_aggregate() {
                vm.push_nil();
                return Ok(());
            }
            // SAFETY: the stored value is initialized
            let (descriptor, address) = resolve_field_path(descriptor, value, &path)?;
            descriptor.push_value(vm, address, out).map(drop)
        })
    }?;
    if found.is_none() {
        vm.push_nil();
    }
    vm.push_boolean(found.is_some());
    Ok(2)
}

/// `Set(key[, field...], value)` overwrites an existing entry; it never inserts.
pub fn set(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let map = check_map(vm)?;
    let top = vm.top();
    if top < 3 {
        return Err(ScriptError::bad_argument(3, "value", vm.type_at(3)));
    }
    let key = check_key(vm, &map, 2)?;
    let (path, _) = field_path(vm, 3, top - 1)?;
    // SAFETY: `key` is initialized
    let found = unsafe {
        map.find_with(key.as_ptr(), |descriptor, value| {
            let (descriptor, address) = resolve_field_path(descriptor, value, &path)?;
            descriptor.check_value(vm, top, address)
        })
    }?;
    if found.is_none() {
        return Err(ScriptError::KeyNotFound(describe_key(vm, 2)));
    }
    map.mark_dirty();
    vm.push_boolean(true);
    Ok(1)
}

/// `Add(key, value)` inserts or overwrites.
pub fn add(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let map = check_map(vm)?;
    let key = check_key(vm, &map, 2)?;
    let value = ValueBuffer::new(map.value_descriptor().clone());
    // SAFETY: both buffers hold constructed values
    unsafe {
        map.value_descriptor().check_value(vm, 3, value.as_ptr())?;
        map.add_pair(key.as_ptr(), value.as_ptr())?;
    }
    Ok(0)
}

/// `Remove(key)`, returning whether the key was present.
pub fn remove(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let map = check_map(vm)?;
    let key = check_key(vm, &map, 2)?;
    // SAFETY: `key` is initialized
    let removed = unsafe { map.remove_key(key.as_ptr()) }?;
    vm.push_boolean(removed);
    Ok(1)
}

pub fn clear(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    check_map(vm)?.clear()?;
    Ok(0)
}

/// Cursor over the occupied slots of one map, in ascending slot order.
pub struct MapEnumerator {
    map: Rc<MapProxy>,
    // keeps the script wrapper alive while enumerating
    _holder: ScriptVar,
    index: Cell<usize>,
    remaining: Cell<usize>,
}

impl ScriptFinalizable for MapEnumerator {
    fn type_name(&self) -> &'static str {
        MAP_ENUMERATOR_TYPE_NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }

    fn finalize(&self) {
        trace!("map enumerator finalized at slot {}", self.index.get());
    }
}

/// `Pairs()`: `(enumerate, enumerator, nil)` for a generic `for`.
pub fn pairs(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let map = check_map(vm)?;
    let enumerator = MapEnumerator {
        remaining: Cell::new(map.num()?),
        map,
        _holder: ScriptVar::from_stack(vm, 1),
        index: Cell::new(0),
    };
    vm.push_function(Rc::new(enumerate));
    vm.push_userdata(Rc::new(enumerator));
    vm.push_nil();
    Ok(3)
}

/// One enumeration step: pushes the next `(key, value)` or nothing when done.
pub fn enumerate(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let enumerator = check_userdata::<MapEnumerator>(vm, 1, MAP_ENUMERATOR_TYPE_NAME)?;
    if enumerator.remaining.get() == 0 {
        return Ok(0);
    }
    let map = &enumerator.map;
    let pushed = map.with_pair_from(enumerator.index.get(), |slot, key, value| {
        enumerator.index.set(slot + 1);
        // SAFETY: occupied slots hold initialized pairs
        unsafe {
            let count = map.key_descriptor().push_value(vm, key, None)?;
            Ok(count + map.value_descriptor().push_value(vm, value, None)?)
        }
    })?;
    match pushed {
        Some(count) => {
            enumerator.remaining.set(enumerator.remaining.get() - 1);
            Ok(count)
        }
        None => {
            enumerator.remaining.set(0);
            Ok(0)
        }
    }
}

/// Push a default-constructed value.
pub fn create_value_type_object(vm: &mut dyn ScriptVm) -> Result<i32, ScriptError> {
    let map = check_map(vm)?;
    let value = ValueBuffer::new(map.value_descriptor().clone());
    // SAFETY: the buffer holds a constructed value
    unsafe { map.value_descriptor().push_value(vm, value.as_ptr(), None) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bridge, BridgeCreateInfo, PropertyClass, ScriptValue, StackVm, StackVmCreateInfo};

    fn mk_vm(info: &BridgeCreateInfo) -> StackVm {
        let mut vm = StackVm::new(&StackVmCreateInfo::default());
        Bridge::new(info, None).install(&mut vm);
        vm
    }

    fn string_to_int(vm: &mut StackVm) -> ScriptValue {
        vm.call_global(
            "Map",
            &[
                ScriptValue::Integer(PropertyClass::Str.tag()),
                ScriptValue::Integer(PropertyClass::Int.tag()),
            ],
        )
        .expect("scalar maps are supported")
        .remove(0)
    }

    fn add(vm: &mut StackVm, map: &ScriptValue, key: &str, value: i64) {
        vm.call_method(map, "Add", &[ScriptValue::string(key), ScriptValue::Integer(value)])
            .expect("add pair");
    }

    #[test]
    fn get_reports_presence() {
        let mut vm = mk_vm(&BridgeCreateInfo::default());
        let map = string_to_int(&mut vm);
        add(&mut vm, &map, "a", 1);

        let found = vm.call_method(&map, "Get", &[ScriptValue::string("a")]).expect("get");
        assert_eq!(found[0].as_integer(), Some(1));
        assert!(found[1].is_truthy());

        let missing = vm.call_method(&map, "Get", &[ScriptValue::string("b")]).expect("get");
        assert!(missing[0].is_nil());
        assert!(!missing[1].is_truthy());
    }

    #[test]
    fn set_never_inserts() {
        let mut vm = mk_vm(&BridgeCreateInfo::default());
        let map = string_to_int(&mut vm);
        let err = vm
            .call_method(&map, "Set", &[ScriptValue::string("k"), ScriptValue::Integer(1)])
            .expect_err("absent key");
        assert_eq!(err.to_string(), "Map key[k] not found!");
        let num = vm.call_method(&map, "Num", &[]).expect("num");
        assert_eq!(num[0].as_integer(), Some(0));

        add(&mut vm, &map, "k", 1);
        let ok = vm
            .call_method(&map, "Set", &[ScriptValue::string("k"), ScriptValue::Integer(2)])
            .expect("present key");
        assert!(ok[0].is_truthy());
        let value = vm.call_method(&map, "Get", &[ScriptValue::string("k")]).expect("get");
        assert_eq!(value[0].as_integer(), Some(2));
    }

    #[test]
    fn enumeration_skips_removed_slots() {
        let mut vm = mk_vm(&BridgeCreateInfo::default());
        let map = string_to_int(&mut vm);
        for (key, value) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
            add(&mut vm, &map, key, value);
        }
        let removed = vm.call_method(&map, "Remove", &[ScriptValue::string("b")]).expect("remove");
        assert!(removed[0].is_truthy());
        let removed = vm
            .call_method(&map, "Remove", &[ScriptValue::string("b")])
            .expect("remove again");
        assert!(!removed[0].is_truthy());

        let mut seen = Vec::new();
        let steps = vm
            .for_each_pair(&map, "Pairs", &[], |key, value| {
                let key = key.as_str().unwrap_or_default();
                seen.push((key, value.as_integer().unwrap_or_default()));
            })
            .expect("enumerate");
        assert_eq!(steps, 3);
        seen.sort();
        assert_eq!(seen, [("a".to_owned(), 1), ("c".to_owned(), 3), ("d".to_owned(), 4)]);
    }

    #[test]
    fn clear_empties_the_map() {
        let mut vm = mk_vm(&BridgeCreateInfo::default());
        let map = string_to_int(&mut vm);
        add(&mut vm, &map, "a", 1);
        vm.call_method(&map, "Clear", &[]).expect("clear");
        let num = vm.call_method(&map, "Num", &[]).expect("num");
        assert_eq!(num[0].as_integer(), Some(0));
        assert_eq!(vm.for_each_pair(&map, "__pairs", &[], |_, _| {}), Ok(0));
    }

    #[test]
    fn unsupported_tags_name_the_container() {
        let mut vm = mk_vm(&BridgeCreateInfo::default());
        let int = ScriptValue::Integer(PropertyClass::Int.tag());
        let err = vm
            .call_global("Map", &[ScriptValue::Integer(0), int])
            .expect_err("tag 0");
        assert_eq!(err.to_string(), "Unsupported type[0] of Map!");
    }

    #[test]
    fn value_type_objects_use_the_value_type() {
        let mut vm = mk_vm(&BridgeCreateInfo::default());
        let map = string_to_int(&mut vm);
        let value = vm.call_method(&map, "CreateValueTypeObject", &[]).expect("default");
        assert_eq!(value[0].as_integer(), Some(0));
    }
}
