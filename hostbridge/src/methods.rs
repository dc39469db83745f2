use std::rc::Rc;

use crate::{
    Descriptor, Property, PropertyClass, ScriptError, ScriptType, ScriptVm, StructType,
    check_string, check_userdata,
};

pub(crate) mod array;
pub(crate) mod map;
pub(crate) mod structure;

pub use map::{MAP_ENUMERATOR_TYPE_NAME, MapEnumerator};

pub type MethodFunction = fn(&mut dyn ScriptVm) -> Result<i32, ScriptError>;

// the receiver is always argument 1
#[derive(Debug, Copy, Clone)]
pub struct ProxyMethod<'a> {
    pub name: &'a str,
    pub ptr: MethodFunction,
}

impl<'a> ProxyMethod<'a> {
    pub const fn new(name: &'a str, ptr: MethodFunction) -> Self {
        Self { name, ptr }
    }
}

pub const ARRAY_METHODS: &[ProxyMethod] = &[
    ProxyMethod::new("Num", array::num),
    ProxyMethod::new("Get", array::get),
    ProxyMethod::new("Set", array::set),
    ProxyMethod::new("Add", array::add),
    ProxyMethod::new("Insert", array::insert),
    ProxyMethod::new("Remove", array::remove),
    ProxyMethod::new("Clear", array::clear),
    ProxyMethod::new("AddUnique", array::add_unique),
    ProxyMethod::new("Pairs", array::pairs),
    ProxyMethod::new("__pairs", array::pairs),
    ProxyMethod::new("PairsLessGC", array::pairs_less_gc),
    ProxyMethod::new("CreateValueTypeObject", array::create_value_type_object),
];

pub const MAP_METHODS: &[ProxyMethod] = &[
    ProxyMethod::new("Num", map::num),
    ProxyMethod::new("Get", map::get),
    ProxyMethod::new("Set", map::set),
    ProxyMethod::new("Add", map::add),
    ProxyMethod::new("Remove", map::remove),
    ProxyMethod::new("Clear", map::clear),
    ProxyMethod::new("Pairs", map::pairs),
    ProxyMethod::new("__pairs", map::pairs),
    ProxyMethod::new("CreateValueTypeObject", map::create_value_type_object),
];

pub const STRUCT_METHODS: &[ProxyMethod] = &[
    ProxyMethod::new("Get", structure::get),
    ProxyMethod::new("Set", structure::set),
];

/// Descriptor for a constructor type tag. Struct tags read their
/// [`StructType`] from `struct_index`.
fn synthesize(
    vm: &dyn ScriptVm,
    tag: i64,
    struct_index: i32,
    container: &'static str,
) -> Result<Rc<dyn Descriptor>, ScriptError> {
    let unsupported = || ScriptError::UnsupportedType { tag, container };
    let class = PropertyClass::from_tag(tag).ok_or_else(unsupported)?;
    let def = match class {
        PropertyClass::Struct => {
            let struct_type = check_userdata::<StructType>(vm, struct_index, "StructType")?;
            Some(struct_type.def().clone())
        }
        _ => None,
    };
    let property = Property::from_class(class, def).ok_or_else(unsupported)?;
    Ok(property)
}

/// Field names in `first..=last`. A trailing nil or userdata argument is the
/// out slot aggregate results get copied into.
fn field_path(
    vm: &dyn ScriptVm,
    first: i32,
    last: i32,
) -> Result<(Vec<String>, Option<i32>), ScriptError> {
    let mut last = last;
    let mut out = None;
    if last >= first && matches!(vm.type_at(last), ScriptType::Nil | ScriptType::Userdata) {
        out = Some(last);
        last -= 1;
    }
    let path = (first..=last)
        .map(|index| check_string(vm, index))
        .collect::<Result<_, _>>()?;
    Ok((path, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StackVm, StackVmCreateInfo, StructDef};

    #[test]
    fn method_names_are_unique() {
        for table in [ARRAY_METHODS, MAP_METHODS, STRUCT_METHODS] {
            let mut names: Vec<_> = table.iter().map(|method| method.name).collect();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), table.len());
        }
    }

    #[test]
    fn field_path_splits_off_the_out_slot() {
        let mut vm = StackVm::new(&StackVmCreateInfo::default());
        vm.push_bytes(b"inner");
        vm.push_bytes(b"value");
        vm.push_nil();
        let (path, out) = field_path(&vm, 1, 3).expect("strings and a trailing nil");
        assert_eq!(path, ["inner", "value"]);
        assert_eq!(out, Some(3));

        vm.set_top(0);
        vm.push_boolean(true);
        assert!(field_path(&vm, 1, 1).is_err(), "path segments must be strings");
        assert_eq!(field_path(&vm, 2, 1), Ok((Vec::new(), None)));
    }

    #[test]
    fn synthesize_needs_a_struct_type_for_struct_tags() {
        let mut vm = StackVm::new(&StackVmCreateInfo::default());
        let int = synthesize(&vm, PropertyClass::Int.tag(), 2, "Array");
        assert_eq!(int.map(|d| d.name().to_owned()), Ok("int".into()));
        assert!(matches!(
            synthesize(&vm, 42, 2, "Array"),
            Err(ScriptError::UnsupportedType { tag: 42, container: "Array" })
        ));
        assert!(synthesize(&vm, PropertyClass::Struct.tag(), 2, "Array").is_err());

        let def = StructDef::builder("Point").field("x", Property::int()).build();
        vm.push_nil();
        vm.push_userdata(Rc::new(StructType::new(def)));
        let point =
            synthesize(&vm, PropertyClass::Struct.tag(), 2, "Array").expect("struct type given");
        assert_eq!(point.name(), "Point");
        assert!(matches!(
            synthesize(&vm, PropertyClass::Array.tag(), 2, "Array"),
            Err(ScriptError::UnsupportedType { .. })
        ));
    }
}
