use std::{
    any::Any,
    fmt,
    hash::{Hash, Hasher},
    mem,
    ptr::{self, NonNull},
    rc::{Rc, Weak},
};

use ahash::AHasher;

use crate::{
    ArrayProxy, Descriptor, DescriptorFlags, FieldRef, MapProxy, ObjectRef, ReferenceCollector,
    ScriptArray, ScriptError, ScriptFinalizable, ScriptMap, ScriptType, ScriptVm, check_integer,
    check_string, check_userdata, clone_array_elements, clone_map_pairs, construct_items,
    destroy_items, destroy_map_pairs, downcast_userdata,
};

pub const STRUCT_TYPE_NAME: &str = "Struct";

/// Integer tags scripts pass to the container constructors.
#[repr(i64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PropertyClass {
    Bool = 1,
    Int = 2,
    Float = 3,
    Str = 4,
    Object = 5,
    Struct = 6,
    Array = 7,
}

impl PropertyClass {
    pub fn from_tag(tag: i64) -> Option<Self> {
        Some(match tag {
            1 => PropertyClass::Bool,
            2 => PropertyClass::Int,
            3 => PropertyClass::Float,
            4 => PropertyClass::Str,
            5 => PropertyClass::Object,
            6 => PropertyClass::Struct,
            7 => PropertyClass::Array,
            _ => return None,
        })
    }

    pub fn tag(self) -> i64 {
        self as i64
    }
}

pub enum PropertyKind {
    Bool,
    Int,
    Float,
    Str,
    Object,
    Struct(Rc<StructDef>),
    // element storage is a `ScriptArray` of the inner type
    Array(Rc<dyn Descriptor>),
    // pair storage is a `ScriptMap` of key and value type
    Map(Rc<dyn Descriptor>, Rc<dyn Descriptor>),
}

/// Descriptor of one reference host value type.
pub struct Property {
    name: String,
    kind: PropertyKind,
    flags: DescriptorFlags,
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Property {
    pub fn new(kind: PropertyKind) -> Rc<Self> {
        let scalar = DescriptorFlags::ZERO_CONSTRUCT | DescriptorFlags::NO_DESTRUCTOR;
        let (name, flags) = match &kind {
            PropertyKind::Bool => ("bool".to_owned(), scalar),
            PropertyKind::Int => ("int".to_owned(), scalar),
            PropertyKind::Float => ("float".to_owned(), scalar),
            PropertyKind::Str => ("string".to_owned(), DescriptorFlags::empty()),
            PropertyKind::Object => {
                ("Object".to_owned(), scalar | DescriptorFlags::OBJECT_REFERENCE)
            }
            PropertyKind::Struct(def) => (def.name.clone(), def.flags),
            PropertyKind::Array(inner) => (
                format!("Array<{}>", inner.name()),
                inner.flags() & DescriptorFlags::OBJECT_REFERENCE,
            ),
            PropertyKind::Map(key, value) => (
                format!("Map<{}, {}>", key.name(), value.name()),
                (key.flags() | value.flags()) & DescriptorFlags::OBJECT_REFERENCE,
            ),
        };
        Rc::new(Self { name, kind, flags })
    }

    pub fn bool() -> Rc<Self> {
        Self::new(PropertyKind::Bool)
    }

    pub fn int() -> Rc<Self> {
        Self::new(PropertyKind::Int)
    }

    pub fn float() -> Rc<Self> {
        Self::new(PropertyKind::Float)
    }

    pub fn string() -> Rc<Self> {
        Self::new(PropertyKind::Str)
    }

    pub fn object() -> Rc<Self> {
        Self::new(PropertyKind::Object)
    }

    pub fn structure(def: Rc<StructDef>) -> Rc<Self> {
        Self::new(PropertyKind::Struct(def))
    }

    pub fn array(inner: Rc<dyn Descriptor>) -> Rc<Self> {
        Self::new(PropertyKind::Array(inner))
    }

    pub fn map(key: Rc<dyn Descriptor>, value: Rc<dyn Descriptor>) -> Rc<Self> {
        Self::new(PropertyKind::Map(key, value))
    }

    /// Synthesize a descriptor from a constructor tag. Struct tags need the
    /// struct definition; nested arrays can't be described by a single tag.
    pub fn from_class(class: PropertyClass, def: Option<Rc<StructDef>>) -> Option<Rc<Self>> {
        match class {
            PropertyClass::Bool => Some(Self::bool()),
            PropertyClass::Int => Some(Self::int()),
            PropertyClass::Float => Some(Self::float()),
            PropertyClass::Str => Some(Self::string()),
            PropertyClass::Object => Some(Self::object()),
            PropertyClass::Struct => def.map(Self::structure),
            PropertyClass::Array => None,
        }
    }

    pub fn kind(&self) -> &PropertyKind {
        &self.kind
    }

    fn mismatch(&self) -> ScriptError {
        ScriptError::type_mismatch(self.name.clone(), ScriptType::Userdata)
    }
}

fn struct_def_of(descriptor: &dyn Descriptor) -> Option<&StructDef> {
    let any = descriptor.as_any();
    if let Some(def) = any.downcast_ref::<StructDef>() {
        return Some(def);
    }
    match &any.downcast_ref::<Property>()?.kind {
        PropertyKind::Struct(def) => Some(&**def),
        _ => None,
    }
}

/// Whether values of `a` can be stored where `b` is expected.
pub fn same_element_kind(a: &dyn Descriptor, b: &dyn Descriptor) -> bool {
    if ptr::addr_eq(a as *const dyn Descriptor, b as *const dyn Descriptor) {
        return true;
    }
    match (struct_def_of(a), struct_def_of(b)) {
        (Some(x), Some(y)) => return ptr::eq(x, y),
        (None, None) => {}
        _ => return false,
    }
    let (Some(a), Some(b)) = (
        a.as_any().downcast_ref::<Property>(),
        b.as_any().downcast_ref::<Property>(),
    ) else {
        return false;
    };
    match (&a.kind, &b.kind) {
        (PropertyKind::Array(x), PropertyKind::Array(y)) => same_element_kind(&**x, &**y),
        (PropertyKind::Map(xk, xv), PropertyKind::Map(yk, yv)) => {
            same_element_kind(&**xk, &**yk) && same_element_kind(&**xv, &**yv)
        }
        (x, y) => mem::discriminant(x) == mem::discriminant(y),
    }
}

fn float_hash_bits(value: f64) -> u64 {
    // 0.0 and -0.0 are identical
    if value == 0.0 { 0 } else { value.to_bits() }
}

impl Descriptor for Property {
    fn name(&self) -> &str {
        &self.name
    }

    fn element_size(&self) -> usize {
        match &self.kind {
            PropertyKind::Bool => size_of::<bool>(),
            PropertyKind::Int => size_of::<i64>(),
            PropertyKind::Float => size_of::<f64>(),
            PropertyKind::Str => size_of::<String>(),
            PropertyKind::Object => size_of::<Option<ObjectRef>>(),
            PropertyKind::Struct(def) => def.size,
            PropertyKind::Array(_) => size_of::<ScriptArray>(),
            PropertyKind::Map(..) => size_of::<ScriptMap>(),
        }
    }

    fn alignment(&self) -> usize {
        match &self.kind {
            PropertyKind::Bool => align_of::<bool>(),
            PropertyKind::Int => align_of::<i64>(),
            PropertyKind::Float => align_of::<f64>(),
            PropertyKind::Str => align_of::<String>(),
            PropertyKind::Object => align_of::<Option<ObjectRef>>(),
            PropertyKind::Struct(def) => def.align,
            PropertyKind::Array(_) => align_of::<ScriptArray>(),
            PropertyKind::Map(..) => align_of::<ScriptMap>(),
        }
    }

    fn flags(&self) -> DescriptorFlags {
        self.flags
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    unsafe fn construct_in_place(&self, dest: *mut u8) {
        // SAFETY: caller provides writable storage for one value
        unsafe {
            match &self.kind {
                PropertyKind::Bool => dest.cast::<bool>().write(false),
                PropertyKind::Int => dest.cast::<i64>().write(0),
                PropertyKind::Float => dest.cast::<f64>().write(0.0),
                PropertyKind::Str => dest.cast::<String>().write(String::new()),
                PropertyKind::Object => dest.cast::<Option<ObjectRef>>().write(None),
                PropertyKind::Struct(def) => def.construct_in_place(dest),
                PropertyKind::Array(inner) => {
                    dest.cast::<ScriptArray>().write(ScriptArray::for_descriptor(&**inner))
                }
                PropertyKind::Map(key, value) => dest
                    .cast::<ScriptMap>()
                    .write(ScriptMap::for_descriptors(&**key, &**value)),
            }
        }
    }

    unsafe fn destroy_in_place(&self, dest: *mut u8) {
        // SAFETY: caller provides an initialized value
        unsafe {
            match &self.kind {
                PropertyKind::Str => ptr::drop_in_place(dest.cast::<String>()),
                PropertyKind::Struct(def) => def.destroy_in_place(dest),
                PropertyKind::Array(inner) => {
                    let array = dest.cast::<ScriptArray>();
                    destroy_items(&**inner, (*array).get_raw_ptr(0), (*array).len());
                    ptr::drop_in_place(array);
                }
                PropertyKind::Map(key, value) => {
                    let map = dest.cast::<ScriptMap>();
                    destroy_map_pairs(&**key, &**value, &*map);
                    ptr::drop_in_place(map);
                }
                _ => {}
            }
        }
    }

    unsafe fn copy_value(&self, dest: *mut u8, src: *const u8) {
        if ptr::eq(dest.cast_const(), src) {
            return;
        }
        // SAFETY: both values are initialized
        unsafe {
            match &self.kind {
                PropertyKind::Bool => *dest.cast::<bool>() = *src.cast::<bool>(),
                PropertyKind::Int => *dest.cast::<i64>() = *src.cast::<i64>(),
                PropertyKind::Float => *dest.cast::<f64>() = *src.cast::<f64>(),
                PropertyKind::Str => {
                    (*dest.cast::<String>()).clone_from(&*src.cast::<String>())
                }
                PropertyKind::Object => {
                    *dest.cast::<Option<ObjectRef>>() = *src.cast::<Option<ObjectRef>>()
                }
                PropertyKind::Struct(def) => def.copy_value(dest, src),
                PropertyKind::Array(inner) => clone_array_elements(
                    &**inner,
                    &mut *dest.cast::<ScriptArray>(),
                    &*src.cast::<ScriptArray>(),
                ),
                PropertyKind::Map(key, value) => clone_map_pairs(
                    &**key,
                    &**value,
                    &mut *dest.cast::<ScriptMap>(),
                    &*src.cast::<ScriptMap>(),
                ),
            }
        }
    }

    unsafe fn identical(&self, a: *const u8, b: *const u8) -> bool {
        // SAFETY: both values are initialized
        unsafe {
            match &self.kind {
                PropertyKind::Bool => *a.cast::<bool>() == *b.cast::<bool>(),
                PropertyKind::Int => *a.cast::<i64>() == *b.cast::<i64>(),
                PropertyKind::Float => *a.cast::<f64>() == *b.cast::<f64>(),
                PropertyKind::Str => *a.cast::<String>() == *b.cast::<String>(),
                PropertyKind::Object => {
                    *a.cast::<Option<ObjectRef>>() == *b.cast::<Option<ObjectRef>>()
                }
                PropertyKind::Struct(def) => def.identical(a, b),
                PropertyKind::Array(inner) => {
                    let (a, b) = (&*a.cast::<ScriptArray>(), &*b.cast::<ScriptArray>());
                    a.len() == b.len()
                        && (0..a.len())
                            .all(|i| inner.identical(a.get_raw_ptr(i), b.get_raw_ptr(i)))
                }
                PropertyKind::Map(key, value) => {
                    let (a, b) = (&*a.cast::<ScriptMap>(), &*b.cast::<ScriptMap>());
                    a.len() == b.len()
                        && a.occupied_indices().all(|index| {
                            b.find_value(a.key_ptr(index), &**key)
                                .is_some_and(|other| value.identical(a.value_ptr(index), other))
                        })
                }
            }
        }
    }

    unsafe fn hash(&self, value: *const u8) -> u64 {
        let mut hasher = AHasher::default();
        // SAFETY: value is initialized
        unsafe {
            match &self.kind {
                PropertyKind::Bool => (*value.cast::<bool>()).hash(&mut hasher),
                PropertyKind::Int => (*value.cast::<i64>()).hash(&mut hasher),
                PropertyKind::Float => {
                    float_hash_bits(*value.cast::<f64>()).hash(&mut hasher)
                }
                PropertyKind::Str => (*value.cast::<String>()).hash(&mut hasher),
                PropertyKind::Object => (*value.cast::<Option<ObjectRef>>()).hash(&mut hasher),
                PropertyKind::Struct(def) => return Descriptor::hash(&**def, value),
                PropertyKind::Array(inner) => {
                    let array = &*value.cast::<ScriptArray>();
                    array.len().hash(&mut hasher);
                    for i in 0..array.len() {
                        hasher.write_u64(Descriptor::hash(&**inner, array.get_raw_ptr(i)));
                    }
                }
                PropertyKind::Map(key_type, value_type) => {
                    let map = &*value.cast::<ScriptMap>();
                    map.len().hash(&mut hasher);
                    // slot order is not part of the value
                    let pairs = map.occupied_indices().fold(0u64, |sum, index| {
                        let key = Descriptor::hash(&**key_type, map.key_ptr(index));
                        let value = Descriptor::hash(&**value_type, map.value_ptr(index));
                        sum.wrapping_add(key.rotate_left(32) ^ value)
                    });
                    hasher.write_u64(pairs);
                }
            }
        }
        hasher.finish()
    }

    fn field_by_name(&self, name: &str) -> Option<FieldRef> {
        match &self.kind {
            PropertyKind::Struct(def) => def.field_by_name(name),
            _ => None,
        }
    }

    fn owner(&self) -> Option<ObjectRef> {
        match &self.kind {
            PropertyKind::Struct(def) => def.owner,
            PropertyKind::Array(inner) => inner.owner(),
            PropertyKind::Map(key, value) => key.owner().or_else(|| value.owner()),
            _ => None,
        }
    }

    unsafe fn trace(&self, value: *mut u8, collector: &mut dyn ReferenceCollector) -> bool {
        // SAFETY: value is initialized
        unsafe {
            match &self.kind {
                PropertyKind::Object => {
                    collector.add_referenced_object(&mut *value.cast::<Option<ObjectRef>>())
                }
                PropertyKind::Struct(def) => def.trace(value, collector),
                PropertyKind::Array(inner) if inner.has_object_references() => {
                    let array = &*value.cast::<ScriptArray>();
                    let mut nulled = false;
                    for i in 0..array.len() {
                        nulled |= inner.trace(array.get_raw_ptr(i), collector);
                    }
                    nulled
                }
                PropertyKind::Map(key_type, value_type) if self.has_object_references() => {
                    let map = &mut *value.cast::<ScriptMap>();
                    let (mut nulled, mut rekey) = (false, false);
                    for index in map.occupied_indices() {
                        if key_type.has_object_references() {
                            let key_nulled = key_type.trace(map.key_ptr(index), collector);
                            rekey |= key_nulled;
                            nulled |= key_nulled;
                        }
                        if value_type.has_object_references() {
                            nulled |= value_type.trace(map.value_ptr(index), collector);
                        }
                    }
                    // a nulled key hashes differently
                    if rekey {
                        map.rehash(&**key_type);
                    }
                    nulled
                }
                _ => false,
            }
        }
    }

    unsafe fn push_value(
        &self,
        vm: &mut dyn ScriptVm,
        value: *const u8,
        out: Option<i32>,
    ) -> Result<i32, ScriptError> {
        // SAFETY: value is initialized
        unsafe {
            match &self.kind {
                PropertyKind::Bool => vm.push_boolean(*value.cast::<bool>()),
                PropertyKind::Int => vm.push_integer(*value.cast::<i64>()),
                PropertyKind::Float => vm.push_number(*value.cast::<f64>()),
                PropertyKind::Str => vm.push_bytes((*value.cast::<String>()).as_bytes()),
                PropertyKind::Object => match *value.cast::<Option<ObjectRef>>() {
                    Some(object) => vm.push_userdata(Rc::new(ObjectHandle::new(object))),
                    None => vm.push_nil(),
                },
                PropertyKind::Struct(def) => return def.push_value(vm, value, out),
                PropertyKind::Array(inner) => {
                    ArrayProxy::push_copy(vm, inner.clone(), &*value.cast::<ScriptArray>());
                }
                PropertyKind::Map(key, map_value) => {
                    let map = &*value.cast::<ScriptMap>();
                    MapProxy::push_copy(vm, key.clone(), map_value.clone(), map);
                }
            }
        }
        Ok(1)
    }

    unsafe fn push_borrowed(
        &self,
        vm: &mut dyn ScriptVm,
        value: NonNull<u8>,
        out: Option<i32>,
        holder: &Rc<dyn Any>,
    ) -> Result<i32, ScriptError> {
        // SAFETY: `holder` keeps the container in place for the proxy's lifetime
        unsafe {
            match &self.kind {
                PropertyKind::Array(inner) => {
                    ArrayProxy::push_borrowed(vm, inner.clone(), value.cast(), holder.clone());
                }
                PropertyKind::Map(key, map_value) => {
                    let (key, map_value) = (key.clone(), map_value.clone());
                    MapProxy::push_borrowed(vm, key, map_value, value.cast(), holder.clone());
                }
                _ => return self.push_value(vm, value.as_ptr(), out),
            }
        }
        Ok(1)
    }

    unsafe fn check_value(
        &self,
        vm: &mut dyn ScriptVm,
        index: i32,
        dest: *mut u8,
    ) -> Result<(), ScriptError> {
        // SAFETY: dest is initialized
        unsafe {
            match &self.kind {
                PropertyKind::Bool => *dest.cast::<bool>() = vm.to_boolean(index),
                PropertyKind::Int => *dest.cast::<i64>() = check_integer(vm, index)?,
                PropertyKind::Float => {
                    *dest.cast::<f64>() = vm.to_number(index).ok_or_else(|| {
                        ScriptError::bad_argument(index, "number", vm.type_at(index))
                    })?
                }
                PropertyKind::Str => *dest.cast::<String>() = check_string(vm, index)?,
                PropertyKind::Object => {
                    let object = match vm.type_at(index) {
                        ScriptType::Nil => None,
                        _ => Some(check_userdata::<ObjectHandle>(vm, index, "Object")?.object()),
                    };
                    *dest.cast::<Option<ObjectRef>>() = object;
                }
                PropertyKind::Struct(def) => def.check_value(vm, index, dest)?,
                PropertyKind::Array(inner) => {
                    let proxy = check_userdata::<ArrayProxy>(vm, index, "Array")?;
                    if !same_element_kind(&**proxy.inner(), &**inner) {
                        return Err(self.mismatch());
                    }
                    proxy.copy_into(&**inner, &mut *dest.cast::<ScriptArray>())?;
                }
                PropertyKind::Map(key, value) => {
                    let proxy = check_userdata::<MapProxy>(vm, index, "Map")?;
                    if !same_element_kind(&**proxy.key_descriptor(), &**key)
                        || !same_element_kind(&**proxy.value_descriptor(), &**value)
                    {
                        return Err(self.mismatch());
                    }
                    proxy.copy_into(dest.cast::<ScriptMap>())?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StructField {
    pub name: String,
    pub property: Rc<Property>,
    pub offset: usize,
}

/// Aggregate host type: named fields laid out with natural alignment.
#[derive(Debug)]
pub struct StructDef {
    this: Weak<StructDef>,
    name: String,
    fields: Vec<StructField>,
    size: usize,
    align: usize,
    owner: Option<ObjectRef>,
    flags: DescriptorFlags,
}

#[derive(Debug)]
pub struct StructDefBuilder {
    name: String,
    fields: Vec<(String, Rc<Property>)>,
    owner: Option<ObjectRef>,
}

impl StructDefBuilder {
    pub fn field(mut self, name: impl Into<String>, property: Rc<Property>) -> Self {
        self.fields.push((name.into(), property));
        self
    }

    pub fn owner(mut self, owner: ObjectRef) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn build(self) -> Rc<StructDef> {
        let mut cursor: usize = 0;
        let mut align = 1;
        let mut flags = DescriptorFlags::AGGREGATE
            | DescriptorFlags::ZERO_CONSTRUCT
            | DescriptorFlags::NO_DESTRUCTOR;
        let fields = self
            .fields
            .into_iter()
            .map(|(name, property)| {
                let offset = cursor.next_multiple_of(property.alignment());
                cursor = offset + property.element_size();
                align = align.max(property.alignment());
                if !property.is_zero_constructible() {
                    flags.remove(DescriptorFlags::ZERO_CONSTRUCT);
                }
                if property.needs_destructor() {
                    flags.remove(DescriptorFlags::NO_DESTRUCTOR);
                }
                if property.has_object_references() {
                    flags.insert(DescriptorFlags::OBJECT_REFERENCE);
                }
                StructField {
                    name,
                    property,
                    offset,
                }
            })
            .collect();
        let size = cursor.next_multiple_of(align).max(1);
        Rc::new_cyclic(|this| StructDef {
            this: this.clone(),
            name: self.name,
            fields,
            size,
            align,
            owner: self.owner,
            flags,
        })
    }
}

impl StructDef {
    pub fn builder(name: impl Into<String>) -> StructDefBuilder {
        StructDefBuilder {
            name: name.into(),
            fields: Vec::new(),
            owner: None,
        }
    }

    pub fn fields(&self) -> &[StructField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|field| field.name == name)
    }
}

impl Descriptor for StructDef {
    fn name(&self) -> &str {
        &self.name
    }

    fn element_size(&self) -> usize {
        self.size
    }

    fn alignment(&self) -> usize {
        self.align
    }

    fn flags(&self) -> DescriptorFlags {
        self.flags
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    unsafe fn construct_in_place(&self, dest: *mut u8) {
        // SAFETY: every field lies within the struct's storage
        unsafe {
            if self.is_zero_constructible() {
                ptr::write_bytes(dest, 0, self.size);
                return;
            }
            for field in &self.fields {
                construct_items(&*field.property, dest.add(field.offset), 1);
            }
        }
    }

    unsafe fn destroy_in_place(&self, dest: *mut u8) {
        // SAFETY: every field is initialized
        unsafe {
            for field in &self.fields {
                destroy_items(&*field.property, dest.add(field.offset), 1);
            }
        }
    }

    unsafe fn copy_value(&self, dest: *mut u8, src: *const u8) {
        // SAFETY: both structs are initialized
        unsafe {
            for field in &self.fields {
                field.property.copy_value(dest.add(field.offset), src.add(field.offset));
            }
        }
    }

    unsafe fn identical(&self, a: *const u8, b: *const u8) -> bool {
        // SAFETY: both structs are initialized
        self.fields.iter().all(|field| unsafe {
            field.property.identical(a.add(field.offset), b.add(field.offset))
        })
    }

    unsafe fn hash(&self, value: *const u8) -> u64 {
        let mut hasher = AHasher::default();
        for field in &self.fields {
            // SAFETY: struct is initialized
            let field_hash =
                unsafe { Descriptor::hash(&*field.property, value.add(field.offset)) };
            hasher.write_u64(field_hash);
        }
        hasher.finish()
    }

    fn field_by_name(&self, name: &str) -> Option<FieldRef> {
        self.field(name).map(|field| FieldRef {
            descriptor: field.property.clone(),
            offset: field.offset,
        })
    }

    fn owner(&self) -> Option<ObjectRef> {
        self.owner
    }

    unsafe fn trace(&self, value: *mut u8, collector: &mut dyn ReferenceCollector) -> bool {
        let mut nulled = false;
        for field in self.fields.iter().filter(|field| field.property.has_object_references()) {
            // SAFETY: struct is initialized
            nulled |= unsafe { field.property.trace(value.add(field.offset), collector) };
        }
        nulled
    }

    unsafe fn push_value(
        &self,
        vm: &mut dyn ScriptVm,
        value: *const u8,
        out: Option<i32>,
    ) -> Result<i32, ScriptError> {
        if let Some(out) = out {
            let existing = vm
                .to_userdata(out)
                .and_then(downcast_userdata::<StructValue>)
                .filter(|existing| ptr::eq(Rc::as_ptr(existing.def()), self));
            if let Some(existing) = existing {
                // SAFETY: both structs are initialized
                unsafe { self.copy_value(existing.as_ptr(), value) };
                vm.push_value(out);
                return Ok(1);
            }
        }
        let def = self
            .this
            .upgrade()
            .ok_or_else(|| ScriptError::Runtime(format!("struct {} is gone", self.name)))?;
        // SAFETY: value is initialized
        let copy = unsafe { StructValue::copy_of(def, value) };
        vm.push_userdata(Rc::new(copy));
        Ok(1)
    }

    unsafe fn check_value(
        &self,
        vm: &mut dyn ScriptVm,
        index: i32,
        dest: *mut u8,
    ) -> Result<(), ScriptError> {
        let source = vm
            .to_userdata(index)
            .and_then(downcast_userdata::<StructValue>)
            .filter(|source| ptr::eq(Rc::as_ptr(source.def()), self))
            .ok_or_else(|| ScriptError::type_mismatch(self.name.clone(), vm.type_at(index)))?;
        // SAFETY: both structs are initialized
        unsafe { self.copy_value(dest, source.as_ptr()) };
        Ok(())
    }
}

/// A standalone struct value owned by the script side.
pub struct StructValue {
    def: Rc<StructDef>,
    buffer: crate::ValueBuffer,
}

impl StructValue {
    pub fn new(def: Rc<StructDef>) -> Self {
        let buffer = crate::ValueBuffer::new(def.clone());
        Self { def, buffer }
    }

    /// # Safety
    /// `src` holds an initialized value of `def`'s type.
    pub unsafe fn copy_of(def: Rc<StructDef>, src: *const u8) -> Self {
        // SAFETY: forwarded contract
        let buffer = unsafe { crate::ValueBuffer::copy_of(def.clone(), src) };
        Self { def, buffer }
    }

    pub fn def(&self) -> &Rc<StructDef> {
        &self.def
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.buffer.as_ptr()
    }

    pub fn identical(&self, other: &StructValue) -> bool {
        // SAFETY: both buffers hold initialized structs
        Rc::ptr_eq(&self.def, &other.def)
            && unsafe { self.def.identical(self.as_ptr(), other.as_ptr()) }
    }

    fn typed_field<T>(&self, name: &str, matches: fn(&PropertyKind) -> bool) -> Option<*mut T> {
        let field = self.def.field(name)?;
        matches(field.property.kind()).then(|| self.as_ptr().wrapping_add(field.offset).cast::<T>())
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        let field = self.typed_field::<i64>(name, |kind| matches!(kind, PropertyKind::Int))?;
        // SAFETY: the field is an initialized `i64`
        Some(unsafe { *field })
    }

    pub fn set_integer(&self, name: &str, value: i64) -> bool {
        self.typed_field::<i64>(name, |kind| matches!(kind, PropertyKind::Int))
            // SAFETY: the field is an initialized `i64`
            .map(|field| unsafe { *field = value })
            .is_some()
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        let field = self.typed_field::<f64>(name, |kind| matches!(kind, PropertyKind::Float))?;
        // SAFETY: the field is an initialized `f64`
        Some(unsafe { *field })
    }

    pub fn set_number(&self, name: &str, value: f64) -> bool {
        self.typed_field::<f64>(name, |kind| matches!(kind, PropertyKind::Float))
            // SAFETY: the field is an initialized `f64`
            .map(|field| unsafe { *field = value })
            .is_some()
    }

    pub fn string(&self, name: &str) -> Option<String> {
        let field = self.typed_field::<String>(name, |kind| matches!(kind, PropertyKind::Str))?;
        // SAFETY: the field is an initialized `String`
        Some(unsafe { (*field).clone() })
    }

    pub fn set_string(&self, name: &str, value: &str) -> bool {
        self.typed_field::<String>(name, |kind| matches!(kind, PropertyKind::Str))
            // SAFETY: the field is an initialized `String`
            .map(|field| unsafe { *field = value.to_owned() })
            .is_some()
    }

    pub fn object(&self, name: &str) -> Option<Option<ObjectRef>> {
        let field = self.typed_field::<Option<ObjectRef>>(name, |kind| {
            matches!(kind, PropertyKind::Object)
        })?;
        // SAFETY: the field is an initialized object reference
        Some(unsafe { *field })
    }

    pub fn set_object(&self, name: &str, value: Option<ObjectRef>) -> bool {
        self.typed_field::<Option<ObjectRef>>(name, |kind| matches!(kind, PropertyKind::Object))
            // SAFETY: the field is an initialized object reference
            .map(|field| unsafe { *field = value })
            .is_some()
    }
}

impl ScriptFinalizable for StructValue {
    fn type_name(&self) -> &'static str {
        STRUCT_TYPE_NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Script handle naming a struct type, passed to the container constructors.
pub struct StructType {
    def: Rc<StructDef>,
}

impl StructType {
    pub fn new(def: Rc<StructDef>) -> Self {
        Self { def }
    }

    pub fn def(&self) -> &Rc<StructDef> {
        &self.def
    }
}

impl ScriptFinalizable for StructType {
    fn type_name(&self) -> &'static str {
        "StructType"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Script handle to a host object.
#[derive(Debug)]
pub struct ObjectHandle {
    object: ObjectRef,
}

impl ObjectHandle {
    pub fn new(object: ObjectRef) -> Self {
        Self { object }
    }

    pub fn object(&self) -> ObjectRef {
        self.object
    }
}

impl ScriptFinalizable for ObjectHandle {
    fn type_name(&self) -> &'static str {
        "Object"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}
