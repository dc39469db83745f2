use std::rc::Rc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use hostbridge::{
    Bridge, BridgeCreateInfo, Property, PropertyClass, ScriptValue, StackVm, StackVmCreateInfo,
    StructDef, StructType, StructValue,
};

const ELEMENTS: usize = 1000;

fn setup() -> (StackVm, ScriptValue) {
    let mut vm = StackVm::new(&StackVmCreateInfo::default());
    Bridge::new(&BridgeCreateInfo::default(), None).install(&mut vm);
    let point = StructDef::builder("Point")
        .field("x", Property::int())
        .field("y", Property::float())
        .build();
    let struct_type = ScriptValue::userdata(Rc::new(StructType::new(point.clone())));
    let array = vm
        .call_global("Array", &[ScriptValue::Integer(PropertyClass::Struct.tag()), struct_type])
        .expect("struct arrays are supported")
        .remove(0);
    for i in 0..ELEMENTS {
        let value = StructValue::new(point.clone());
        value.set_integer("x", i as i64);
        vm.call_method(&array, "Add", &[ScriptValue::userdata(Rc::new(value))])
            .expect("add point");
    }
    (vm, array)
}

fn bench_iteration(c: &mut Criterion) {
    let (mut vm, array) = setup();
    for method in ["Pairs", "PairsLessGC"] {
        c.bench_function(&format!("{method}_{ELEMENTS}"), |b| {
            b.iter(|| {
                let mut sum = 0;
                vm.for_each_pair(&array, method, &[], |index, _| {
                    sum += index.as_integer().unwrap_or_default();
                })
                .expect("iteration succeeds");
                black_box(sum)
            })
        });
    }
}

criterion_group!(benches, bench_iteration);
criterion_main!(benches);
