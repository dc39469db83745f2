use std::{process, rc::Rc};

use clap::Parser as ClapParser;
use log::{error, info};

use hostbridge::{
    Bridge, BridgeCreateInfo, CollectibleRegistry, ObjectHeap, Property, PropertyClass,
    ScriptError, ScriptValue, StackVm, StackVmCreateInfo, StructDef, StructType, StructValue,
    downcast_userdata,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long, default_value_t = 8, help = "Number of struct elements to add")]
    elements: usize,

    #[arg(long, help = "Iterate from the last element down")]
    reverse: bool,

    /// Copy every element into one reused script value
    #[arg(long, help = "Iterate with PairsLessGC")]
    less_gc: bool,

    #[arg(long, help = "Capacity kept when the array is cleared")]
    clear_slack: Option<usize>,
}

fn print_targets(
    vm: &mut StackVm,
    heap: &ObjectHeap,
    array: &ScriptValue,
    cli: &Cli,
) -> Result<(), ScriptError> {
    let method = if cli.less_gc { "PairsLessGC" } else { "Pairs" };
    let args = [ScriptValue::Boolean(cli.reverse)];
    let steps = vm.for_each_pair(array, method, &args, |index, value| {
        let Some(target) = value.as_userdata().and_then(downcast_userdata::<StructValue>) else {
            return;
        };
        let id = target.integer("id").unwrap_or_default();
        let actor = target
            .object("actor")
            .flatten()
            .and_then(|actor| heap.name(actor))
            .unwrap_or_else(|| "none".to_owned());
        println!("  [{}] id={id} actor={actor}", index.as_integer().unwrap_or_default());
    })?;
    println!("{steps} elements via {method}");
    Ok(())
}

fn run(cli: &Cli) -> Result<(), ScriptError> {
    let heap = ObjectHeap::new();
    let type_owner = heap.allocate("TargetType");
    heap.add_root(type_owner);
    let target = StructDef::builder("Target")
        .field("id", Property::int())
        .field("actor", Property::object())
        .owner(type_owner)
        .build();

    let collectibles: Rc<dyn CollectibleRegistry> = heap.clone();
    let bridge = Bridge::new(
        &BridgeCreateInfo {
            clear_slack: cli.clear_slack,
            ..Default::default()
        },
        Some(collectibles),
    );
    let mut vm = StackVm::new(&StackVmCreateInfo::default());
    bridge.install(&mut vm);

    let struct_type = ScriptValue::userdata(Rc::new(StructType::new(target.clone())));
    let array = vm
        .call_global("Array", &[ScriptValue::Integer(PropertyClass::Struct.tag()), struct_type])?
        .into_iter()
        .next()
        .unwrap_or_default();

    let mut actors = Vec::with_capacity(cli.elements);
    for id in 0..cli.elements {
        let actor = heap.allocate(format!("Actor{id}"));
        let value = StructValue::new(target.clone());
        value.set_integer("id", id as i64);
        value.set_object("actor", Some(actor));
        vm.call_method(&array, "Add", &[ScriptValue::userdata(Rc::new(value))])?;
        actors.push(actor);
    }
    info!("created {} targets", actors.len());
    print_targets(&mut vm, &heap, &array, cli)?;

    for &actor in actors.iter().step_by(3) {
        heap.mark_pending_kill(actor);
    }
    let stats = heap.collect_garbage();
    println!(
        "collected: {} collectibles, {} marked, {} nulled, {} freed",
        stats.collectibles, stats.marked, stats.nulled, stats.freed
    );
    print_targets(&mut vm, &heap, &array, cli)?;

    vm.call_method(&array, "Clear", &[])?;
    let num = vm.call_method(&array, "Num", &[])?;
    println!("after clear: {}", num.first().and_then(ScriptValue::as_integer).unwrap_or_default());
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        error!("{err}");
        process::exit(1);
    }
}
