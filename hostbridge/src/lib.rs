mod bridge;
mod descriptor;
mod error;
mod function;
mod heap;
mod methods;
mod objects;
mod property;
mod proxies;
mod replication;
mod settings;
mod stack;
mod tagged;
mod var;
mod visitor;
mod vm;

pub use bridge::{Bridge, BridgeShared};
pub use descriptor::*;
pub use error::ScriptError;
pub use function::*;
pub use heap::{GarbageCollectionStats, MarkCollector, ObjectHeap, ObjectRef, ObjectState};
pub use methods::{
    ARRAY_METHODS, MAP_ENUMERATOR_TYPE_NAME, MAP_METHODS, MapEnumerator, MethodFunction,
    ProxyMethod, STRUCT_METHODS,
};
pub use objects::*;
pub use property::*;
pub use proxies::*;
pub use replication::*;
pub use settings::{BridgeCreateInfo, BridgeSettings};
pub use stack::*;
pub use tagged::*;
pub use var::*;
pub use visitor::{CollectibleRegistry, ReferenceCollector, Traceable};
pub use vm::*;
