use std::rc::{Rc, Weak};

use log::debug;

use crate::{
    ARRAY_METHODS, ARRAY_TYPE_NAME, BridgeCreateInfo, BridgeSettings, CollectibleRegistry,
    MAP_ENUMERATOR_TYPE_NAME, MAP_METHODS, MAP_TYPE_NAME, NativeFunction, STRUCT_METHODS,
    STRUCT_TYPE_NAME, ScriptVm, Traceable, methods,
};

/// State every proxy created inside one VM shares.
pub struct BridgeShared {
    pub settings: BridgeSettings,
    collectibles: Option<Rc<dyn CollectibleRegistry>>,
}

impl BridgeShared {
    pub fn register_collectible(&self, collectible: Weak<dyn Traceable>) {
        if let Some(registry) = &self.collectibles {
            registry.register_collectible(collectible);
        }
    }
}

/// Installs the container constructors and method tables into a VM.
pub struct Bridge {
    shared: Rc<BridgeShared>,
}

impl Bridge {
    pub fn new(info: &BridgeCreateInfo, collectibles: Option<Rc<dyn CollectibleRegistry>>) -> Self {
        Self {
            shared: Rc::new(BridgeShared {
                settings: BridgeSettings::new(info),
                collectibles,
            }),
        }
    }

    pub fn settings(&self) -> BridgeSettings {
        self.shared.settings
    }

    pub fn install(&self, vm: &mut dyn ScriptVm) {
        vm.set_bridge(self.shared.clone());
        let tables = [
            (ARRAY_TYPE_NAME, ARRAY_METHODS),
            (MAP_TYPE_NAME, MAP_METHODS),
            (STRUCT_TYPE_NAME, STRUCT_METHODS),
        ];
        for (type_name, table) in tables {
            for method in table {
                let function: NativeFunction = Rc::new(method.ptr);
                vm.set_method(type_name, method.name, function);
            }
        }
        let step: NativeFunction = Rc::new(methods::map::enumerate);
        vm.set_method(MAP_ENUMERATOR_TYPE_NAME, "Next", step);

        let array: NativeFunction = Rc::new(methods::array::construct);
        vm.push_function(array);
        vm.set_global(ARRAY_TYPE_NAME);
        let map: NativeFunction = Rc::new(methods::map::construct);
        vm.push_function(map);
        vm.set_global(MAP_TYPE_NAME);
        debug!(
            "installed {} array and {} map methods",
            ARRAY_METHODS.len(),
            MAP_METHODS.len()
        );
    }
}

pub(crate) fn settings_of(vm: &dyn ScriptVm) -> BridgeSettings {
    vm.bridge().map(|bridge| bridge.settings).unwrap_or_default()
}

pub(crate) fn register_collectible(vm: &dyn ScriptVm, collectible: Weak<dyn Traceable>) {
    if let Some(bridge) = vm.bridge() {
        bridge.register_collectible(collectible);
    }
}
