use std::rc::Weak;

use crate::ObjectRef;

/// Host collector side of a trace step.
pub trait ReferenceCollector {
    /// Report one embedded object reference.
    /// Returns `true` when the collector nulled the reference because the
    /// object is gone; the caller must then drop whatever held it.
    fn add_referenced_object(&mut self, object: &mut Option<ObjectRef>) -> bool;
}

/// Anything the host collector asks to report the objects it keeps alive.
pub trait Traceable {
    fn add_referenced_objects(&self, collector: &mut dyn ReferenceCollector);

    fn referencer_name(&self) -> &'static str;
}

pub trait CollectibleRegistry {
    /// Dead weak entries are dropped by the registry on its next collection.
    fn register_collectible(&self, collectible: Weak<dyn Traceable>);
}
