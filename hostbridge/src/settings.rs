/// Optional overrides for [`BridgeSettings`]; unset fields keep their defaults.
#[derive(Debug, Default, Clone)]
pub struct BridgeCreateInfo {
    // capacity kept by `Clear` on owned containers
    pub clear_slack: Option<usize>,
    // smallest array length that takes the low-garbage iteration path
    pub less_gc_min_len: Option<usize>,
    // whether `Map.Remove` marks the container dirty when the key was absent
    pub dirty_on_noop_remove: Option<bool>,
    // bucket count of freshly created owned maps
    pub map_initial_buckets: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    pub clear_slack: usize,
    pub less_gc_min_len: usize,
    pub dirty_on_noop_remove: bool,
    pub map_initial_buckets: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            clear_slack: 0,
            less_gc_min_len: 2,
            dirty_on_noop_remove: true,
            map_initial_buckets: 8,
        }
    }
}

impl BridgeSettings {
    pub fn new(info: &BridgeCreateInfo) -> Self {
        let mut settings = Self::default();
        info.clear_slack
            .inspect(|&val| settings.clear_slack = val);
        info.less_gc_min_len
            .inspect(|&val| settings.less_gc_min_len = val.max(1));
        info.dirty_on_noop_remove
            .inspect(|&val| settings.dirty_on_noop_remove = val);
        info.map_initial_buckets
            .inspect(|&val| settings.map_initial_buckets = val.next_power_of_two());
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_keep_defaults() {
        let settings = BridgeSettings::new(&BridgeCreateInfo {
            clear_slack: Some(16),
            ..Default::default()
        });
        assert_eq!(settings.clear_slack, 16);
        assert_eq!(settings.less_gc_min_len, 2);
        assert!(settings.dirty_on_noop_remove);
        assert_eq!(settings.map_initial_buckets, 8);
    }

    #[test]
    fn bucket_override_rounds_to_power_of_two() {
        let settings = BridgeSettings::new(&BridgeCreateInfo {
            map_initial_buckets: Some(12),
            less_gc_min_len: Some(0),
            ..Default::default()
        });
        assert_eq!(settings.map_initial_buckets, 16);
        assert_eq!(
            settings.less_gc_min_len, 1,
            "low-garbage threshold must never drop below one element"
        );
    }
}
