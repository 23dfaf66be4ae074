use serde::{Deserialize, Serialize};

use super::{counter::VersionCounter, lww::LwwRegister, or_set::{Element, OrSet}};
use crate::{codec, ContextMap};

/// Durable replicated state of one context.
///
/// Three independent CRDTs composed only at read time: the version counter is
/// diagnostic, the OR-Set accumulates fields with observed-remove semantics,
/// and the register overlays the latest whole-context snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextState {
    #[serde(default)]
    pub version_counter: VersionCounter,
    #[serde(default)]
    pub or_set: OrSet,
    #[serde(default)]
    pub lww_register: LwwRegister,
}

impl ContextState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Structural join with another replica's state. Returns true if the
    /// local state changed.
    pub fn merge(&mut self, other: &ContextState) -> bool {
        let counter_changed = self.version_counter.merge(&other.version_counter);
        let set_changed = self.or_set.merge(&other.or_set);
        let register_changed = self.lww_register.merge(&other.lww_register);
        counter_changed || set_changed || register_changed
    }

    /// Live OR-Set elements folded into a map, overlaid with the register.
    ///
    /// A register field only overlays a key that still has a live element no
    /// newer than the register. Removed keys stay removed and a later field
    /// write is never masked by an older snapshot.
    pub fn resolve(&self) -> ContextMap {
        let live: Vec<&Element> = self.or_set.live().collect();
        let mut resolved = codec::fold(live.iter().copied());
        let Some(register) = self.lww_register.get() else {
            return resolved;
        };

        for (key, value) in &register.value {
            let newest = live
                .iter()
                .filter(|element| element.key == *key)
                .map(|element| element.timestamp)
                .max();
            if newest.is_some_and(|timestamp| register.timestamp >= timestamp) {
                resolved.insert(key.clone(), value.clone());
            }
        }
        resolved
    }

    /// Largest element or register timestamp in this state
    pub fn max_timestamp(&self) -> u64 {
        self.or_set
            .max_timestamp()
            .max(self.lww_register.timestamp())
    }
}
