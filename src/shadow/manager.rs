//! Shadow caster registry
//!
//! Tracks the registered directional and omni-directional casters and a
//! single "shadow set out of date" flag. The flag goes true on any
//! registration change and is cleared only by an explicit
//! [`ShadowManager::set_shadow_textures_up_to_date`] from the composition
//! material rebuild path — never automatically.

use crate::shadow::{DirectionalShadow, OmniShadow};

/// Registration handle for a shadow caster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShadowId(u64);

pub struct ShadowManager<D = DirectionalShadow, O = OmniShadow> {
    directional: Vec<(ShadowId, D)>,
    omni: Vec<(ShadowId, O)>,
    next_id: u64,
    textures_up_to_date: bool,
}

impl<D, O> Default for ShadowManager<D, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, O> ShadowManager<D, O> {
    pub fn new() -> Self {
        Self {
            directional: Vec::new(),
            omni: Vec::new(),
            next_id: 1,
            textures_up_to_date: false,
        }
    }

    fn next_id(&mut self) -> ShadowId {
        let id = ShadowId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn register_directional(&mut self, caster: D) -> ShadowId {
        let id = self.next_id();
        self.directional.push((id, caster));
        self.textures_up_to_date = false;
        id
    }

    pub fn unregister_directional(&mut self, id: ShadowId) -> Option<D> {
        let index = self.directional.iter().position(|(i, _)| *i == id)?;
        self.textures_up_to_date = false;
        Some(self.directional.remove(index).1)
    }

    pub fn register_omni(&mut self, caster: O) -> ShadowId {
        let id = self.next_id();
        self.omni.push((id, caster));
        self.textures_up_to_date = false;
        id
    }

    pub fn unregister_omni(&mut self, id: ShadowId) -> Option<O> {
        let index = self.omni.iter().position(|(i, _)| *i == id)?;
        self.textures_up_to_date = false;
        Some(self.omni.remove(index).1)
    }

    pub fn directional_count(&self) -> usize {
        self.directional.len()
    }

    pub fn omni_count(&self) -> usize {
        self.omni.len()
    }

    pub fn directional(&self) -> impl Iterator<Item = &D> {
        self.directional.iter().map(|(_, c)| c)
    }

    pub fn directional_mut(&mut self) -> impl Iterator<Item = &mut D> {
        self.directional.iter_mut().map(|(_, c)| c)
    }

    pub fn omni(&self) -> impl Iterator<Item = &O> {
        self.omni.iter().map(|(_, c)| c)
    }

    pub fn omni_mut(&mut self) -> impl Iterator<Item = &mut O> {
        self.omni.iter_mut().map(|(_, c)| c)
    }

    pub fn shadow_textures_out_of_date(&self) -> bool {
        !self.textures_up_to_date
    }

    /// Acknowledges the current shadow set. Called by the composition
    /// material rebuild after it has re-baked shadow counts and rebound the
    /// shadow textures.
    pub fn set_shadow_textures_up_to_date(&mut self) {
        self.textures_up_to_date = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Caster types are irrelevant to registry behavior.
    type TestManager = ShadowManager<u32, u32>;

    #[test]
    fn registration_changes_set_out_of_date() {
        let mut manager = TestManager::new();
        assert!(manager.shadow_textures_out_of_date());

        let first = manager.register_directional(1);
        let _second = manager.register_directional(2);
        assert_eq!(manager.directional_count(), 2);

        manager.set_shadow_textures_up_to_date();
        assert!(!manager.shadow_textures_out_of_date());

        manager.unregister_directional(first);
        assert_eq!(manager.directional_count(), 1);
        assert!(manager.shadow_textures_out_of_date());
    }

    #[test]
    fn acknowledge_is_idempotent_until_topology_changes() {
        let mut manager = TestManager::new();
        manager.register_omni(7);

        assert!(manager.shadow_textures_out_of_date());
        manager.set_shadow_textures_up_to_date();
        assert!(!manager.shadow_textures_out_of_date());

        // Second acknowledge without a topology change stays clean
        manager.set_shadow_textures_up_to_date();
        assert!(!manager.shadow_textures_out_of_date());

        manager.register_omni(8);
        assert!(manager.shadow_textures_out_of_date());
    }

    #[test]
    fn unregister_unknown_id_is_a_no_op() {
        let mut manager = TestManager::new();
        let id = manager.register_directional(1);
        manager.unregister_directional(id);
        manager.set_shadow_textures_up_to_date();

        assert!(manager.unregister_directional(id).is_none());
        assert!(!manager.shadow_textures_out_of_date());
    }
}
