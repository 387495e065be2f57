//! Static table of protected resources and their ceiling priorities

use std::collections::HashMap;
use std::fmt;

use crate::error::{ArbiterError, ConfigError};
use crate::Priority;

/// Identifier of a protected resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(&'static str);

impl ResourceId {
    pub const fn new(name: &'static str) -> Self {
        ResourceId(name)
    }

    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A resource definition. The ceiling never changes after it is defined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resource {
    pub id: ResourceId,
    pub ceiling: Priority,
}

/// Index of a resource inside its registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Slot(pub(crate) usize);

#[derive(Debug, Default, Clone)]
pub struct ResourceRegistry {
    resources: Vec<Resource>,
    index: HashMap<ResourceId, Slot>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a resource. The ceiling must be at least the highest base priority of any task
    /// that will ever acquire it; [`TaskSet::validate`](crate::harness::TaskSet::validate)
    /// checks this.
    pub fn define(&mut self, id: ResourceId, ceiling: Priority) -> Result<(), ConfigError> {
        if self.index.contains_key(&id) {
            return Err(ConfigError::DuplicateResource(id));
        }

        self.index.insert(id, Slot(self.resources.len()));
        self.resources.push(Resource { id, ceiling });

        Ok(())
    }

    /// Builder form of [`define`](Self::define)
    pub fn with(mut self, id: ResourceId, ceiling: Priority) -> Result<Self, ConfigError> {
        self.define(id, ceiling)?;
        Ok(self)
    }

    pub fn ceiling(&self, id: ResourceId) -> Result<Priority, ArbiterError> {
        self.get(id).map(|res| res.ceiling)
    }

    pub fn get(&self, id: ResourceId) -> Result<&Resource, ArbiterError> {
        self.slot(id).map(|slot| &self.resources[slot.0])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub(crate) fn slot(&self, id: ResourceId) -> Result<Slot, ArbiterError> {
        self.index
            .get(&id)
            .copied()
            .ok_or(ArbiterError::InvalidResource(id))
    }

    pub(crate) fn by_slot(&self, slot: Slot) -> &Resource {
        &self.resources[slot.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ResourceId = ResourceId::new("A");
    const B: ResourceId = ResourceId::new("B");

    #[test]
    fn lookup_defined_ceiling() {
        let registry = ResourceRegistry::new().with(A, 4).unwrap().with(B, 5).unwrap();

        assert_eq!(registry.ceiling(A).unwrap(), 4);
        assert_eq!(registry.ceiling(B).unwrap(), 5);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn undefined_resource_is_invalid() {
        let registry = ResourceRegistry::new().with(A, 4).unwrap();

        assert!(matches!(
            registry.ceiling(B),
            Err(ArbiterError::InvalidResource(id)) if id == B
        ));
    }

    #[test]
    fn duplicate_definition_rejected() {
        let mut registry = ResourceRegistry::new();
        registry.define(A, 4).unwrap();

        assert_eq!(registry.define(A, 5), Err(ConfigError::DuplicateResource(A)));
        assert_eq!(registry.ceiling(A).unwrap(), 4);
    }
}
