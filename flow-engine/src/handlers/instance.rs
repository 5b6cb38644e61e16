// Live Resource Instances
// Type-erased instances and the resolved bindings handed to step handlers

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Opaque instance value as stored by the lifecycle manager
pub type AnyInstance = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceAccessError {
    #[error("no resource bound as '{0}'")]
    Missing(String),

    #[error("resource bound as '{binding}' is not a {expected}")]
    WrongType {
        binding: String,
        expected: &'static str,
    },
}

/// A created resource together with the type information needed for binding checks
#[derive(Clone)]
pub struct ResourceInstance {
    resource_type: String,
    capabilities: Arc<BTreeSet<String>>,
    value: AnyInstance,
}

impl ResourceInstance {
    pub fn new(
        resource_type: impl Into<String>,
        capabilities: Arc<BTreeSet<String>>,
        value: AnyInstance,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            capabilities,
            value,
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Whether this instance can be bound where `tag` is required
    pub fn satisfies(&self, tag: &str) -> bool {
        self.resource_type == tag || self.capabilities.contains(tag)
    }

    pub fn value(&self) -> &AnyInstance {
        &self.value
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for ResourceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceInstance")
            .field("resource_type", &self.resource_type)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Resolved resource bindings for one step invocation
#[derive(Debug, Clone, Default)]
pub struct Resources {
    bindings: BTreeMap<String, ResourceInstance>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, binding: impl Into<String>, instance: ResourceInstance) {
        self.bindings.insert(binding.into(), instance);
    }

    pub fn instance(&self, binding: &str) -> Option<&ResourceInstance> {
        self.bindings.get(binding)
    }

    /// Typed access to a bound instance
    pub fn get<T: Send + Sync + 'static>(&self, binding: &str) -> Result<Arc<T>, ResourceAccessError> {
        let instance = self
            .bindings
            .get(binding)
            .ok_or_else(|| ResourceAccessError::Missing(binding.to_string()))?;
        instance
            .downcast::<T>()
            .ok_or_else(|| ResourceAccessError::WrongType {
                binding: binding.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(resource_type: &str, caps: &[&str], value: AnyInstance) -> ResourceInstance {
        ResourceInstance::new(
            resource_type,
            Arc::new(caps.iter().map(|c| c.to_string()).collect()),
            value,
        )
    }

    #[test]
    fn test_satisfies_by_type_or_capability() {
        let pg = instance("postgres", &["sql"], Arc::new(5u32));
        assert!(pg.satisfies("postgres"));
        assert!(pg.satisfies("sql"));
        assert!(!pg.satisfies("redis"));
    }

    #[test]
    fn test_typed_access() {
        let mut resources = Resources::new();
        resources.insert("counter", instance("counter", &[], Arc::new(7u32)));

        assert_eq!(*resources.get::<u32>("counter").unwrap(), 7);
        assert!(matches!(
            resources.get::<String>("counter"),
            Err(ResourceAccessError::WrongType { .. })
        ));
        assert_eq!(
            resources.get::<u32>("missing").unwrap_err(),
            ResourceAccessError::Missing("missing".to_string())
        );
    }
}
