// Handlers Module
// Step and resource handler traits plus the registry the engine dispatches through

pub mod instance;

pub use instance::{AnyInstance, ResourceAccessError, ResourceInstance, Resources};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Declared interface of a step type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepSchema {
    /// Output fields other nodes may reference as `...output.<field>`
    pub outputs: BTreeSet<String>,
    /// Resource binding name -> required resource type or capability tag
    pub resources: BTreeMap<String, String>,
}

impl StepSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(mut self, field: impl Into<String>) -> Self {
        self.outputs.insert(field.into());
        self
    }

    pub fn resource(mut self, binding: impl Into<String>, tag: impl Into<String>) -> Self {
        self.resources.insert(binding.into(), tag.into());
        self
    }
}

/// Declared interface of a resource type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Tags this resource satisfies besides its own type name
    pub capabilities: BTreeSet<String>,
}

impl ResourceSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.insert(tag.into());
        self
    }
}

/// A step type implementation
#[async_trait::async_trait]
pub trait Step: Send + Sync + 'static {
    /// Decoded argument structure
    type Input: DeserializeOwned + Send;
    /// Native result, converted into the graph's output value
    type Output: Serialize + Send;

    fn schema(&self) -> StepSchema {
        StepSchema::default()
    }

    /// The `onRun` hook
    async fn run(&self, resources: &Resources, input: Self::Input) -> anyhow::Result<Self::Output>;
}

/// A resource type implementation
#[async_trait::async_trait]
pub trait Resource: Send + Sync + 'static {
    type Input: DeserializeOwned + Send;
    type Instance: Send + Sync + 'static;

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::default()
    }

    async fn create(&self, input: Self::Input) -> anyhow::Result<Self::Instance>;

    async fn destroy(&self, instance: Arc<Self::Instance>) -> anyhow::Result<()>;
}

/// Failure while invoking a handler through the registry
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("failed to decode arguments: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode output: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("{0:#}")]
    Handler(anyhow::Error),
}

/// Type-erased step handler
#[async_trait::async_trait]
pub trait StepHandler: Send + Sync {
    fn schema(&self) -> &StepSchema;

    async fn invoke(&self, resources: &Resources, input: Value) -> Result<Value, InvokeError>;
}

/// Type-erased resource handler
#[async_trait::async_trait]
pub trait ResourceHandler: Send + Sync {
    fn schema(&self) -> &ResourceSchema;

    async fn create(&self, input: Value) -> Result<AnyInstance, InvokeError>;

    async fn destroy(&self, instance: AnyInstance) -> Result<(), InvokeError>;
}

struct StepAdapter<S> {
    inner: S,
    schema: StepSchema,
}

#[async_trait::async_trait]
impl<S: Step> StepHandler for StepAdapter<S> {
    fn schema(&self) -> &StepSchema {
        &self.schema
    }

    async fn invoke(&self, resources: &Resources, input: Value) -> Result<Value, InvokeError> {
        let input: S::Input = serde_json::from_value(input).map_err(InvokeError::Decode)?;
        let output = self
            .inner
            .run(resources, input)
            .await
            .map_err(InvokeError::Handler)?;
        serde_json::to_value(output).map_err(InvokeError::Encode)
    }
}

struct ResourceAdapter<R> {
    inner: R,
    schema: ResourceSchema,
}

#[async_trait::async_trait]
impl<R: Resource> ResourceHandler for ResourceAdapter<R> {
    fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    async fn create(&self, input: Value) -> Result<AnyInstance, InvokeError> {
        let input: R::Input = serde_json::from_value(input).map_err(InvokeError::Decode)?;
        let instance = self.inner.create(input).await.map_err(InvokeError::Handler)?;
        Ok(Arc::new(instance))
    }

    async fn destroy(&self, instance: AnyInstance) -> Result<(), InvokeError> {
        let instance = instance.downcast::<R::Instance>().map_err(|_| {
            InvokeError::Handler(anyhow::anyhow!(
                "instance is not a {}",
                std::any::type_name::<R::Instance>()
            ))
        })?;
        self.inner.destroy(instance).await.map_err(InvokeError::Handler)
    }
}

/// Registry of step and resource handlers keyed by type name
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    steps: HashMap<String, Arc<dyn StepHandler>>,
    resources: HashMap<String, Arc<dyn ResourceHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step type
    pub fn register_step<S: Step>(&mut self, type_name: impl Into<String>, step: S) {
        let schema = step.schema();
        self.steps.insert(
            type_name.into(),
            Arc::new(StepAdapter {
                inner: step,
                schema,
            }),
        );
    }

    /// Register a resource type
    pub fn register_resource<R: Resource>(&mut self, type_name: impl Into<String>, resource: R) {
        let schema = resource.schema();
        self.resources.insert(
            type_name.into(),
            Arc::new(ResourceAdapter {
                inner: resource,
                schema,
            }),
        );
    }

    pub fn with_step<S: Step>(mut self, type_name: impl Into<String>, step: S) -> Self {
        self.register_step(type_name, step);
        self
    }

    pub fn with_resource<R: Resource>(mut self, type_name: impl Into<String>, resource: R) -> Self {
        self.register_resource(type_name, resource);
        self
    }

    pub fn step(&self, type_name: &str) -> Option<&Arc<dyn StepHandler>> {
        self.steps.get(type_name)
    }

    pub fn resource(&self, type_name: &str) -> Option<&Arc<dyn ResourceHandler>> {
        self.resources.get(type_name)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut steps: Vec<_> = self.steps.keys().collect();
        let mut resources: Vec<_> = self.resources.keys().collect();
        steps.sort();
        resources.sort();
        f.debug_struct("HandlerRegistry")
            .field("steps", &steps)
            .field("resources", &resources)
            .finish()
    }
}
