// Workflow Configuration Models
// Format-agnostic declarations of steps, resources, and engine settings

use crate::address::Address;
use crate::expression::Expression;

use serde::Deserialize;
use std::collections::BTreeMap;

/// Worker count used when neither config nor the host reports one
const FALLBACK_WORKERS: usize = 4;

/// Root workflow declaration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowConfig {
    /// Stateless units of work
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// Shared dependencies with an explicit create/destroy lifecycle
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,

    /// Engine tuning
    #[serde(default)]
    pub engine: EngineConfig,
}

impl WorkflowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: StepConfig) -> Self {
        self.steps.push(step);
        self
    }

    pub fn resource(mut self, resource: ResourceConfig) -> Self {
        self.resources.push(resource);
        self
    }
}

/// A step declaration
#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    /// Handler type name, looked up in the registry
    #[serde(rename = "type")]
    pub step_type: String,

    /// Instance name, unique per type
    pub name: String,

    /// Argument name -> unevaluated expression
    #[serde(default)]
    pub args: BTreeMap<String, Expression>,

    /// Explicit dependency addresses (`step.t.n`, `step.t.n[1]`, `resource.t.n`)
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Repetition count; absent means a single unindexed instance
    #[serde(default)]
    pub count: Option<Expression>,

    /// Resource binding name -> expression referencing a resource address
    #[serde(default)]
    pub uses: BTreeMap<String, Expression>,
}

impl StepConfig {
    pub fn new(step_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            name: name.into(),
            args: BTreeMap::new(),
            depends_on: Vec::new(),
            count: None,
            uses: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, name: impl Into<String>, expr: Expression) -> Self {
        self.args.insert(name.into(), expr);
        self
    }

    pub fn depends_on(mut self, address: impl Into<String>) -> Self {
        self.depends_on.push(address.into());
        self
    }

    pub fn count(mut self, expr: Expression) -> Self {
        self.count = Some(expr);
        self
    }

    pub fn uses(mut self, binding: impl Into<String>, expr: Expression) -> Self {
        self.uses.insert(binding.into(), expr);
        self
    }

    /// Address of the unindexed (or placeholder) node for this step
    pub fn address(&self) -> Address {
        Address::step(&self.step_type, &self.name, None)
    }
}

/// A resource declaration
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    #[serde(rename = "type")]
    pub resource_type: String,

    pub name: String,

    #[serde(default)]
    pub args: BTreeMap<String, Expression>,

    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceConfig {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            args: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn arg(mut self, name: impl Into<String>, expr: Expression) -> Self {
        self.args.insert(name.into(), expr);
        self
    }

    pub fn depends_on(mut self, address: impl Into<String>) -> Self {
        self.depends_on.push(address.into());
        self
    }

    pub fn address(&self) -> Address {
        Address::resource(&self.resource_type, &self.name)
    }
}

/// Engine settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Worker pool size (0 = derive from available parallelism)
    #[serde(default)]
    pub workers: usize,
}

impl EngineConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self { workers }
    }

    /// Effective pool size, never zero
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(FALLBACK_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_builder() {
        let step = StepConfig::new("http", "fetch")
            .arg("url", Expression::literal("https://example.com"))
            .depends_on("resource.db.main")
            .count(Expression::literal(3));

        assert_eq!(step.address().to_string(), "step.http.fetch");
        assert_eq!(step.args.len(), 1);
        assert_eq!(step.depends_on, vec!["resource.db.main"]);
        assert!(step.count.is_some());
    }

    #[test]
    fn test_worker_count_defaults() {
        assert_eq!(EngineConfig::with_workers(3).worker_count(), 3);
        assert!(EngineConfig::default().worker_count() >= 1);
    }
}
