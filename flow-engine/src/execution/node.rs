// Graph Nodes
// Vertex type with atomic execution state, counters, and once-guards

use crate::address::Address;
use crate::config::{ResourceConfig, StepConfig};
use crate::expression::{EvalError, Expression};

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use thiserror::Error;

/// Whether a node is a unit of work or a shared dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Step,
    Resource,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Step => write!(f, "step"),
            NodeKind::Resource => write!(f, "resource"),
        }
    }
}

/// Execution status; transitions are Pending -> Running -> {Done | Failed},
/// or Pending -> Failed through a skip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeStatus {
    Pending = 0,
    Running = 1,
    Done = 2,
    Failed = 3,
}

impl NodeStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => NodeStatus::Pending,
            1 => NodeStatus::Running,
            2 => NodeStatus::Done,
            _ => NodeStatus::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Failed)
    }
}

/// Why a node ended in `Failed`
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NodeError {
    #[error("{hook} failed: {message}")]
    Handler { hook: &'static str, message: String },

    #[error("failed to decode arguments for {hook}: {message}")]
    Decode { hook: &'static str, message: String },

    #[error("failed to evaluate arguments: {0}")]
    Eval(#[from] EvalError),

    #[error("no handler registered for {kind} type '{type_name}'")]
    UnknownType { kind: NodeKind, type_name: String },

    #[error("binding '{binding}' must reference a resource address")]
    InvalidBinding { binding: String },

    #[error("binding '{binding}' is required but not declared in `uses`")]
    MissingBinding { binding: String },

    #[error("resource '{address}' bound as '{binding}' was never created")]
    MissingResource { binding: String, address: Address },

    #[error("resource bound as '{binding}' has type '{actual}', which does not satisfy '{required}'")]
    IncompatibleResource {
        binding: String,
        required: String,
        actual: String,
    },

    #[error("invalid repetition count: {0}")]
    InvalidCount(String),

    #[error("failed to expand instances: {0}")]
    Expansion(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("skipped due to upstream failure of {upstream}")]
    Skipped { upstream: Address },

    #[error("context cancelled")]
    Cancelled,
}

impl NodeError {
    /// Skip markers and cancellation are consequences of another failure
    pub fn is_symptom(&self) -> bool {
        matches!(self, NodeError::Skipped { .. } | NodeError::Cancelled)
    }
}

/// Immutable declaration a node was created from
#[derive(Debug, Clone)]
pub enum NodeConfig {
    Step(Arc<StepConfig>),
    Resource(Arc<ResourceConfig>),
}

impl NodeConfig {
    pub fn type_name(&self) -> &str {
        match self {
            NodeConfig::Step(step) => &step.step_type,
            NodeConfig::Resource(resource) => &resource.resource_type,
        }
    }

    /// Every expression the node carries, excluding a placeholder count
    pub fn expressions(&self) -> Vec<&Expression> {
        match self {
            NodeConfig::Step(step) => step.args.values().chain(step.uses.values()).collect(),
            NodeConfig::Resource(resource) => resource.args.values().collect(),
        }
    }

    pub fn depends_on(&self) -> &[String] {
        match self {
            NodeConfig::Step(step) => &step.depends_on,
            NodeConfig::Resource(resource) => &resource.depends_on,
        }
    }
}

/// How a node relates to its declaration's repetition count
#[derive(Debug, Clone, PartialEq)]
pub enum Instance {
    /// No count declared
    Single,
    /// One of `count` statically known instances
    Indexed { index: usize, count: usize },
    /// Count depends on another node's output; expanded at run time
    Placeholder { count: Expression },
    /// Materialized from a placeholder at run time
    Expanded { index: usize },
}

impl Instance {
    pub fn index(&self) -> Option<usize> {
        match self {
            Instance::Indexed { index, .. } | Instance::Expanded { index } => Some(*index),
            Instance::Single | Instance::Placeholder { .. } => None,
        }
    }
}

/// One vertex of the execution graph
pub struct Node {
    address: Address,
    config: NodeConfig,
    instance: Instance,
    status: AtomicU8,
    dependency_count: AtomicUsize,
    descendant_count: AtomicUsize,
    last_error: Mutex<Option<NodeError>>,
    output: OnceLock<Value>,
    expansion: OnceLock<Vec<Address>>,
    destroyed: AtomicBool,
    skipped: AtomicBool,
}

impl Node {
    pub fn new(address: Address, config: NodeConfig, instance: Instance) -> Self {
        Self {
            address,
            config,
            instance,
            status: AtomicU8::new(NodeStatus::Pending as u8),
            dependency_count: AtomicUsize::new(0),
            descendant_count: AtomicUsize::new(0),
            last_error: Mutex::new(None),
            output: OnceLock::new(),
            expansion: OnceLock::new(),
            destroyed: AtomicBool::new(false),
            skipped: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn kind(&self) -> NodeKind {
        match self.config {
            NodeConfig::Step(_) => NodeKind::Step,
            NodeConfig::Resource(_) => NodeKind::Resource,
        }
    }

    pub fn type_name(&self) -> &str {
        self.config.type_name()
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.instance, Instance::Placeholder { .. })
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn transition(&self, from: NodeStatus, to: NodeStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Pending -> Running; false if the node already left Pending
    pub fn try_start(&self) -> bool {
        self.transition(NodeStatus::Pending, NodeStatus::Running)
    }

    /// Running -> Done, publishing the output first
    pub fn complete(&self, output: Option<Value>) -> bool {
        if let Some(output) = output {
            let _ = self.output.set(output);
        }
        self.transition(NodeStatus::Running, NodeStatus::Done)
    }

    /// Running -> Failed with the given error.
    ///
    /// The error is recorded only when the transition happens; a node that
    /// already finished keeps its outcome.
    pub fn fail(&self, error: NodeError) -> bool {
        // Held across the transition so readers never see Failed without its error
        let mut slot = self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.transition(NodeStatus::Running, NodeStatus::Failed) {
            return false;
        }
        *slot = Some(error);
        true
    }

    /// Pending -> Failed for nodes that will never run.
    ///
    /// Returns true for exactly one caller, however many propagation paths
    /// reach this node; that caller owns the outstanding-work decrement.
    pub fn skip(&self, error: NodeError) -> bool {
        if self.skipped.swap(true, Ordering::AcqRel) {
            return false;
        }
        if !self.transition(NodeStatus::Pending, NodeStatus::Failed) {
            return false;
        }
        self.set_error(error);
        true
    }

    fn set_error(&self, error: NodeError) {
        let mut slot = self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(error);
    }

    pub fn error(&self) -> Option<NodeError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.get()
    }

    pub fn dependency_count(&self) -> usize {
        self.dependency_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_dependency_count(&self, count: usize) {
        self.dependency_count.store(count, Ordering::Release);
    }

    pub(crate) fn add_dependencies(&self, count: usize) {
        self.dependency_count.fetch_add(count, Ordering::AcqRel);
    }

    /// Decrement the unmet-dependency counter, returning the new value
    pub(crate) fn decrement_dependencies(&self) -> usize {
        decrement(&self.dependency_count)
    }

    pub fn descendant_count(&self) -> usize {
        self.descendant_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_descendant_count(&self, count: usize) {
        self.descendant_count.store(count, Ordering::Release);
    }

    pub(crate) fn add_descendants(&self, count: usize) {
        self.descendant_count.fetch_add(count, Ordering::AcqRel);
    }

    /// Decrement the step-dependent counter, returning the new value
    pub(crate) fn decrement_descendants(&self) -> usize {
        decrement(&self.descendant_count)
    }

    /// Claim the destroy-once guard; true for the first caller only
    pub(crate) fn claim_destroy(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Addresses materialized from this placeholder, once expanded
    pub fn expansion(&self) -> Option<&[Address]> {
        self.expansion.get().map(Vec::as_slice)
    }

    pub(crate) fn set_expansion(&self, instances: Vec<Address>) {
        let _ = self.expansion.set(instances);
    }

    pub fn step_config(&self) -> Option<&StepConfig> {
        match &self.config {
            NodeConfig::Step(step) => Some(step),
            NodeConfig::Resource(_) => None,
        }
    }

    pub fn resource_config(&self) -> Option<&ResourceConfig> {
        match &self.config {
            NodeConfig::Resource(resource) => Some(resource),
            NodeConfig::Step(_) => None,
        }
    }
}

fn decrement(counter: &AtomicUsize) -> usize {
    match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1)) {
        Ok(previous) => previous - 1,
        Err(_) => 0,
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("kind", &self.kind())
            .field("instance", &self.instance)
            .field("status", &self.status())
            .field("dependency_count", &self.dependency_count())
            .field("descendant_count", &self.descendant_count())
            .finish()
    }
}
