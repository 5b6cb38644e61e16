// Workflow Executor
// Ready-queue worker pool driving the graph to completion

use super::builder::{expand_placeholder, GraphBuilder};
use super::context;
use super::events::{EventSender, ExecutionEvent, ProgressSender};
use super::graph::{BuildError, Graph};
use super::node::{Instance, Node, NodeError, NodeKind, NodeStatus};
use super::resources::{panic_message, ResourceManager};
use crate::address::Address;
use crate::config::{EngineConfig, StepConfig, WorkflowConfig};
use crate::expression::{Evaluator, Expression, PathEvaluator};
use crate::handlers::{
    HandlerRegistry, InvokeError, ResourceInstance, Resources, StepSchema,
};

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A node that ended in `Failed`, with the reason
#[derive(Debug, Clone, PartialEq)]
pub struct FailedNode {
    pub address: Address,
    pub error: NodeError,
}

impl fmt::Display for FailedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.address, self.error)
    }
}

/// Outcome of an unsuccessful run
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// At least one node failed on its own; `root` is the first such failure
    #[error("{} node(s) failed: {}", .failed.len(), list(.failed))]
    NodesFailed {
        failed: Vec<FailedNode>,
        #[source]
        root: NodeError,
    },

    /// Every failure was a consequence of cancellation
    #[error("execution cancelled; {} node(s) did not run", .nodes.len())]
    Cancelled { nodes: Vec<Address> },

    #[error("this engine has already executed its graph")]
    AlreadyExecuted,
}

impl ExecutionError {
    /// Every node that ended in `Failed`
    pub fn failed_nodes(&self) -> Vec<&Address> {
        match self {
            ExecutionError::NodesFailed { failed, .. } => {
                failed.iter().map(|f| &f.address).collect()
            }
            ExecutionError::Cancelled { nodes } => nodes.iter().collect(),
            ExecutionError::AlreadyExecuted => Vec::new(),
        }
    }

    /// Nodes whose own work failed, excluding skipped and cancelled ones
    pub fn root_causes(&self) -> Vec<&FailedNode> {
        match self {
            ExecutionError::NodesFailed { failed, .. } => {
                failed.iter().filter(|f| !f.error.is_symptom()).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn list(failed: &[FailedNode]) -> String {
    failed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Runs a built graph with a fixed pool of workers
pub struct Engine {
    graph: Arc<Graph>,
    registry: Arc<HandlerRegistry>,
    evaluator: Arc<dyn Evaluator>,
    config: EngineConfig,
    event_tx: Option<ProgressSender>,
    executed: AtomicBool,
}

impl Engine {
    pub fn new(graph: Graph, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            graph: Arc::new(graph),
            registry,
            evaluator: Arc::new(PathEvaluator),
            config: EngineConfig::default(),
            event_tx: None,
            executed: AtomicBool::new(false),
        }
    }

    /// Build the workflow's graph and adopt its engine settings
    pub fn from_workflow(
        workflow: &WorkflowConfig,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self, BuildError> {
        let graph = GraphBuilder::new(&registry).build(workflow)?;
        Ok(Self::new(graph, registry).with_config(workflow.engine.clone()))
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Execute the graph to completion
    pub async fn execute(&self) -> Result<(), ExecutionError> {
        self.execute_with_cancellation(CancellationToken::new())
            .await
    }

    /// Execute the graph, skipping not-yet-started nodes once `token` is cancelled.
    ///
    /// Always waits for in-flight handlers and destroys every live resource
    /// before returning, whatever the outcome.
    pub async fn execute_with_cancellation(
        &self,
        token: CancellationToken,
    ) -> Result<(), ExecutionError> {
        if self.executed.swap(true, Ordering::AcqRel) {
            return Err(ExecutionError::AlreadyExecuted);
        }

        let start = Instant::now();
        let workers = self.config.worker_count();
        let run = Arc::new(Run::new(
            self.graph.clone(),
            self.registry.clone(),
            self.evaluator.clone(),
            self.event_tx.clone(),
            token.child_token(),
        ));

        tracing::info!(nodes = self.graph.len(), workers, "starting workflow execution");
        self.event_tx
            .send_event(ExecutionEvent::run_started(self.graph.len(), workers));

        run.seed();

        let handles: Vec<_> = (0..workers)
            .map(|id| tokio::spawn(run.clone().worker(id)))
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker terminated abnormally");
                self.event_tx
                    .send_event(ExecutionEvent::error(format!("worker terminated abnormally: {}", e)));
            }
        }

        run.destroys.close();
        run.destroys.wait().await;
        run.resources.shutdown().await;

        let result = run.outcome();
        let failed = match &result {
            Ok(()) => 0,
            Err(e) => e.failed_nodes().len(),
        };

        tracing::info!(
            success = result.is_ok(),
            failed,
            duration_ms = start.elapsed().as_millis() as u64,
            "workflow execution finished"
        );
        self.event_tx.send_event(ExecutionEvent::run_completed(
            result.is_ok(),
            failed,
            start.elapsed(),
        ));

        result
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("nodes", &self.graph.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Shared state of one execution
struct Run {
    graph: Arc<Graph>,
    registry: Arc<HandlerRegistry>,
    evaluator: Arc<dyn Evaluator>,
    resources: ResourceManager,
    event_tx: Option<ProgressSender>,
    ready_tx: mpsc::UnboundedSender<Arc<Node>>,
    ready_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Node>>>,
    /// Nodes not yet in a terminal state
    outstanding: AtomicUsize,
    /// Fires once outstanding work reaches zero; closes the queue for every worker
    drained: CancellationToken,
    /// Fires on the first failure or on external cancellation
    cancel: CancellationToken,
    /// Eager destroys still in flight
    destroys: TaskTracker,
    /// Addresses of nodes whose own work failed, in the order they failed
    failures: Mutex<Vec<Address>>,
}

impl Run {
    fn new(
        graph: Arc<Graph>,
        registry: Arc<HandlerRegistry>,
        evaluator: Arc<dyn Evaluator>,
        event_tx: Option<ProgressSender>,
        cancel: CancellationToken,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let outstanding = graph.len();
        let drained = CancellationToken::new();
        if outstanding == 0 {
            drained.cancel();
        }

        Self {
            graph,
            registry,
            evaluator,
            resources: ResourceManager::new(event_tx.clone()),
            event_tx,
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            outstanding: AtomicUsize::new(outstanding),
            drained,
            cancel,
            destroys: TaskTracker::new(),
            failures: Mutex::new(Vec::new()),
        }
    }

    fn seed(&self) {
        for node in self.graph.nodes() {
            if node.dependency_count() == 0 {
                self.enqueue(node);
            }
        }
    }

    fn enqueue(&self, node: Arc<Node>) {
        // The receiver lives as long as the run, so sending cannot fail here
        let _ = self.ready_tx.send(node);
    }

    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.cancel();
        }
    }

    async fn worker(self: Arc<Self>, id: usize) {
        tracing::debug!(worker = id, "worker started");

        loop {
            let next = {
                let mut rx = self.ready_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.drained.cancelled() => None,
                    node = rx.recv() => node,
                }
            };
            let Some(node) = next else {
                break;
            };

            if self.cancel.is_cancelled() {
                if node.skip(NodeError::Cancelled) {
                    tracing::debug!(node = %node.address(), "skipped after cancellation");
                    self.event_tx
                        .send_event(ExecutionEvent::node_skipped(node.address(), NodeError::Cancelled));
                    self.propagate_skip(node.address());
                    self.finish_one();
                }
                continue;
            }

            self.clone().dispatch(node).await;
        }

        tracing::debug!(worker = id, "worker stopped");
    }

    async fn dispatch(self: Arc<Self>, node: Arc<Node>) {
        if !node.try_start() {
            return;
        }

        tracing::debug!(node = %node.address(), kind = %node.kind(), "node started");
        self.event_tx
            .send_event(ExecutionEvent::node_started(node.address(), node.kind()));
        let start = Instant::now();

        // A separate task turns a panicking handler into a node failure
        let task = tokio::spawn({
            let run = self.clone();
            let node = node.clone();
            async move { run.execute_node(&node).await }
        });
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(NodeError::Panicked(panic_message(e))),
        };

        match result {
            Ok(output) => self.on_success(&node, output, start),
            Err(error) => self.on_failure(&node, error),
        }
    }

    async fn execute_node(&self, node: &Arc<Node>) -> Result<Option<Value>, NodeError> {
        match node.kind() {
            NodeKind::Resource => self.create_resource(node).await.map(|()| None),
            NodeKind::Step if node.is_placeholder() => self.expand(node).map(|()| None),
            NodeKind::Step => self.run_step(node).await.map(Some),
        }
    }

    async fn create_resource(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        let Some(config) = node.resource_config() else {
            return Err(NodeError::UnknownType {
                kind: NodeKind::Resource,
                type_name: node.type_name().to_string(),
            });
        };
        let handler = self
            .registry
            .resource(&config.resource_type)
            .ok_or_else(|| NodeError::UnknownType {
                kind: NodeKind::Resource,
                type_name: config.resource_type.clone(),
            })?;

        let ctx = context::assemble(&self.graph, node);
        let input = self.evaluator.evaluate_args(&config.args, &ctx)?;
        let value = handler
            .create(input)
            .await
            .map_err(|e| hook_error("create", e))?;

        let instance = ResourceInstance::new(
            config.resource_type.clone(),
            Arc::new(handler.schema().capabilities.clone()),
            value,
        );
        self.resources
            .register(node.clone(), handler.clone(), instance);
        Ok(())
    }

    async fn run_step(&self, node: &Node) -> Result<Value, NodeError> {
        let Some(config) = node.step_config() else {
            return Err(NodeError::UnknownType {
                kind: NodeKind::Step,
                type_name: node.type_name().to_string(),
            });
        };
        let handler = self
            .registry
            .step(&config.step_type)
            .ok_or_else(|| NodeError::UnknownType {
                kind: NodeKind::Step,
                type_name: config.step_type.clone(),
            })?;

        let ctx = context::assemble(&self.graph, node);
        let input = self.evaluator.evaluate_args(&config.args, &ctx)?;
        let resources = self.bind_resources(config, handler.schema())?;

        handler
            .invoke(&resources, input)
            .await
            .map_err(|e| hook_error("run", e))
    }

    /// Resolve `uses` bindings to live instances and check them against the step's requirements
    fn bind_resources(
        &self,
        config: &StepConfig,
        schema: &StepSchema,
    ) -> Result<Resources, NodeError> {
        let mut resources = Resources::new();

        for (binding, expr) in &config.uses {
            let address = match expr {
                Expression::Reference(address)
                    if address.is_resource() && address.len() == 3 =>
                {
                    address
                }
                _ => {
                    return Err(NodeError::InvalidBinding {
                        binding: binding.clone(),
                    })
                }
            };

            let instance = self.resources.instance(address).ok_or_else(|| {
                NodeError::MissingResource {
                    binding: binding.clone(),
                    address: address.clone(),
                }
            })?;

            if let Some(required) = schema.resources.get(binding) {
                if !instance.satisfies(required) {
                    return Err(NodeError::IncompatibleResource {
                        binding: binding.clone(),
                        required: required.clone(),
                        actual: instance.resource_type().to_string(),
                    });
                }
            }

            resources.insert(binding.clone(), instance);
        }

        if let Some(binding) = schema
            .resources
            .keys()
            .find(|binding| resources.instance(binding).is_none())
        {
            return Err(NodeError::MissingBinding {
                binding: binding.clone(),
            });
        }

        Ok(resources)
    }

    /// Materialize a placeholder's instances and queue the ready ones
    fn expand(&self, node: &Node) -> Result<(), NodeError> {
        let Instance::Placeholder { count } = node.instance() else {
            return Ok(());
        };

        let ctx = context::assemble(&self.graph, node);
        let value = self.evaluator.evaluate(count, &ctx)?;
        let count = value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                NodeError::InvalidCount(format!(
                    "expected a non-negative integer, got {}",
                    value
                ))
            })?;

        let instances = expand_placeholder(&self.graph, node, count)
            .map_err(|e| NodeError::Expansion(e.message))?;

        // Counted before the placeholder itself completes, so the run cannot drain early
        self.outstanding
            .fetch_add(instances.len(), Ordering::AcqRel);
        self.event_tx.send_event(ExecutionEvent::placeholder_expanded(
            node.address(),
            instances.iter().map(|n| n.address().clone()).collect(),
        ));

        for instance in instances {
            if instance.dependency_count() == 0 {
                self.enqueue(instance);
            }
        }
        Ok(())
    }

    fn on_success(self: &Arc<Self>, node: &Arc<Node>, output: Option<Value>, start: Instant) {
        if !node.complete(output) {
            return;
        }

        tracing::debug!(
            node = %node.address(),
            duration_ms = start.elapsed().as_millis() as u64,
            "node completed"
        );
        self.event_tx
            .send_event(ExecutionEvent::node_completed(node.address(), start.elapsed()));

        for dependent in self.graph.dependents_of(node.address()) {
            if let Some(dependent) = self.graph.node(&dependent) {
                if dependent.decrement_dependencies() == 0
                    && dependent.status() == NodeStatus::Pending
                {
                    self.enqueue(dependent);
                }
            }
        }

        if node.kind() == NodeKind::Step {
            for dependency in self.graph.dependencies_of(node.address()) {
                let Some(resource) = self.graph.node(&dependency) else {
                    continue;
                };
                if resource.kind() == NodeKind::Resource && resource.decrement_descendants() == 0 {
                    self.spawn_destroy(resource);
                }
            }
        }

        self.finish_one();
    }

    /// Destroy off the worker so the loop keeps draining the queue
    fn spawn_destroy(self: &Arc<Self>, resource: Arc<Node>) {
        if !self.resources.is_live(resource.address()) {
            return;
        }
        tracing::debug!(resource = %resource.address(), "last dependent finished; destroying eagerly");

        let run = Arc::clone(self);
        self.destroys.spawn(async move {
            run.resources.destroy(&resource).await;
        });
    }

    fn on_failure(&self, node: &Node, error: NodeError) {
        tracing::warn!(node = %node.address(), error = %error, "node failed");
        self.event_tx
            .send_event(ExecutionEvent::node_failed(node.address(), &error));

        node.fail(error);
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(node.address().clone());

        self.cancel.cancel();
        self.propagate_skip(node.address());
        self.finish_one();
    }

    /// Skip every transitive dependent of `origin`, breadth first.
    ///
    /// A path only continues through nodes it skipped itself; nodes skipped by
    /// a concurrent path are walked by that path.
    fn propagate_skip(&self, origin: &Address) {
        let mut queue: std::collections::VecDeque<Address> =
            self.graph.dependents_of(origin).into();

        while let Some(address) = queue.pop_front() {
            let Some(node) = self.graph.node(&address) else {
                continue;
            };
            let error = NodeError::Skipped {
                upstream: origin.clone(),
            };
            if node.skip(error.clone()) {
                tracing::debug!(node = %address, upstream = %origin, "node skipped");
                self.event_tx
                    .send_event(ExecutionEvent::node_skipped(&address, &error));
                queue.extend(self.graph.dependents_of(&address));
                self.finish_one();
            }
        }
    }

    /// Aggregate the final node states into the run's result
    fn outcome(&self) -> Result<(), ExecutionError> {
        let failed: Vec<FailedNode> = self
            .graph
            .nodes()
            .into_iter()
            .filter(|node| node.status() == NodeStatus::Failed)
            .map(|node| FailedNode {
                address: node.address().clone(),
                error: node.error().unwrap_or(NodeError::Cancelled),
            })
            .collect();

        if failed.is_empty() {
            return Ok(());
        }

        let order = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let root = order.iter().find_map(|address| {
            failed
                .iter()
                .find(|f| &f.address == address && !f.error.is_symptom())
                .map(|f| f.error.clone())
        });

        match root {
            Some(root) => Err(ExecutionError::NodesFailed { failed, root }),
            None => Err(ExecutionError::Cancelled {
                nodes: failed.into_iter().map(|f| f.address).collect(),
            }),
        }
    }
}

fn hook_error(hook: &'static str, error: InvokeError) -> NodeError {
    match error {
        InvokeError::Decode(e) => NodeError::Decode {
            hook,
            message: e.to_string(),
        },
        other => NodeError::Handler {
            hook,
            message: other.to_string(),
        },
    }
}
