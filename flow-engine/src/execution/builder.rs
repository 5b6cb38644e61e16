// Graph Builder
// Creates nodes, links explicit and implicit dependencies, and validates the DAG

use super::graph::{BuildError, Graph};
use super::node::{Instance, Node, NodeConfig, NodeKind, NodeStatus};
use crate::address::Address;
use crate::config::{ResourceConfig, StepConfig, WorkflowConfig};
use crate::expression::{EvalContext, Evaluator, Expression, PathEvaluator};
use crate::handlers::HandlerRegistry;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// How a declared step was materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    Single,
    Repeated(usize),
    Placeholder,
}

#[derive(Debug, Clone)]
struct StepEntry {
    shape: Shape,
    outputs: BTreeSet<String>,
}

/// Maps references onto node addresses using the declared topology
#[derive(Debug, Clone, Default)]
pub(crate) struct Resolver {
    steps: HashMap<Address, StepEntry>,
    resources: HashSet<Address>,
}

impl Resolver {
    pub(crate) fn shape(&self, base: &Address) -> Option<Shape> {
        self.steps.get(base).map(|entry| entry.shape)
    }

    /// Resolve a node path to the address of the node it depends on.
    ///
    /// Resources are checked first, then placeholders (any index targets the
    /// placeholder), then concrete steps. An explicit index targets exactly
    /// that instance; a bare name of a repeated step is ambiguous. Paths
    /// that match nothing resolve to `None`.
    pub(crate) fn resolve(
        &self,
        from: &Address,
        reference: &Address,
    ) -> Result<Option<Address>, BuildError> {
        if !reference.is_node_path() {
            return Ok(None);
        }

        let index = reference.segments()[2].index;
        let base = reference.prefix(3).with_index(None);

        if reference.is_resource() {
            if index.is_none() && self.resources.contains(&base) {
                return Ok(Some(base));
            }
            return Ok(None);
        }

        let Some(entry) = self.steps.get(&base) else {
            return Ok(None);
        };

        match (entry.shape, index) {
            (Shape::Placeholder, _) => Ok(Some(base)),
            (Shape::Single, None) => Ok(Some(base)),
            (Shape::Single, Some(_)) => Ok(None),
            (Shape::Repeated(_), None) => Err(BuildError::ambiguous(from, &base)),
            (Shape::Repeated(count), Some(i)) if i < count => Ok(Some(base.with_index(Some(i)))),
            (Shape::Repeated(_), Some(_)) => Ok(None),
        }
    }

    /// Reject `...output.<field>` references to fields the producer does not declare
    pub(crate) fn validate_output(
        &self,
        from: &Address,
        target: &Address,
        reference: &Address,
    ) -> Result<(), BuildError> {
        let rest = reference.suffix(3);
        let [head, field, ..] = rest else {
            return Ok(());
        };
        if head.name != "output" {
            return Ok(());
        }

        let declared = self
            .steps
            .get(&target.with_index(None))
            .map(|entry| entry.outputs.contains(&field.name))
            .unwrap_or(false);

        if declared {
            Ok(())
        } else {
            Err(BuildError::undeclared_output(from, target, &field.name))
        }
    }
}

/// Builds a [`Graph`] from a workflow declaration
pub struct GraphBuilder<'a> {
    registry: &'a HandlerRegistry,
    evaluator: &'a dyn Evaluator,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a HandlerRegistry) -> Self {
        Self {
            registry,
            evaluator: &PathEvaluator,
        }
    }

    /// Evaluator used for statically resolvable counts
    pub fn with_evaluator(mut self, evaluator: &'a dyn Evaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Run all three build passes; any error aborts the build
    pub fn build(&self, workflow: &WorkflowConfig) -> Result<Graph, BuildError> {
        let mut warnings = Vec::new();

        // Later declarations of the same address replace earlier ones
        let mut resources: BTreeMap<Address, Arc<ResourceConfig>> = BTreeMap::new();
        for resource in &workflow.resources {
            check_name(NodeKind::Resource, &resource.resource_type, &resource.name)?;
            let address = resource.address();
            if resources
                .insert(address.clone(), Arc::new(resource.clone()))
                .is_some()
            {
                warnings.push(format!("duplicate declaration of '{}'; later one wins", address));
            }
        }

        let mut steps: BTreeMap<Address, Arc<StepConfig>> = BTreeMap::new();
        for step in &workflow.steps {
            check_name(NodeKind::Step, &step.step_type, &step.name)?;
            let address = step.address();
            if steps.insert(address.clone(), Arc::new(step.clone())).is_some() {
                warnings.push(format!("duplicate declaration of '{}'; later one wins", address));
            }
        }

        for warning in &warnings {
            tracing::warn!("{}", warning);
        }

        let mut resolver = Resolver::default();
        for (address, resource) in &resources {
            if self.registry.resource(&resource.resource_type).is_none() {
                return Err(BuildError::unknown_type(
                    address,
                    NodeKind::Resource,
                    &resource.resource_type,
                ));
            }
            resolver.resources.insert(address.clone());
        }

        let declared: HashSet<Address> = steps.keys().chain(resources.keys()).cloned().collect();

        for (address, step) in &steps {
            let handler = self.registry.step(&step.step_type).ok_or_else(|| {
                BuildError::unknown_type(address, NodeKind::Step, &step.step_type)
            })?;

            let shape = match &step.count {
                None => Shape::Single,
                Some(count) if references_declared(count, &declared) => Shape::Placeholder,
                Some(count) => Shape::Repeated(self.static_count(address, count)?),
            };

            resolver.steps.insert(
                address.clone(),
                StepEntry {
                    shape,
                    outputs: handler.schema().outputs.clone(),
                },
            );
        }

        // Pass 1: nodes
        let mut graph = Graph::new(resolver);
        for warning in warnings {
            graph.add_warning(warning);
        }

        for (address, resource) in resources {
            graph.insert(Node::new(
                address,
                NodeConfig::Resource(resource),
                Instance::Single,
            ));
        }

        for (address, step) in steps {
            let shape = graph.resolver().shape(&address).unwrap_or(Shape::Single);
            match shape {
                Shape::Single => {
                    graph.insert(Node::new(address, NodeConfig::Step(step), Instance::Single));
                }
                Shape::Repeated(count) => {
                    for index in 0..count {
                        graph.insert(Node::new(
                            address.with_index(Some(index)),
                            NodeConfig::Step(step.clone()),
                            Instance::Indexed { index, count },
                        ));
                    }
                }
                Shape::Placeholder => {
                    let count = step.count.clone().unwrap_or(Expression::literal(0));
                    graph.insert(Node::new(
                        address,
                        NodeConfig::Step(step),
                        Instance::Placeholder { count },
                    ));
                }
            }
        }

        // Pass 2: edges
        for node in graph.nodes() {
            for predecessor in link(&graph, &node)? {
                graph.add_edge(&predecessor, node.address());
            }
        }

        // Pass 3: validation and counters
        graph.detect_cycles()?;
        initialize_counters(&graph);

        tracing::debug!(
            nodes = graph.len(),
            warnings = graph.warnings().len(),
            "execution graph built"
        );

        Ok(graph)
    }

    fn static_count(&self, address: &Address, count: &Expression) -> Result<usize, BuildError> {
        let value = self
            .evaluator
            .evaluate(count, &EvalContext::new())
            .map_err(|e| BuildError::invalid_count(address, e))?;

        value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                BuildError::invalid_count(
                    address,
                    format!("expected a non-negative integer, got {}", value),
                )
            })
    }
}

/// Build a graph with the default evaluator
pub fn build(workflow: &WorkflowConfig, registry: &HandlerRegistry) -> Result<Graph, BuildError> {
    GraphBuilder::new(registry).build(workflow)
}

/// Types and names become address segments, so they must not carry address syntax
fn check_name(kind: NodeKind, type_name: &str, name: &str) -> Result<(), BuildError> {
    let valid = |part: &str| !part.is_empty() && !part.contains(&['.', '[', ']'][..]);
    if valid(type_name) && valid(name) {
        Ok(())
    } else {
        Err(BuildError::invalid_name(kind, type_name, name))
    }
}

fn references_declared(expr: &Expression, declared: &HashSet<Address>) -> bool {
    expr.references()
        .iter()
        .any(|r| r.is_node_path() && declared.contains(&r.prefix(3).with_index(None)))
}

/// Predecessors of `node` from its explicit dependency list and every
/// expression it carries (including a placeholder's count)
pub(crate) fn link(graph: &Graph, node: &Node) -> Result<BTreeSet<Address>, BuildError> {
    let resolver = graph.resolver();
    let from = node.address();
    let mut predecessors = BTreeSet::new();

    for raw in node.config().depends_on() {
        let reference: Address = raw
            .parse()
            .map_err(|e| BuildError::invalid_reference(from, raw, e))?;
        match resolver.resolve(from, &reference)? {
            Some(target) => {
                predecessors.insert(target);
            }
            None => return Err(BuildError::unresolved(from, raw)),
        }
    }

    let mut expressions = node.config().expressions();
    if let Instance::Placeholder { count } = node.instance() {
        expressions.push(count);
    }

    for expr in expressions {
        for reference in expr.references() {
            // Unknown roots (environment values and the like) are not edges
            if let Some(target) = resolver.resolve(from, reference)? {
                resolver.validate_output(from, &target, reference)?;
                predecessors.insert(target);
            }
        }
    }

    Ok(predecessors)
}

fn initialize_counters(graph: &Graph) {
    for node in graph.nodes() {
        node.set_dependency_count(graph.dependencies_of(node.address()).len());

        if node.kind() == NodeKind::Resource {
            let step_dependents = graph
                .dependents_of(node.address())
                .iter()
                .filter_map(|address| graph.node(address))
                .filter(|dependent| dependent.kind() == NodeKind::Step)
                .count();
            node.set_descendant_count(step_dependents);
        }
    }
}

/// Materialize `count` instances of an executing placeholder and splice them in.
///
/// Instances inherit the placeholder's predecessors and become direct step
/// dependents of its resources. Every dependent of the placeholder is
/// re-linked onto each instance so it only becomes ready once all of them
/// are Done. Nothing is inserted if any instance fails to link.
pub(crate) fn expand_placeholder(
    graph: &Graph,
    placeholder: &Node,
    count: usize,
) -> Result<Vec<Arc<Node>>, BuildError> {
    let inherited = graph.dependencies_of(placeholder.address());

    let mut linked = Vec::with_capacity(count);
    for index in 0..count {
        let node = Node::new(
            placeholder.address().with_index(Some(index)),
            placeholder.config().clone(),
            Instance::Expanded { index },
        );
        let mut predecessors = link(graph, &node)?;
        predecessors.extend(inherited.iter().cloned());
        linked.push((node, predecessors));
    }

    let dependents = graph.dependents_of(placeholder.address());
    let mut instances = Vec::with_capacity(count);

    for (node, predecessors) in linked {
        let unmet = predecessors
            .iter()
            .filter(|p| {
                graph
                    .node(p)
                    .map_or(true, |n| n.status() != NodeStatus::Done)
            })
            .count();
        node.set_dependency_count(unmet);
        let node = graph.insert(node);

        for predecessor in &predecessors {
            graph.add_edge(predecessor, node.address());
            if let Some(pred) = graph.node(predecessor) {
                if pred.kind() == NodeKind::Resource {
                    pred.add_descendants(1);
                }
            }
        }

        for dependent in &dependents {
            if graph.add_edge(node.address(), dependent) {
                if let Some(dependent) = graph.node(dependent) {
                    dependent.add_dependencies(1);
                }
            }
        }

        instances.push(node);
    }

    placeholder.set_expansion(instances.iter().map(|n| n.address().clone()).collect());

    tracing::debug!(
        placeholder = %placeholder.address(),
        instances = instances.len(),
        "placeholder expanded"
    );

    Ok(instances)
}
