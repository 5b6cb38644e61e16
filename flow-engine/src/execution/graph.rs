// Execution Graph (DAG)
// Node map plus adjacency, cycle detection, and build error types

use super::builder::Resolver;
use super::node::{Node, NodeKind};
use crate::address::Address;

use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

/// Fatal error raised while building (or expanding) the graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("graph error: {message}")]
pub struct BuildError {
    pub message: String,
    pub kind: BuildErrorKind,
    /// Node the error is attributed to (the closing node for cycles)
    pub address: Option<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildErrorKind {
    /// Circular dependency detected
    CyclicDependency,
    /// Explicit dependency on a node that does not exist
    UnresolvedReference,
    /// Bare reference to a statically repeated step
    AmbiguousReference,
    /// Reference to an output field the producer does not declare
    UndeclaredOutput,
    /// No handler registered for a step/resource type
    UnknownType,
    /// Repetition count is not a non-negative integer
    InvalidCount,
    /// Dependency string is not a valid node address
    InvalidReference,
    /// Type or name would not survive the address's string form
    InvalidName,
}

impl BuildError {
    fn new(kind: BuildErrorKind, message: impl Into<String>, address: Option<Address>) -> Self {
        Self {
            message: message.into(),
            kind,
            address,
        }
    }

    pub fn cyclic(closing: Address, cycle: &[Address]) -> Self {
        let path: Vec<String> = cycle.iter().map(ToString::to_string).collect();
        Self::new(
            BuildErrorKind::CyclicDependency,
            format!(
                "circular dependency detected at '{}': {}",
                closing,
                path.join(" -> ")
            ),
            Some(closing),
        )
    }

    pub fn unresolved(node: &Address, reference: &str) -> Self {
        Self::new(
            BuildErrorKind::UnresolvedReference,
            format!("'{}' depends on unknown node '{}'", node, reference),
            Some(node.clone()),
        )
    }

    pub fn ambiguous(node: &Address, reference: &Address) -> Self {
        Self::new(
            BuildErrorKind::AmbiguousReference,
            format!(
                "'{}' references repeated step '{}' without an index",
                node, reference
            ),
            Some(node.clone()),
        )
    }

    pub fn undeclared_output(node: &Address, target: &Address, field: &str) -> Self {
        Self::new(
            BuildErrorKind::UndeclaredOutput,
            format!(
                "'{}' references output '{}' which '{}' does not declare",
                node, field, target
            ),
            Some(node.clone()),
        )
    }

    pub fn unknown_type(node: &Address, kind: NodeKind, type_name: &str) -> Self {
        Self::new(
            BuildErrorKind::UnknownType,
            format!("'{}' uses unknown {} type '{}'", node, kind, type_name),
            Some(node.clone()),
        )
    }

    pub fn invalid_count(node: &Address, detail: impl std::fmt::Display) -> Self {
        Self::new(
            BuildErrorKind::InvalidCount,
            format!("'{}' has an invalid count: {}", node, detail),
            Some(node.clone()),
        )
    }

    pub fn invalid_name(kind: NodeKind, type_name: &str, name: &str) -> Self {
        Self::new(
            BuildErrorKind::InvalidName,
            format!(
                "{} '{}' of type '{}' has an invalid name: type and name must be non-empty and contain no '.', '[' or ']'",
                kind, name, type_name
            ),
            None,
        )
    }

    pub fn invalid_reference(node: &Address, reference: &str, detail: impl std::fmt::Display) -> Self {
        Self::new(
            BuildErrorKind::InvalidReference,
            format!(
                "'{}' has malformed dependency '{}': {}",
                node, reference, detail
            ),
            Some(node.clone()),
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

/// The execution graph: nodes keyed by address plus both directions of adjacency
///
/// Topology is written by the builder and afterwards only extended by
/// placeholder expansion, which inserts new nodes and edges without
/// removing any.
pub struct Graph {
    nodes: DashMap<Address, Arc<Node>>,
    dependencies: DashMap<Address, BTreeSet<Address>>,
    dependents: DashMap<Address, BTreeSet<Address>>,
    resolver: Resolver,
    warnings: Vec<String>,
}

impl Graph {
    pub(crate) fn new(resolver: Resolver) -> Self {
        Self {
            nodes: DashMap::new(),
            dependencies: DashMap::new(),
            dependents: DashMap::new(),
            resolver,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub(crate) fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// Non-fatal diagnostics collected during build
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub(crate) fn insert(&self, node: Node) -> Arc<Node> {
        let node = Arc::new(node);
        self.nodes.insert(node.address().clone(), node.clone());
        node
    }

    /// Add the edge `from -> to` (`to` depends on `from`); false if already present
    pub(crate) fn add_edge(&self, from: &Address, to: &Address) -> bool {
        let inserted = self
            .dependents
            .entry(from.clone())
            .or_default()
            .insert(to.clone());
        self.dependencies
            .entry(to.clone())
            .or_default()
            .insert(from.clone());
        inserted
    }

    pub fn node(&self, address: &Address) -> Option<Arc<Node>> {
        self.nodes.get(address).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.nodes.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node addresses in canonical order
    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> =
            self.nodes.iter().map(|entry| entry.key().clone()).collect();
        addresses.sort();
        addresses
    }

    /// All nodes in canonical address order
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.address().cmp(b.address()));
        nodes
    }

    /// Direct predecessors of `address`
    pub fn dependencies_of(&self, address: &Address) -> Vec<Address> {
        self.dependencies
            .get(address)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct successors of `address`
    pub fn dependents_of(&self, address: &Address) -> Vec<Address> {
        self.dependents
            .get(address)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every node reachable through the dependents relation, breadth-first
    pub fn transitive_dependents(&self, address: &Address) -> Vec<Address> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<Address> = self.dependents_of(address).into();

        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            queue.extend(self.dependents_of(&next));
            order.push(next);
        }

        order
    }

    /// Detect cycles with a three-color depth-first traversal
    pub fn detect_cycles(&self) -> Result<(), BuildError> {
        let mut marks: HashMap<Address, Mark> = HashMap::new();

        for address in self.addresses() {
            if !marks.contains_key(&address) {
                let mut path = Vec::new();
                self.visit(&address, &mut marks, &mut path)?;
            }
        }

        Ok(())
    }

    fn visit(
        &self,
        address: &Address,
        marks: &mut HashMap<Address, Mark>,
        path: &mut Vec<Address>,
    ) -> Result<(), BuildError> {
        marks.insert(address.clone(), Mark::Visiting);
        path.push(address.clone());

        for next in self.dependencies_of(address) {
            match marks.get(&next) {
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|a| *a == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next.clone());
                    return Err(BuildError::cyclic(next, &cycle));
                }
                Some(Mark::Visited) => {}
                None => self.visit(&next, marks, path)?,
            }
        }

        path.pop();
        marks.insert(address.clone(), Mark::Visited);
        Ok(())
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.addresses())
            .field("warnings", &self.warnings)
            .finish()
    }
}
