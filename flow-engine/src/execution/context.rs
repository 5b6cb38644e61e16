// Evaluation Context Assembly
// Exposes completed dependency outputs to the node about to execute

use super::graph::Graph;
use super::node::{Instance, Node, NodeKind, NodeStatus};
use crate::address::{Address, RESOURCE_ROOT, STEP_ROOT};
use crate::expression::EvalContext;

use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Variable holding the executing instance's own index
pub const INDEX_VARIABLE: &str = "index";

/// Build the variable context for `node` from its Done dependencies.
///
/// Steps contribute their outputs under `step.<type>.<name>`. Resources
/// contribute a descriptor under `resource.<type>.<name>`; the live instance
/// itself is only reachable through `uses` bindings.
///
/// Reads only nodes that are already Done, whose outputs never change, so it
/// is safe to call while other nodes are still executing.
pub fn assemble(graph: &Graph, node: &Node) -> EvalContext {
    let mut ctx = EvalContext::new();
    let mut repeated: BTreeMap<Address, Vec<Value>> = BTreeMap::new();

    for dependency in graph.dependencies_of(node.address()) {
        let Some(producer) = graph.node(&dependency) else {
            continue;
        };
        if producer.status() != NodeStatus::Done {
            continue;
        }
        if producer.kind() == NodeKind::Resource {
            set_descriptor(&mut ctx, &dependency);
            continue;
        }

        match producer.instance() {
            Instance::Single => set_output(&mut ctx, &dependency, envelope(&producer)),
            Instance::Indexed { index, count } => {
                let slots = repeated
                    .entry(dependency.with_index(None))
                    .or_insert_with(|| vec![Value::Null; *count]);
                if let Some(slot) = slots.get_mut(*index) {
                    *slot = envelope(&producer);
                }
            }
            Instance::Placeholder { .. } => {
                set_output(&mut ctx, &dependency, aggregate(graph, &producer));
            }
            // Reached through the placeholder's aggregated list instead
            Instance::Expanded { .. } => {}
        }
    }

    for (base, slots) in repeated {
        set_output(&mut ctx, &base, Value::Array(slots));
    }

    if let Some(index) = node.instance().index() {
        ctx.set(INDEX_VARIABLE, json!(index));
    }

    ctx
}

fn envelope(producer: &Node) -> Value {
    json!({ "output": producer.output().cloned().unwrap_or(Value::Null) })
}

/// Index-ordered outputs of an expanded placeholder's instances
fn aggregate(graph: &Graph, placeholder: &Node) -> Value {
    let instances = placeholder.expansion().unwrap_or_default();
    Value::Array(
        instances
            .iter()
            .map(|address| match graph.node(address) {
                Some(instance) if instance.status() == NodeStatus::Done => envelope(&instance),
                _ => Value::Null,
            })
            .collect(),
    )
}

fn set_descriptor(ctx: &mut EvalContext, address: &Address) {
    if let (Some(resource_type), Some(name)) = (address.node_type(), address.node_name()) {
        let descriptor = json!({
            "address": address.to_string(),
            "type": resource_type,
            "name": name,
        });
        ctx.set_nested(RESOURCE_ROOT, resource_type, name, descriptor);
    }
}

fn set_output(ctx: &mut EvalContext, address: &Address, value: Value) {
    if let (Some(step_type), Some(name)) = (address.node_type(), address.node_name()) {
        ctx.set_nested(STEP_ROOT, step_type, name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceConfig, StepConfig, WorkflowConfig};
    use crate::execution::builder::{build, expand_placeholder};
    use crate::execution::testing::registry;
    use crate::expression::{Evaluator, Expression, PathEvaluator};

    fn addr(input: &str) -> Address {
        input.parse().unwrap()
    }

    fn finish(graph: &Graph, address: &str, output: Value) {
        let node = graph.node(&addr(address)).unwrap();
        assert!(node.try_start());
        assert!(node.complete(Some(output)));
    }

    #[test]
    fn test_single_producer_envelope() {
        let workflow = WorkflowConfig::new()
            .step(StepConfig::new("echo", "a"))
            .step(StepConfig::new("echo", "b").depends_on("step.echo.a"));
        let graph = build(&workflow, &registry()).unwrap();
        finish(&graph, "step.echo.a", json!({ "value": 5 }));

        let ctx = assemble(&graph, &graph.node(&addr("step.echo.b")).unwrap());
        assert_eq!(
            ctx.lookup(&addr("step.echo.a.output.value")).unwrap(),
            &json!(5)
        );
        assert!(ctx.get(INDEX_VARIABLE).is_none());
    }

    #[test]
    fn test_repeated_producer_dense_list() {
        let workflow = WorkflowConfig::new()
            .step(StepConfig::new("echo", "fan").count(Expression::literal(3)))
            .step(
                StepConfig::new("echo", "sink")
                    .depends_on("step.echo.fan[0]")
                    .depends_on("step.echo.fan[2]"),
            );
        let graph = build(&workflow, &registry()).unwrap();
        finish(&graph, "step.echo.fan[2]", json!({ "value": "two" }));

        let ctx = assemble(&graph, &graph.node(&addr("step.echo.sink")).unwrap());
        assert_eq!(
            ctx.lookup(&addr("step.echo.fan")).unwrap(),
            &json!([null, null, { "output": { "value": "two" } }])
        );
    }

    #[test]
    fn test_own_index_is_exposed() {
        let workflow = WorkflowConfig::new()
            .step(StepConfig::new("echo", "fan").count(Expression::literal(2)));
        let graph = build(&workflow, &registry()).unwrap();

        let ctx = assemble(&graph, &graph.node(&addr("step.echo.fan[1]")).unwrap());
        let value = PathEvaluator
            .evaluate(&Expression::parse("item-${index}").unwrap(), &ctx)
            .unwrap();
        assert_eq!(value, json!("item-1"));
    }

    #[test]
    fn test_resource_descriptor_and_pending_steps_hidden() {
        let workflow = WorkflowConfig::new()
            .resource(ResourceConfig::new("store", "main"))
            .step(StepConfig::new("echo", "a"))
            .step(
                StepConfig::new("record", "b")
                    .uses("store", Expression::parse("${resource.store.main}").unwrap())
                    .depends_on("step.echo.a"),
            );
        let graph = build(&workflow, &registry()).unwrap();
        finish(&graph, "resource.store.main", json!(null));

        // step.echo.a is still pending, so only the resource shows up
        let ctx = assemble(&graph, &graph.node(&addr("step.record.b")).unwrap());
        assert_eq!(
            ctx.into_value(),
            json!({ "resource": { "store": { "main": {
                "address": "resource.store.main",
                "type": "store",
                "name": "main",
            }}}})
        );
    }

    #[test]
    fn test_expanded_placeholder_aggregates_instances() {
        let workflow = WorkflowConfig::new()
            .step(StepConfig::new("echo", "size"))
            .step(
                StepConfig::new("echo", "fan")
                    .count(Expression::parse("${step.echo.size.output.value}").unwrap()),
            )
            .step(StepConfig::new("echo", "sink").depends_on("step.echo.fan"));
        let graph = build(&workflow, &registry()).unwrap();
        finish(&graph, "step.echo.size", json!({ "value": 2 }));

        let fan = graph.node(&addr("step.echo.fan")).unwrap();
        assert!(fan.try_start());
        expand_placeholder(&graph, &fan, 2).unwrap();
        assert!(fan.complete(None));
        finish(&graph, "step.echo.fan[0]", json!({ "value": "a" }));
        finish(&graph, "step.echo.fan[1]", json!({ "value": "b" }));

        let ctx = assemble(&graph, &graph.node(&addr("step.echo.sink")).unwrap());
        assert_eq!(
            ctx.lookup(&addr("step.echo.fan")).unwrap(),
            &json!([{ "output": { "value": "a" } }, { "output": { "value": "b" } }])
        );
        assert_eq!(
            ctx.lookup(&addr("step.echo.fan[1].output.value")).unwrap(),
            &json!("b")
        );
    }
}
