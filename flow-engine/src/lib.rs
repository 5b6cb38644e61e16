// Flow Engine Library
// Builds declarative step/resource workflows into a DAG and executes them concurrently

pub mod address;
pub mod config;
pub mod execution;
pub mod expression;
pub mod handlers;

// Re-export address types
pub use address::{Address, AddressError, Segment};

// Re-export configuration types
pub use config::{ConfigError, EngineConfig, ResourceConfig, StepConfig, WorkflowConfig, WorkflowParser};

// Re-export expression types
pub use expression::{EvalContext, EvalError, Evaluator, Expression, PathEvaluator};

// Re-export handler types
pub use handlers::{
    HandlerRegistry, Resource, ResourceInstance, ResourceSchema, Resources, Step, StepSchema,
};

// Re-export execution types
pub use execution::{
    build, BuildError, BuildErrorKind, Engine, ExecutionError, ExecutionEvent, FailedNode, Graph,
    GraphBuilder, NodeError, NodeStatus, ProgressSender,
};
