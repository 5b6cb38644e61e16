// Execution Engine Module
// Graph construction, the concurrent executor, and resource lifecycle management

pub mod builder;
pub mod context;
pub mod events;
pub mod executor;
pub mod graph;
pub mod node;
pub mod resources;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types
pub use builder::{build, GraphBuilder};
pub use events::{progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use executor::{Engine, ExecutionError, FailedNode};
pub use graph::{BuildError, BuildErrorKind, Graph};
pub use node::{Instance, Node, NodeConfig, NodeError, NodeKind, NodeStatus};
pub use resources::ResourceManager;
