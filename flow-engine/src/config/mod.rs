// Configuration Module
// Workflow declarations consumed by the graph builder

pub mod models;
pub mod parser;

pub use models::{EngineConfig, ResourceConfig, StepConfig, WorkflowConfig};
pub use parser::{ConfigError, WorkflowParser};
