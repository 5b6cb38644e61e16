// Execution Events
// Progress reporting for workflow runs

use super::node::NodeKind;
use crate::address::Address;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while a graph executes
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Workers are about to start
    RunStarted { total_nodes: usize, workers: usize },

    /// All work finished and the cleanup sweep ran
    RunCompleted {
        success: bool,
        failed: usize,
        duration: Duration,
    },

    /// A node was dispatched to its handler
    NodeStarted { address: Address, kind: NodeKind },

    /// A node reached Done
    NodeCompleted { address: Address, duration: Duration },

    /// A node's own work failed
    NodeFailed { address: Address, error: String },

    /// A node will never run because an upstream node failed or the run was cancelled
    NodeSkipped { address: Address, reason: String },

    /// A placeholder was materialized into concrete instances
    PlaceholderExpanded {
        address: Address,
        instances: Vec<Address>,
    },

    /// A resource instance was created and is now live
    ResourceCreated { address: Address },

    /// A resource instance was released
    ResourceDestroyed { address: Address, eager: bool },

    /// Log message
    Log {
        level: LogLevel,
        message: String,
        address: Option<Address>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn run_started(total_nodes: usize, workers: usize) -> Self {
        Self::RunStarted {
            total_nodes,
            workers,
        }
    }

    pub fn run_completed(success: bool, failed: usize, duration: Duration) -> Self {
        Self::RunCompleted {
            success,
            failed,
            duration,
        }
    }

    pub fn node_started(address: &Address, kind: NodeKind) -> Self {
        Self::NodeStarted {
            address: address.clone(),
            kind,
        }
    }

    pub fn node_completed(address: &Address, duration: Duration) -> Self {
        Self::NodeCompleted {
            address: address.clone(),
            duration,
        }
    }

    pub fn node_failed(address: &Address, error: impl ToString) -> Self {
        Self::NodeFailed {
            address: address.clone(),
            error: error.to_string(),
        }
    }

    pub fn node_skipped(address: &Address, reason: impl ToString) -> Self {
        Self::NodeSkipped {
            address: address.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn placeholder_expanded(address: &Address, instances: Vec<Address>) -> Self {
        Self::PlaceholderExpanded {
            address: address.clone(),
            instances,
        }
    }

    pub fn resource_created(address: &Address) -> Self {
        Self::ResourceCreated {
            address: address.clone(),
        }
    }

    pub fn resource_destroyed(address: &Address, eager: bool) -> Self {
        Self::ResourceDestroyed {
            address: address.clone(),
            eager,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, address: Option<Address>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            address,
        }
    }

    /// Create an error log event for failures outside any single node
    pub fn error(message: impl Into<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            address: None,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
