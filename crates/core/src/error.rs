//! Error types for graph validation, node execution and run coordination.

use crate::actions::ActionError;
use crate::types::{NodeId, RunId, WorkflowId};
use serde::{Deserialize, Serialize};

/// A workflow graph that cannot be executed. Raised before any node runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The submitted structure is not a `{ nodes: [...] }` DAG.
    #[error("malformed workflow graph: {message}")]
    Malformed { message: String },

    #[error("duplicate node id '{node_id}'")]
    DuplicateNode { node_id: NodeId },

    #[error("node '{node_id}' depends on unknown node '{dependency}'")]
    UnknownDependency { node_id: NodeId, dependency: NodeId },

    /// `path` starts and ends with the same node.
    #[error("dependency cycle: {}", format_path(.path))]
    Cycle { path: Vec<NodeId> },
}

fn format_path(path: &[NodeId]) -> String {
    path.iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Failure of a single node. Contained to the node and its dependents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeError {
    #[error("missing credential for service '{service}'")]
    MissingCredential { service: String },

    #[error("no action registered for node type '{node_type}'")]
    UnknownActionType { node_type: String },

    #[error("node timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error(transparent)]
    Action(#[from] ActionError),
}

impl NodeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Action(e) if e.transient)
    }
}

/// Run-level failures surfaced by the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("run {run_id} not found")]
    RunNotFound { run_id: RunId },

    #[error("run {run_id} has already finished")]
    RunAlreadyFinished { run_id: RunId },

    #[error("workflow {workflow_id} not found")]
    WorkflowNotFound { workflow_id: WorkflowId },

    #[error("store operation failed")]
    Store(#[source] anyhow::Error),
}
