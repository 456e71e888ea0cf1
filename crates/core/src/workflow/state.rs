use super::graph::ValidatedGraph;
use super::node_executor::NodeOutcome;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Live state of one run, owned by the coordinator
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub run_id: RunId,
    pub workflow_name: String,
    pub origin: RunOrigin,
    #[serde(serialize_with = "serialize_graph")]
    pub graph: Arc<ValidatedGraph>,
    pub node_states: BTreeMap<NodeId, NodeState>,
    pub overall_status: RunStatus,
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn serialize_graph<S: serde::Serializer>(
    graph: &Arc<ValidatedGraph>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serde::Serialize::serialize(graph.as_ref(), serializer)
}

impl RunState {
    pub fn new(run_id: RunId, graph: Arc<ValidatedGraph>, origin: RunOrigin) -> Self {
        let node_states = graph
            .nodes()
            .iter()
            .map(|node| (node.id.clone(), NodeState::pending()))
            .collect();

        Self {
            run_id,
            workflow_name: graph.name().to_string(),
            origin,
            graph,
            node_states,
            overall_status: RunStatus::Pending,
            cancel_requested: false,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    /// Pending -> Running
    pub fn start(&mut self) -> bool {
        if self.overall_status != RunStatus::Pending {
            return false;
        }
        self.overall_status = RunStatus::Running;
        self.started_at = Utc::now();
        true
    }

    /// Running -> terminal. Terminal states have no outgoing transition.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) -> bool {
        if self.overall_status.is_terminal() || !status.is_terminal() {
            tracing::warn!(
                "Ignoring transition {:?} -> {:?} for run {}",
                self.overall_status,
                status,
                self.run_id
            );
            return false;
        }
        self.overall_status = status;
        self.finished_at = Some(Utc::now());
        self.error = error;
        true
    }

    pub fn node_status(&self, node_id: &NodeId) -> Option<NodeStatus> {
        self.node_states.get(node_id).map(|s| s.status)
    }

    pub fn mark_ready(&mut self, node_id: &NodeId) -> bool {
        self.transition(node_id, &[NodeStatus::Pending], NodeStatus::Ready)
    }

    pub fn mark_running(&mut self, node_id: &NodeId) -> bool {
        let moved = self.transition(node_id, &[NodeStatus::Ready], NodeStatus::Running);
        if moved {
            if let Some(state) = self.node_states.get_mut(node_id) {
                state.started_at = Some(Utc::now());
            }
        }
        moved
    }

    /// Skip a node that was never dispatched
    pub fn mark_skipped(&mut self, node_id: &NodeId) -> bool {
        let moved = self.transition(
            node_id,
            &[NodeStatus::Pending, NodeStatus::Ready],
            NodeStatus::Skipped,
        );
        if moved {
            if let Some(state) = self.node_states.get_mut(node_id) {
                state.finished_at = Some(Utc::now());
            }
        }
        moved
    }

    /// Record the terminal outcome of a dispatched node
    pub fn record(&mut self, outcome: &NodeOutcome) -> bool {
        let Some(state) = self.node_states.get_mut(&outcome.node_id) else {
            return false;
        };
        if state.status != NodeStatus::Running {
            tracing::warn!(
                "Outcome for node {} arrived in state {:?}",
                outcome.node_id,
                state.status
            );
            return false;
        }

        state.status = outcome.status;
        state.attempts = outcome.attempts;
        state.result = outcome.output.clone();
        state.error = outcome.error.clone();
        state.started_at = Some(outcome.started_at);
        state.finished_at = Some(outcome.finished_at);
        true
    }

    fn transition(&mut self, node_id: &NodeId, from: &[NodeStatus], to: NodeStatus) -> bool {
        match self.node_states.get_mut(node_id) {
            Some(state) if from.contains(&state.status) => {
                state.status = to;
                true
            }
            Some(state) => {
                tracing::debug!(
                    "Node {} not moved to {:?}: currently {:?}",
                    node_id,
                    to,
                    state.status
                );
                false
            }
            None => false,
        }
    }

    pub fn tally(&self) -> NodeTally {
        tally(self.node_states.values())
    }

    /// Every node is Succeeded, Failed or Skipped
    pub fn all_terminal(&self) -> bool {
        self.node_states.values().all(|s| s.status.is_terminal())
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            workflow_name: self.workflow_name.clone(),
            origin: self.origin.clone(),
            status: self.overall_status,
            nodes: self.node_states.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
        }
    }
}
