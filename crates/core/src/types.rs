use crate::error::{GraphError, NodeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of a node, unique within one workflow graph
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a stored workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Owner of workflows and credentials
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Status of a single node within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Retry policy for a node, overriding the engine defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
}

/// A single node of a workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
    #[serde(default, alias = "depends_on")]
    pub depends_on: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "timeout_secs")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            node_type: node_type.into(),
            config: empty_config(),
            depends_on: Vec::new(),
            timeout_secs: None,
            retry: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(NodeId::new).collect();
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// User-submitted workflow definition (the DAG of nodes)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<Node>,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }

    /// Parse the stored DAG form `{ "nodes": [{id, type, config, dependsOn}] }`.
    ///
    /// Anything that does not match that shape is reported as
    /// [`GraphError::Malformed`].
    pub fn from_value(name: impl Into<String>, dag: serde_json::Value) -> Result<Self, GraphError> {
        #[derive(Deserialize)]
        struct RawDag {
            #[serde(default)]
            name: Option<String>,
            nodes: Vec<Node>,
        }

        let raw: RawDag = serde_json::from_value(dag).map_err(|e| GraphError::Malformed {
            message: e.to_string(),
        })?;

        if let Some(node) = raw.nodes.iter().find(|n| n.id.0.trim().is_empty()) {
            return Err(GraphError::Malformed {
                message: format!("node of type '{}' has an empty id", node.node_type),
            });
        }

        let name = name.into();
        Ok(Self {
            name: if name.is_empty() {
                raw.name.unwrap_or_default()
            } else {
                name
            },
            nodes: raw.nodes,
        })
    }
}

/// Reference to a credential owned by the external credential store
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    pub service: String,
    pub value: String,
}

impl CredentialRef {
    pub fn new(service: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            value: value.into(),
        }
    }

    /// Short SHA-256 fingerprint of the value, safe to log
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.value.as_bytes());
        hex::encode(&digest[..6])
    }
}

impl std::fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRef")
            .field("service", &self.service)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Execution state of one node in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeState {
    pub fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Counts of terminal node states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTally {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl NodeTally {
    pub fn terminal(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// Where a run came from, recorded on its summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOrigin {
    pub workflow_id: Option<WorkflowId>,
    pub user_id: Option<UserId>,
}

/// Summary of a finished run, persisted through the workflow store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub workflow_name: String,
    #[serde(default)]
    pub origin: RunOrigin,
    pub status: RunStatus,
    pub nodes: BTreeMap<NodeId, NodeState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    pub fn tally(&self) -> NodeTally {
        tally(self.nodes.values())
    }
}

pub(crate) fn tally<'a>(states: impl Iterator<Item = &'a NodeState>) -> NodeTally {
    let mut tally = NodeTally::default();
    for state in states {
        match state.status {
            NodeStatus::Succeeded => tally.succeeded += 1,
            NodeStatus::Failed => tally.failed += 1,
            NodeStatus::Skipped => tally.skipped += 1,
            _ => {}
        }
    }
    tally
}
