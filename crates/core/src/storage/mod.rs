pub mod redb_store;

pub use redb_store::RedbStore;

use crate::types::{CredentialRef, RunId, RunSummary, UserId, WorkflowId};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A workflow as saved by its owner. `dag` is the raw `{ nodes: [...] }`
/// document; it is parsed and validated only when a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredWorkflow {
    pub id: WorkflowId,
    pub user_id: UserId,
    pub name: String,
    pub dag: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredWorkflow {
    pub fn new(user_id: UserId, name: impl Into<String>, dag: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            user_id,
            name: name.into(),
            dag,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Public view of a stored credential; never carries the secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialInfo {
    pub service: String,
    pub created_at: DateTime<Utc>,
}

/// Persistence for workflow definitions and finished run summaries
pub trait WorkflowStore: Send + Sync {
    fn load_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<StoredWorkflow>>;

    /// Insert or replace by id
    fn save_workflow(&self, workflow: &StoredWorkflow) -> Result<()>;

    /// Workflows owned by `user_id`, most recently updated first
    fn list_workflows(&self, user_id: &UserId) -> Result<Vec<StoredWorkflow>>;

    fn save_run_summary(&self, summary: &RunSummary) -> Result<()>;

    fn get_run_summary(&self, run_id: &RunId) -> Result<Option<RunSummary>>;
}

/// Per-user credential storage. The engine only reads from it.
pub trait CredentialStore: Send + Sync {
    fn lookup(&self, user_id: &UserId, service: &str) -> Result<Option<CredentialRef>>;

    /// Insert or replace the credential for `credential.service`
    fn put_credential(&self, user_id: &UserId, credential: CredentialRef) -> Result<()>;

    /// Services the user holds credentials for, sorted by service
    fn list_services(&self, user_id: &UserId) -> Result<Vec<CredentialInfo>>;
}
