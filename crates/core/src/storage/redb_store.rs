use super::{CredentialInfo, CredentialStore, StoredWorkflow, WorkflowStore};
use crate::types::{CredentialRef, RunId, RunSummary, UserId, WorkflowId};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const WORKFLOWS_TABLE: JsonTable = TableDefinition::new("workflows");
const CREDENTIALS_TABLE: JsonTable = TableDefinition::new("credentials");
const RUN_SUMMARIES_TABLE: JsonTable = TableDefinition::new("run_summaries");

// Separates user and service in credential keys; cannot appear in either
const KEY_SEPARATOR: char = '\u{1f}';

#[derive(Serialize, Deserialize)]
struct CredentialRecord {
    service: String,
    value: String,
    created_at: DateTime<Utc>,
}

fn credential_key(user_id: &UserId, service: &str) -> String {
    format!("{}{}{}", user_id, KEY_SEPARATOR, service)
}

fn credential_prefix(user_id: &UserId) -> String {
    format!("{}{}", user_id, KEY_SEPARATOR)
}

/// Workflow and credential store backed by a single redb file
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _workflows = write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("Failed to open workflows table")?;
            let _credentials = write_txn
                .open_table(CREDENTIALS_TABLE)
                .context("Failed to open credentials table")?;
            let _summaries = write_txn
                .open_table(RUN_SUMMARIES_TABLE)
                .context("Failed to open run summaries table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(table).context("Failed to open table")?;
            let value = serde_json::to_vec(value).context("Failed to serialize record")?;
            table
                .insert(key, value.as_slice())
                .context("Failed to insert record")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> Result<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        match table.get(key).context("Failed to get record")? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize record")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl WorkflowStore for RedbStore {
    fn load_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<StoredWorkflow>> {
        self.get(WORKFLOWS_TABLE, &workflow_id.to_string())
    }

    fn save_workflow(&self, workflow: &StoredWorkflow) -> Result<()> {
        self.put(WORKFLOWS_TABLE, &workflow.id.to_string(), workflow)
    }

    fn list_workflows(&self, user_id: &UserId) -> Result<Vec<StoredWorkflow>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(WORKFLOWS_TABLE)
            .context("Failed to open table")?;

        let mut workflows = Vec::new();
        for item in table.iter().context("Failed to iterate workflows")? {
            let (_key, value) = item.context("Failed to read item")?;
            let workflow: StoredWorkflow = serde_json::from_slice(value.value())
                .context("Failed to deserialize workflow")?;
            if &workflow.user_id == user_id {
                workflows.push(workflow);
            }
        }

        workflows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(workflows)
    }

    fn save_run_summary(&self, summary: &RunSummary) -> Result<()> {
        self.put(RUN_SUMMARIES_TABLE, &summary.run_id.to_string(), summary)
    }

    fn get_run_summary(&self, run_id: &RunId) -> Result<Option<RunSummary>> {
        self.get(RUN_SUMMARIES_TABLE, &run_id.to_string())
    }
}

impl CredentialStore for RedbStore {
    fn lookup(&self, user_id: &UserId, service: &str) -> Result<Option<CredentialRef>> {
        let record: Option<CredentialRecord> =
            self.get(CREDENTIALS_TABLE, &credential_key(user_id, service))?;
        Ok(record.map(|r| CredentialRef::new(r.service, r.value)))
    }

    fn put_credential(&self, user_id: &UserId, credential: CredentialRef) -> Result<()> {
        let key = credential_key(user_id, &credential.service);
        let created_at = self
            .get::<CredentialRecord>(CREDENTIALS_TABLE, &key)?
            .map(|existing| existing.created_at)
            .unwrap_or_else(Utc::now);

        tracing::debug!(
            "Storing credential {} ({}) for user {}",
            credential.service,
            credential.fingerprint(),
            user_id
        );

        self.put(
            CREDENTIALS_TABLE,
            &key,
            &CredentialRecord {
                service: credential.service,
                value: credential.value,
                created_at,
            },
        )
    }

    fn list_services(&self, user_id: &UserId) -> Result<Vec<CredentialInfo>> {
        let prefix = credential_prefix(user_id);
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(CREDENTIALS_TABLE)
            .context("Failed to open table")?;

        let mut services = Vec::new();
        for item in table
            .range(prefix.as_str()..)
            .context("Failed to iterate credentials")?
        {
            let (key, value) = item.context("Failed to read item")?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let record: CredentialRecord = serde_json::from_slice(value.value())
                .context("Failed to deserialize credential")?;
            services.push(CredentialInfo {
                service: record.service,
                created_at: record.created_at,
            });
        }

        services.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(services)
    }
}
