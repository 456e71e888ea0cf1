//! Scripted actions and an in-memory store for engine tests.

use crate::actions::{Action, ActionError, ActionRegistry, CredentialRequirement, Credentials};
use crate::storage::{CredentialInfo, CredentialStore, StoredWorkflow, WorkflowStore};
use crate::types::{CredentialRef, RunId, RunSummary, UserId, WorkflowId};
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Barrier, Notify, Semaphore};

/// Built-ins plus `fail`, `flaky`, `needs_key` and `panic`
pub fn registry() -> ActionRegistry {
    let mut registry = ActionRegistry::with_builtins();
    registry.register(Arc::new(FailAction));
    registry.register(Arc::new(FlakyAction::default()));
    registry.register(Arc::new(NeedsKeyAction));
    registry.register(Arc::new(PanicAction));
    registry
}

/// Always fails permanently
pub struct FailAction;

#[async_trait::async_trait]
impl Action for FailAction {
    fn name(&self) -> &str {
        "fail"
    }

    async fn invoke(&self, _: &serde_json::Value, _: &Credentials) -> Result<serde_json::Value, ActionError> {
        Err(ActionError::permanent("scripted failure"))
    }
}

/// Fails transiently `config.failures` times per distinct config, then succeeds
#[derive(Default)]
pub struct FlakyAction {
    calls: Mutex<HashMap<String, u64>>,
}

#[async_trait::async_trait]
impl Action for FlakyAction {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn invoke(&self, config: &serde_json::Value, _: &Credentials) -> Result<serde_json::Value, ActionError> {
        let failures = config.get("failures").and_then(|v| v.as_u64()).unwrap_or(1);
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(config.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if call <= failures {
            Err(ActionError::transient(format!("flaky call {}", call)))
        } else {
            Ok(serde_json::json!({ "calls": call }))
        }
    }
}

/// Requires the credential named by `config.service`
pub struct NeedsKeyAction;

#[async_trait::async_trait]
impl Action for NeedsKeyAction {
    fn name(&self) -> &str {
        "needs_key"
    }

    fn credentials(&self, config: &serde_json::Value) -> Vec<CredentialRequirement> {
        config
            .get("service")
            .and_then(|v| v.as_str())
            .map(|service| vec![CredentialRequirement::required(service)])
            .unwrap_or_default()
    }

    async fn invoke(&self, config: &serde_json::Value, credentials: &Credentials) -> Result<serde_json::Value, ActionError> {
        let service = config.get("service").and_then(|v| v.as_str()).unwrap_or_default();
        let credential = credentials
            .get(service)
            .ok_or_else(|| ActionError::permanent("credential not passed"))?;
        Ok(serde_json::json!({ "fingerprint": credential.fingerprint() }))
    }
}

pub struct PanicAction;

#[async_trait::async_trait]
impl Action for PanicAction {
    fn name(&self) -> &str {
        "panic"
    }

    async fn invoke(&self, _: &serde_json::Value, _: &Credentials) -> Result<serde_json::Value, ActionError> {
        panic!("boom");
    }
}

/// Completes only once `parties` invocations are in flight together
pub struct BarrierAction {
    name: String,
    barrier: Barrier,
}

impl BarrierAction {
    pub fn new(name: &str, parties: usize) -> Self {
        Self {
            name: name.to_string(),
            barrier: Barrier::new(parties),
        }
    }
}

#[async_trait::async_trait]
impl Action for BarrierAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _: &serde_json::Value, _: &Credentials) -> Result<serde_json::Value, ActionError> {
        self.barrier.wait().await;
        Ok(serde_json::Value::Null)
    }
}

/// Blocks every invocation until the test releases it
pub struct GateAction {
    name: String,
    open: Semaphore,
    entered: AtomicUsize,
    entered_notify: Notify,
}

impl GateAction {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            open: Semaphore::new(0),
            entered: AtomicUsize::new(0),
            entered_notify: Notify::new(),
        }
    }

    /// Let `n` blocked invocations through
    pub fn release(&self, n: usize) {
        self.open.add_permits(n);
    }

    /// Wait until at least `n` invocations are blocked on the gate
    pub async fn wait_entered(&self, n: usize) {
        loop {
            let notified = self.entered_notify.notified();
            if self.entered.load(Ordering::SeqCst) >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait::async_trait]
impl Action for GateAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _: &serde_json::Value, _: &Credentials) -> Result<serde_json::Value, ActionError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.entered_notify.notify_waiters();
        let permit = self
            .open
            .acquire()
            .await
            .map_err(|_| ActionError::permanent("gate closed"))?;
        permit.forget();
        Ok(serde_json::json!({ "gate": "passed" }))
    }
}

/// Sleeps, recording the peak number of concurrent invocations
pub struct ProbeAction {
    name: String,
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ProbeAction {
    pub fn new(name: &str, delay_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::from_millis(delay_ms),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Action for ProbeAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _: &serde_json::Value, _: &Credentials) -> Result<serde_json::Value, ActionError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(serde_json::Value::Null)
    }
}

/// In-memory workflow and credential store
#[derive(Default)]
pub struct MemoryStore {
    workflows: Mutex<HashMap<WorkflowId, StoredWorkflow>>,
    credentials: Mutex<HashMap<(UserId, String), CredentialRef>>,
    summaries: Mutex<HashMap<RunId, RunSummary>>,
    fail_summaries: AtomicBool,
}

impl MemoryStore {
    /// Make every `save_run_summary` call fail
    pub fn fail_summaries(&self) {
        self.fail_summaries.store(true, Ordering::SeqCst);
    }
}

impl WorkflowStore for MemoryStore {
    fn load_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<StoredWorkflow>> {
        Ok(self.workflows.lock().unwrap().get(workflow_id).cloned())
    }

    fn save_workflow(&self, workflow: &StoredWorkflow) -> Result<()> {
        self.workflows
            .lock()
            .unwrap()
            .insert(workflow.id, workflow.clone());
        Ok(())
    }

    fn list_workflows(&self, user_id: &UserId) -> Result<Vec<StoredWorkflow>> {
        Ok(self
            .workflows
            .lock()
            .unwrap()
            .values()
            .filter(|w| &w.user_id == user_id)
            .cloned()
            .collect())
    }

    fn save_run_summary(&self, summary: &RunSummary) -> Result<()> {
        if self.fail_summaries.load(Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        self.summaries
            .lock()
            .unwrap()
            .insert(summary.run_id, summary.clone());
        Ok(())
    }

    fn get_run_summary(&self, run_id: &RunId) -> Result<Option<RunSummary>> {
        Ok(self.summaries.lock().unwrap().get(run_id).cloned())
    }
}

impl CredentialStore for MemoryStore {
    fn lookup(&self, user_id: &UserId, service: &str) -> Result<Option<CredentialRef>> {
        Ok(self
            .credentials
            .lock()
            .unwrap()
            .get(&(user_id.clone(), service.to_string()))
            .cloned())
    }

    fn put_credential(&self, user_id: &UserId, credential: CredentialRef) -> Result<()> {
        self.credentials
            .lock()
            .unwrap()
            .insert((user_id.clone(), credential.service.clone()), credential);
        Ok(())
    }

    fn list_services(&self, user_id: &UserId) -> Result<Vec<CredentialInfo>> {
        let mut services: Vec<CredentialInfo> = self
            .credentials
            .lock()
            .unwrap()
            .keys()
            .filter(|(owner, _)| owner == user_id)
            .map(|(_, service)| CredentialInfo {
                service: service.clone(),
                created_at: Utc::now(),
            })
            .collect();
        services.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(services)
    }
}
