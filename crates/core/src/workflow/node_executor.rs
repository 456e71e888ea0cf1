use crate::actions::{Action, ActionError, ActionRegistry, CredentialResolver, Credentials};
use crate::config::EngineConfig;
use crate::error::NodeError;
use crate::events::{EventEmitter, EventKind};
use crate::types::{Node, NodeId, NodeStatus, RunId};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a node needs from the run it belongs to
#[derive(Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub emitter: Arc<EventEmitter>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub cancel: CancellationToken,
}

/// Terminal result of executing one node
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<NodeError>,
    /// Action invocations made; 0 when the node failed before invoking
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Node executor with credential resolution, timeout and retry logic
pub struct NodeExecutor {
    actions: Arc<ActionRegistry>,
    config: EngineConfig,
}

impl NodeExecutor {
    pub fn new(actions: Arc<ActionRegistry>, config: EngineConfig) -> Self {
        Self { actions, config }
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    /// Emit `NodeStarted` now and return the rest of the execution as an
    /// owned future, ready to be spawned.
    pub fn dispatch(
        self: &Arc<Self>,
        node: Node,
        ctx: RunContext,
    ) -> impl Future<Output = NodeOutcome> + Send + 'static {
        let started_at = self.announce(&node, &ctx);
        let executor = Arc::clone(self);
        async move { executor.complete(&node, &ctx, started_at).await }
    }

    /// Execute a node to completion
    pub async fn execute(&self, node: &Node, ctx: &RunContext) -> NodeOutcome {
        let started_at = self.announce(node, ctx);
        self.complete(node, ctx, started_at).await
    }

    fn announce(&self, node: &Node, ctx: &RunContext) -> DateTime<Utc> {
        tracing::debug!("Dispatching node {} ({}) for run {}", node.id, node.node_type, ctx.run_id);
        ctx.emitter.emit(EventKind::NodeStarted {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
        });
        Utc::now()
    }

    async fn complete(&self, node: &Node, ctx: &RunContext, started_at: DateTime<Utc>) -> NodeOutcome {
        let (result, attempts) = self.run_attempts(node, ctx).await;
        let finished_at = Utc::now();

        let outcome = match result {
            Ok(output) => {
                tracing::info!(
                    "Node {} succeeded for run {} after {} attempt(s)",
                    node.id,
                    ctx.run_id,
                    attempts
                );
                NodeOutcome {
                    node_id: node.id.clone(),
                    status: NodeStatus::Succeeded,
                    output: Some(output),
                    error: None,
                    attempts,
                    started_at,
                    finished_at,
                }
            }
            Err(error) => {
                tracing::warn!("Node {} failed for run {}: {}", node.id, ctx.run_id, error);
                NodeOutcome {
                    node_id: node.id.clone(),
                    status: NodeStatus::Failed,
                    output: None,
                    error: Some(error),
                    attempts,
                    started_at,
                    finished_at,
                }
            }
        };

        ctx.emitter.emit(EventKind::NodeFinished {
            node_id: outcome.node_id.clone(),
            status: outcome.status,
            attempts: outcome.attempts,
            result: outcome.output.clone(),
            error: outcome.error.clone(),
        });

        outcome
    }

    async fn run_attempts(
        &self,
        node: &Node,
        ctx: &RunContext,
    ) -> (Result<serde_json::Value, NodeError>, u32) {
        let Some(action) = self.actions.resolve(&node.node_type) else {
            return (
                Err(NodeError::UnknownActionType {
                    node_type: node.node_type.clone(),
                }),
                0,
            );
        };

        let credentials = match resolve_credentials(action.as_ref(), node, ctx) {
            Ok(credentials) => credentials,
            Err(e) => return (Err(e), 0),
        };

        let timeout = node
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.node_timeout());
        let max_attempts = node
            .retry
            .as_ref()
            .map(|r| r.max_attempts)
            .unwrap_or(self.config.max_attempts)
            .max(1);
        let backoff_ms = node
            .retry
            .as_ref()
            .and_then(|r| r.backoff_ms)
            .unwrap_or(self.config.backoff_ms);

        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::debug!("Invoking node {} (attempt {}/{})", node.id, attempt, max_attempts);

            let error = match invoke_once(action.as_ref(), node, &credentials, timeout).await {
                Ok(output) => return (Ok(output), attempt),
                Err(e) => e,
            };

            if !error.is_transient() || attempt >= max_attempts {
                return (Err(error), attempt);
            }

            let delay = backoff_delay(backoff_ms, attempt, self.config.max_backoff_ms);
            tracing::info!(
                "Retrying node {} after {:?} (attempt {}): {}",
                node.id,
                delay,
                attempt + 1,
                error
            );

            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    tracing::warn!("Run {} cancelled during backoff of node {}", ctx.run_id, node.id);
                    return (Err(error), attempt);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn resolve_credentials(
    action: &dyn Action,
    node: &Node,
    ctx: &RunContext,
) -> Result<Credentials, NodeError> {
    let mut credentials = Credentials::default();
    for requirement in action.credentials(&node.config) {
        match ctx.credentials.lookup(&requirement.service) {
            Some(credential) => {
                tracing::debug!(
                    "Resolved credential {} ({}) for node {}",
                    credential.service,
                    credential.fingerprint(),
                    node.id
                );
                credentials.insert(credential);
            }
            None if requirement.required => {
                return Err(NodeError::MissingCredential {
                    service: requirement.service,
                });
            }
            None => {}
        }
    }
    Ok(credentials)
}

async fn invoke_once(
    action: &dyn Action,
    node: &Node,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<serde_json::Value, NodeError> {
    let call = AssertUnwindSafe(action.invoke(&node.config, credentials)).catch_unwind();

    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(result)) => result.map_err(NodeError::from),
        Ok(Err(panic)) => {
            let message = panic_message(&*panic);
            tracing::error!("Action {} panicked in node {}: {}", action.name(), node.id, message);
            Err(ActionError::permanent(format!("action panicked: {}", message)).into())
        }
        Err(_) => {
            tracing::warn!("Node {} timed out after {:?}", node.id, timeout);
            Err(NodeError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// `base * 2^(attempt-1)`, capped at `max_ms`
fn backoff_delay(base_ms: u64, attempt: u32, max_ms: u64) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}
