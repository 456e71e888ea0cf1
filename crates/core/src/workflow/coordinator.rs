use super::graph::ValidatedGraph;
use super::node_executor::{NodeExecutor, RunContext};
use super::scheduler::{RunOutcome, Scheduler};
use super::state::RunState;
use crate::actions::{ActionRegistry, CredentialResolver, CredentialSet};
use crate::config::EngineConfig;
use crate::error::RunError;
use crate::events::{EventEmitter, EventKind, EventSubscriber};
use crate::storage::{CredentialStore, WorkflowStore};
use crate::types::*;
use chrono::Utc;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

struct ActiveRun {
    state: Arc<RwLock<RunState>>,
    cancel: CancellationToken,
    emitter: Arc<EventEmitter>,
}

/// Finished runs kept for status queries, oldest evicted first
struct Archive {
    capacity: usize,
    order: VecDeque<RunId>,
    runs: HashMap<RunId, RunState>,
}

impl Archive {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            runs: HashMap::new(),
        }
    }

    fn insert(&mut self, state: RunState) {
        if self.capacity == 0 {
            return;
        }
        while self.runs.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.runs.remove(&oldest);
            tracing::debug!("Evicted finished run {} from archive", oldest);
        }
        self.order.push_back(state.run_id);
        self.runs.insert(state.run_id, state);
    }

    fn remove(&mut self, run_id: &RunId) -> bool {
        if self.runs.remove(run_id).is_some() {
            self.order.retain(|id| id != run_id);
            true
        } else {
            false
        }
    }
}

struct CoordinatorInner {
    scheduler: Scheduler,
    executor: Arc<NodeExecutor>,
    workflows: Arc<dyn WorkflowStore>,
    credentials: Arc<dyn CredentialStore>,
    active: RwLock<HashMap<RunId, ActiveRun>>,
    archive: RwLock<Archive>,
    config: EngineConfig,
}

/// Owns every run: starts, tracks, cancels and finalizes them
#[derive(Clone)]
pub struct RunCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RunCoordinator {
    pub fn new(
        actions: Arc<ActionRegistry>,
        workflows: Arc<dyn WorkflowStore>,
        credentials: Arc<dyn CredentialStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                scheduler: Scheduler::from_config(&config),
                executor: Arc::new(NodeExecutor::new(actions, config.clone())),
                workflows,
                credentials,
                active: RwLock::new(HashMap::new()),
                archive: RwLock::new(Archive::new(config.retained_runs)),
                config,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validate `spec` and start running it in the background
    pub async fn start_run(&self, spec: WorkflowSpec, credentials: CredentialSet) -> Result<RunId, RunError> {
        let (run_id, _) = self.start_run_subscribed(spec, credentials).await?;
        Ok(run_id)
    }

    /// Like [`start_run`](Self::start_run), with a subscriber attached before
    /// the first event is emitted
    pub async fn start_run_subscribed(
        &self,
        spec: WorkflowSpec,
        credentials: CredentialSet,
    ) -> Result<(RunId, EventSubscriber), RunError> {
        let graph = ValidatedGraph::validate(spec)?;
        Ok(self
            .launch(graph, Arc::new(credentials), RunOrigin::default())
            .await)
    }

    /// Start a stored workflow owned by `user_id`
    pub async fn start_workflow(&self, user_id: &UserId, workflow_id: WorkflowId) -> Result<RunId, RunError> {
        let (run_id, _) = self.start_workflow_subscribed(user_id, workflow_id).await?;
        Ok(run_id)
    }

    pub async fn start_workflow_subscribed(
        &self,
        user_id: &UserId,
        workflow_id: WorkflowId,
    ) -> Result<(RunId, EventSubscriber), RunError> {
        let stored = self
            .inner
            .workflows
            .load_workflow(&workflow_id)
            .map_err(RunError::Store)?
            .filter(|w| &w.user_id == user_id)
            .ok_or(RunError::WorkflowNotFound { workflow_id })?;

        let spec = WorkflowSpec::from_value(stored.name, stored.dag)?;
        let graph = ValidatedGraph::validate(spec)?;
        let credentials = self.collect_credentials(user_id, &graph)?;

        tracing::info!(
            "Starting stored workflow {} for user {} with {} credential(s)",
            workflow_id,
            user_id,
            credentials.services().len()
        );

        let origin = RunOrigin {
            workflow_id: Some(workflow_id),
            user_id: Some(user_id.clone()),
        };
        Ok(self.launch(graph, Arc::new(credentials), origin).await)
    }

    /// Credentials the graph's actions declare, looked up once up front
    fn collect_credentials(&self, user_id: &UserId, graph: &ValidatedGraph) -> Result<CredentialSet, RunError> {
        let mut found = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for node in graph.nodes() {
            let Some(action) = self.inner.executor.actions().resolve(&node.node_type) else {
                continue;
            };
            for requirement in action.credentials(&node.config) {
                if !seen.insert(requirement.service.clone()) {
                    continue;
                }
                if let Some(credential) = self
                    .inner
                    .credentials
                    .lookup(user_id, &requirement.service)
                    .map_err(RunError::Store)?
                {
                    found.push(credential);
                }
            }
        }
        Ok(CredentialSet::new(found))
    }

    async fn launch(
        &self,
        graph: ValidatedGraph,
        credentials: Arc<dyn CredentialResolver>,
        origin: RunOrigin,
    ) -> (RunId, EventSubscriber) {
        let graph = Arc::new(graph);
        let run_id = RunId::new();
        let emitter = Arc::new(EventEmitter::new(run_id, self.inner.config.event_buffer));
        let subscriber = emitter.subscribe();
        let cancel = CancellationToken::new();

        let mut state = RunState::new(run_id, Arc::clone(&graph), origin);
        state.start();
        let state = Arc::new(RwLock::new(state));

        self.inner.active.write().await.insert(
            run_id,
            ActiveRun {
                state: Arc::clone(&state),
                cancel: cancel.clone(),
                emitter: Arc::clone(&emitter),
            },
        );

        tracing::info!(
            "Starting run {} for workflow '{}' ({} nodes)",
            run_id,
            graph.name(),
            graph.len()
        );

        let ctx = RunContext {
            run_id,
            emitter,
            credentials,
            cancel,
        };
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.drive(graph, ctx, state).await;
        });

        (run_id, subscriber)
    }

    async fn drive(&self, graph: Arc<ValidatedGraph>, ctx: RunContext, state: Arc<RwLock<RunState>>) {
        let scheduled = self.inner.scheduler.run(
            graph,
            Arc::clone(&self.inner.executor),
            ctx.clone(),
            Arc::clone(&state),
        );

        let (outcome, error) = match AssertUnwindSafe(scheduled).catch_unwind().await {
            Ok(outcome) => {
                let error = (outcome.status == RunStatus::Failed)
                    .then(|| format!("{} node(s) failed", outcome.tally.failed));
                (outcome, error)
            }
            Err(_) => {
                tracing::error!("Scheduler for run {} panicked", ctx.run_id);
                let tally = state.read().await.tally();
                (
                    RunOutcome {
                        status: RunStatus::Failed,
                        tally,
                    },
                    Some("scheduler panicked".to_string()),
                )
            }
        };

        self.finalize(ctx, state, outcome, error).await;
    }

    /// Persist the summary, emit `RunFinished`, then archive the run
    async fn finalize(
        &self,
        ctx: RunContext,
        state: Arc<RwLock<RunState>>,
        outcome: RunOutcome,
        mut error: Option<String>,
    ) {
        let run_id = ctx.run_id;
        let mut status = outcome.status;

        let mut summary = state.read().await.summary();
        summary.status = status;
        summary.finished_at = Some(Utc::now());
        summary.error = error.clone();

        if let Err(e) = self.inner.workflows.save_run_summary(&summary) {
            tracing::error!("Failed to persist summary for run {}: {:#}", run_id, e);
            status = RunStatus::Failed;
            error = Some(format!("failed to persist run summary: {:#}", e));
        }

        let snapshot = {
            let mut state = state.write().await;
            state.cancel_requested = ctx.cancel.is_cancelled();
            state.finish(status, error.clone());
            state.clone()
        };

        ctx.emitter.emit(EventKind::RunFinished {
            status,
            tally: outcome.tally,
            error,
        });

        tracing::info!("Run {} finished: {:?}", run_id, status);

        self.inner.archive.write().await.insert(snapshot);
        self.inner.active.write().await.remove(&run_id);
    }

    /// Request cancellation. In-flight nodes run to completion; nothing new is
    /// dispatched.
    pub async fn cancel(&self, run_id: RunId) -> Result<(), RunError> {
        if let Some(run) = self.inner.active.read().await.get(&run_id) {
            if run.state.read().await.overall_status.is_terminal() {
                return Err(RunError::RunAlreadyFinished { run_id });
            }
            tracing::warn!("Cancelling run {}", run_id);
            run.cancel.cancel();
            return Ok(());
        }

        if self.inner.archive.read().await.runs.contains_key(&run_id) {
            Err(RunError::RunAlreadyFinished { run_id })
        } else {
            Err(RunError::RunNotFound { run_id })
        }
    }

    /// Snapshot of an active or retained finished run
    pub async fn get_status(&self, run_id: RunId) -> Option<RunState> {
        if let Some(run) = self.inner.active.read().await.get(&run_id) {
            let mut snapshot = run.state.read().await.clone();
            snapshot.cancel_requested = run.cancel.is_cancelled();
            return Some(snapshot);
        }
        self.inner.archive.read().await.runs.get(&run_id).cloned()
    }

    /// Summary of a run: live when the run is known here, otherwise from the store
    pub async fn run_summary(&self, run_id: RunId) -> Result<Option<RunSummary>, RunError> {
        if let Some(state) = self.get_status(run_id).await {
            return Ok(Some(state.summary()));
        }
        self.inner
            .workflows
            .get_run_summary(&run_id)
            .map_err(RunError::Store)
    }

    /// Attach a subscriber to a run that has not finished yet
    pub async fn subscribe(&self, run_id: RunId) -> Result<EventSubscriber, RunError> {
        if let Some(run) = self.inner.active.read().await.get(&run_id) {
            if !run.emitter.is_closed() {
                return Ok(run.emitter.subscribe());
            }
            return Err(RunError::RunAlreadyFinished { run_id });
        }
        if self.inner.archive.read().await.runs.contains_key(&run_id) {
            return Err(RunError::RunAlreadyFinished { run_id });
        }
        Err(RunError::RunNotFound { run_id })
    }

    /// Drop a finished run from the archive. Returns whether it was retained.
    pub async fn acknowledge(&self, run_id: RunId) -> bool {
        self.inner.archive.write().await.remove(&run_id)
    }

    pub async fn active_runs(&self) -> Vec<RunId> {
        self.inner.active.read().await.keys().copied().collect()
    }
}
