use super::graph::ValidatedGraph;
use super::node_executor::{NodeExecutor, NodeOutcome, RunContext};
use super::state::RunState;
use crate::actions::ActionError;
use crate::config::EngineConfig;
use crate::error::NodeError;
use crate::events::EventKind;
use crate::types::{NodeId, NodeStatus, NodeTally, RunStatus};
use chrono::Utc;
use futures::FutureExt;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;

/// Process-wide cap on concurrently executing nodes, shared by every run.
///
/// Permits are handed out in FIFO order.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a worker slot. `None` once the pool is closed.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).acquire_owned().await.ok()
    }
}

/// Result of driving a graph to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub tally: NodeTally,
}

/// Drives one run's graph: tracks readiness, dispatches nodes and
/// propagates failure and cancellation
pub struct Scheduler {
    pool: Arc<WorkerPool>,
    max_concurrency_per_run: Option<usize>,
}

type NodeTask = (NodeId, Option<NodeOutcome>);

impl Scheduler {
    pub fn new(pool: Arc<WorkerPool>, max_concurrency_per_run: Option<usize>) -> Self {
        Self {
            pool,
            max_concurrency_per_run,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Arc::new(WorkerPool::new(config.max_workers)),
            config.max_concurrency_per_run,
        )
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Run every node of `graph` to a terminal status.
    ///
    /// `state` is written only from here; the caller reads snapshots.
    pub async fn run(
        &self,
        graph: Arc<ValidatedGraph>,
        executor: Arc<NodeExecutor>,
        ctx: RunContext,
        state: Arc<RwLock<RunState>>,
    ) -> RunOutcome {
        let total = graph.len();
        let limit = self.max_concurrency_per_run.unwrap_or(usize::MAX).max(1);

        let mut remaining: HashMap<NodeId, usize> = graph
            .nodes()
            .iter()
            .map(|node| (node.id.clone(), graph.in_degree(&node.id)))
            .collect();
        let mut ready: BTreeSet<NodeId> = graph.roots().into_iter().collect();
        let mut completed = 0usize;
        let mut in_flight: JoinSet<NodeTask> = JoinSet::new();

        {
            let mut state = state.write().await;
            for node_id in &ready {
                state.mark_ready(node_id);
            }
        }
        if total > 0 {
            ctx.emitter.emit(EventKind::progress(
                0,
                total,
                format!("{} node(s) ready: {}", ready.len(), join_ids(&ready)),
            ));
        }

        tracing::info!(
            "Scheduling run {} ({} nodes, {} waves)",
            ctx.run_id,
            total,
            graph.wave_count()
        );

        loop {
            // Dispatch in ascending id order while capacity allows
            while in_flight.len() < limit {
                let Some(node_id) = ready.first().cloned() else {
                    break;
                };
                if ctx.cancel.is_cancelled() {
                    break;
                }

                let permit = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => None,
                    permit = self.pool.acquire() => permit,
                };
                let Some(permit) = permit else {
                    break;
                };

                ready.remove(&node_id);
                let Some(node) = graph.node(&node_id).cloned() else {
                    continue;
                };
                state.write().await.mark_running(&node_id);

                let execution = executor.dispatch(node, ctx.clone());
                in_flight.spawn(async move {
                    let _permit = permit;
                    let outcome = AssertUnwindSafe(execution).catch_unwind().await.ok();
                    (node_id, outcome)
                });
            }

            if in_flight.is_empty() {
                break;
            }

            match in_flight.join_next().await {
                Some(Ok((node_id, outcome))) => {
                    let outcome = match outcome {
                        Some(outcome) => outcome,
                        None => {
                            tracing::error!("Node {} task panicked in run {}", node_id, ctx.run_id);
                            lost_outcome(&node_id, &ctx, &state).await
                        }
                    };

                    let mut state = state.write().await;
                    state.record(&outcome);
                    completed += 1;

                    if outcome.status == NodeStatus::Succeeded {
                        let mut unlocked = BTreeSet::new();
                        for dependent in graph.dependents(&outcome.node_id) {
                            if state.node_status(dependent) != Some(NodeStatus::Pending) {
                                continue;
                            }
                            if let Some(count) = remaining.get_mut(dependent) {
                                *count = count.saturating_sub(1);
                                if *count == 0 && state.mark_ready(dependent) {
                                    unlocked.insert(dependent.clone());
                                }
                            }
                        }
                        if !unlocked.is_empty() {
                            ctx.emitter.emit(EventKind::progress(
                                completed,
                                total,
                                format!("{} node(s) ready: {}", unlocked.len(), join_ids(&unlocked)),
                            ));
                            ready.extend(unlocked);
                        }
                    } else {
                        for dependent in graph.transitive_dependents(&outcome.node_id) {
                            if state.mark_skipped(&dependent) {
                                ready.remove(&dependent);
                                completed += 1;
                                tracing::debug!(
                                    "Skipping node {}: dependency {} failed",
                                    dependent,
                                    outcome.node_id
                                );
                                emit_skipped(&ctx, &dependent);
                            }
                        }
                    }

                    ctx.emitter.emit(EventKind::progress(
                        completed,
                        total,
                        format!("node {} {}", outcome.node_id, status_word(outcome.status)),
                    ));
                }
                Some(Err(e)) => {
                    tracing::error!("Node task for run {} aborted: {}", ctx.run_id, e);
                }
                None => break,
            }
        }

        let mut state = state.write().await;

        // Tasks that vanished without reporting
        let lost: Vec<NodeId> = state
            .node_states
            .iter()
            .filter(|(_, s)| s.status == NodeStatus::Running)
            .map(|(id, _)| id.clone())
            .collect();
        for node_id in lost {
            let outcome = aborted_outcome(&node_id, &state);
            state.record(&outcome);
            emit_finished(&ctx, &outcome);
            completed += 1;
        }

        if ctx.cancel.is_cancelled() {
            tracing::warn!("Run {} cancelled; skipping undispatched nodes", ctx.run_id);
        }
        let mut swept = 0usize;
        for node_id in graph.topological_order() {
            if state.mark_skipped(&node_id) {
                emit_skipped(&ctx, &node_id);
                swept += 1;
            }
        }
        if swept > 0 {
            completed += swept;
            ctx.emitter.emit(EventKind::progress(
                completed,
                total,
                format!("{} node(s) skipped", swept),
            ));
        }

        let tally = state.tally();
        let status = if ctx.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if tally.succeeded == total {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };

        tracing::info!(
            "Run {} finished scheduling: {:?} ({} succeeded, {} failed, {} skipped)",
            ctx.run_id,
            status,
            tally.succeeded,
            tally.failed,
            tally.skipped
        );

        RunOutcome { status, tally }
    }
}

/// Outcome for a node whose task panicked outside the action
async fn lost_outcome(
    node_id: &NodeId,
    ctx: &RunContext,
    state: &Arc<RwLock<RunState>>,
) -> NodeOutcome {
    let outcome = aborted_outcome(node_id, &*state.read().await);
    emit_finished(ctx, &outcome);
    outcome
}

fn aborted_outcome(node_id: &NodeId, state: &RunState) -> NodeOutcome {
    let now = Utc::now();
    let started_at = state
        .node_states
        .get(node_id)
        .and_then(|s| s.started_at)
        .unwrap_or(now);
    NodeOutcome {
        node_id: node_id.clone(),
        status: NodeStatus::Failed,
        output: None,
        error: Some(NodeError::Action(ActionError::permanent(
            "node task aborted before reporting a result",
        ))),
        attempts: 0,
        started_at,
        finished_at: now,
    }
}

fn emit_finished(ctx: &RunContext, outcome: &NodeOutcome) {
    ctx.emitter.emit(EventKind::NodeFinished {
        node_id: outcome.node_id.clone(),
        status: outcome.status,
        attempts: outcome.attempts,
        result: outcome.output.clone(),
        error: outcome.error.clone(),
    });
}

fn emit_skipped(ctx: &RunContext, node_id: &NodeId) {
    ctx.emitter.emit(EventKind::NodeFinished {
        node_id: node_id.clone(),
        status: NodeStatus::Skipped,
        attempts: 0,
        result: None,
        error: None,
    });
}

fn join_ids(ids: &BTreeSet<NodeId>) -> String {
    ids.iter().map(NodeId::as_str).collect::<Vec<_>>().join(", ")
}

fn status_word(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Succeeded => "succeeded",
        NodeStatus::Failed => "failed",
        NodeStatus::Skipped => "skipped",
        NodeStatus::Pending => "pending",
        NodeStatus::Ready => "ready",
        NodeStatus::Running => "running",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionRegistry, CredentialSet};
    use crate::events::{EventEmitter, EventSubscriber, ExecutionEvent};
    use crate::testing::{self, BarrierAction, GateAction, ProbeAction};
    use crate::types::{Node, RunId, RunOrigin, WorkflowSpec};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        graph: Arc<ValidatedGraph>,
        executor: Arc<NodeExecutor>,
        ctx: RunContext,
        state: Arc<RwLock<RunState>>,
        subscriber: EventSubscriber,
    }

    fn harness(nodes: Vec<Node>, registry: ActionRegistry) -> Harness {
        let graph = Arc::new(ValidatedGraph::validate(WorkflowSpec::new("test", nodes)).unwrap());
        let emitter = Arc::new(EventEmitter::new(RunId::new(), 1024));
        let subscriber = emitter.subscribe();
        let ctx = RunContext {
            run_id: emitter.run_id(),
            emitter,
            credentials: Arc::new(CredentialSet::default()),
            cancel: CancellationToken::new(),
        };
        let state = Arc::new(RwLock::new(RunState::new(
            ctx.run_id,
            Arc::clone(&graph),
            RunOrigin::default(),
        )));
        let executor = Arc::new(NodeExecutor::new(Arc::new(registry), EngineConfig::default()));
        Harness {
            graph,
            executor,
            ctx,
            state,
            subscriber,
        }
    }

    async fn run(harness: &Harness, scheduler: &Scheduler) -> RunOutcome {
        scheduler
            .run(
                Arc::clone(&harness.graph),
                Arc::clone(&harness.executor),
                harness.ctx.clone(),
                Arc::clone(&harness.state),
            )
            .await
    }

    fn unbounded() -> Scheduler {
        Scheduler::new(Arc::new(WorkerPool::new(16)), None)
    }

    fn drain(subscriber: &mut EventSubscriber) -> Vec<ExecutionEvent> {
        std::iter::from_fn(|| subscriber.try_recv()).collect()
    }

    fn started(events: &[ExecutionEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::NodeStarted { node_id, .. } => Some(node_id.to_string()),
                _ => None,
            })
            .collect()
    }

    fn finished(events: &[ExecutionEvent]) -> Vec<(String, NodeStatus)> {
        events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::NodeFinished {
                    node_id, status, ..
                } => Some((node_id.to_string(), *status)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_join_node_waits_for_both_roots() {
        let mut h = harness(
            vec![
                Node::new("C", "echo").depends_on(["A", "B"]),
                Node::new("B", "echo"),
                Node::new("A", "echo"),
            ],
            testing::registry(),
        );

        let outcome = run(&h, &unbounded()).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.tally.succeeded, 3);

        let events = drain(&mut h.subscriber);
        assert_eq!(started(&events), vec!["A", "B", "C"]);
        assert_eq!(finished(&events).len(), 3);
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[tokio::test]
    async fn test_failure_skips_transitive_dependents_only() {
        let mut h = harness(
            vec![
                Node::new("a", "fail"),
                Node::new("b", "echo").depends_on(["a"]),
                Node::new("c", "echo").depends_on(["b"]),
                Node::new("d", "echo"),
            ],
            testing::registry(),
        );

        let outcome = run(&h, &unbounded()).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(
            outcome.tally,
            NodeTally {
                succeeded: 1,
                failed: 1,
                skipped: 2
            }
        );

        let events = drain(&mut h.subscriber);
        let starts = started(&events);
        assert!(!starts.contains(&"b".to_string()));
        assert!(!starts.contains(&"c".to_string()));
        assert!(finished(&events).contains(&("c".to_string(), NodeStatus::Skipped)));

        let state = h.state.read().await;
        assert!(state.all_terminal());
        assert_eq!(state.node_status(&NodeId::new("d")), Some(NodeStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_independent_nodes_run_in_parallel() {
        let mut registry = testing::registry();
        registry.register(Arc::new(BarrierAction::new("barrier", 2)));
        let mut h = harness(
            vec![Node::new("x", "barrier"), Node::new("y", "barrier")],
            registry,
        );

        let outcome = tokio::time::timeout(Duration::from_secs(5), run(&h, &unbounded()))
            .await
            .expect("independent nodes should not wait on each other");
        assert_eq!(outcome.status, RunStatus::Succeeded);

        let events = drain(&mut h.subscriber);
        let first_finish = events
            .iter()
            .position(|e| matches!(e.kind, EventKind::NodeFinished { .. }))
            .unwrap();
        let starts_before = events[..first_finish]
            .iter()
            .filter(|e| matches!(e.kind, EventKind::NodeStarted { .. }))
            .count();
        assert_eq!(starts_before, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_run_concurrency_limit() {
        let probe = Arc::new(ProbeAction::new("probe", 50));
        let mut registry = testing::registry();
        registry.register(probe.clone());
        let h = harness(
            (0..6).map(|i| Node::new(format!("n{}", i), "probe")).collect(),
            registry,
        );

        let scheduler = Scheduler::new(Arc::new(WorkerPool::new(16)), Some(2));
        let outcome = run(&h, &scheduler).await;

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(probe.peak(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_is_shared_across_runs() {
        let probe = Arc::new(ProbeAction::new("probe", 50));
        let mut registry = testing::registry();
        registry.register(probe.clone());
        let nodes: Vec<Node> = (0..3).map(|i| Node::new(format!("n{}", i), "probe")).collect();
        let first = harness(nodes.clone(), registry);
        let second = Harness {
            executor: Arc::clone(&first.executor),
            ..harness(nodes, ActionRegistry::new())
        };

        let scheduler = Scheduler::new(Arc::new(WorkerPool::new(2)), None);
        let (a, b) = tokio::join!(run(&first, &scheduler), run(&second, &scheduler));

        assert_eq!(a.status, RunStatus::Succeeded);
        assert_eq!(b.status, RunStatus::Succeeded);
        assert_eq!(probe.peak(), 2);
        assert_eq!(scheduler.pool().available(), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_first_wave() {
        let gate = Arc::new(GateAction::new("gate"));
        let mut registry = testing::registry();
        registry.register(gate.clone());
        let mut h = harness(
            vec![
                Node::new("a", "gate"),
                Node::new("b", "gate"),
                Node::new("c", "echo").depends_on(["a", "b"]),
            ],
            registry,
        );

        let scheduler = unbounded();
        let driver = run(&h, &scheduler);
        let canceller = async {
            gate.wait_entered(2).await;
            h.ctx.cancel.cancel();
            gate.release(2);
        };
        let (outcome, _) = tokio::join!(driver, canceller);

        assert_eq!(outcome.status, RunStatus::Cancelled);
        let events = drain(&mut h.subscriber);
        assert_eq!(started(&events), vec!["a", "b"]);
        let finishes = finished(&events);
        assert!(finishes.contains(&("a".to_string(), NodeStatus::Succeeded)));
        assert!(finishes.contains(&("b".to_string(), NodeStatus::Succeeded)));
        assert!(finishes.contains(&("c".to_string(), NodeStatus::Skipped)));
    }

    #[tokio::test]
    async fn test_cancel_before_start_dispatches_nothing() {
        let mut h = harness(
            vec![Node::new("a", "echo"), Node::new("b", "echo").depends_on(["a"])],
            testing::registry(),
        );
        h.ctx.cancel.cancel();

        let outcome = run(&h, &unbounded()).await;
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.tally.skipped, 2);

        let events = drain(&mut h.subscriber);
        assert!(started(&events).is_empty());
        assert_eq!(finished(&events).len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_order_is_deterministic() {
        let nodes = vec![
            Node::new("m", "echo"),
            Node::new("z", "echo"),
            Node::new("b", "echo").depends_on(["z"]),
            Node::new("a", "echo").depends_on(["m"]),
            Node::new("k", "echo"),
        ];

        let mut orders = Vec::new();
        for _ in 0..5 {
            let mut h = harness(nodes.clone(), testing::registry());
            run(&h, &unbounded()).await;
            orders.push(started(&drain(&mut h.subscriber)));
        }

        assert_eq!(orders[0][..3], ["k", "m", "z"]);
        assert!(orders.iter().all(|o| o == &orders[0]));
    }

    #[tokio::test]
    async fn test_empty_graph_succeeds() {
        let mut h = harness(vec![], testing::registry());
        let outcome = run(&h, &unbounded()).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert!(drain(&mut h.subscriber).is_empty());
    }

    #[tokio::test]
    async fn test_progress_reaches_total() {
        let mut h = harness(
            vec![Node::new("a", "echo"), Node::new("b", "echo").depends_on(["a"])],
            testing::registry(),
        );
        run(&h, &unbounded()).await;

        let last_progress = drain(&mut h.subscriber)
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::Progress {
                    completed,
                    total,
                    percent,
                    ..
                } => Some((completed, total, percent)),
                _ => None,
            })
            .last();
        assert_eq!(last_progress, Some((2, 2, 100)));
    }
}
