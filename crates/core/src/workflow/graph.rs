use crate::error::GraphError;
use crate::types::{Node, NodeId, WorkflowSpec};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, VecDeque};

/// A workflow graph that passed validation.
///
/// Immutable: a run holds it behind an `Arc` as its frozen snapshot. Reverse
/// edges, in-degrees and depths are computed once here so the scheduler can
/// answer readiness questions without walking the graph.
pub struct ValidatedGraph {
    spec: WorkflowSpec,
    graph: DiGraph<NodeId, ()>,
    indices: HashMap<NodeId, NodeIndex>,
    dependents: Vec<Vec<NodeId>>,
    dependencies: Vec<Vec<NodeId>>,
    depth: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl ValidatedGraph {
    /// Validate a workflow and build its execution view
    pub fn validate(spec: WorkflowSpec) -> Result<Self, GraphError> {
        let mut graph = DiGraph::with_capacity(spec.nodes.len(), 0);
        let mut indices = HashMap::with_capacity(spec.nodes.len());

        for node in &spec.nodes {
            if indices.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode {
                    node_id: node.id.clone(),
                });
            }
            let index = graph.add_node(node.id.clone());
            indices.insert(node.id.clone(), index);
        }

        // Edge from dependency to dependent (dep -> node); repeated deps collapse
        let mut dependencies = Vec::with_capacity(spec.nodes.len());
        for (position, node) in spec.nodes.iter().enumerate() {
            let mut deps = BTreeSet::new();
            for dep in &node.depends_on {
                let dep_index =
                    indices
                        .get(dep)
                        .ok_or_else(|| GraphError::UnknownDependency {
                            node_id: node.id.clone(),
                            dependency: dep.clone(),
                        })?;
                if deps.insert(dep.clone()) {
                    graph.add_edge(*dep_index, NodeIndex::new(position), ());
                }
            }
            dependencies.push(deps.into_iter().collect::<Vec<_>>());
        }

        let successors: Vec<Vec<NodeIndex>> = graph
            .node_indices()
            .map(|index| {
                let mut next: Vec<NodeIndex> = graph
                    .neighbors_directed(index, Direction::Outgoing)
                    .collect();
                next.sort_by(|a, b| graph[*a].cmp(&graph[*b]));
                next
            })
            .collect();

        if let Some(path) = find_cycle(&graph, &successors) {
            return Err(GraphError::Cycle { path });
        }

        let order = petgraph::algo::toposort(&graph, None).map_err(|cycle| GraphError::Cycle {
            path: vec![graph[cycle.node_id()].clone()],
        })?;

        // Longest path from a root
        let mut depth = vec![0usize; graph.node_count()];
        for index in order {
            for dep in graph.neighbors_directed(index, Direction::Incoming) {
                depth[index.index()] = depth[index.index()].max(depth[dep.index()] + 1);
            }
        }

        let dependents: Vec<Vec<NodeId>> = successors
            .iter()
            .map(|next| next.iter().map(|n| graph[*n].clone()).collect::<Vec<_>>())
            .collect();

        Ok(Self {
            spec,
            graph,
            indices,
            dependents,
            dependencies,
            depth,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &WorkflowSpec {
        &self.spec
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[Node] {
        &self.spec.nodes
    }

    pub fn len(&self) -> usize {
        self.spec.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spec.nodes.is_empty()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.indices.contains_key(node_id)
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&Node> {
        self.indices
            .get(node_id)
            .map(|index| &self.spec.nodes[index.index()])
    }

    /// Nodes that depend directly on `node_id`, sorted by id
    pub fn dependents(&self, node_id: &NodeId) -> &[NodeId] {
        self.indices
            .get(node_id)
            .map(|index| self.dependents[index.index()].as_slice())
            .unwrap_or(&[])
    }

    /// Direct dependencies of `node_id`, sorted by id
    pub fn dependencies(&self, node_id: &NodeId) -> &[NodeId] {
        self.indices
            .get(node_id)
            .map(|index| self.dependencies[index.index()].as_slice())
            .unwrap_or(&[])
    }

    pub fn in_degree(&self, node_id: &NodeId) -> usize {
        self.dependencies(node_id).len()
    }

    /// Length of the longest dependency chain leading to `node_id`
    pub fn depth(&self, node_id: &NodeId) -> Option<usize> {
        self.indices.get(node_id).map(|index| self.depth[index.index()])
    }

    /// Nodes with no dependencies, sorted by id
    pub fn roots(&self) -> Vec<NodeId> {
        let mut roots: Vec<NodeId> = self
            .graph
            .node_indices()
            .filter(|index| {
                self.graph
                    .neighbors_directed(*index, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|index| self.graph[index].clone())
            .collect();
        roots.sort();
        roots
    }

    /// Nodes grouped by depth, each group sorted by id
    pub fn waves(&self) -> Vec<Vec<NodeId>> {
        let mut waves: Vec<Vec<NodeId>> = Vec::new();
        for (position, node) in self.spec.nodes.iter().enumerate() {
            let depth = self.depth[position];
            if waves.len() <= depth {
                waves.resize_with(depth + 1, Vec::new);
            }
            waves[depth].push(node.id.clone());
        }
        for wave in &mut waves {
            wave.sort();
        }
        waves
    }

    pub fn wave_count(&self) -> usize {
        self.depth.iter().max().map(|d| d + 1).unwrap_or(0)
    }

    /// Dependencies first; ties broken by depth, then id
    pub fn topological_order(&self) -> Vec<NodeId> {
        self.waves().into_iter().flatten().collect()
    }

    /// Every node reachable through dependent edges, sorted by id
    pub fn transitive_dependents(&self, node_id: &NodeId) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&NodeId> = self.dependents(node_id).iter().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents(next));
            }
        }
        seen.into_iter().collect()
    }
}

/// Three-color depth-first search. Returns the first cycle found, with the
/// entry node repeated at the end.
fn find_cycle(graph: &DiGraph<NodeId, ()>, successors: &[Vec<NodeIndex>]) -> Option<Vec<NodeId>> {
    let mut marks = vec![Mark::Unvisited; graph.node_count()];

    for root in graph.node_indices() {
        if marks[root.index()] != Mark::Unvisited {
            continue;
        }

        // (node, next successor to visit)
        let mut stack: Vec<(NodeIndex, usize)> = vec![(root, 0)];
        marks[root.index()] = Mark::InProgress;

        while let Some(frame) = stack.last_mut() {
            let (current, position) = *frame;
            let next = &successors[current.index()];

            if position == next.len() {
                marks[current.index()] = Mark::Done;
                stack.pop();
                continue;
            }
            frame.1 += 1;

            let child = next[position];
            match marks[child.index()] {
                Mark::Unvisited => {
                    marks[child.index()] = Mark::InProgress;
                    stack.push((child, 0));
                }
                Mark::InProgress => {
                    let start = stack
                        .iter()
                        .position(|(index, _)| *index == child)
                        .unwrap_or(0);
                    let mut path: Vec<NodeId> = stack[start..]
                        .iter()
                        .map(|(index, _)| graph[*index].clone())
                        .collect();
                    path.push(graph[child].clone());
                    return Some(path);
                }
                Mark::Done => {}
            }
        }
    }

    None
}

impl serde::Serialize for ValidatedGraph {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.spec.serialize(serializer)
    }
}

impl std::fmt::Debug for ValidatedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedGraph")
            .field("name", &self.spec.name)
            .field("nodes", &self.spec.nodes.len())
            .field("waves", &self.wave_count())
            .finish()
    }
}
