//! Runtime step graph.
//!
//! Built once at run start: data-dependency edges come from statically
//! scanning each step's config for template references, branch edges from
//! condition/switch targets. Acyclicity is a hard precondition checked
//! before anything executes. The graph drives scheduling (which steps are
//! ready) and branch skipping (which subtrees an unselected branch disables).

use std::collections::HashMap;

use petgraph::{
    Direction,
    algo::is_cyclic_directed,
    graph::{DiGraph, EdgeIndex, NodeIndex},
    visit::EdgeRef,
};

use crate::{
    FlowgateError, Result, ShareLock,
    expr::scan_step_refs,
    model::StepModel,
    pipeline::{
        Step, StepId, StepState,
    },
};

/// Why an edge exists: a template reference or a branch selection.
#[derive(Debug, Clone, PartialEq)]
pub enum DepKind {
    /// The target's config references the source's output.
    Data,
    /// The source is a condition/switch and the target is the branch entry
    /// for this handle.
    Branch(String),
}

#[derive(Debug, Clone)]
pub struct DepEdge {
    pub kind: DepKind,
    /// Set when branch skipping disables this edge.
    pub skipped: bool,
}

#[derive(Clone)]
pub struct StepGraph {
    graph: ShareLock<DiGraph<Step, DepEdge>>,
}

impl StepGraph {
    /// Parse the step list and derive the dependency structure. References
    /// to unknown steps are rejected.
    pub fn build(steps: &[StepModel]) -> Result<Self> {
        Self::build_with(steps, true)
    }

    /// Graph for a loop body: references to steps outside the body carry no
    /// edge and resolve at runtime from the parent's committed outputs.
    pub fn build_nested(steps: &[StepModel]) -> Result<Self> {
        Self::build_with(steps, false)
    }

    fn build_with(
        steps: &[StepModel],
        strict: bool,
    ) -> Result<Self> {
        let mut graph: DiGraph<Step, DepEdge> = DiGraph::new();
        let mut indices: HashMap<StepId, NodeIndex> = HashMap::new();

        for model in steps {
            let step = Step::new(model)?;
            if indices.contains_key(&step.id) {
                return Err(FlowgateError::Pipeline(format!("duplicate step id '{}'", step.id)));
            }
            let sid = step.id.clone();
            let idx = graph.add_node(step);
            indices.insert(sid, idx);
        }

        for model in steps {
            let idx = indices[&model.id];
            let local = graph[idx].action.local_step_ids();

            for referenced in scan_step_refs(&model.config) {
                if local.contains(&referenced) {
                    continue;
                }
                let src = match indices.get(&referenced) {
                    Some(src) => *src,
                    None if !strict => continue,
                    None => {
                        return Err(FlowgateError::Validation(format!(
                            "step '{}' references unknown step '{}'",
                            model.id, referenced
                        )));
                    }
                };
                graph.add_edge(
                    src,
                    idx,
                    DepEdge {
                        kind: DepKind::Data,
                        skipped: false,
                    },
                );
            }

            for (handle, target) in graph[idx].action.branch_targets() {
                let dst = *indices.get(&target).ok_or_else(|| {
                    FlowgateError::Validation(format!("step '{}' selects unknown branch target '{}'", model.id, target))
                })?;
                graph.add_edge(
                    idx,
                    dst,
                    DepEdge {
                        kind: DepKind::Branch(handle),
                        skipped: false,
                    },
                );
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(FlowgateError::Cycle("the step reference graph contains a cycle".to_string()));
        }

        Ok(Self {
            graph: ShareLock::new(graph.into()),
        })
    }

    fn index_of(
        graph: &DiGraph<Step, DepEdge>,
        sid: &StepId,
    ) -> Option<NodeIndex> {
        graph.node_indices().find(|idx| graph[*idx].id.eq(sid))
    }

    pub fn get_step(
        &self,
        sid: &StepId,
    ) -> Option<Step> {
        let graph = self.graph.read().unwrap();
        Self::index_of(&graph, sid).map(|idx| graph[idx].clone())
    }

    pub fn state(
        &self,
        sid: &StepId,
    ) -> Option<StepState> {
        let graph = self.graph.read().unwrap();
        Self::index_of(&graph, sid).map(|idx| graph[idx].state)
    }

    pub fn mark_state(
        &self,
        sid: &StepId,
        state: StepState,
    ) {
        let mut graph = self.graph.write().unwrap();
        if let Some(idx) = Self::index_of(&graph, sid) {
            graph[idx].state = state;
        }
    }

    pub fn mark_continued(
        &self,
        sid: &StepId,
    ) {
        let mut graph = self.graph.write().unwrap();
        if let Some(idx) = Self::index_of(&graph, sid) {
            graph[idx].continued = true;
        }
    }

    pub fn all_step_ids(&self) -> Vec<StepId> {
        let graph = self.graph.read().unwrap();
        graph.node_indices().map(|idx| graph[idx].id.clone()).collect()
    }

    /// Steps with no dependencies; runnable at start.
    pub fn roots(&self) -> Vec<StepId> {
        let graph = self.graph.read().unwrap();
        graph
            .node_indices()
            .filter(|idx| graph.edges_directed(*idx, Direction::Incoming).count() == 0)
            .map(|idx| graph[idx].id.clone())
            .collect()
    }

    /// Whether an incoming edge no longer blocks its target.
    fn edge_satisfied(
        graph: &DiGraph<Step, DepEdge>,
        edge: EdgeIndex,
    ) -> bool {
        if graph[edge].skipped {
            return true;
        }
        let (src, _) = graph.edge_endpoints(edge).unwrap();
        let source = &graph[src];
        match source.state {
            StepState::Succeeded | StepState::Skipped => true,
            StepState::Failed => source.continued,
            _ => false,
        }
    }

    fn is_ready(
        graph: &DiGraph<Step, DepEdge>,
        idx: NodeIndex,
    ) -> bool {
        graph[idx].state == StepState::Pending
            && graph.edges_directed(idx, Direction::Incoming).all(|e| Self::edge_satisfied(graph, e.id()))
    }

    /// Successors of a finished step that are now runnable.
    pub fn ready_successors(
        &self,
        sid: &StepId,
    ) -> Vec<StepId> {
        let graph = self.graph.read().unwrap();
        let Some(idx) = Self::index_of(&graph, sid) else {
            return Vec::new();
        };
        let mut ready: Vec<StepId> = graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| e.target())
            .filter(|dst| Self::is_ready(&graph, *dst))
            .map(|dst| graph[dst].id.clone())
            .collect();
        ready.sort();
        ready.dedup();
        ready
    }

    /// Next runnable step, for sequential (loop body) execution.
    pub fn next_runnable(&self) -> Option<StepId> {
        let graph = self.graph.read().unwrap();
        graph.node_indices().find(|idx| Self::is_ready(&graph, *idx)).map(|idx| graph[idx].id.clone())
    }

    /// A data dependency whose source was skipped by branching, if any. Such
    /// a step must fail fast instead of running.
    pub fn skipped_data_source(
        &self,
        sid: &StepId,
    ) -> Option<StepId> {
        let graph = self.graph.read().unwrap();
        let idx = Self::index_of(&graph, sid)?;
        graph
            .edges_directed(idx, Direction::Incoming)
            .filter(|e| e.weight().kind == DepKind::Data)
            .map(|e| e.source())
            .find(|src| graph[*src].state == StepState::Skipped)
            .map(|src| graph[src].id.clone())
    }

    /// Skip every branch a condition/switch did not select. Returns the step
    /// ids that became Skipped.
    ///
    /// Skipping travels the branch structure only: a branch target is
    /// skipped once every branch edge into it is skipped, and nested
    /// conditions inside a skipped branch cascade through their own branch
    /// edges. Steps that merely *reference* a skipped step's output are not
    /// part of the subtree; they stay schedulable and fail fast with a
    /// skipped-dependency error instead.
    pub fn skip_unselected(
        &self,
        sid: &StepId,
        selected_handle: &str,
    ) -> Vec<StepId> {
        let mut to_process: Vec<EdgeIndex> = {
            let graph = self.graph.read().unwrap();
            let Some(idx) = Self::index_of(&graph, sid) else {
                return Vec::new();
            };
            graph
                .edges_directed(idx, Direction::Outgoing)
                .filter(|e| matches!(&e.weight().kind, DepKind::Branch(handle) if handle != selected_handle))
                .map(|e| e.id())
                .collect()
        };

        let mut skipped = Vec::new();

        while let Some(edge_idx) = to_process.pop() {
            let mut graph = self.graph.write().unwrap();

            if graph[edge_idx].skipped {
                continue;
            }
            graph[edge_idx].skipped = true;

            let (_, target_idx) = graph.edge_endpoints(edge_idx).unwrap();
            let all_branch_edges_skipped = graph
                .edges_directed(target_idx, Direction::Incoming)
                .filter(|e| matches!(e.weight().kind, DepKind::Branch(_)))
                .all(|e| e.weight().skipped);

            if all_branch_edges_skipped && graph[target_idx].state == StepState::Pending {
                graph[target_idx].state = StepState::Skipped;
                skipped.push(graph[target_idx].id.clone());

                let outgoing: Vec<EdgeIndex> = graph
                    .edges_directed(target_idx, Direction::Outgoing)
                    .filter(|e| matches!(e.weight().kind, DepKind::Branch(_)))
                    .map(|e| e.id())
                    .collect();
                drop(graph);
                to_process.extend(outgoing);
            }
        }

        skipped
    }

    /// Whether every step has reached a terminal state.
    pub fn is_all_terminal(&self) -> bool {
        let graph = self.graph.read().unwrap();
        graph.node_indices().all(|idx| graph[idx].state.is_terminal())
    }

    /// Current (id, state, continued) tuples, for aggregation and records.
    pub fn states(&self) -> Vec<(StepId, StepState, bool)> {
        let graph = self.graph.read().unwrap();
        graph.node_indices().map(|idx| (graph[idx].id.clone(), graph[idx].state, graph[idx].continued)).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn wait_step(id: &str) -> StepModel {
        StepModel {
            id: id.to_string(),
            kind: "wait".to_string(),
            config: json!({"duration_seconds": 0}),
            ..Default::default()
        }
    }

    fn transform_step(
        id: &str,
        input: &str,
    ) -> StepModel {
        StepModel {
            id: id.to_string(),
            kind: "transform".to_string(),
            config: json!({
                "language": "javascript",
                "code": "function main(params) { return params; }",
                "inputs": [{"name": "x", "value": input}]
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_data_edges_from_references() {
        let steps = vec![
            wait_step("a"),
            transform_step("b", "${steps.a.output.data}"),
            transform_step("c", "${steps.b.output.data.x}"),
        ];
        let graph = StepGraph::build(&steps).unwrap();

        assert_eq!(graph.roots(), vec!["a".to_string()]);

        graph.mark_state(&"a".to_string(), StepState::Succeeded);
        assert_eq!(graph.ready_successors(&"a".to_string()), vec!["b".to_string()]);

        graph.mark_state(&"b".to_string(), StepState::Succeeded);
        assert_eq!(graph.ready_successors(&"b".to_string()), vec!["c".to_string()]);
    }

    #[test]
    fn test_cycle_rejected() {
        let steps = vec![
            transform_step("a", "${steps.b.output.data.x}"),
            transform_step("b", "${steps.a.output.data.x}"),
        ];
        let err = StepGraph::build(&steps).err().unwrap();
        assert!(matches!(err, FlowgateError::Cycle(_)));
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let steps = vec![transform_step("a", "${steps.ghost.output.data}")];
        let err = StepGraph::build(&steps).err().unwrap();
        assert!(err.to_string().contains("unknown step 'ghost'"));
    }

    #[test]
    fn test_independent_steps_are_all_roots() {
        let steps = vec![wait_step("a"), wait_step("b"), wait_step("c")];
        let graph = StepGraph::build(&steps).unwrap();
        assert_eq!(graph.roots().len(), 3);
    }

    #[test]
    fn test_skip_travels_branch_edges_only() {
        // cond selects between t and f; t2 references t's output
        let steps = vec![
            StepModel {
                id: "cond".to_string(),
                kind: "condition".to_string(),
                config: json!({
                    "conditions": [{"selector": "${var:flag}", "op": "eq", "value": true}],
                    "then_step": "t",
                    "else_step": "f"
                }),
                ..Default::default()
            },
            wait_step("t"),
            wait_step("f"),
            transform_step("t2", "${steps.t.output.data}"),
        ];
        let graph = StepGraph::build(&steps).unwrap();

        graph.mark_state(&"cond".to_string(), StepState::Succeeded);
        let skipped = graph.skip_unselected(&"cond".to_string(), "false");

        // the branch target is skipped; its data-dependent is not absorbed
        // into the subtree, it must fail fast when scheduled instead
        assert_eq!(skipped, vec!["t".to_string()]);
        assert_eq!(graph.state(&"t".to_string()), Some(StepState::Skipped));
        assert_eq!(graph.state(&"t2".to_string()), Some(StepState::Pending));
        assert_eq!(graph.skipped_data_source(&"t2".to_string()), Some("t".to_string()));
        assert_eq!(graph.state(&"f".to_string()), Some(StepState::Pending));
        assert_eq!(graph.ready_successors(&"cond".to_string()), vec!["f".to_string()]);
    }

    #[test]
    fn test_nested_branch_cascades() {
        // outer selects between an inner condition and f; skipping the inner
        // condition skips both of its targets
        let steps = vec![
            StepModel {
                id: "outer".to_string(),
                kind: "condition".to_string(),
                config: json!({
                    "conditions": [{"selector": "${var:flag}", "op": "eq", "value": true}],
                    "then_step": "inner",
                    "else_step": "f"
                }),
                ..Default::default()
            },
            StepModel {
                id: "inner".to_string(),
                kind: "condition".to_string(),
                config: json!({
                    "conditions": [{"selector": "${var:deep}", "op": "eq", "value": true}],
                    "then_step": "x",
                    "else_step": "y"
                }),
                ..Default::default()
            },
            wait_step("x"),
            wait_step("y"),
            wait_step("f"),
        ];
        let graph = StepGraph::build(&steps).unwrap();

        graph.mark_state(&"outer".to_string(), StepState::Succeeded);
        let skipped = graph.skip_unselected(&"outer".to_string(), "false");

        assert!(skipped.contains(&"inner".to_string()));
        assert!(skipped.contains(&"x".to_string()));
        assert!(skipped.contains(&"y".to_string()));
        assert_eq!(graph.state(&"f".to_string()), Some(StepState::Pending));
    }

    #[test]
    fn test_skipped_data_source_detected() {
        let steps = vec![
            StepModel {
                id: "cond".to_string(),
                kind: "condition".to_string(),
                config: json!({
                    "conditions": [{"selector": "${var:flag}", "op": "eq", "value": true}],
                    "then_step": "t",
                    "else_step": "f"
                }),
                ..Default::default()
            },
            wait_step("t"),
            wait_step("f"),
            // depends on the skipped branch's output and on the live branch
            StepModel {
                id: "join".to_string(),
                kind: "transform".to_string(),
                config: json!({
                    "language": "javascript",
                    "code": "function main(params) { return params; }",
                    "inputs": [
                        {"name": "a", "value": "${steps.t.output.data}"},
                        {"name": "b", "value": "${steps.f.output.data}"}
                    ]
                }),
                ..Default::default()
            },
        ];
        let graph = StepGraph::build(&steps).unwrap();

        graph.mark_state(&"cond".to_string(), StepState::Succeeded);
        graph.skip_unselected(&"cond".to_string(), "false");
        graph.mark_state(&"f".to_string(), StepState::Succeeded);

        // join is ready (skipped source satisfies readiness) but must fail
        // fast because it requires t's output
        assert_eq!(graph.ready_successors(&"f".to_string()), vec!["join".to_string()]);
        assert_eq!(graph.skipped_data_source(&"join".to_string()), Some("t".to_string()));
    }

    #[test]
    fn test_failed_continued_satisfies_dependents() {
        let steps = vec![wait_step("a"), transform_step("b", "${steps.a.output.data}")];
        let graph = StepGraph::build(&steps).unwrap();

        graph.mark_state(&"a".to_string(), StepState::Failed);
        assert!(graph.ready_successors(&"a".to_string()).is_empty());

        graph.mark_continued(&"a".to_string());
        assert_eq!(graph.ready_successors(&"a".to_string()), vec!["b".to_string()]);
    }
}
