//! The flow engine: a directed graph of nodes whose edges are keyed by
//! outcome label, driven from a start node until a node yields a label
//! with no outgoing edge.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::context::FlowContext;
use crate::node::{Node, NodeError};

/// Transitions before a run is aborted as runaway. A misconfigured
/// graph with a self-loop would otherwise run unboundedly.
pub const DEFAULT_STEP_LIMIT: usize = 64;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid flow: {0}")]
    Invalid(String),
    #[error("node `{node}` failed: {source}")]
    Node { node: String, source: NodeError },
    #[error("flow exceeded {limit} transitions without terminating")]
    StepLimit { limit: usize },
}

/// Handle to a node registered with a [`FlowBuilder`]. Only valid for
/// the builder that minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Builds the (node, label) → node edge map once, at flow-construction
/// time. The resulting [`Flow`] is immutable.
pub struct FlowBuilder {
    nodes: Vec<Arc<dyn Node>>,
    edges: Vec<(NodeId, String, NodeId)>,
    start: Option<NodeId>,
    step_limit: usize,
}

impl FlowBuilder {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            start: None,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    pub fn node(&mut self, node: Arc<dyn Node>) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn start(&mut self, id: NodeId) -> &mut Self {
        self.start = Some(id);
        self
    }

    /// Register the edge taken when `from` finalizes with `label`.
    pub fn edge(&mut self, from: NodeId, label: &str, to: NodeId) -> &mut Self {
        self.edges.push((from, label.to_string(), to));
        self
    }

    pub fn step_limit(&mut self, limit: usize) -> &mut Self {
        self.step_limit = limit;
        self
    }

    pub fn build(self) -> Result<Flow, FlowError> {
        let start = self
            .start
            .ok_or_else(|| FlowError::Invalid("no start node designated".into()))?;

        let mut edges: HashMap<(usize, String), usize> = HashMap::new();
        for (from, label, to) in self.edges {
            if edges.insert((from.0, label.clone()), to.0).is_some() {
                return Err(FlowError::Invalid(format!(
                    "duplicate edge from `{}` on label `{}`",
                    self.nodes[from.0].name(),
                    label
                )));
            }
        }

        Ok(Flow {
            nodes: self.nodes,
            edges,
            start: start.0,
            step_limit: self.step_limit,
        })
    }
}

impl Default for FlowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One configured graph of nodes. Stateless between runs; the same
/// flow may drive many independent contexts concurrently, each from
/// its own task.
pub struct Flow {
    nodes: Vec<Arc<dyn Node>>,
    edges: HashMap<(usize, String), usize>,
    start: usize,
    step_limit: usize,
}

impl Flow {
    /// Drive `ctx` from the start node until a node finalizes with a
    /// label that has no outgoing edge (the only termination
    /// condition). Node failures propagate; mutations already applied
    /// to `ctx` before the failing phase remain.
    #[tracing::instrument(name = "flow_run", skip(self, ctx), fields(task_id = %ctx.task_id))]
    pub async fn run(&self, ctx: &mut FlowContext) -> Result<(), FlowError> {
        let mut current = self.start;

        for step in 0..self.step_limit {
            let node = &self.nodes[current];
            let fail = |source: NodeError| FlowError::Node { node: node.name().to_string(), source };

            let input = node.prepare(ctx).await.map_err(fail)?;
            let result = node.execute(&input).await.map_err(fail)?;
            let label = node.finalize(ctx, input, result).await.map_err(fail)?;

            debug!(step, node = node.name(), label = %label, "node finalized");

            match self.edges.get(&(current, label.clone())) {
                Some(&next) => current = next,
                None => {
                    info!(node = node.name(), label = %label, "flow terminated");
                    return Ok(());
                }
            }
        }

        Err(FlowError::StepLimit { limit: self.step_limit })
    }
}
