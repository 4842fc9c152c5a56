//! Direction graphs: parsed edge lists compiled into a step machine over agent nodes.

pub mod builder;
pub mod executor;
pub mod router;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::agent::AgentNode;

pub use builder::{build_for_task, parse_direction, Direction, EdgeTarget, GraphBuilder};
pub use executor::{RunOptions, RunReport};
pub use router::{Classifier, Route, RouterRegistry, RouterSpec};

pub const START: &str = "START";
pub const END: &str = "END";
pub const ROUTER_PREFIX: &str = "router:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Agent(String),
    End,
}

impl Target {
    pub fn parse(name: &str) -> Self {
        match name.trim() {
            END => Target::End,
            other => Target::Agent(other.to_string()),
        }
    }
}

/// Outgoing edge of START or of an agent node.
#[derive(Debug, Clone)]
pub enum Transition {
    Direct(Target),
    Routed { router: String, route: Route },
}

impl Transition {
    /// Every target this transition could lead to.
    pub fn possible_targets(&self) -> Vec<Target> {
        match self {
            Transition::Direct(target) => vec![target.clone()],
            Transition::Routed { route, .. } => {
                route.routes().values().map(|t| Target::parse(t)).collect()
            }
        }
    }

    fn is_routed(&self) -> bool {
        matches!(self, Transition::Routed { .. })
    }
}

/// An executable graph for one task variant.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    nodes: BTreeMap<String, AgentNode>,
    order: Vec<String>,
    entry: Vec<Transition>,
    transitions: BTreeMap<String, Vec<Transition>>,
}

impl CompiledGraph {
    /// Node identifiers in registration order.
    pub fn node_ids(&self) -> &[String] {
        &self.order
    }

    pub fn node(&self, id: &str) -> Option<&AgentNode> {
        self.nodes.get(id)
    }

    /// Whether any node asks for its turns to be checkpointed.
    pub fn checkpointed(&self) -> bool {
        self.nodes.values().any(AgentNode::memory_enabled)
    }

    /// Nodes reachable from START in discovery order, and whether END is reachable.
    pub fn reachable(&self) -> (Vec<String>, bool) {
        let mut seen = BTreeSet::new();
        let mut visited = Vec::new();
        let mut reaches_end = false;
        let mut queue: VecDeque<Target> = ordered(&self.entry)
            .flat_map(Transition::possible_targets)
            .collect();

        while let Some(target) = queue.pop_front() {
            match target {
                Target::End => reaches_end = true,
                Target::Agent(id) => {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    if let Some(transitions) = self.transitions.get(&id) {
                        queue.extend(ordered(transitions).flat_map(Transition::possible_targets));
                    }
                    visited.push(id);
                }
            }
        }
        (visited, reaches_end)
    }
}

/// Unconditional transitions first, then routed ones, each in declaration order.
fn ordered(transitions: &[Transition]) -> impl Iterator<Item = &Transition> {
    transitions
        .iter()
        .filter(|t| !t.is_routed())
        .chain(transitions.iter().filter(|t| t.is_routed()))
}
