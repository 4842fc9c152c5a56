use std::collections::BTreeMap;

use tracing::debug;

use super::{
    router::RouterRegistry, CompiledGraph, Target, Transition, END, ROUTER_PREFIX, START,
};
use crate::{
    agent::{AgentNode, AgentSpec},
    config::{Config, ConfigError},
    models::ModelRegistry,
    prompt::Variables,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeTarget {
    Node(Target),
    Router(String),
}

/// One parsed `"A -> B"` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Direction {
    pub source: String,
    pub target: EdgeTarget,
}

pub fn parse_direction(line: &str) -> Result<Direction, ConfigError> {
    let invalid = || ConfigError::InvalidDirection(line.to_string());
    let (source, target) = line.split_once("->").ok_or_else(invalid)?;
    let (source, target) = (source.trim(), target.trim());
    if source.is_empty() || target.is_empty() || source == END || source.starts_with(ROUTER_PREFIX)
    {
        return Err(invalid());
    }

    let target = match target.strip_prefix(ROUTER_PREFIX) {
        Some(name) if !name.trim().is_empty() => EdgeTarget::Router(name.trim().to_string()),
        Some(_) => return Err(invalid()),
        None if target == START => return Err(invalid()),
        None => EdgeTarget::Node(Target::parse(target)),
    };

    Ok(Direction {
        source: source.to_string(),
        target,
    })
}

/// Accumulates nodes and directions, then checks the graph is runnable.
pub struct GraphBuilder<'a> {
    routers: &'a RouterRegistry,
    nodes: BTreeMap<String, AgentNode>,
    order: Vec<String>,
    entry: Vec<Transition>,
    transitions: BTreeMap<String, Vec<Transition>>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(routers: &'a RouterRegistry) -> Self {
        Self {
            routers,
            nodes: BTreeMap::new(),
            order: Vec::new(),
            entry: Vec::new(),
            transitions: BTreeMap::new(),
        }
    }

    /// Registers `node` unless a node with the same id exists. Returns whether it was added.
    pub fn add_node(&mut self, node: AgentNode) -> bool {
        let id = node.id().to_string();
        if self.nodes.contains_key(&id) {
            debug!(node = %id, "node already registered");
            return false;
        }
        self.order.push(id.clone());
        self.nodes.insert(id, node);
        true
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn add_direction(&mut self, direction: &Direction) -> Result<(), ConfigError> {
        let transition = match &direction.target {
            EdgeTarget::Node(target) => {
                self.check_target(target)?;
                Transition::Direct(target.clone())
            }
            EdgeTarget::Router(name) => {
                let route = self.routers.resolve(name)?.clone();
                for target in route.routes().values() {
                    self.check_target(&Target::parse(target))?;
                }
                Transition::Routed {
                    router: name.clone(),
                    route,
                }
            }
        };

        if direction.source == START {
            self.entry.push(transition);
        } else if self.nodes.contains_key(&direction.source) {
            self.transitions
                .entry(direction.source.clone())
                .or_default()
                .push(transition);
        } else {
            return Err(ConfigError::UnknownAgent(direction.source.clone()));
        }
        Ok(())
    }

    fn check_target(&self, target: &Target) -> Result<(), ConfigError> {
        match target {
            Target::Agent(id) if !self.nodes.contains_key(id) => {
                Err(ConfigError::UnknownAgent(id.clone()))
            }
            _ => Ok(()),
        }
    }

    pub fn build(self) -> Result<CompiledGraph, ConfigError> {
        if self.entry.is_empty() {
            return Err(ConfigError::NoEntry);
        }
        for id in &self.order {
            if self.transitions.get(id).map_or(true, Vec::is_empty) {
                return Err(ConfigError::DeadEnd(id.clone()));
            }
        }
        Ok(CompiledGraph {
            nodes: self.nodes,
            order: self.order,
            entry: self.entry,
            transitions: self.transitions,
        })
    }
}

/// Agent ids named by the directions, in first-mention order.
fn referenced_agents(
    directions: &[Direction],
    routers: &RouterRegistry,
) -> Result<Vec<String>, ConfigError> {
    let mut ids: Vec<String> = Vec::new();
    let mut push = |id: &str| {
        if id != START && id != END && !ids.iter().any(|known| known == id) {
            ids.push(id.to_string());
        }
    };

    for direction in directions {
        push(&direction.source);
        match &direction.target {
            EdgeTarget::Node(Target::Agent(id)) => push(id),
            EdgeTarget::Node(Target::End) => {}
            EdgeTarget::Router(name) => {
                for target in routers.resolve(name)?.routes().values() {
                    push(target.trim());
                }
            }
        }
    }
    Ok(ids)
}

/// Materializes and compiles the agents the directions reference for one task variant,
/// then wires them up.
pub fn build_for_task(
    config: &Config,
    variables: &Variables,
    models: &ModelRegistry,
    routers: &RouterRegistry,
) -> Result<CompiledGraph, ConfigError> {
    let directions = config
        .directions
        .iter()
        .map(|line| parse_direction(line))
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = GraphBuilder::new(routers);
    for id in referenced_agents(&directions, routers)? {
        let agent = config
            .agents
            .get(&id)
            .ok_or_else(|| ConfigError::UnknownAgent(id.clone()))?;
        let node = AgentSpec::from_config(id, agent)
            .materialize(variables)
            .compile(models)?;
        builder.add_node(node);
    }

    for direction in &directions {
        builder.add_direction(direction)?;
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::AgentMemoryConfig, models::ModelHandle, providers::scripted::ScriptedProvider,
        state::ConversationState,
    };

    fn models() -> ModelRegistry {
        ModelRegistry::new().with_handle(ModelHandle::new(
            "m",
            Arc::new(ScriptedProvider::new()),
            "gpt",
        ))
    }

    fn node(id: &str, models: &ModelRegistry) -> AgentNode {
        AgentSpec {
            id: id.to_string(),
            model: "m".to_string(),
            prompt: Vec::new(),
            memory: AgentMemoryConfig::default(),
        }
        .compile(models)
        .unwrap()
    }

    fn build(lines: &[&str], agents: &[&str], routers: &RouterRegistry) -> Result<CompiledGraph, ConfigError> {
        let models = models();
        let mut builder = GraphBuilder::new(routers);
        for id in agents {
            builder.add_node(node(id, &models));
        }
        for line in lines {
            builder.add_direction(&parse_direction(line)?)?;
        }
        builder.build()
    }

    #[test]
    fn parses_trimmed_edges_and_router_directives() {
        assert_eq!(
            parse_direction("  START ->  teacher ").unwrap(),
            Direction {
                source: "START".to_string(),
                target: EdgeTarget::Node(Target::Agent("teacher".to_string())),
            }
        );
        assert_eq!(
            parse_direction("student -> END").unwrap().target,
            EdgeTarget::Node(Target::End)
        );
        assert_eq!(
            parse_direction("student -> router: check ").unwrap().target,
            EdgeTarget::Router("check".to_string())
        );
        for bad in ["student", "-> b", "END -> a", "a -> START", "a -> router:"] {
            assert!(
                matches!(parse_direction(bad), Err(ConfigError::InvalidDirection(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn linear_chain_reaches_end_through_both_agents() {
        let graph = build(
            &["START -> a", "a -> b", "b -> END"],
            &["a", "b"],
            &RouterRegistry::new(),
        )
        .unwrap();
        let (reachable, reaches_end) = graph.reachable();
        assert_eq!(reachable, ["a", "b"]);
        assert!(reaches_end);
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let models = models();
        let routers = RouterRegistry::new();
        let mut builder = GraphBuilder::new(&routers);
        assert!(builder.add_node(node("a", &models)));
        assert!(!builder.add_node(node("a", &models)));
        builder.add_direction(&parse_direction("START -> a").unwrap()).unwrap();
        builder.add_direction(&parse_direction("a -> END").unwrap()).unwrap();
        assert_eq!(builder.build().unwrap().node_ids(), ["a"]);
    }

    #[test]
    fn unknown_router_is_a_configuration_error() {
        let error = build(&["START -> a", "a -> router:missing"], &["a"], &RouterRegistry::new())
            .unwrap_err();
        assert!(matches!(error, ConfigError::UnknownRouter(name) if name == "missing"));
    }

    #[test]
    fn router_targets_must_be_known() {
        let routers = RouterRegistry::new().with_router(
            "flip",
            |_: &ConversationState| "x".to_string(),
            [("x", "ghost")],
        );
        let error = build(&["START -> a", "a -> router:flip"], &["a"], &routers).unwrap_err();
        assert!(matches!(error, ConfigError::UnknownAgent(id) if id == "ghost"));
    }

    #[test]
    fn graph_needs_an_entry_and_no_dead_ends() {
        assert!(matches!(
            build(&["a -> END"], &["a"], &RouterRegistry::new()),
            Err(ConfigError::NoEntry)
        ));
        assert!(matches!(
            build(&["START -> a", "a -> b"], &["a", "b"], &RouterRegistry::new()),
            Err(ConfigError::DeadEnd(id)) if id == "b"
        ));
    }

    #[test]
    fn build_for_task_registers_only_referenced_agents() {
        let config = Config::from_yaml_str(crate::config::tests::SAMPLE).unwrap();
        let models = ModelRegistry::with_shared_provider(&config, Arc::new(ScriptedProvider::new()));
        let variant = &config.tasks.expand().unwrap()[0];
        let graph =
            build_for_task(&config, &variant.variables, &models, &RouterRegistry::new()).unwrap();

        assert_eq!(graph.node_ids(), ["teacher", "student"]);
        let teacher = graph.node("teacher").unwrap();
        assert_eq!(teacher.spec().prompt[0].content, "You tutor third students.");
    }
}
