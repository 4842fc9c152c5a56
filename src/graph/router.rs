//! Named routing directives: a classifier over the conversation plus a label table.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{config::ConfigError, state::ConversationState};

/// Returns the label of the branch to take given the conversation so far.
pub type Classifier = Arc<dyn Fn(&ConversationState) -> String + Send + Sync>;

/// Declarative routers that can be written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouterSpec {
    /// `matched` when the last message contains `pattern`, otherwise `otherwise`.
    Contains {
        pattern: String,
        matched: String,
        otherwise: String,
        routes: BTreeMap<String, String>,
    },
    /// `stop` once agents have written `max_turns` messages, `continue` before.
    TurnLimit {
        max_turns: usize,
        stop: String,
        #[serde(rename = "continue")]
        proceed: String,
        routes: BTreeMap<String, String>,
    },
}

impl RouterSpec {
    fn into_route(self) -> Route {
        match self {
            RouterSpec::Contains {
                pattern,
                matched,
                otherwise,
                routes,
            } => Route::new(
                Arc::new(move |state: &ConversationState| {
                    let hit = state
                        .last()
                        .map(|m| m.content.contains(&pattern))
                        .unwrap_or(false);
                    if hit {
                        matched.clone()
                    } else {
                        otherwise.clone()
                    }
                }),
                routes,
            ),
            RouterSpec::TurnLimit {
                max_turns,
                stop,
                proceed,
                routes,
            } => Route::new(
                Arc::new(move |state: &ConversationState| {
                    if state.agent_turns() >= max_turns {
                        stop.clone()
                    } else {
                        proceed.clone()
                    }
                }),
                routes,
            ),
        }
    }
}

/// A classifier and the targets its labels map to.
#[derive(Clone)]
pub struct Route {
    classifier: Classifier,
    routes: BTreeMap<String, String>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route").field("routes", &self.routes).finish()
    }
}

impl Route {
    pub fn new(classifier: Classifier, routes: BTreeMap<String, String>) -> Self {
        Self { classifier, routes }
    }

    pub fn classify(&self, state: &ConversationState) -> String {
        (self.classifier)(state)
    }

    pub fn routes(&self) -> &BTreeMap<String, String> {
        &self.routes
    }
}

/// Directive name to route. Lookup of an unregistered name is a configuration error.
#[derive(Debug, Clone, Default)]
pub struct RouterRegistry {
    routes: BTreeMap<String, Route>,
}

impl RouterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, I, L, T>(&mut self, name: impl Into<String>, classifier: F, routes: I)
    where
        F: Fn(&ConversationState) -> String + Send + Sync + 'static,
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: Into<String>,
    {
        let routes = routes
            .into_iter()
            .map(|(label, target)| (label.into(), target.into()))
            .collect();
        self.routes
            .insert(name.into(), Route::new(Arc::new(classifier), routes));
    }

    pub fn with_router<F, I, L, T>(mut self, name: impl Into<String>, classifier: F, routes: I) -> Self
    where
        F: Fn(&ConversationState) -> String + Send + Sync + 'static,
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: Into<String>,
    {
        self.register(name, classifier, routes);
        self
    }

    pub fn insert_spec(&mut self, name: impl Into<String>, spec: RouterSpec) {
        self.routes.insert(name.into(), spec.into_route());
    }

    /// Registry holding every router declared in the configuration.
    pub fn from_specs(specs: &BTreeMap<String, RouterSpec>) -> Self {
        let mut registry = Self::new();
        for (name, spec) in specs {
            registry.insert_spec(name.clone(), spec.clone());
        }
        registry
    }

    /// Adds `other`'s entries; names already present are replaced.
    pub fn merge(&mut self, other: &RouterRegistry) {
        for (name, route) in &other.routes {
            self.routes.insert(name.clone(), route.clone());
        }
    }

    pub fn resolve(&self, name: &str) -> Result<&Route, ConfigError> {
        self.routes
            .get(name.trim())
            .ok_or_else(|| ConfigError::UnknownRouter(name.trim().to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateMessage;

    fn state(contents: &[(&str, &str)]) -> ConversationState {
        ConversationState::with_messages(
            contents
                .iter()
                .map(|(who, text)| StateMessage::from_agent(*who, *text))
                .collect(),
        )
    }

    #[test]
    fn contains_router_reads_the_last_message() {
        let spec: RouterSpec = serde_yaml::from_str(
            "kind: contains\npattern: DONE\nmatched: finish\notherwise: again\nroutes:\n  finish: END\n  again: teacher\n",
        )
        .unwrap();
        let mut registry = RouterRegistry::new();
        registry.insert_spec("check", spec);
        let route = registry.resolve("check").unwrap();

        assert_eq!(route.classify(&state(&[("student", "still thinking")])), "again");
        assert_eq!(route.classify(&state(&[("student", "DONE, it is 12")])), "finish");
        assert_eq!(route.routes()["finish"], "END");
    }

    #[test]
    fn turn_limit_router_counts_agent_messages() {
        let spec: RouterSpec = serde_yaml::from_str(
            "kind: turn_limit\nmax_turns: 2\nstop: stop\ncontinue: go\nroutes:\n  stop: END\n  go: student\n",
        )
        .unwrap();
        let route = RouterRegistry::from_specs(&BTreeMap::from([("limit".to_string(), spec)]))
            .resolve("limit")
            .unwrap()
            .clone();

        assert_eq!(route.classify(&state(&[("teacher", "a")])), "go");
        assert_eq!(route.classify(&state(&[("teacher", "a"), ("student", "b")])), "stop");
    }

    #[test]
    fn statically_registered_routers_resolve_by_trimmed_name() {
        let registry = RouterRegistry::new().with_router(
            "always_end",
            |_: &ConversationState| "end".to_string(),
            [("end", "END")],
        );
        assert!(registry.resolve("  always_end ").is_ok());
        assert!(matches!(
            registry.resolve("nope"),
            Err(ConfigError::UnknownRouter(name)) if name == "nope"
        ));
    }
}
