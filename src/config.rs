use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    eval::schema::EvalConfig,
    graph::router::RouterSpec,
    prompt::Prompt,
    retry::RetryPolicy,
    tasks::TaskBlock,
    types::MessageRole,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("configuration file contains no document")]
    Empty,
    #[error("unknown task mode '{0}' (expected 'union' or 'iter')")]
    UnknownTaskMode(String),
    #[error("invalid task content: {0}")]
    InvalidTasks(String),
    #[error("agent '{agent}' references unknown model '{model}'")]
    UnknownModel { agent: String, model: String },
    #[error("unknown model type '{0}'")]
    UnknownModelType(String),
    #[error("environment variable {0} referenced by the configuration is not set")]
    MissingEnv(String),
    #[error("unknown agent '{0}' in directions")]
    UnknownAgent(String),
    #[error("unknown router '{0}'")]
    UnknownRouter(String),
    #[error("invalid direction '{0}': expected 'A -> B'")]
    InvalidDirection(String),
    #[error("directions declare no START edge")]
    NoEntry,
    #[error("agent '{0}' has no outgoing direction")]
    DeadEnd(String),
    #[error("{owner} uses role '{role}'; prompts may only use system, user or assistant")]
    InvalidRole { owner: String, role: String },
    #[error("configuration has no evaluation section")]
    MissingEvaluation,
    #[error("failed to initialise model '{name}': {message}")]
    ModelInit { name: String, message: String },
}

fn default_concurrency() -> usize {
    8
}

fn default_recursion_limit() -> usize {
    25
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_model_type() -> String {
    "openai".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySettings {
    #[serde(default = "MemorySettings::default_path")]
    pub path: PathBuf,
}

impl MemorySettings {
    fn default_path() -> PathBuf {
        PathBuf::from(".")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.path.join("checkpoints")
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Wall-clock ceiling for a single run; unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            recursion_limit: default_recursion_limit(),
            memory: MemorySettings::default(),
            retry: RetryPolicy::default(),
            request_timeout_ms: default_request_timeout_ms(),
            run_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(rename = "type", default = "default_model_type")]
    pub kind: String,
    /// Extra request parameters (`temperature`, `max_tokens`, ...).
    #[serde(default, alias = "kwargs", skip_serializing_if = "Map::is_empty")]
    pub kargs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchConfig {
    #[serde(default = "default_true")]
    pub swap_user_assistant: bool,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            swap_user_assistant: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMemoryConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub when_switch: SwitchConfig,
}

impl Default for AgentMemoryConfig {
    fn default() -> Self {
        Self {
            enable: true,
            id: None,
            when_switch: SwitchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub model: String,
    pub prompt: Vec<Prompt>,
    #[serde(default)]
    pub memory: AgentMemoryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub globals: GlobalConfig,
    pub models: BTreeMap<String, ModelConfig>,
    pub agents: BTreeMap<String, AgentConfig>,
    pub directions: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: BTreeMap<String, RouterSpec>,
    pub tasks: TaskBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvalConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parses YAML; with several documents the last one wins.
    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        let mut last = None;
        for document in serde_yaml::Deserializer::from_str(input) {
            last = Some(serde_yaml::Value::deserialize(document)?);
        }
        let value = match last {
            Some(serde_yaml::Value::Null) | None => return Err(ConfigError::Empty),
            Some(value) => value,
        };

        let config: Config = serde_yaml::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, agent) in &self.agents {
            if !self.models.contains_key(&agent.model) {
                return Err(ConfigError::UnknownModel {
                    agent: name.clone(),
                    model: agent.model.clone(),
                });
            }
            check_roles(&format!("agent '{name}'"), &agent.prompt)?;
        }
        check_roles("tasks.start_prompt", std::slice::from_ref(&self.tasks.start_prompt))?;

        if let Some(evaluation) = &self.evaluation {
            if !self.models.contains_key(&evaluation.model) {
                return Err(ConfigError::UnknownModel {
                    agent: "evaluation".to_string(),
                    model: evaluation.model.clone(),
                });
            }
            check_roles("evaluation", &evaluation.prompt)?;
        }

        // Surfaces an unknown mode before any model is touched.
        self.tasks.expand()?;
        Ok(())
    }

    pub fn evaluation(&self) -> Result<&EvalConfig, ConfigError> {
        self.evaluation.as_ref().ok_or(ConfigError::MissingEvaluation)
    }
}

fn check_roles(owner: &str, prompts: &[Prompt]) -> Result<(), ConfigError> {
    match prompts.iter().find(|p| p.role == MessageRole::Tool) {
        Some(prompt) => Err(ConfigError::InvalidRole {
            owner: owner.to_string(),
            role: prompt.role.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
globals:
  concurrency: 2
  recursion_limit: 10
  memory:
    path: ./runs
models:
  local:
    api_base: http://localhost:11434/v1
    model: qwen
    type: ollama
    kargs:
      temperature: 0.2
agents:
  teacher:
    model: local
    prompt:
      - role: system
        content: "You tutor {grade} students."
  student:
    model: local
    prompt:
      - role: system
        content: "You are a {grade} student."
    memory:
      enable: false
directions:
  - START -> teacher
  - teacher -> student
  - student -> END
tasks:
  mode: union
  start_prompt:
    role: user
    content: "Problem: {question}"
  content:
    grade: [third, fifth]
    question: ["1+1", "2*3"]
evaluation:
  model: local
  strategy: prompt
  prompt:
    - role: system
      content: "Grade the dialogue."
    - role: user
      content: "{messages}"
  format:
    - field: clarity
      type: int
      description: clarity score
"#;

    #[test]
    fn parses_the_full_document() {
        let config = Config::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.globals.concurrency, 2);
        assert_eq!(config.globals.retry, RetryPolicy::default());
        assert_eq!(config.models["local"].kind, "ollama");
        assert_eq!(config.agents["teacher"].prompt[0].role, MessageRole::System);
        assert!(config.agents["teacher"].memory.enable);
        assert!(!config.agents["student"].memory.enable);
        assert!(config.agents["student"].memory.when_switch.swap_user_assistant);
        assert_eq!(config.directions.len(), 3);
        assert_eq!(config.tasks.expand().unwrap().len(), 4);
        assert!(config.evaluation().is_ok());
    }

    #[test]
    fn last_document_wins() {
        let input = format!("models: {{}}\n---\n{SAMPLE}");
        let config = Config::from_yaml_str(&input).unwrap();
        assert_eq!(config.agents.len(), 2);
    }

    #[test]
    fn rejects_agents_with_unknown_models() {
        let input = SAMPLE.replace("    model: local\n    prompt:\n      - role: system\n        content: \"You are", "    model: missing\n    prompt:\n      - role: system\n        content: \"You are");
        assert!(matches!(
            Config::from_yaml_str(&input),
            Err(ConfigError::UnknownModel { agent, model }) if agent == "student" && model == "missing"
        ));
    }

    #[test]
    fn rejects_unknown_task_modes_at_load() {
        let input = SAMPLE.replace("mode: union", "mode: shuffle");
        assert!(matches!(
            Config::from_yaml_str(&input),
            Err(ConfigError::UnknownTaskMode(_))
        ));
    }

    #[test]
    fn tool_role_is_rejected_in_prompts() {
        let input = SAMPLE.replace("    - role: system\n      content: \"Grade", "    - role: tool\n      content: \"Grade");
        assert!(matches!(
            Config::from_yaml_str(&input),
            Err(ConfigError::InvalidRole { owner, .. }) if owner == "evaluation"
        ));
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(Config::from_yaml_str(""), Err(ConfigError::Empty)));
    }

    #[test]
    fn bundled_demo_config_loads() {
        let config =
            Config::from_yaml_str(include_str!("../demos/tutoring.yaml")).unwrap();
        assert_eq!(config.tasks.expand().unwrap().len(), 8);
        assert!(config.routers.contains_key("wrap_up"));
        assert_eq!(config.evaluation().unwrap().format.len(), 3);
    }
}
