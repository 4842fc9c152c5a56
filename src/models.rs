//! Resolves logical model names into shared, retrying model handles.

use std::{collections::BTreeMap, env, fmt, sync::Arc, time::Duration};

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{
    config::{Config, ConfigError, ModelConfig},
    functions::{Tool, ToolCall, ToolChoice},
    providers::{
        openai::{OpenAI, OpenAIConfig, OLLAMA_BASE_URL},
        LLMProvider,
    },
    retry::RetryPolicy,
    types::{ChatMessage, CompletionRequest},
    LLMError,
};

/// A provider bound to one model identifier and its request parameters.
#[derive(Clone)]
pub struct ModelHandle {
    name: String,
    provider: Arc<dyn LLMProvider>,
    model: String,
    parameters: Map<String, Value>,
    retry: RetryPolicy,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("parameters", &self.parameters)
            .finish()
    }
}

impl ModelHandle {
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn LLMProvider>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            model: model.into(),
            parameters: Map::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn request(&self, messages: Vec<ChatMessage>) -> CompletionRequest {
        let mut request = CompletionRequest::new(self.model.clone(), messages);
        for (key, value) in &self.parameters {
            match key.as_str() {
                "temperature" => {
                    if let Some(v) = value.as_f64() {
                        request = request.with_temperature(v as f32);
                    }
                }
                "top_p" => {
                    if let Some(v) = value.as_f64() {
                        request = request.with_top_p(v as f32);
                    }
                }
                "max_tokens" => {
                    if let Some(v) = value.as_u64() {
                        request = request.with_max_tokens(v as u32);
                    }
                }
                _ => request = request.with_extra(key.clone(), value.clone()),
            }
        }
        request
    }

    /// One completion, retried on transport failures.
    pub async fn invoke(&self, messages: Vec<ChatMessage>) -> Result<ChatMessage, LLMError> {
        let label = format!("model:{}", self.name);
        self.retry
            .run(&label, LLMError::is_retryable, |attempt| {
                let messages = messages.clone();
                async move {
                    debug!(model = %self.name, attempt, "invoking model");
                    self.invoke_once(messages).await
                }
            })
            .await
    }

    /// A single attempt; for callers that retry at their own layer.
    pub async fn invoke_once(&self, messages: Vec<ChatMessage>) -> Result<ChatMessage, LLMError> {
        let response = self.provider.complete(self.request(messages)).await?;
        Ok(response.message)
    }

    /// Forces the model to call `tool` and returns the resulting call. A single attempt;
    /// callers that validate the arguments retry at their own layer.
    pub async fn invoke_with_tool(
        &self,
        messages: Vec<ChatMessage>,
        tool: &Tool,
    ) -> Result<Option<ToolCall>, LLMError> {
        let name = tool.function.name.clone();
        let request = self
            .request(messages)
            .with_tool(tool.clone())
            .with_tool_choice(ToolChoice::function(name.clone()));
        let response = self.provider.complete(request).await?;
        Ok(response
            .message
            .tool_calls
            .into_iter()
            .find(|call| call.function.name == name))
    }
}

/// One handle per logical model name, resolved once per process.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    handles: BTreeMap<String, ModelHandle>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: ModelHandle) {
        self.handles.insert(handle.name.clone(), handle);
    }

    pub fn with_handle(mut self, handle: ModelHandle) -> Self {
        self.insert(handle);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ModelHandle> {
        self.handles.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handles.keys().map(String::as_str)
    }

    /// Builds HTTP-backed handles for every configured model.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::for_models(config, config.models.keys().map(String::as_str))
    }

    /// Builds handles for the named models only; the rest of the configuration
    /// is not resolved, so their credentials need not be available.
    pub fn for_models<'n>(
        config: &Config,
        names: impl IntoIterator<Item = &'n str>,
    ) -> Result<Self, ConfigError> {
        let timeout = Duration::from_millis(config.globals.request_timeout_ms);
        let mut registry = Self::new();
        for name in names {
            let model = config
                .models
                .get(name)
                .ok_or_else(|| ConfigError::UnknownModel {
                    agent: "registry".to_string(),
                    model: name.to_string(),
                })?;
            let provider = build_provider(name, model, timeout)?;
            info!(model = %name, kind = %model.kind, id = %model.model, "resolved model");
            registry.insert(
                ModelHandle::new(name, provider, model.model.clone())
                    .with_parameters(model.kargs.clone())
                    .with_retry(config.globals.retry.clone()),
            );
        }
        Ok(registry)
    }

    /// Same names as the configuration, every handle backed by `provider`.
    pub fn with_shared_provider(config: &Config, provider: Arc<dyn LLMProvider>) -> Self {
        let mut registry = Self::new();
        for (name, model) in &config.models {
            registry.insert(
                ModelHandle::new(name.clone(), Arc::clone(&provider), model.model.clone())
                    .with_parameters(model.kargs.clone())
                    .with_retry(config.globals.retry.clone()),
            );
        }
        registry
    }
}

fn build_provider(
    name: &str,
    model: &ModelConfig,
    timeout: Duration,
) -> Result<Arc<dyn LLMProvider>, ConfigError> {
    let api_key = model.api_key.as_deref().map(resolve_env).transpose()?;

    let mut config = match model.kind.to_ascii_lowercase().as_str() {
        "openai" => {
            let key = match api_key {
                Some(key) => key,
                None => env::var("OPENAI_API_KEY")
                    .map_err(|_| ConfigError::MissingEnv("OPENAI_API_KEY".to_string()))?,
            };
            OpenAIConfig::new(key)
        }
        "ollama" => {
            let mut config = OpenAIConfig::anonymous(OLLAMA_BASE_URL);
            config.api_key = api_key;
            config
        }
        other => return Err(ConfigError::UnknownModelType(other.to_string())),
    };

    if let Some(base) = &model.api_base {
        config = config.with_base_url(resolve_env(base)?);
    }

    let provider = OpenAI::from_config(config.with_timeout(timeout)).map_err(|error| {
        ConfigError::ModelInit {
            name: name.to_string(),
            message: error.to_string(),
        }
    })?;
    Ok(Arc::new(provider))
}

/// `${NAME}` reads the environment; anything else is taken literally.
fn resolve_env(value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    match trimmed.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
        Some(var) => env::var(var).map_err(|_| ConfigError::MissingEnv(var.to_string())),
        None => Ok(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::providers::scripted::{ScriptedProvider, ScriptedReply};

    #[test]
    fn literal_values_pass_through_env_resolution() {
        assert_eq!(resolve_env("sk-literal").unwrap(), "sk-literal");
        assert!(matches!(
            resolve_env("${COLLOQUY_SURELY_UNSET_VAR}"),
            Err(ConfigError::MissingEnv(var)) if var == "COLLOQUY_SURELY_UNSET_VAR"
        ));
    }

    #[test]
    fn selected_models_skip_unresolvable_siblings() {
        let config = Config::from_yaml_str(
            r#"
models:
  remote:
    model: gpt
    type: openai
    api_key: ${COLLOQUY_SURELY_UNSET_VAR}
  grader:
    model: qwen
    type: ollama
agents:
  solo:
    model: remote
    prompt:
      - role: system
        content: hi
directions:
  - START -> solo
  - solo -> END
tasks:
  mode: iter
  start_prompt:
    role: user
    content: go
  content: []
"#,
        )
        .unwrap();

        assert!(matches!(
            ModelRegistry::from_config(&config),
            Err(ConfigError::MissingEnv(_))
        ));
        let registry = ModelRegistry::for_models(&config, ["grader"]).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["grader"]);
    }

    #[test]
    fn known_parameters_map_onto_request_fields() {
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider::new());
        let mut parameters = Map::new();
        parameters.insert("temperature".to_string(), json!(0.25));
        parameters.insert("max_tokens".to_string(), json!(128));
        parameters.insert("seed".to_string(), json!(9));
        let handle = ModelHandle::new("m", provider, "gpt").with_parameters(parameters);

        let request = handle.request(vec![ChatMessage::user("hi")]);
        assert_eq!(request.temperature, Some(0.25));
        assert_eq!(request.max_tokens, Some(128));
        assert_eq!(request.extra["seed"], 9);
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_retries_transport_failures() {
        let provider = Arc::new(ScriptedProvider::new().with_replies([
            ScriptedReply::Error("503".to_string()),
            ScriptedReply::Text("recovered".to_string()),
        ]));
        let handle = ModelHandle::new("m", provider.clone(), "gpt")
            .with_retry(RetryPolicy::new(3, Duration::from_millis(5)));

        let reply = handle.invoke(vec![ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(reply.text(), Some("recovered"));
        assert_eq!(provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn forced_tool_call_is_requested_by_name() {
        let provider = Arc::new(ScriptedProvider::new().with_replies([ScriptedReply::ToolCall {
            name: "save".to_string(),
            arguments: json!({"score": 4}),
        }]));
        let handle = ModelHandle::new("m", provider.clone(), "gpt");
        let tool = crate::functions::FunctionDefinition::new("save").to_tool();

        let call = handle
            .invoke_with_tool(vec![ChatMessage::user("grade")], &tool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(call.function.arguments["score"], 4);

        let requests = provider.requests();
        let sent = &requests[0];
        assert_eq!(sent.tools.len(), 1);
        let forced = sent.tool_choice.as_ref().unwrap();
        assert_eq!(forced.function.name, "save");
    }
}
