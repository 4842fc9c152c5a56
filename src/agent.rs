//! Compiles one agent's configuration into a turn function over shared state.

use std::fmt;

use tracing::debug;

use crate::{
    config::{AgentConfig, AgentMemoryConfig, ConfigError},
    models::{ModelHandle, ModelRegistry},
    prompt::{render_prompts, Prompt, Variables},
    state::{ConversationState, StateMessage},
    types::{ChatMessage, MessageRole},
    LLMError,
};

/// Whose message it is, relative to the agent about to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    Own,
    Other,
}

impl Perspective {
    pub fn of(message: &StateMessage, agent: &str) -> Self {
        if message.spoken_by(agent) {
            Perspective::Own
        } else {
            Perspective::Other
        }
    }

    pub fn role(self) -> MessageRole {
        match self {
            Perspective::Own => MessageRole::Assistant,
            Perspective::Other => MessageRole::User,
        }
    }
}

/// Rewrites the shared log as seen by `agent`: its own messages become model turns,
/// everything else becomes input. With `swap` off the recorded roles are kept.
pub fn remap_history(messages: &[StateMessage], agent: &str, swap: bool) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|message| {
            let role = if swap {
                Perspective::of(message, agent).role()
            } else {
                message.role
            };
            ChatMessage::new(role, message.content.clone())
        })
        .collect()
}

/// An agent's configuration, possibly rendered for one task variant.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSpec {
    pub id: String,
    pub model: String,
    pub prompt: Vec<Prompt>,
    pub memory: AgentMemoryConfig,
}

impl AgentSpec {
    pub fn from_config(id: impl Into<String>, config: &AgentConfig) -> Self {
        Self {
            id: id.into(),
            model: config.model.clone(),
            prompt: config.prompt.clone(),
            memory: config.memory.clone(),
        }
    }

    /// A copy with every seed prompt rendered against `variables`.
    pub fn materialize(&self, variables: &Variables) -> AgentSpec {
        AgentSpec {
            prompt: render_prompts(&self.prompt, variables),
            ..self.clone()
        }
    }

    pub fn compile(self, models: &ModelRegistry) -> Result<AgentNode, ConfigError> {
        let model = models
            .get(&self.model)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownModel {
                agent: self.id.clone(),
                model: self.model.clone(),
            })?;
        Ok(AgentNode { spec: self, model })
    }
}

/// A compiled agent: `turn(state)` produces the single message it appends.
#[derive(Clone)]
pub struct AgentNode {
    spec: AgentSpec,
    model: ModelHandle,
}

impl fmt::Debug for AgentNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentNode")
            .field("id", &self.spec.id)
            .field("model", &self.model.name())
            .field("memory", &self.spec.memory.enable)
            .finish()
    }
}

impl AgentNode {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    pub fn memory_enabled(&self) -> bool {
        self.spec.memory.enable
    }

    /// Seed prompt followed by the history as this agent sees it.
    pub fn model_input(&self, state: &ConversationState) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> =
            self.spec.prompt.iter().map(Prompt::to_message).collect();
        if !state.is_empty() {
            messages.extend(remap_history(
                state.messages(),
                &self.spec.id,
                self.spec.memory.when_switch.swap_user_assistant,
            ));
        }
        messages
    }

    pub async fn turn(&self, state: &ConversationState) -> Result<StateMessage, LLMError> {
        let input = self.model_input(state);
        debug!(agent = %self.spec.id, history = state.len(), "agent turn");
        let reply = self.model.invoke(input).await?;
        let content = reply.text().unwrap_or_default().to_string();
        Ok(StateMessage::from_agent(self.spec.id.clone(), content))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::providers::scripted::ScriptedProvider;

    fn dialogue() -> ConversationState {
        ConversationState::with_messages(vec![
            StateMessage::from_agent("teacher", "What is 3 x 4?"),
            StateMessage::from_agent("student", "12"),
        ])
    }

    #[test]
    fn teacher_sees_its_own_turn_as_self() {
        let state = dialogue();
        let tags: Vec<Perspective> = state
            .messages()
            .iter()
            .map(|m| Perspective::of(m, "teacher"))
            .collect();
        assert_eq!(tags, [Perspective::Own, Perspective::Other]);

        let remapped = remap_history(state.messages(), "teacher", true);
        assert_eq!(remapped[0].role, MessageRole::Assistant);
        assert_eq!(remapped[1].role, MessageRole::User);
    }

    #[test]
    fn student_sees_the_mirror_image() {
        let state = dialogue();
        let remapped = remap_history(state.messages(), "student", true);
        assert_eq!(remapped[0].role, MessageRole::User);
        assert_eq!(remapped[1].role, MessageRole::Assistant);
    }

    #[test]
    fn without_swap_recorded_roles_are_kept() {
        let mut state = ConversationState::new();
        state.push(StateMessage::from_prompt(&Prompt::new(MessageRole::User, "go")));
        state.push(StateMessage::from_agent("teacher", "hi"));
        let remapped = remap_history(state.messages(), "student", false);
        assert_eq!(remapped[0].role, MessageRole::User);
        assert_eq!(remapped[1].role, MessageRole::Assistant);
    }

    fn node(provider: Arc<ScriptedProvider>) -> AgentNode {
        let config: AgentConfig = serde_json::from_value(json!({
            "model": "m",
            "prompt": [{"role": "system", "content": "You teach {topic}."}]
        }))
        .unwrap();
        let models = ModelRegistry::new().with_handle(ModelHandle::new("m", provider, "gpt"));
        let variables = json!({"topic": "fractions"}).as_object().cloned().unwrap();
        AgentSpec::from_config("teacher", &config)
            .materialize(&variables)
            .compile(&models)
            .unwrap()
    }

    #[test]
    fn empty_state_sends_only_the_seed_prompt() {
        let node = node(Arc::new(ScriptedProvider::new()));
        let input = node.model_input(&ConversationState::new());
        assert_eq!(input.len(), 1);
        assert_eq!(input[0].text(), Some("You teach fractions."));
    }

    #[tokio::test]
    async fn turn_tags_the_reply_with_the_agent() {
        let provider = Arc::new(ScriptedProvider::from_texts(["Let's begin."]));
        let node = node(provider.clone());
        let state = dialogue();

        let message = node.turn(&state).await.unwrap();
        assert_eq!(message.speaker.as_deref(), Some("teacher"));
        assert_eq!(message.content, "Let's begin.");

        let requests = provider.requests();
        let sent = &requests[0].messages;
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].role, MessageRole::System);
        assert_eq!(sent[1].role, MessageRole::Assistant);
        assert_eq!(sent[2].role, MessageRole::User);
    }

    #[test]
    fn compile_rejects_unknown_models() {
        let config: AgentConfig =
            serde_json::from_value(json!({"model": "ghost", "prompt": []})).unwrap();
        let error = AgentSpec::from_config("a", &config)
            .compile(&ModelRegistry::new())
            .unwrap_err();
        assert!(matches!(error, ConfigError::UnknownModel { .. }));
    }
}
