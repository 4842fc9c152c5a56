use serde::{Deserialize, Serialize};

use crate::{prompt::Prompt, types::MessageRole};

/// A message in the shared log. `speaker` is `None` for the start prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub role: MessageRole,
    pub content: String,
}

impl StateMessage {
    pub fn from_agent(agent: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            speaker: Some(agent.into()),
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn from_prompt(prompt: &Prompt) -> Self {
        Self {
            speaker: None,
            role: prompt.role,
            content: prompt.content.clone(),
        }
    }

    pub fn spoken_by(&self, agent: &str) -> bool {
        self.speaker.as_deref() == Some(agent)
    }
}

/// Append-only message log threaded through one graph execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    messages: Vec<StateMessage>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<StateMessage>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: StateMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[StateMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<StateMessage> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&StateMessage> {
        self.messages.last()
    }

    /// Messages written by agents, excluding the start prompt.
    pub fn agent_turns(&self) -> usize {
        self.messages.iter().filter(|m| m.speaker.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_only_agent_turns() {
        let mut state = ConversationState::new();
        state.push(StateMessage::from_prompt(&Prompt::new(MessageRole::User, "start")));
        state.push(StateMessage::from_agent("teacher", "hello"));
        state.push(StateMessage::from_agent("student", "hi"));

        assert_eq!(state.len(), 3);
        assert_eq!(state.agent_turns(), 2);
        assert!(state.last().unwrap().spoken_by("student"));
    }
}
