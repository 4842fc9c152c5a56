use std::{collections::VecDeque, sync::Mutex, time::Duration};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    functions::{FunctionCall, ToolCall},
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    ToolCall { name: String, arguments: Value },
    Error(String),
}

/// Replays canned replies in order. Safe to share between concurrent runs.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ScriptedReply>>,
    fallback: Option<String>,
    latency: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: None,
            latency: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new().with_replies(texts.into_iter().map(|text| ScriptedReply::Text(text.into())))
    }

    pub fn with_replies<I>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = ScriptedReply>,
    {
        if let Ok(mut queue) = self.responses.lock() {
            queue.extend(replies);
        }
        self
    }

    /// Reply used once the script is exhausted.
    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(text.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Requests seen so far, in arrival order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self) -> Option<ScriptedReply> {
        let next = self.responses.lock().ok().and_then(|mut queue| queue.pop_front());
        next.or_else(|| self.fallback.clone().map(ScriptedReply::Text))
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request);
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let message = match self.next_reply() {
            Some(ScriptedReply::Text(text)) => ChatMessage::assistant(text),
            Some(ScriptedReply::ToolCall { name, arguments }) => {
                let call = ToolCall::new(FunctionCall::new(name, arguments)).with_id("call_scripted");
                let mut message = ChatMessage::assistant(String::new());
                message.content = None;
                message.with_tool_calls(vec![call])
            }
            Some(ScriptedReply::Error(reason)) => return Err(LLMError::Provider(reason)),
            None => return Err(LLMError::Provider("no more scripted responses".to_string())),
        };

        Ok(CompletionResponse {
            message,
            usage: None,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
