//! `{placeholder}` substitution for prompt templates.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{ChatMessage, MessageRole};

/// One task's substitution map, in declared key order.
pub type Variables = Map<String, Value>;

static RE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^{}]+)\}").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub role: MessageRole,
    pub content: String,
}

impl Prompt {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn render(&self, variables: &Variables) -> Prompt {
        Prompt {
            role: self.role,
            content: render_template(&self.content, variables),
        }
    }

    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

/// Renders every prompt of a list into a fresh copy; the source list is untouched.
pub fn render_prompts(prompts: &[Prompt], variables: &Variables) -> Vec<Prompt> {
    prompts.iter().map(|prompt| prompt.render(variables)).collect()
}

/// Textual form of a variable as it appears inside a prompt.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replaces `{key}` with the matching variable. Unknown keys stay as written.
pub fn render_template(template: &str, variables: &Variables) -> String {
    render_with(template, |key| variables.get(key).map(value_to_text))
}

/// Single pass over `template`; substituted text is never rescanned.
pub fn render_with(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    RE_PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
