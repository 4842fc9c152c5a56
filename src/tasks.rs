//! Expands a declarative task block into concrete task variants.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConfigError;
use crate::prompt::{Prompt, Variables};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBlock {
    pub mode: String,
    pub start_prompt: Prompt,
    #[serde(default)]
    pub content: Value,
}

/// One concrete variable map plus its rendered start prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskVariant {
    pub index: usize,
    pub variables: Variables,
    pub start_prompt: Prompt,
}

impl TaskBlock {
    pub fn expand(&self) -> Result<Vec<TaskVariant>, ConfigError> {
        let variables = expand_variables(&self.mode, &self.content)?;
        Ok(variables
            .into_iter()
            .enumerate()
            .map(|(index, variables)| TaskVariant {
                index,
                start_prompt: self.start_prompt.render(&variables),
                variables,
            })
            .collect())
    }
}

/// `union`: Cartesian product of the dimensions in declared order.
/// `iter`: the listed maps unchanged.
pub fn expand_variables(mode: &str, content: &Value) -> Result<Vec<Variables>, ConfigError> {
    match mode.trim().to_ascii_lowercase().as_str() {
        "union" => expand_union(content),
        "iter" => expand_iter(content),
        other => Err(ConfigError::UnknownTaskMode(other.to_string())),
    }
}

fn expand_union(content: &Value) -> Result<Vec<Variables>, ConfigError> {
    let dimensions = match content {
        Value::Null => return Ok(vec![Variables::new()]),
        Value::Object(map) => map,
        _ => {
            return Err(ConfigError::InvalidTasks(
                "union content must map dimension names to value lists".to_string(),
            ))
        }
    };

    let mut combinations = vec![Variables::new()];
    for (name, values) in dimensions {
        let values = values.as_array().ok_or_else(|| {
            ConfigError::InvalidTasks(format!("dimension '{name}' must be a list of values"))
        })?;

        let mut next = Vec::with_capacity(combinations.len() * values.len());
        for partial in &combinations {
            for value in values {
                let mut entry = partial.clone();
                entry.insert(name.clone(), value.clone());
                next.push(entry);
            }
        }
        combinations = next;
    }

    Ok(combinations)
}

fn expand_iter(content: &Value) -> Result<Vec<Variables>, ConfigError> {
    let entries = match content {
        Value::Null => return Ok(Vec::new()),
        Value::Array(entries) => entries,
        _ => {
            return Err(ConfigError::InvalidTasks(
                "iter content must be a list of variable maps".to_string(),
            ))
        }
    };

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            entry.as_object().cloned().ok_or_else(|| {
                ConfigError::InvalidTasks(format!("iter entry {index} is not a map"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::MessageRole;

    #[test]
    fn union_is_the_full_product_in_declared_order() {
        let content = json!({
            "student": ["eager", "bored", "lost"],
            "question": ["q1", "q2"],
        });
        let variants = expand_variables("union", &content).unwrap();

        assert_eq!(variants.len(), 6);
        let pairs: Vec<(String, String)> = variants
            .iter()
            .map(|v| (v["student"].as_str().unwrap().into(), v["question"].as_str().unwrap().into()))
            .collect();
        assert_eq!(pairs[0], ("eager".into(), "q1".into()));
        assert_eq!(pairs[1], ("eager".into(), "q2".into()));
        assert_eq!(pairs[5], ("lost".into(), "q2".into()));

        let mut unique = pairs.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 6);

        for variant in &variants {
            let keys: Vec<&str> = variant.keys().map(String::as_str).collect();
            assert_eq!(keys, ["student", "question"]);
        }
    }

    #[test]
    fn empty_union_yields_one_identity_variant() {
        assert_eq!(expand_variables("union", &json!({})).unwrap(), vec![Variables::new()]);
        assert_eq!(expand_variables("union", &Value::Null).unwrap(), vec![Variables::new()]);
    }

    #[test]
    fn iter_passes_entries_through_in_order() {
        let content = json!([{"q": "b"}, {"q": "a", "extra": 1}]);
        let variants = expand_variables("iter", &content).unwrap();
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0]["q"], "b");
        assert_eq!(variants[1]["extra"], 1);
    }

    #[test]
    fn mode_is_case_insensitive() {
        assert_eq!(expand_variables("UNION", &json!({"a": [1]})).unwrap().len(), 1);
    }

    #[test]
    fn unknown_mode_is_a_configuration_error() {
        assert!(matches!(
            expand_variables("zip", &json!({})),
            Err(ConfigError::UnknownTaskMode(mode)) if mode == "zip"
        ));
    }

    #[test]
    fn block_renders_start_prompt_per_variant() {
        let block = TaskBlock {
            mode: "iter".to_string(),
            start_prompt: Prompt::new(MessageRole::User, "Today's problem: {question}"),
            content: json!([{"question": "7*8"}, {"question": "9-4"}]),
        };
        let variants = block.expand().unwrap();
        assert_eq!(variants[1].index, 1);
        assert_eq!(variants[1].start_prompt.content, "Today's problem: 9-4");
        assert_eq!(block.start_prompt.content, "Today's problem: {question}");
    }
}
