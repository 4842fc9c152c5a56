//! Declarative score formats and the JSON schema built from them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    functions::{FunctionDefinition, FunctionParameters, Tool},
    prompt::Prompt,
};

pub const SAVE_RESULT_TOOL: &str = "save_result_to_database";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
    Dict,
}

impl FieldType {
    pub fn json_type(self) -> &'static str {
        match self {
            FieldType::Str => "string",
            FieldType::Int => "integer",
            FieldType::Float => "number",
            FieldType::Bool => "boolean",
            FieldType::Dict => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatField {
    pub field: String,
    #[serde(rename = "type")]
    pub kind: FieldType,
    #[serde(default)]
    pub description: String,
    /// Sub-fields of a `dict` field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<FormatField>,
}

impl FormatField {
    pub fn schema(&self) -> Value {
        match self.kind {
            FieldType::Dict => {
                let mut nested = object_parameters(&self.items);
                nested.description = Some(self.description.clone());
                nested.to_value()
            }
            kind => json!({
                "type": kind.json_type(),
                "description": self.description,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStrategy {
    /// Force a call to the save-result tool and read its arguments.
    #[default]
    Tool,
    /// Ask for marker-delimited JSON in the reply text.
    Prompt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
    pub model: String,
    pub prompt: Vec<Prompt>,
    pub format: Vec<FormatField>,
    #[serde(default)]
    pub strategy: ExtractionStrategy,
}

impl EvalConfig {
    pub fn parameters(&self) -> FunctionParameters {
        object_parameters(&self.format)
    }

    pub fn schema(&self) -> Value {
        self.parameters().to_value()
    }

    pub fn save_tool(&self) -> Tool {
        FunctionDefinition::new(SAVE_RESULT_TOOL)
            .with_description("Save the evaluation results to a database.")
            .with_parameters(self.parameters())
            .to_tool()
    }
}

/// Every field is required and nothing else is allowed.
fn object_parameters(fields: &[FormatField]) -> FunctionParameters {
    let mut parameters = FunctionParameters::new();
    for field in fields {
        parameters.insert(field.field.clone(), field.schema(), true);
    }
    parameters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EvalConfig {
        serde_yaml::from_str(
            r#"
model: grader
prompt:
  - role: system
    content: Grade it.
format:
  - field: clarity
    type: int
    description: 1-5
  - field: correct
    type: bool
    description: final answer is right
  - field: guidance
    type: dict
    description: scaffolding quality
    items:
      - field: score
        type: float
        description: 0-1
      - field: comment
        type: str
        description: why
"#,
        )
        .unwrap()
    }

    #[test]
    fn strategy_defaults_to_tool() {
        assert_eq!(config().strategy, ExtractionStrategy::Tool);
    }

    #[test]
    fn nested_fields_build_nested_objects() {
        let schema = config().schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(schema["required"], json!(["clarity", "correct", "guidance"]));
        assert_eq!(schema["properties"]["clarity"]["type"], "integer");
        assert_eq!(schema["properties"]["correct"]["type"], "boolean");

        let guidance = &schema["properties"]["guidance"];
        assert_eq!(guidance["type"], "object");
        assert_eq!(guidance["description"], "scaffolding quality");
        assert_eq!(guidance["properties"]["score"]["type"], "number");
        assert_eq!(guidance["required"], json!(["score", "comment"]));
    }

    #[test]
    fn save_tool_carries_the_schema() {
        let tool = config().save_tool();
        assert_eq!(tool.function.name, SAVE_RESULT_TOOL);
        assert_eq!(tool.function.parameters.required.len(), 3);
    }
}
