use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: FunctionParameters,
}

impl FunctionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: FunctionParameters::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, parameters: FunctionParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn to_tool(&self) -> Tool {
        Tool::from(self.clone())
    }
}

/// JSON-schema object describing a function's arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionParameters {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(rename = "additionalProperties", skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
}

impl FunctionParameters {
    pub fn new() -> Self {
        Self {
            kind: "object".to_string(),
            description: None,
            properties: Map::new(),
            required: Vec::new(),
            additional_properties: Some(false),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, schema: Value, required: bool) {
        let name = name.into();
        if required {
            self.required.push(name.clone());
        }
        self.properties.insert(name, schema);
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("type".to_string(), Value::String(self.kind.clone()));
        if let Some(description) = &self.description {
            object.insert("description".to_string(), Value::String(description.clone()));
        }
        object.insert("properties".to_string(), Value::Object(self.properties.clone()));
        object.insert(
            "required".to_string(),
            Value::Array(self.required.iter().cloned().map(Value::String).collect()),
        );
        if let Some(additional) = self.additional_properties {
            object.insert("additionalProperties".to_string(), Value::Bool(additional));
        }
        Value::Object(object)
    }
}

impl Default for FunctionParameters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: ToolType,
    pub function: FunctionDefinition,
}

impl From<FunctionDefinition> for Tool {
    fn from(function: FunctionDefinition) -> Self {
        Self {
            kind: ToolType::Function,
            function,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Function,
}

#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
    pub raw_arguments: Option<String>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            raw_arguments: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: Option<String>,
    pub kind: ToolCallType,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(function: FunctionCall) -> Self {
        Self {
            id: None,
            kind: ToolCallType::Function,
            function,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ToolCallType {
    Function,
}

impl Serialize for ToolCall {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("ToolCall", 3)?;
        if let Some(id) = &self.id {
            state.serialize_field("id", id)?;
        }
        state.serialize_field("type", &self.kind)?;
        state.serialize_field("function", &SerializableFunctionCall(&self.function))?;
        state.end()
    }
}

impl Serialize for ToolCallType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            ToolCallType::Function => serializer.serialize_str("function"),
        }
    }
}

impl<'de> Deserialize<'de> for ToolCall {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawFunctionCall {
            name: String,
            arguments: String,
        }

        #[derive(Deserialize)]
        struct RawToolCall {
            id: Option<String>,
            #[serde(rename = "type", default = "default_call_type")]
            kind: String,
            function: RawFunctionCall,
        }

        fn default_call_type() -> String {
            "function".to_string()
        }

        let raw = RawToolCall::deserialize(deserializer)?;
        let kind = match raw.kind.as_str() {
            "function" => ToolCallType::Function,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "unsupported tool call type '{other}'"
                )))
            }
        };

        // Malformed arguments are kept raw so the caller can decide whether to retry.
        let arguments = serde_json::from_str(&raw.function.arguments).unwrap_or(Value::Null);

        Ok(Self {
            id: raw.id,
            kind,
            function: FunctionCall {
                name: raw.function.name,
                arguments,
                raw_arguments: Some(raw.function.arguments),
            },
        })
    }
}

struct SerializableFunctionCall<'a>(&'a FunctionCall);

impl<'a> Serialize for SerializableFunctionCall<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("function", 2)?;
        state.serialize_field("name", &self.0.name)?;
        let raw = if let Some(raw) = &self.0.raw_arguments {
            raw.clone()
        } else {
            serde_json::to_string(&self.0.arguments)
                .map_err(|error| serde::ser::Error::custom(error.to_string()))?
        };
        state.serialize_field("arguments", &raw)?;
        state.end()
    }
}

/// Forces the model to call one named function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoice {
    #[serde(rename = "type")]
    pub kind: ToolChoiceKind,
    pub function: ToolChoiceFunction,
}

impl ToolChoice {
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            kind: ToolChoiceKind::Function,
            function: ToolChoiceFunction { name: name.into() },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceKind {
    Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}
