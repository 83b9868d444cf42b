use serde::{Deserialize, Serialize};

use murmur_llm::ToolDefinition;

/// Description of an available tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    /// Server grouping for display (`None` for built-in tools).
    #[serde(default)]
    pub server: Option<String>,
}

impl ToolSpec {
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// A tool call extracted from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// What a tool produced. Errors are carried here, not thrown — the error
/// text is injected into the continuation as the tool's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub output: ToolOutput,
    #[serde(default)]
    pub images: Vec<ToolImage>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: ToolOutput::Text(output.into()),
            images: Vec::new(),
            error: None,
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self {
            output: ToolOutput::Json(value),
            images: Vec::new(),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            output: ToolOutput::Text(message.clone()),
            images: Vec::new(),
            error: Some(message),
        }
    }

    /// The text injected into the model's continuation.
    pub fn result_text(&self) -> String {
        match &self.error {
            Some(e) => format!("Error: {e}"),
            None => self.output.to_display_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Text(String),
    Json(serde_json::Value),
}

impl ToolOutput {
    pub fn to_display_string(&self) -> String {
        match self {
            ToolOutput::Text(s) => s.clone(),
            ToolOutput::Json(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
        }
    }
}

/// An image returned by a tool, base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolImage {
    pub data: String,
    pub mime_type: String,
}
