use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use murmur_llm::ToolDefinition;

use crate::spec::{ToolCall, ToolOutcome, ToolSpec};

/// A locally hosted tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name for this tool (e.g. "web_search").
    fn name(&self) -> &str;
    /// Human-readable description of what this tool does.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute the tool. Failures are returned as error outcomes, not `Err`.
    async fn execute(&self, input: serde_json::Value) -> ToolOutcome;
}

/// Dispatch to tools hosted on MCP servers.
///
/// MCP server lifecycle management lives outside this workspace; the executor
/// only needs routing and the spec list.
#[async_trait]
pub trait McpDispatch: Send + Sync {
    /// Specs of every tool currently exposed by connected servers.
    fn specs(&self) -> Vec<ToolSpec>;
    /// Whether this dispatcher owns the named tool.
    fn owns(&self, name: &str) -> bool;
    async fn invoke(&self, call: &ToolCall) -> ToolOutcome;
}

/// Routes calls to local tools first, then to the MCP dispatcher.
pub struct ToolExecutor {
    local: Vec<Arc<dyn Tool>>,
    mcp: Option<Arc<dyn McpDispatch>>,
}

impl ToolExecutor {
    pub fn new(local: Vec<Arc<dyn Tool>>, mcp: Option<Arc<dyn McpDispatch>>) -> Self {
        Self { local, mcp }
    }

    pub fn empty() -> Self {
        Self {
            local: Vec::new(),
            mcp: None,
        }
    }

    /// Specs of every available tool, local first, then MCP-hosted.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .local
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
                server: None,
            })
            .collect();
        if let Some(mcp) = &self.mcp {
            specs.extend(mcp.specs());
        }
        specs
    }

    /// API-level definitions for the request's `tools` field.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.specs().iter().map(ToolSpec::to_definition).collect()
    }

    /// Whether a call to `name` is MCP-routed (its result images count
    /// against the MCP image cap).
    pub fn is_mcp(&self, name: &str) -> bool {
        self.local.iter().all(|t| t.name() != name)
            && self.mcp.as_ref().is_some_and(|m| m.owns(name))
    }

    /// Execute one call. Unknown tools produce an error outcome.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutcome {
        if let Some(tool) = self.local.iter().find(|t| t.name() == call.name) {
            debug!(tool = %call.name, "executing local tool");
            return tool.execute(call.input.clone()).await;
        }
        if let Some(mcp) = &self.mcp {
            if mcp.owns(&call.name) {
                debug!(tool = %call.name, "dispatching MCP tool");
                return mcp.invoke(call).await;
            }
        }
        warn!(tool = %call.name, "model invoked unknown tool");
        ToolOutcome::error(format!("unknown tool: {}", call.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"x": {"type": "string"}}})
        }
        async fn execute(&self, input: serde_json::Value) -> ToolOutcome {
            ToolOutcome::text(input["x"].as_str().unwrap_or_default().to_string())
        }
    }

    #[tokio::test]
    async fn executes_local_tool() {
        let exec = ToolExecutor::new(vec![Arc::new(Echo)], None);
        let call = ToolCall {
            id: "toolu_1".into(),
            name: "echo".into(),
            input: serde_json::json!({"x": "1"}),
        };
        let outcome = exec.execute(&call).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.result_text(), "1");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_value() {
        let exec = ToolExecutor::empty();
        let call = ToolCall {
            id: "toolu_1".into(),
            name: "missing".into(),
            input: serde_json::json!({}),
        };
        let outcome = exec.execute(&call).await;
        assert!(outcome.error.is_some());
        assert!(outcome.result_text().contains("unknown tool"));
    }
}
