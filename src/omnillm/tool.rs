//! Tools and the registry agents resolve them from.
//!
//! A [`Tool`] couples a name and description with an async callable and an
//! argument schema.  The public schema follows the OpenAI function-calling
//! shape; provider adapters translate it at their boundary where a provider
//! expects something else.
//!
//! Schema generation reads the declared argument list (declaration order,
//! all required, every argument `type: string`) and attaches the
//! description supplied via [`describe_arg`](Tool::describe_arg), falling
//! back to the argument's own name.  An explicit schema set through
//! [`set_schema`](Tool::set_schema) bypasses generation entirely.
//!
//! # Example
//!
//! ```rust
//! use omnillm::Tool;
//! use serde_json::json;
//!
//! let tool = Tool::new("get_weather", "Current temperature for a city")
//!     .arg("location")
//!     .describe_arg("location", "City name, e.g. \"Kansas City\"")
//!     .with_callable(|args| async move {
//!         let city = args["location"].as_str().unwrap_or("").to_string();
//!         Ok(json!(if city == "Kansas City" { "85" } else { "90" }))
//!     });
//!
//! let schema = tool.get_schema();
//! assert_eq!(schema["function"]["name"], json!("get_weather"));
//! assert_eq!(schema["function"]["parameters"]["required"], json!(["location"]));
//! ```

use crate::omnillm::error::AiError;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by tool callables.
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, AiError>> + Send>>;

/// The async function a tool dispatches to.  Arguments arrive as a map
/// keyed by parameter name.
pub type ToolCallable = Arc<dyn Fn(Map<String, Value>) -> ToolFuture + Send + Sync>;

/// One declared tool argument.
#[derive(Debug, Clone)]
pub struct ToolArg {
    /// Parameter name.
    pub name: String,
    /// Description surfaced in the generated schema; defaults to the name.
    pub description: Option<String>,
}

/// A named callable exposed to a model with an argument schema.
#[derive(Clone)]
pub struct Tool {
    /// Tool name; unique within a registry.
    pub name: String,
    /// Description surfaced to the model for tool selection.
    pub description: String,
    args: Vec<ToolArg>,
    callable: Option<ToolCallable>,
    explicit_schema: Option<Value>,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("args", &self.args)
            .field("has_callable", &self.callable.is_some())
            .field("has_explicit_schema", &self.explicit_schema.is_some())
            .finish()
    }
}

impl Tool {
    /// Create a tool with no arguments and no callable yet.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Tool {
            name: name.into(),
            description: description.into(),
            args: Vec::new(),
            callable: None,
            explicit_schema: None,
        }
    }

    /// Declare an argument.  Arguments appear in the schema in declaration
    /// order and are all required.
    pub fn arg(mut self, name: impl Into<String>) -> Self {
        self.args.push(ToolArg {
            name: name.into(),
            description: None,
        });
        self
    }

    /// Attach a description to a declared argument, declaring it first when
    /// it does not exist yet.
    pub fn describe_arg(mut self, name: &str, description: impl Into<String>) -> Self {
        match self.args.iter_mut().find(|a| a.name == name) {
            Some(arg) => arg.description = Some(description.into()),
            None => self.args.push(ToolArg {
                name: name.to_string(),
                description: Some(description.into()),
            }),
        }
        self
    }

    /// Attach the async callable the tool dispatches to.
    pub fn with_callable<F, Fut>(mut self, callable: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, AiError>> + Send + 'static,
    {
        self.callable = Some(Arc::new(move |args| Box::pin(callable(args))));
        self
    }

    /// Replace the generated schema with an explicit OpenAI-shaped one.
    pub fn set_schema(mut self, schema: Value) -> Self {
        self.explicit_schema = Some(schema);
        self
    }

    /// Declared arguments, in order.
    pub fn args(&self) -> &[ToolArg] {
        &self.args
    }

    /// True when a callable is attached.
    pub fn has_callable(&self) -> bool {
        self.callable.is_some()
    }

    /// Public schema in the OpenAI function-calling shape.
    pub fn get_schema(&self) -> Value {
        if let Some(schema) = &self.explicit_schema {
            return schema.clone();
        }
        let mut properties = Map::new();
        let mut required = Vec::new();
        for arg in &self.args {
            properties.insert(
                arg.name.clone(),
                json!({
                    "type": "string",
                    "description": arg.description.clone().unwrap_or_else(|| arg.name.clone()),
                }),
            );
            required.push(Value::String(arg.name.clone()));
        }
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                },
                "strict": true,
            }
        })
    }

    /// Run the tool with the given arguments.
    ///
    /// A callable is required; invoking without one is
    /// [`AiError::InvalidArgument`].  Declared arguments missing from the
    /// map fail validation.  The return value is coerced to a string for
    /// the model: string results pass through, everything else is
    /// JSON-encoded.
    pub async fn invoke(&self, arguments: Map<String, Value>) -> Result<String, AiError> {
        let callable = self.callable.as_ref().ok_or_else(|| {
            AiError::InvalidArgument(format!("tool '{}' has no callable attached", self.name))
        })?;
        for arg in &self.args {
            if !arguments.contains_key(&arg.name) {
                return Err(AiError::InvalidArgument(format!(
                    "tool '{}' missing required argument '{}'",
                    self.name, arg.name
                )));
            }
        }
        let result = callable(arguments).await.map_err(|e| match e {
            AiError::ToolExecution { .. } => e,
            other => AiError::ToolExecution {
                tool: self.name.clone(),
                message: other.to_string(),
            },
        })?;
        Ok(coerce_result(&result))
    }
}

/// Coerce a tool result to the string handed back to the model.
fn coerce_result(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Named collection of tools with unique names.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.  A tool with the same name is replaced.
    pub fn register(&mut self, tool: Tool) {
        self.tools.insert(tool.name.clone(), Arc::new(tool));
    }

    /// Remove a tool by name.
    pub fn unregister(&mut self, name: &str) {
        self.tools.remove(name);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.get(name).cloned()
    }

    /// True when the registry holds a tool with this name.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// True when no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All registered tools.
    pub fn tools(&self) -> Vec<Arc<Tool>> {
        self.tools.values().cloned().collect()
    }

    /// Schemas of every registered tool, for the request `tools` param.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools.values().map(|t| t.get_schema()).collect()
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<String, AiError> {
        let tool = self
            .get(name)
            .ok_or_else(|| AiError::ToolNotFound(name.to_string()))?;
        tool.invoke(arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_tool() -> Tool {
        Tool::new("echo", "Echoes its input")
            .arg("text")
            .with_callable(|args| async move { Ok(args["text"].clone()) })
    }

    #[test]
    fn schema_required_in_declaration_order_all_strings() {
        let tool = Tool::new("t", "test")
            .arg("a")
            .arg("b")
            .arg("c")
            .describe_arg("b", "the second one");
        let schema = tool.get_schema();
        let function = &schema["function"];
        assert_eq!(function["parameters"]["required"], json!(["a", "b", "c"]));
        assert_eq!(function["parameters"]["properties"]["a"]["type"], json!("string"));
        // Missing description defaults to the argument's own name.
        assert_eq!(
            function["parameters"]["properties"]["a"]["description"],
            json!("a")
        );
        assert_eq!(
            function["parameters"]["properties"]["b"]["description"],
            json!("the second one")
        );
        assert_eq!(function["strict"], json!(true));
    }

    #[test]
    fn explicit_schema_bypasses_generation() {
        let custom = json!({"type": "function", "function": {"name": "x"}});
        let tool = Tool::new("x", "custom").arg("ignored").set_schema(custom.clone());
        assert_eq!(tool.get_schema(), custom);
    }

    #[tokio::test]
    async fn invoke_requires_callable() {
        let tool = Tool::new("bare", "no callable");
        let err = tool.invoke(Map::new()).await.unwrap_err();
        assert!(matches!(err, AiError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn invoke_validates_required_arguments() {
        let tool = echo_tool();
        let err = tool.invoke(Map::new()).await.unwrap_err();
        assert!(err.to_string().contains("text"));
    }

    #[tokio::test]
    async fn invoke_coerces_structured_results_to_json() {
        let tool = Tool::new("structured", "returns a struct").with_callable(|_| async move {
            Ok(json!({"answer": 42}))
        });
        let out = tool.invoke(Map::new()).await.unwrap();
        assert_eq!(out, "{\"answer\":42}");
    }

    #[tokio::test]
    async fn registry_execute_routes_and_reports_missing() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool());

        let mut args = Map::new();
        args.insert("text".into(), json!("hello"));
        let out = registry.execute("echo", args).await.unwrap();
        assert_eq!(out, "hello");

        let err = registry.execute("absent", Map::new()).await.unwrap_err();
        assert!(matches!(err, AiError::ToolNotFound(_)));
    }
}
