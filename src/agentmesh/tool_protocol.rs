//! Tool protocol abstraction layer.
//!
//! This module provides the flexible seam between agents and tool
//! implementations. A tool's execution scope is part of its identity from
//! declaration on: [`ToolScope`] decides whether the sandbox handle is
//! injected and what the executor assumes about mutation when nothing else
//! is declared. Argument shapes are declared as [`ArgSpec`]s and checked at
//! the dispatch boundary, so tool bodies see well-formed JSON.
//!
//! Tools never raise through the executor: every invocation resolves to a
//! [`ToolResult`], success or failure, which the agent loop relays to the
//! LLM either way.
//!
//! # Key components
//!
//! - **[`ToolProtocol`] trait** — how tools are executed and discovered
//! - **[`ToolRegistry`]** — multi-protocol aggregation with transparent
//!   routing, scope-aware sandbox injection, and argument checking
//! - **[`ToolMetadata`]** — identity, scope, argument specs, and the
//!   read/write classification driving batch parallelism
//! - **[`SandboxHandle`]** — filesystem allowlist auto-injected into
//!   sandboxed-scope tools
//!
//! # Example
//!
//! ```rust
//! use agentmesh::tool_protocol::{ArgKind, ArgSpec, ToolMetadata, ToolScope};
//!
//! let spec = ToolMetadata::new("grep_notes", "Searches the note store", ToolScope::Context)
//!     .with_arg(ArgSpec::required("pattern", ArgKind::String))
//!     .with_arg(ArgSpec::optional("limit", ArgKind::Integer).defaulting(serde_json::json!(10)));
//!
//! // Context-scope tools are read-only unless declared otherwise.
//! assert!(spec.read_only);
//! assert!(spec.check_arguments(&serde_json::json!({"pattern": "todo"})).is_ok());
//! assert!(spec.check_arguments(&serde_json::json!({"limit": 3})).is_err());
//! ```

use crate::agentmesh::error::{AgentError, BoxError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where (and with what privileges) a tool executes.
///
/// The scope is fixed at declaration and drives two behaviors downstream:
/// sandbox injection ([`needs_sandbox`](ToolScope::needs_sandbox)) and the
/// default read/write classification used by the batch executor
/// ([`assumed_read_only`](ToolScope::assumed_read_only)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolScope {
    /// In-process, restricted to the sandbox path allowlist.
    Sandboxed,
    /// Touches host resources outside the sandbox.
    System,
    /// Proxies to a remote service.
    Remote,
    /// Reads agent context only; never touches external state.
    Context,
}

impl ToolScope {
    /// Whether tools of this scope receive the sandbox handle.
    pub fn needs_sandbox(&self) -> bool {
        matches!(self, ToolScope::Sandboxed)
    }

    /// The read/write classification assumed when a tool declares nothing.
    ///
    /// Context-scope tools cannot mutate by definition; every other scope
    /// is assumed mutating until the tool opts in via
    /// [`ToolMetadata::read_only`].
    pub fn assumed_read_only(&self) -> bool {
        matches!(self, ToolScope::Context)
    }
}

/// Outcome of a tool invocation.
///
/// A tagged sum: either the tool ran and produced output, or it failed
/// with a message the LLM can adapt to. Failures are data, not errors —
/// the executor relays both variants as tool-role messages and reserves
/// `Err` returns from [`ToolProtocol::execute`] for transport breakage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToolResult {
    /// The tool ran; `output` is its JSON result.
    Ok {
        /// The produced output.
        output: JsonValue,
        /// Execution annotations (timing, truncation, cost, ...).
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        annotations: HashMap<String, JsonValue>,
    },
    /// The tool failed; `message` explains why.
    Err {
        /// Failure description relayed to the LLM.
        message: String,
    },
}

impl ToolResult {
    /// A successful outcome carrying `output`.
    pub fn ok(output: JsonValue) -> Self {
        ToolResult::Ok {
            output,
            annotations: HashMap::new(),
        }
    }

    /// A failed outcome carrying `message`.
    pub fn err(message: impl Into<String>) -> Self {
        ToolResult::Err {
            message: message.into(),
        }
    }

    /// Whether the invocation succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, ToolResult::Ok { .. })
    }

    /// The produced output; `Null` for failures.
    pub fn output(&self) -> &JsonValue {
        static NULL_OUTPUT: JsonValue = JsonValue::Null;
        match self {
            ToolResult::Ok { output, .. } => output,
            ToolResult::Err { .. } => &NULL_OUTPUT,
        }
    }

    /// The failure message, when the invocation failed.
    pub fn error(&self) -> Option<&str> {
        match self {
            ToolResult::Ok { .. } => None,
            ToolResult::Err { message } => Some(message),
        }
    }

    /// Execution annotations; empty for failures.
    pub fn annotations(&self) -> Option<&HashMap<String, JsonValue>> {
        match self {
            ToolResult::Ok { annotations, .. } => Some(annotations),
            ToolResult::Err { .. } => None,
        }
    }

    /// Attach an execution annotation to a successful outcome (no-op on
    /// failures).
    pub fn annotate(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        if let ToolResult::Ok { annotations, .. } = &mut self {
            annotations.insert(key.into(), value);
        }
        self
    }
}

/// JSON type admitted by one tool argument.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ArgKind {
    /// JSON Schema type name.
    pub fn json_name(&self) -> &'static str {
        match self {
            ArgKind::String => "string",
            ArgKind::Number => "number",
            ArgKind::Integer => "integer",
            ArgKind::Boolean => "boolean",
            ArgKind::Array => "array",
            ArgKind::Object => "object",
        }
    }

    fn admits(&self, value: &JsonValue) -> bool {
        match self {
            ArgKind::String => value.is_string(),
            ArgKind::Number => value.is_number(),
            ArgKind::Integer => value.is_i64() || value.is_u64(),
            ArgKind::Boolean => value.is_boolean(),
            ArgKind::Array => value.is_array(),
            ArgKind::Object => value.is_object(),
        }
    }
}

/// Declared shape of one tool argument.
///
/// Built through the [`required`](ArgSpec::required) /
/// [`optional`](ArgSpec::optional) constructors so a declaration reads as
/// its contract: `ArgSpec::required("path", ArgKind::String)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSpec {
    /// Argument name.
    pub name: String,
    /// Admitted JSON type.
    #[serde(rename = "type")]
    pub kind: ArgKind,
    /// Whether the LLM must supply the argument.
    pub required: bool,
    /// Surface description for generated schemas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Value assumed when an optional argument is omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
}

impl ArgSpec {
    /// Declare an argument the caller must supply.
    pub fn required(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            description: None,
            default: None,
        }
    }

    /// Declare an argument the caller may omit.
    pub fn optional(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            description: None,
            default: None,
        }
    }

    /// Attach a schema description.
    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Attach a default for omitted optional arguments.
    pub fn defaulting(mut self, value: JsonValue) -> Self {
        self.default = Some(value);
        self
    }

    /// Check one supplied (or missing) value against this spec.
    fn check(&self, supplied: Option<&JsonValue>) -> Result<(), String> {
        match supplied {
            Some(value) if !self.kind.admits(value) => Err(format!(
                "argument '{}' must be a {}",
                self.name,
                self.kind.json_name()
            )),
            None if self.required => Err(format!("required argument '{}' is missing", self.name)),
            _ => Ok(()),
        }
    }
}

/// Identity and contract of one tool.
///
/// The execution scope is part of the constructor — it is not an
/// afterthought, because sandbox injection and batch scheduling both key
/// off it. `read_only` starts from the scope's assumption
/// ([`ToolScope::assumed_read_only`]) and can be overridden per tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    /// Tool name, unique within a registry.
    pub name: String,
    /// Description surfaced to the LLM for tool selection.
    pub description: String,
    /// Execution scope.
    pub scope: ToolScope,
    /// Whether the tool mutates no external state. Drives the batch
    /// executor's parallel/serial discipline; unknown tools are treated
    /// as mutating.
    pub read_only: bool,
    /// Declared arguments.
    pub args: Vec<ArgSpec>,
    /// Protocol-specific tags (capability flags, routing hints, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, JsonValue>,
}

impl ToolMetadata {
    /// Declare a tool with its name, description, and execution scope.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        scope: ToolScope,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            scope,
            read_only: scope.assumed_read_only(),
            args: Vec::new(),
            tags: HashMap::new(),
        }
    }

    /// Declare the tool as read-only (eligible for parallel batches).
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Declare an argument.
    pub fn with_arg(mut self, arg: ArgSpec) -> Self {
        self.args.push(arg);
        self
    }

    /// Attach a protocol-specific tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.tags.insert(key.into(), value);
        self
    }

    /// Check a JSON argument object against the declared specs.
    ///
    /// Every declared spec is checked; unknown extra keys are tolerated
    /// (the tool may ignore them). `Null` passes only when no argument is
    /// required. Fails with [`AgentError::InvalidArguments`] naming the
    /// first offending argument.
    pub fn check_arguments(&self, arguments: &JsonValue) -> Result<(), AgentError> {
        let object = match arguments {
            JsonValue::Object(map) => Some(map),
            JsonValue::Null => None,
            _ => {
                return Err(AgentError::InvalidArguments {
                    tool: self.name.clone(),
                    message: "arguments must be a JSON object".to_string(),
                });
            }
        };

        for spec in &self.args {
            let supplied = object.and_then(|map| map.get(&spec.name));
            spec.check(supplied).map_err(|message| AgentError::InvalidArguments {
                tool: self.name.clone(),
                message,
            })?;
        }
        Ok(())
    }

    /// Render the declaration as a provider-facing tool definition with a
    /// JSON Schema parameters object.
    pub fn to_tool_definition(&self) -> crate::agentmesh::client_wrapper::ToolDefinition {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for spec in &self.args {
            let mut schema = serde_json::Map::new();
            schema.insert(
                "type".to_string(),
                JsonValue::String(spec.kind.json_name().to_string()),
            );
            if let Some(description) = &spec.description {
                schema.insert(
                    "description".to_string(),
                    JsonValue::String(description.clone()),
                );
            }
            if let Some(default) = &spec.default {
                schema.insert("default".to_string(), default.clone());
            }
            properties.insert(spec.name.clone(), JsonValue::Object(schema));
            if spec.required {
                required.push(JsonValue::String(spec.name.clone()));
            }
        }

        crate::agentmesh::client_wrapper::ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }
}

/// Filesystem allowlist handed to sandboxed-scope tools.
///
/// The registry injects the handle into the execution context of every
/// tool whose scope [`needs_sandbox`](ToolScope::needs_sandbox); tool
/// implementations call [`is_path_allowed`](SandboxHandle::is_path_allowed)
/// before touching the filesystem.
#[derive(Debug, Clone, Default)]
pub struct SandboxHandle {
    /// Path prefixes the tool may read or write under.
    pub allowed_paths: Vec<PathBuf>,
}

impl SandboxHandle {
    /// Create a handle allowing access under the given path prefixes.
    pub fn new(allowed_paths: Vec<PathBuf>) -> Self {
        Self { allowed_paths }
    }

    /// Whether `path` falls under one of the allowed prefixes.
    ///
    /// An empty allowlist denies everything.
    pub fn is_path_allowed(&self, path: &Path) -> bool {
        self.allowed_paths
            .iter()
            .any(|prefix| path.starts_with(prefix))
    }
}

/// Trait for implementing tool execution protocols.
#[async_trait]
pub trait ToolProtocol: Send + Sync {
    /// Execute a tool with the given parameters.
    ///
    /// `sandbox` is `Some` only for tools whose scope
    /// [`needs_sandbox`](ToolScope::needs_sandbox); implementations of
    /// sandboxed tools must honor the allowlist. Application-level
    /// failures belong in [`ToolResult::Err`]; the `Err` return is for
    /// transport breakage (unreachable server, missing registration).
    async fn execute(
        &self,
        tool_name: &str,
        parameters: JsonValue,
        sandbox: Option<&SandboxHandle>,
    ) -> Result<ToolResult, BoxError>;

    /// Get metadata about available tools.
    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, BoxError>;

    /// Protocol identifier (e.g. "functions", "remote").
    fn protocol_name(&self) -> &str;
}

/// A tool that can be used by agents: a declaration bound to the protocol
/// that executes it.
pub struct Tool {
    metadata: ToolMetadata,
    protocol: Arc<dyn ToolProtocol>,
}

impl Tool {
    /// Bind a declaration to the supplied protocol implementation.
    pub fn new(metadata: ToolMetadata, protocol: Arc<dyn ToolProtocol>) -> Self {
        Self { metadata, protocol }
    }

    /// Borrow the static metadata for the tool.
    pub fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    /// Execute the tool through its protocol.
    pub async fn execute(
        &self,
        parameters: JsonValue,
        sandbox: Option<&SandboxHandle>,
    ) -> Result<ToolResult, BoxError> {
        self.protocol
            .execute(&self.metadata.name, parameters, sandbox)
            .await
    }
}

/// Registry for managing the tools available to agents.
///
/// Supports multiple protocols, enabling agents to transparently access
/// tools from several sources. The registry checks arguments against the
/// declared specs before dispatch and injects the sandbox handle into
/// sandboxed-scope tools.
///
/// # Example
///
/// ```rust,no_run
/// use agentmesh::tool_protocol::ToolRegistry;
/// use agentmesh::tool_protocols::FunctionToolProtocol;
/// use std::sync::Arc;
///
/// # async {
/// let mut registry = ToolRegistry::new();
/// registry
///     .add_protocol("functions", Arc::new(FunctionToolProtocol::new()))
///     .await
///     .ok();
/// # };
/// ```
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
    tool_to_protocol: HashMap<String, String>,
    protocols: HashMap<String, Arc<dyn ToolProtocol>>,
    sandbox: SandboxHandle,
}

impl ToolRegistry {
    /// Create an empty registry ready to accept protocols.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            tool_to_protocol: HashMap::new(),
            protocols: HashMap::new(),
            sandbox: SandboxHandle::default(),
        }
    }

    /// Configure the sandbox allowlist injected into sandboxed tools.
    pub fn with_sandbox(mut self, sandbox: SandboxHandle) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Borrow the configured sandbox handle.
    pub fn sandbox(&self) -> &SandboxHandle {
        &self.sandbox
    }

    /// Register a protocol and discover its tools.
    ///
    /// Calls `protocol.list_tools()` and registers every discovered tool.
    /// A tool with an already-registered name is replaced; the new
    /// protocol's tool takes precedence.
    pub async fn add_protocol(
        &mut self,
        protocol_name: &str,
        protocol: Arc<dyn ToolProtocol>,
    ) -> Result<(), BoxError> {
        let discovered = protocol.list_tools().await?;
        self.protocols
            .insert(protocol_name.to_string(), protocol.clone());

        for metadata in discovered {
            let tool_name = metadata.name.clone();
            self.tools
                .insert(tool_name.clone(), Tool::new(metadata, protocol.clone()));
            self.tool_to_protocol
                .insert(tool_name, protocol_name.to_string());
        }
        Ok(())
    }

    /// Remove a protocol and all its tools from the registry.
    pub fn remove_protocol(&mut self, protocol_name: &str) {
        self.protocols.remove(protocol_name);
        let doomed: Vec<String> = self
            .tool_to_protocol
            .iter()
            .filter(|(_, pn)| *pn == protocol_name)
            .map(|(tn, _)| tn.clone())
            .collect();
        for tool_name in doomed {
            self.tools.remove(&tool_name);
            self.tool_to_protocol.remove(&tool_name);
        }
    }

    /// Insert or replace a single tool declaration.
    pub fn add_tool(&mut self, metadata: ToolMetadata, protocol: Arc<dyn ToolProtocol>) {
        let name = metadata.name.clone();
        self.tools.insert(name, Tool::new(metadata, protocol));
    }

    /// Remove a tool by name, returning the owned entry if present.
    pub fn remove_tool(&mut self, name: &str) -> Option<Tool> {
        self.tool_to_protocol.remove(name);
        self.tools.remove(name)
    }

    /// Borrow a tool by name.
    pub fn get_tool(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    /// Whether the named tool is registered.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List declarations for registered tools, sorted by name for stable
    /// prompt rendering.
    pub fn list_tools(&self) -> Vec<&ToolMetadata> {
        let mut out: Vec<&ToolMetadata> = self.tools.values().map(|t| &t.metadata).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Which protocol handles a specific tool.
    pub fn get_tool_protocol(&self, tool_name: &str) -> Option<&str> {
        self.tool_to_protocol.get(tool_name).map(|s| s.as_str())
    }

    /// All registered protocol names.
    pub fn list_protocols(&self) -> Vec<&str> {
        self.protocols.keys().map(|s| s.as_str()).collect()
    }

    /// Whether the named tool is declared read-only.
    ///
    /// Unknown tools report `false` — the executor defaults them to
    /// mutating.
    pub fn is_read_only(&self, tool_name: &str) -> bool {
        self.tools
            .get(tool_name)
            .map(|t| t.metadata.read_only)
            .unwrap_or(false)
    }

    /// Execute a named tool with serialized parameters.
    ///
    /// Arguments are checked against the declared specs first (failing
    /// with [`AgentError::InvalidArguments`] wrapped as the boxed error);
    /// tools whose scope needs it receive the registry's sandbox handle.
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        parameters: JsonValue,
    ) -> Result<ToolResult, BoxError> {
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| Box::new(AgentError::UnknownTool(tool_name.to_string())) as BoxError)?;

        tool.metadata
            .check_arguments(&parameters)
            .map_err(|e| Box::new(e) as BoxError)?;

        let sandbox = if tool.metadata.scope.needs_sandbox() {
            Some(&self.sandbox)
        } else {
            None
        };
        tool.execute(parameters, sandbox).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockProtocol;

    #[async_trait]
    impl ToolProtocol for MockProtocol {
        async fn execute(
            &self,
            tool_name: &str,
            _parameters: JsonValue,
            sandbox: Option<&SandboxHandle>,
        ) -> Result<ToolResult, BoxError> {
            Ok(ToolResult::ok(serde_json::json!({
                "tool": tool_name,
                "sandboxed": sandbox.is_some(),
            })))
        }

        async fn list_tools(&self) -> Result<Vec<ToolMetadata>, BoxError> {
            Ok(vec![
                ToolMetadata::new("probe", "Reads state", ToolScope::Context),
                ToolMetadata::new("mutate", "Writes state", ToolScope::System),
            ])
        }

        fn protocol_name(&self) -> &str {
            "mock"
        }
    }

    #[test]
    fn test_scope_drives_defaults() {
        let context = ToolMetadata::new("peek", "Reads context", ToolScope::Context);
        assert!(context.read_only, "context scope implies read-only");
        assert!(!context.scope.needs_sandbox());

        let sandboxed = ToolMetadata::new("edit", "Edits files", ToolScope::Sandboxed);
        assert!(!sandboxed.read_only, "non-context scopes assume mutating");
        assert!(sandboxed.scope.needs_sandbox());

        let probe = ToolMetadata::new("stat", "Stats files", ToolScope::Sandboxed).read_only();
        assert!(probe.read_only, "explicit opt-in overrides the assumption");
    }

    #[test]
    fn test_argument_checking() {
        let spec = ToolMetadata::new("echo", "Repeats input", ToolScope::Context)
            .with_arg(ArgSpec::required("text", ArgKind::String))
            .with_arg(ArgSpec::optional("times", ArgKind::Integer));

        assert!(spec.check_arguments(&serde_json::json!({"text": "hi"})).is_ok());
        assert!(spec
            .check_arguments(&serde_json::json!({"text": "hi", "times": 2}))
            .is_ok());

        let missing = spec
            .check_arguments(&serde_json::json!({"times": 2}))
            .unwrap_err();
        match missing {
            AgentError::InvalidArguments { message, .. } => {
                assert!(message.contains("required argument 'text'"))
            }
            other => panic!("expected InvalidArguments, got {:?}", other),
        }

        let wrong_type = spec
            .check_arguments(&serde_json::json!({"text": 42}))
            .unwrap_err();
        match wrong_type {
            AgentError::InvalidArguments { message, .. } => {
                assert!(message.contains("must be a string"))
            }
            other => panic!("expected InvalidArguments, got {:?}", other),
        }

        // Null passes only when nothing is required.
        let lax = ToolMetadata::new("ping", "No args", ToolScope::Context);
        assert!(lax.check_arguments(&JsonValue::Null).is_ok());
        assert!(spec.check_arguments(&JsonValue::Null).is_err());
    }

    #[test]
    fn test_result_variants() {
        let ok = ToolResult::ok(serde_json::json!({"n": 1})).annotate(
            "elapsed_ms",
            serde_json::json!(4),
        );
        assert!(ok.is_ok());
        assert_eq!(ok.output()["n"], 1);
        assert!(ok.error().is_none());
        assert_eq!(ok.annotations().unwrap()["elapsed_ms"], 4);

        let err = ToolResult::err("backend unreachable");
        assert!(!err.is_ok());
        assert!(err.output().is_null());
        assert_eq!(err.error(), Some("backend unreachable"));
        assert!(err.annotations().is_none());
    }

    #[test]
    fn test_tool_definition_schema() {
        let spec = ToolMetadata::new("echo", "Repeats input", ToolScope::Context).with_arg(
            ArgSpec::required("text", ArgKind::String).describe("what to repeat"),
        );
        let definition = spec.to_tool_definition();
        assert_eq!(definition.name, "echo");
        assert_eq!(
            definition.parameters_schema["properties"]["text"]["type"],
            "string"
        );
        assert_eq!(definition.parameters_schema["required"][0], "text");
    }

    #[test]
    fn test_sandbox_allowlist() {
        let sandbox = SandboxHandle::new(vec![PathBuf::from("/tmp/work")]);
        assert!(sandbox.is_path_allowed(Path::new("/tmp/work/file.txt")));
        assert!(!sandbox.is_path_allowed(Path::new("/etc/passwd")));
        assert!(!SandboxHandle::default().is_path_allowed(Path::new("/tmp")));
    }

    #[tokio::test]
    async fn test_registry_discovery_and_routing() {
        let mut registry = ToolRegistry::new();
        registry
            .add_protocol("mock", Arc::new(MockProtocol))
            .await
            .unwrap();

        assert_eq!(registry.list_tools().len(), 2);
        assert!(registry.is_read_only("probe"));
        assert!(!registry.is_read_only("mutate"));
        assert!(!registry.is_read_only("unknown"));
        assert_eq!(registry.get_tool_protocol("probe"), Some("mock"));

        registry.remove_protocol("mock");
        assert!(registry.list_tools().is_empty());
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute_tool("ghost", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_sandbox_injection_by_scope() {
        let mut registry =
            ToolRegistry::new().with_sandbox(SandboxHandle::new(vec![PathBuf::from("/tmp")]));
        let protocol = Arc::new(MockProtocol);
        registry.add_tool(
            ToolMetadata::new("inside", "sandboxed", ToolScope::Sandboxed),
            protocol.clone(),
        );
        registry.add_tool(
            ToolMetadata::new("outside", "context", ToolScope::Context),
            protocol,
        );

        let result = registry
            .execute_tool("inside", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result.output()["sandboxed"], true);

        let result = registry
            .execute_tool("outside", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result.output()["sandboxed"], false);
    }
}
