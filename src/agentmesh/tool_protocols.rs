//! Tool protocol implementations.
//!
//! Concrete [`ToolProtocol`] implementations shipped with the crate:
//!
//! - **[`FunctionToolProtocol`]** — direct Rust function calls (sync and
//!   async), the workhorse for local tools and skill-compiled tools.
//!
//! Remote protocols (HTTP tool servers, MCP-style bridges) implement the
//! same trait outside the core.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::tool_protocol::{ArgKind, ArgSpec, ToolMetadata, ToolResult, ToolScope};
//! use agentmesh::tool_protocols::FunctionToolProtocol;
//! use std::sync::Arc;
//!
//! # async {
//! let protocol = FunctionToolProtocol::new();
//! protocol
//!     .register_tool(
//!         ToolMetadata::new("add", "Adds two numbers", ToolScope::Context)
//!             .with_arg(ArgSpec::required("a", ArgKind::Number))
//!             .with_arg(ArgSpec::required("b", ArgKind::Number)),
//!         Arc::new(|params| {
//!             let a = params["a"].as_f64().unwrap_or(0.0);
//!             let b = params["b"].as_f64().unwrap_or(0.0);
//!             Ok(ToolResult::ok(serde_json::json!({"result": a + b})))
//!         }),
//!     )
//!     .await;
//! # };
//! ```

use crate::agentmesh::error::BoxError;
use crate::agentmesh::tool_protocol::{SandboxHandle, ToolMetadata, ToolProtocol, ToolResult};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Type alias for synchronous tool functions.
pub type ToolFunction = Arc<dyn Fn(JsonValue) -> Result<ToolResult, BoxError> + Send + Sync>;

/// Type alias for asynchronous tool functions.
///
/// The function receives the JSON arguments and the sandbox handle (for
/// sandboxed-scope tools) and returns a boxed future.
pub type AsyncToolFunction = Arc<
    dyn Fn(
            JsonValue,
            Option<SandboxHandle>,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<ToolResult, BoxError>> + Send>,
        > + Send
        + Sync,
>;

enum Registered {
    Sync(ToolFunction),
    Async(AsyncToolFunction),
}

/// Function-calling tool adapter.
///
/// Registers plain Rust closures as tools. Registration is expected during
/// initialization or skill activation; execution is lock-free apart from a
/// short read on the function table.
pub struct FunctionToolProtocol {
    tools: RwLock<HashMap<String, ToolMetadata>>,
    functions: RwLock<HashMap<String, Registered>>,
}

impl FunctionToolProtocol {
    /// Create an empty adapter ready to accept new tool registrations.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a synchronous tool function.
    ///
    /// Subsequent registrations under the same name overwrite the previous
    /// one.
    pub async fn register_tool(&self, metadata: ToolMetadata, function: ToolFunction) {
        let name = metadata.name.clone();
        self.tools.write().await.insert(name.clone(), metadata);
        self.functions
            .write()
            .await
            .insert(name, Registered::Sync(function));
    }

    /// Register an asynchronous tool function.
    pub async fn register_async_tool(&self, metadata: ToolMetadata, function: AsyncToolFunction) {
        let name = metadata.name.clone();
        self.tools.write().await.insert(name.clone(), metadata);
        self.functions
            .write()
            .await
            .insert(name, Registered::Async(function));
    }

    /// Remove a registered tool; unknown names are a no-op.
    pub async fn unregister_tool(&self, name: &str) {
        self.tools.write().await.remove(name);
        self.functions.write().await.remove(name);
    }
}

impl Default for FunctionToolProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProtocol for FunctionToolProtocol {
    async fn execute(
        &self,
        tool_name: &str,
        parameters: JsonValue,
        sandbox: Option<&SandboxHandle>,
    ) -> Result<ToolResult, BoxError> {
        enum Call {
            Sync(ToolFunction),
            Async(AsyncToolFunction),
        }

        let call = {
            let functions = self.functions.read().await;
            match functions.get(tool_name) {
                Some(Registered::Sync(f)) => Call::Sync(Arc::clone(f)),
                Some(Registered::Async(f)) => Call::Async(Arc::clone(f)),
                None => return Err(format!("Tool not registered: {}", tool_name).into()),
            }
        };

        match call {
            Call::Sync(function) => function(parameters),
            Call::Async(function) => function(parameters, sandbox.cloned()).await,
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, BoxError> {
        Ok(self.tools.read().await.values().cloned().collect())
    }

    fn protocol_name(&self) -> &str {
        "functions"
    }
}
