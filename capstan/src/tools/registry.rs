//! Registry contract and the static in-process implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{ToolDescriptor, ToolError};

/// Async handler for one tool. Receives validated arguments and a
/// cancellation token; returns a JSON value or a [`ToolError`].
pub type ToolHandler = Arc<
    dyn Fn(Value, CancellationToken) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync,
>;

/// Tool registry: list descriptors, invoke by name.
///
/// **Interaction**: the kernel filters `list()` by expansion state before each
/// model call; the scheduler calls `invoke` for each dispatched tool call.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn list(&self) -> Vec<ToolDescriptor>;

    async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolError>;
}

/// In-process registry built from descriptor + handler pairs.
///
/// Containers are registered descriptor-only; the scheduler intercepts
/// container calls before they reach `invoke`.
#[derive(Default)]
pub struct StaticToolRegistry {
    descriptors: Vec<ToolDescriptor>,
    handlers: HashMap<String, ToolHandler>,
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool with an async handler. Replaces any same-named tool.
    pub fn register(mut self, descriptor: ToolDescriptor, handler: ToolHandler) -> Self {
        self.handlers.insert(descriptor.name.clone(), handler);
        self.descriptors.retain(|d| d.name != descriptor.name);
        self.descriptors.push(descriptor);
        self
    }

    /// Registers a tool backed by a synchronous closure.
    pub fn register_fn<F>(self, descriptor: ToolDescriptor, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handler: ToolHandler = Arc::new(move |args, _cancel| {
            let f = Arc::clone(&f);
            Box::pin(async move { f(args) })
        });
        self.register(descriptor, handler)
    }

    /// Registers a container (descriptor only; not invokable).
    pub fn register_container(mut self, descriptor: ToolDescriptor) -> Self {
        self.descriptors.retain(|d| d.name != descriptor.name);
        self.descriptors.push(descriptor);
        self
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }
}

#[async_trait]
impl ToolRegistry for StaticToolRegistry {
    fn list(&self) -> Vec<ToolDescriptor> {
        self.descriptors.clone()
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        handler(arguments, cancel.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_registry() -> StaticToolRegistry {
        StaticToolRegistry::new().register_fn(
            ToolDescriptor::function("add", "Add two numbers", json!({})),
            |args| {
                let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(a + b))
            },
        )
    }

    #[tokio::test]
    async fn invoke_runs_registered_handler() {
        let reg = add_registry();
        let cancel = CancellationToken::new();
        let out = reg
            .invoke("add", json!({"a": 2, "b": 3}), &cancel)
            .await
            .unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn invoke_unknown_tool_is_not_found() {
        let reg = add_registry();
        let cancel = CancellationToken::new();
        let err = reg.invoke("sub", json!({}), &cancel).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(name) if name == "sub"));
    }

    #[test]
    fn register_replaces_same_name() {
        let reg = add_registry().register_fn(
            ToolDescriptor::function("add", "Replacement", json!({})),
            |_| Ok(json!(0)),
        );
        assert_eq!(reg.list().len(), 1);
        assert_eq!(reg.descriptor("add").map(|d| d.description.as_str()), Some("Replacement"));
    }
}
