//! Tool descriptors and the registry contract.
//!
//! The engine never owns tool implementations; it consumes [`ToolDescriptor`]
//! records plus a [`ToolRegistry`] it can `invoke` through. Containers are
//! plain descriptors whose only purpose is to reveal member tools (see
//! [`container`]); the registry stays unaware of expansion state; the kernel
//! filters visibility with [`visible_tools`].

pub mod container;
mod registry;
pub mod schema;

pub use registry::{StaticToolRegistry, ToolHandler, ToolRegistry};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// Predicate deciding whether a tool is visible, given a context map
/// (e.g. `{"surface": "cli"}`). Evaluated on every iteration.
pub type VisibilityPredicate = Arc<dyn Fn(&BTreeMap<String, Value>) -> bool + Send + Sync>;

/// Static description of one callable tool.
///
/// Consumed, not owned: builders hand the engine a list of these records and
/// a registry that can invoke them by name.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    /// Human-readable description shown to the model.
    pub description: String,
    /// JSON schema of the argument object.
    pub parameters: Value,
    /// When true, the permission middleware gates every invocation.
    pub requires_permission: bool,
    /// `Some(members)` marks a container-only tool: invoking it with no
    /// arguments opens it; its members become visible on the next iteration.
    pub container_members: Option<Vec<String>>,
    /// Container this tool belongs to; hidden until that container is opened.
    pub member_of: Option<String>,
    /// Optional visibility predicate evaluated against the context map.
    pub visibility: Option<VisibilityPredicate>,
}

impl ToolDescriptor {
    /// Plain function tool.
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            requires_permission: false,
            container_members: None,
            member_of: None,
            visibility: None,
        }
    }

    /// Container-only tool with the given members.
    pub fn container(
        name: impl Into<String>,
        description: impl Into<String>,
        members: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
            requires_permission: false,
            container_members: Some(members),
            member_of: None,
            visibility: None,
        }
    }

    pub fn with_permission_required(mut self) -> Self {
        self.requires_permission = true;
        self
    }

    pub fn with_member_of(mut self, container: impl Into<String>) -> Self {
        self.member_of = Some(container.into());
        self
    }

    pub fn with_visibility(mut self, predicate: VisibilityPredicate) -> Self {
        self.visibility = Some(predicate);
        self
    }

    pub fn is_container(&self) -> bool {
        self.container_members.is_some()
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("requires_permission", &self.requires_permission)
            .field("container_members", &self.container_members)
            .field("member_of", &self.member_of)
            .field("visibility", &self.visibility.is_some())
            .finish()
    }
}

/// Errors from invoking a tool through the registry.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{message}")]
    Execution {
        message: String,
        payload: Option<Value>,
    },
    #[error("tool call cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        ToolError::Execution {
            message: message.into(),
            payload: None,
        }
    }
}

/// Filters the registry's tool list down to what the model may see.
///
/// A tool is visible when it is not a hidden container member (its container
/// has been opened, or it belongs to none) and its visibility predicate, if
/// any, accepts the context map. Containers themselves are always candidates;
/// opening is what reveals the members, per the two-step protocol.
pub fn visible_tools(
    all: &[ToolDescriptor],
    expanded_containers: &BTreeSet<String>,
    context: &BTreeMap<String, Value>,
) -> Vec<ToolDescriptor> {
    all.iter()
        .filter(|t| match &t.member_of {
            Some(container) => expanded_containers.contains(container),
            None => true,
        })
        .filter(|t| match &t.visibility {
            Some(predicate) => predicate(context),
            None => true,
        })
        .cloned()
        .collect()
}
