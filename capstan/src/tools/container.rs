//! Container two-step protocol: synthetic results for opening a container
//! and for the error case of invoking one with arguments.
//!
//! Containers exist to keep the visible tool list small: only opened
//! containers expand, so member schemas never reach the prompt until the
//! model asks for them.

use serde_json::{json, Value};

use crate::message::ToolFailure;

/// Failure kind carried by a container misuse result.
pub const CONTAINER_INVOCATION_ERROR: &str = "container_invocation_error";

/// Structured error for a container invoked with arguments.
///
/// Explains the two-step protocol and offers the member list so the model can
/// retry with no arguments or call a member directly once opened.
pub fn container_invocation_failure(container: &str, members: &[String]) -> ToolFailure {
    ToolFailure {
        kind: CONTAINER_INVOCATION_ERROR.to_string(),
        message: format!(
            "'{container}' is a container and takes no arguments. Call {container}() with no \
             arguments to open it, then call one of its member tools: {}.",
            members.join(", ")
        ),
        payload: Some(json!({
            "container": container,
            "members": members,
        })),
    }
}

/// Acknowledgement value appended when a container opens.
pub fn expansion_ack(container: &str, members: &[String]) -> Value {
    json!({
        "opened": container,
        "members": members,
        "note": format!(
            "Container '{container}' is open; the member tools are available from the next step."
        ),
    })
}
