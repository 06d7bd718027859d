//! Argument validation against a tool descriptor's JSON parameter schema.
//!
//! Deliberately shallow: required properties and primitive `type` checks,
//! enough to hand the model a per-property explanation it can act on. Full
//! JSON-Schema semantics belong to the tool implementations themselves.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One per-property validation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyIssue {
    pub property: String,
    pub message: String,
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Validates `arguments` against `schema`. Empty/null arguments are treated
/// as an empty object. Returns all issues, not just the first.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), Vec<PropertyIssue>> {
    let empty = serde_json::Map::new();
    let args = match arguments {
        Value::Null => &empty,
        Value::Object(map) => map,
        _ => {
            return Err(vec![PropertyIssue {
                property: String::new(),
                message: "arguments must be a JSON object".to_string(),
            }])
        }
    };

    let mut issues = Vec::new();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(key) {
                issues.push(PropertyIssue {
                    property: key.to_string(),
                    message: "required property is missing".to_string(),
                });
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (key, value) in args {
            match properties.get(key) {
                Some(spec) => {
                    if let Some(expected) = spec.get("type").and_then(Value::as_str) {
                        if !type_matches(expected, value) {
                            issues.push(PropertyIssue {
                                property: key.clone(),
                                message: format!("expected {expected}"),
                            });
                        }
                    }
                }
                None => {
                    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                        issues.push(PropertyIssue {
                            property: key.clone(),
                            message: "unknown property".to_string(),
                        });
                    }
                }
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}
