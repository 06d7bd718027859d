//! Middleware state slots: typed, keyed, immutable records inside the loop state.
//!
//! Each slot type declares a unique string key and a default. The [`SlotMap`]
//! stores slots as JSON values so the whole loop state snapshots without the
//! map knowing any concrete slot type; reads deserialize on demand and fall
//! back to the default when the key is absent.
//!
//! Updates are whole-record replacements: `map.update::<T>(f)` reads the
//! current record, applies `f`, and returns a new map.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A typed record owned by exactly one middleware.
pub trait MiddlewareSlot: Serialize + DeserializeOwned + Default + Clone {
    /// Unique key of this slot inside the loop state.
    const KEY: &'static str;
}

/// Keyed store of middleware records. At most one record per key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotMap {
    slots: BTreeMap<String, Value>,
}

impl SlotMap {
    /// Reads the record for `T`, or its default when absent or undecodable.
    pub fn get<T: MiddlewareSlot>(&self) -> T {
        self.slots
            .get(T::KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Returns a new map with the record for `T` replaced.
    pub fn with<T: MiddlewareSlot>(&self, record: T) -> Self {
        let mut slots = self.slots.clone();
        slots.insert(
            T::KEY.to_string(),
            serde_json::to_value(record).unwrap_or(Value::Null),
        );
        Self { slots }
    }

    /// Returns a new map with `f` applied to the current record for `T`.
    pub fn update<T: MiddlewareSlot>(&self, f: impl FnOnce(T) -> T) -> Self {
        self.with(f(self.get::<T>()))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Circuit-breaker bookkeeping: last signature and consecutive count per tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    #[serde(default)]
    pub last_signature_per_tool: BTreeMap<String, String>,
    #[serde(default)]
    pub consecutive_count_per_tool: BTreeMap<String, u32>,
}

impl MiddlewareSlot for CircuitBreakerState {
    const KEY: &'static str = "guard.circuit_breaker";
}

impl CircuitBreakerState {
    /// Count this signature would reach if committed now.
    pub fn predicted_count(&self, tool: &str, signature: &str) -> u32 {
        match self.last_signature_per_tool.get(tool) {
            Some(last) if last == signature => {
                self.consecutive_count_per_tool.get(tool).copied().unwrap_or(0) + 1
            }
            _ => 1,
        }
    }

    /// Returns the state after observing one call with this signature.
    pub fn observed(&self, tool: &str, signature: &str) -> Self {
        let count = self.predicted_count(tool, signature);
        let mut next = self.clone();
        next.last_signature_per_tool
            .insert(tool.to_string(), signature.to_string());
        next.consecutive_count_per_tool
            .insert(tool.to_string(), count);
        next
    }
}

/// Consecutive tool-failure counter; resets on any clean iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorTrackingState {
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl MiddlewareSlot for ErrorTrackingState {
    const KEY: &'static str = "guard.error_tracking";
}

/// Total tool-error counter for the turn; never resets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalErrorThresholdState {
    #[serde(default)]
    pub total_error_count: u32,
}

impl MiddlewareSlot for TotalErrorThresholdState {
    const KEY: &'static str = "guard.total_errors";
}

/// Per-batch permission decisions; reset at the start of each iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchPermissionState {
    /// Tools approved within the current batch.
    #[serde(default)]
    pub approved: BTreeSet<String>,
    /// Tools denied within the current batch, with the denial reason.
    #[serde(default)]
    pub denied: BTreeMap<String, String>,
    #[serde(default)]
    pub batch_check_performed: bool,
}

impl MiddlewareSlot for BatchPermissionState {
    const KEY: &'static str = "permission.batch";
}

/// Turn-scoped permission grants: tools approved for the rest of the turn
/// (ApproveForTurn) or for the thread lifetime (ApprovePersistent). Unlike
/// [`BatchPermissionState`], this survives iteration boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnPermissionState {
    #[serde(default)]
    pub approved_for_turn: BTreeSet<String>,
    #[serde(default)]
    pub persistent: BTreeSet<String>,
}

impl MiddlewareSlot for TurnPermissionState {
    const KEY: &'static str = "permission.turn";
}

/// Extended iteration limit granted by continuation approvals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuationPermissionState {
    #[serde(default)]
    pub current_extended_limit: u32,
}

impl MiddlewareSlot for ContinuationPermissionState {
    const KEY: &'static str = "continuation.limit";
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: reading an absent slot yields the default; `with` replaces whole records.
    #[test]
    fn slot_map_defaults_and_replaces() {
        let map = SlotMap::default();
        let s: ErrorTrackingState = map.get();
        assert_eq!(s.consecutive_failures, 0);

        let map = map.with(ErrorTrackingState {
            consecutive_failures: 3,
        });
        assert_eq!(map.get::<ErrorTrackingState>().consecutive_failures, 3);
        assert!(map.contains_key(ErrorTrackingState::KEY));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn update_is_functional() {
        let map = SlotMap::default();
        let next = map.update::<TotalErrorThresholdState>(|mut s| {
            s.total_error_count += 1;
            s
        });
        assert_eq!(map.get::<TotalErrorThresholdState>().total_error_count, 0);
        assert_eq!(next.get::<TotalErrorThresholdState>().total_error_count, 1);
    }

    #[test]
    fn slot_map_round_trips_through_json() {
        let map = SlotMap::default()
            .with(ErrorTrackingState {
                consecutive_failures: 2,
            })
            .update::<CircuitBreakerState>(|s| s.observed("ping", "ping({})"));
        let json = serde_json::to_string(&map).unwrap();
        let back: SlotMap = serde_json::from_str(&json).unwrap();
        assert_eq!(map, back);
        assert_eq!(
            back.get::<CircuitBreakerState>()
                .predicted_count("ping", "ping({})"),
            2
        );
    }

    /// **Scenario**: circuit-breaker count grows on identical signature, resets on a new one.
    #[test]
    fn circuit_breaker_counts_consecutive_signatures() {
        let s = CircuitBreakerState::default();
        assert_eq!(s.predicted_count("ping", "ping({})"), 1);
        let s = s.observed("ping", "ping({})");
        assert_eq!(s.predicted_count("ping", "ping({})"), 2);
        let s = s.observed("ping", "ping({})");
        assert_eq!(s.predicted_count("ping", "ping({})"), 3);
        // Different arguments break the run.
        assert_eq!(s.predicted_count("ping", r#"ping({"n":1})"#), 1);
        let s = s.observed("ping", r#"ping({"n":1})"#);
        assert_eq!(s.consecutive_count_per_tool.get("ping"), Some(&1));
    }
}
