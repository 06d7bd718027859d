//! Envelope fields stamped onto each wire event: session id and sequence number.
//!
//! `EnvelopeState` tracks the next event id for one stream and injects the
//! envelope into each serialized event without overwriting payload keys.

use crate::event::WireEvent;
use serde_json::Value;

/// Envelope fields recommended for each message on a stream.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    /// Session id; constant within one stream.
    pub session_id: Option<String>,
    /// Per-message sequence number; monotonically increasing within a stream.
    pub event_id: Option<u64>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_event_id(mut self, id: u64) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Merges envelope fields into the given JSON object (top level only).
    /// Does not overwrite existing keys.
    pub fn inject_into(&self, obj: &mut Value) {
        let Some(obj) = obj.as_object_mut() else {
            return;
        };
        if let Some(ref id) = self.session_id {
            obj.entry("session_id")
                .or_insert_with(|| Value::String(id.clone()));
        }
        if let Some(id) = self.event_id {
            obj.entry("event_id")
                .or_insert_with(|| Value::Number(serde_json::Number::from(id)));
        }
    }
}

/// Envelope state for one stream: session id plus the next event id.
pub struct EnvelopeState {
    pub session_id: String,
    pub next_event_id: u64,
}

impl EnvelopeState {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            next_event_id: 1,
        }
    }

    /// Injects the envelope into the event value and advances the sequence.
    pub fn inject_into(&mut self, value: &mut Value) {
        let env = Envelope::new()
            .with_session_id(&self.session_id)
            .with_event_id(self.next_event_id);
        self.next_event_id += 1;
        env.inject_into(value);
    }
}

/// Converts a wire event to JSON and stamps the envelope using the given state.
pub fn to_json(event: &WireEvent, state: &mut EnvelopeState) -> Result<Value, serde_json::Error> {
    let mut value = event.to_value()?;
    state.inject_into(&mut value);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_injects_without_overwriting() {
        let mut obj = serde_json::json!({"type": "text_delta", "delta": "x", "session_id": "keep"});
        let env = Envelope::new().with_session_id("sess-1").with_event_id(7);
        env.inject_into(&mut obj);
        assert_eq!(obj["session_id"], "keep");
        assert_eq!(obj["event_id"], 7);
    }

    #[test]
    fn to_json_advances_event_id() {
        let mut state = EnvelopeState::new("run-9".to_string());
        let ev = WireEvent::TextMessageEnd;
        let first = to_json(&ev, &mut state).unwrap();
        let second = to_json(&ev, &mut state).unwrap();
        assert_eq!(first["session_id"], "run-9");
        assert_eq!(first["event_id"], 1);
        assert_eq!(second["event_id"], 2);
    }
}
