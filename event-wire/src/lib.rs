//! Wire shape of a single agent event: tagged payload plus envelope injection.
//!
//! This crate defines how one engine event looks on the wire (`type` tag plus
//! payload fields) and how the per-stream envelope (`session_id`, `event_id`)
//! is stamped onto it. It does not depend on the engine crate; the engine
//! bridges its in-memory events into [`WireEvent`] and calls [`to_json`].

pub mod envelope;
pub mod event;

pub use envelope::{to_json, Envelope, EnvelopeState};
pub use event::WireEvent;
