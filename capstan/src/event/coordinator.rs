//! Event coordinator: observer fan-out plus correlated request/response.
//!
//! Every emitted event is delivered to all registered observers in emission
//! order; a failing observer is logged and skipped, never allowed to stop
//! delivery or fail the emitter. Response events additionally resolve the
//! pending waiter registered under their request id.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AgentEvent, ResponsePayload};

/// Error raised by an observer; swallowed (and logged) by the coordinator.
#[derive(Debug, thiserror::Error)]
#[error("observer: {0}")]
pub struct ObserverError(pub String);

/// Error from waiting on a bidirectional response.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventError {
    #[error("response timed out")]
    Timeout,
    #[error("cancelled while waiting for response")]
    Cancelled,
    /// The coordinator dropped the pending entry (e.g. reaped after timeout
    /// by another waiter, or the response event carried the wrong type).
    #[error("response channel closed")]
    ChannelClosed,
}

/// Receives events from the coordinator.
///
/// `should_process` lets an observer opt out cheaply (e.g. a persistence
/// observer that only cares about checkpoint events). Failures in `on_event`
/// are swallowed by the coordinator.
#[async_trait::async_trait]
pub trait EventObserver: Send + Sync {
    fn should_process(&self, _event: &AgentEvent) -> bool {
        true
    }

    async fn on_event(
        &self,
        event: &AgentEvent,
        cancel: &CancellationToken,
    ) -> Result<(), ObserverError>;
}

/// Fans events out to observers and parks response waiters by request id.
///
/// Shared by the kernel, the scheduler, and every middleware of one engine;
/// safe under many emitters and many observers.
pub struct EventCoordinator {
    observers: std::sync::RwLock<Vec<(u64, Arc<dyn EventObserver>)>>,
    next_observer_id: std::sync::atomic::AtomicU64,
    pending: DashMap<String, oneshot::Sender<AgentEvent>>,
    response_timeout: Duration,
}

impl EventCoordinator {
    pub fn new(response_timeout: Duration) -> Self {
        Self {
            observers: std::sync::RwLock::new(Vec::new()),
            next_observer_id: std::sync::atomic::AtomicU64::new(0),
            pending: DashMap::new(),
            response_timeout,
        }
    }

    /// Default response timeout used when a waiter does not override it.
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Registers an observer; events emitted after registration reach it.
    /// Returns a handle usable with [`EventCoordinator::remove_observer`].
    pub fn register_observer(&self, observer: Arc<dyn EventObserver>) -> u64 {
        let id = self
            .next_observer_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if let Ok(mut guard) = self.observers.write() {
            guard.push((id, observer));
        }
        id
    }

    /// Removes a previously registered observer.
    pub fn remove_observer(&self, id: u64) {
        if let Ok(mut guard) = self.observers.write() {
            guard.retain(|(oid, _)| *oid != id);
        }
    }

    /// Emits an event to all observers, in registration order.
    ///
    /// If the event is a response, the matching pending waiter (if any) is
    /// resolved first so the requesting middleware is never behind a slow
    /// observer.
    pub async fn emit(&self, event: AgentEvent) {
        if let Some(request_id) = event.response_request_id() {
            let request_id = request_id.to_string();
            self.deliver_response(&request_id, event.clone());
        }
        let observers: Vec<(u64, Arc<dyn EventObserver>)> = match self.observers.read() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        };
        let cancel = CancellationToken::new();
        for (_, observer) in observers {
            if !observer.should_process(&event) {
                continue;
            }
            if let Err(e) = observer.on_event(&event, &cancel).await {
                warn!(error = %e, "observer failed; continuing delivery");
            }
        }
    }

    /// Registers a waiter for the given request id.
    ///
    /// Must be called **before** emitting the request event, otherwise a fast
    /// responder could race the registration.
    pub fn expect_response(self: &Arc<Self>, request_id: &str) -> ResponseWaiter {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.to_string(), tx);
        ResponseWaiter {
            request_id: request_id.to_string(),
            rx,
            coordinator: Arc::clone(self),
            timeout: self.response_timeout,
        }
    }

    /// Resolves the pending waiter for `request_id`. Returns false when no
    /// waiter is registered (already resolved, reaped, or never requested).
    pub fn deliver_response(&self, request_id: &str, event: AgentEvent) -> bool {
        match self.pending.remove(request_id) {
            Some((_, tx)) => {
                if tx.send(event).is_err() {
                    debug!(request_id, "response waiter already dropped");
                    return false;
                }
                true
            }
            None => {
                debug!(request_id, "no pending waiter for response");
                false
            }
        }
    }

    fn reap(&self, request_id: &str) {
        if self.pending.remove(request_id).is_some() {
            warn!(request_id, "reaped undelivered response waiter");
        }
    }
}

/// Handle returned by [`EventCoordinator::expect_response`].
pub struct ResponseWaiter {
    request_id: String,
    rx: oneshot::Receiver<AgentEvent>,
    coordinator: Arc<EventCoordinator>,
    timeout: Duration,
}

impl ResponseWaiter {
    /// Overrides the coordinator's default timeout for this waiter.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Suspends until the matching response arrives, the timeout elapses, or
    /// the turn is cancelled.
    pub async fn wait<T: ResponsePayload>(
        self,
        cancel: &CancellationToken,
    ) -> Result<T, EventError> {
        let ResponseWaiter {
            request_id,
            rx,
            coordinator,
            timeout,
        } = self;
        tokio::select! {
            _ = cancel.cancelled() => {
                coordinator.reap(&request_id);
                Err(EventError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                coordinator.reap(&request_id);
                Err(EventError::Timeout)
            }
            received = rx => match received {
                Ok(event) => T::from_event(event).ok_or(EventError::ChannelClosed),
                Err(_) => Err(EventError::ChannelClosed),
            }
        }
    }
}

/// Observer that forwards every event into an mpsc channel.
///
/// Used by the thread facade so `run` can hand the caller a lazy stream of
/// events; dropped receivers simply stop consuming (send errors are ignored).
pub struct ChannelObserver {
    tx: mpsc::Sender<AgentEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<AgentEvent>) -> Self {
        Self { tx }
    }

    /// Creates a paired observer and receiver with the given buffer size.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl EventObserver for ChannelObserver {
    async fn on_event(
        &self,
        event: &AgentEvent,
        _cancel: &CancellationToken,
    ) -> Result<(), ObserverError> {
        let _ = self.tx.send(event.clone()).await;
        Ok(())
    }
}

/// Observer that records every event; for tests and debugging.
#[derive(Default)]
pub struct CollectingObserver {
    events: std::sync::Mutex<Vec<AgentEvent>>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl EventObserver for CollectingObserver {
    async fn on_event(
        &self,
        event: &AgentEvent,
        _cancel: &CancellationToken,
    ) -> Result<(), ObserverError> {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event.clone());
        }
        Ok(())
    }
}
