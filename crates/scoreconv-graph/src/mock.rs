//! Scripted in-memory transport for deterministic testing.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use scoreconv_graph::{GraphClient, MockTransport};
//! use serde_json::json;
//!
//! let transport = MockTransport::new()
//!     .with_data("ControlAction", json!({ "ControlAction": [] }));
//! let client = GraphClient::new(transport.clone().into_shared());
//!
//! assert!(client.fetch_job("missing").await.is_err());
//! assert_eq!(transport.calls_for("ControlAction").len(), 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

use scoreconv_core::{Error, Result};

use crate::transport::{
    ConnectionEvent, GraphRequest, GraphResponse, GraphTransport, NotificationStream,
};

/// Scripted outcome for one operation.
#[derive(Debug, Clone)]
enum Scripted {
    Response(GraphResponse),
    TransportError(String),
}

/// A recorded request.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub operation: String,
    pub variables: JsonValue,
    pub timestamp: std::time::Instant,
}

#[derive(Default)]
struct MockState {
    /// One-shot responses, consumed in order before the sticky default.
    queued: HashMap<String, VecDeque<Scripted>>,
    sticky: HashMap<String, Scripted>,
    calls: Vec<MockCall>,
    subscribers: Vec<futures::channel::mpsc::UnboundedSender<GraphResponse>>,
    latency: HashMap<String, Duration>,
}

/// In-memory [`GraphTransport`] with scripted responses and a call log.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Always answer `operation` with `data`.
    pub fn with_data(self, operation: &str, data: JsonValue) -> Self {
        self.state().sticky.insert(
            operation.to_string(),
            Scripted::Response(GraphResponse::from_data(data)),
        );
        self
    }

    /// Always answer `operation` with a GraphQL error response.
    pub fn with_graph_error(self, operation: &str, message: &str) -> Self {
        self.state().sticky.insert(
            operation.to_string(),
            Scripted::Response(GraphResponse::from_error(message)),
        );
        self
    }

    /// Always fail `operation` at the transport level.
    pub fn with_transport_error(self, operation: &str, message: &str) -> Self {
        self.state().sticky.insert(
            operation.to_string(),
            Scripted::TransportError(message.to_string()),
        );
        self
    }

    /// Answer the next call of `operation` with `data`, then fall back.
    pub fn push_data(&self, operation: &str, data: JsonValue) {
        self.state()
            .queued
            .entry(operation.to_string())
            .or_default()
            .push_back(Scripted::Response(GraphResponse::from_data(data)));
    }

    /// Fail the next call of `operation` at the transport level.
    pub fn push_transport_error(&self, operation: &str, message: &str) {
        self.state()
            .queued
            .entry(operation.to_string())
            .or_default()
            .push_back(Scripted::TransportError(message.to_string()));
    }

    /// Delay every response to `operation`.
    pub fn with_latency(self, operation: &str, latency: Duration) -> Self {
        self.state().latency.insert(operation.to_string(), latency);
        self
    }

    /// Deliver a notification to every open subscription.
    pub fn notify(&self, data: JsonValue) {
        let response = GraphResponse::from_data(data);
        self.state()
            .subscribers
            .retain(|s| s.unbounded_send(response.clone()).is_ok());
    }

    /// End every open subscription stream.
    pub fn close_subscriptions(&self) {
        self.state().subscribers.clear();
    }

    /// Number of subscriptions still held open by a consumer.
    pub fn open_subscriptions(&self) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|s| !s.is_closed());
        state.subscribers.len()
    }

    /// Emit a connection lifecycle event.
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// Get all logged calls for assertion.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Logged calls of one operation, in order.
    pub fn calls_for(&self, operation: &str) -> Vec<MockCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    /// Operation names in call order.
    pub fn operation_sequence(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .map(|c| c.operation.clone())
            .collect()
    }

    /// Clear the call log.
    pub fn clear_calls(&self) {
        self.state().calls.clear()
    }

    pub fn into_shared(self) -> Arc<dyn GraphTransport> {
        Arc::new(self)
    }

    fn record(&self, request: &GraphRequest) -> (Option<Scripted>, Option<Duration>) {
        let operation = request.operation_name().to_string();
        let mut state = self.state();
        state.calls.push(MockCall {
            operation: operation.clone(),
            variables: request.variables.clone(),
            timestamp: std::time::Instant::now(),
        });
        let queued = state.queued.get_mut(&operation).and_then(|q| q.pop_front());
        let scripted = match queued {
            Some(next) => Some(next),
            None => state.sticky.get(&operation).cloned(),
        };
        (scripted, state.latency.get(&operation).copied())
    }
}

#[async_trait]
impl GraphTransport for MockTransport {
    async fn execute(&self, request: GraphRequest) -> Result<GraphResponse> {
        let (scripted, latency) = self.record(&request);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match scripted {
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::TransportError(message)) => Err(Error::Remote(message)),
            None => Err(Error::Remote(format!(
                "No scripted response for {}",
                request.operation_name()
            ))),
        }
    }

    async fn subscribe(&self, request: GraphRequest) -> Result<NotificationStream> {
        let (scripted, _) = self.record(&request);
        if let Some(Scripted::TransportError(message)) = scripted {
            return Err(Error::Remote(message));
        }
        let (tx, rx) = futures::channel::mpsc::unbounded();
        self.state().subscribers.push(tx);
        Ok(rx)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn request(op: &str) -> GraphRequest {
        GraphRequest::new(op, "query { x }", json!({"k": op}))
    }

    #[tokio::test]
    async fn test_queued_responses_precede_sticky() {
        let mock = MockTransport::new().with_data("Op", json!({"n": 0}));
        mock.push_data("Op", json!({"n": 1}));

        let first = mock.execute(request("Op")).await.unwrap();
        let second = mock.execute(request("Op")).await.unwrap();
        assert_eq!(first.data, Some(json!({"n": 1})));
        assert_eq!(second.data, Some(json!({"n": 0})));
        assert_eq!(mock.calls_for("Op").len(), 2);
    }

    #[tokio::test]
    async fn test_unscripted_operation_is_remote_error() {
        let mock = MockTransport::new();
        let err = mock.execute(request("Unknown")).await.unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
        assert_eq!(mock.operation_sequence(), vec!["Unknown".to_string()]);
    }

    #[tokio::test]
    async fn test_notify_reaches_open_subscriptions() {
        let mock = MockTransport::new();
        let mut stream = mock.subscribe(request("Sub")).await.unwrap();
        assert_eq!(mock.open_subscriptions(), 1);

        mock.notify(json!({"hello": "world"}));
        let received = stream.next().await.unwrap();
        assert_eq!(received.data, Some(json!({"hello": "world"})));

        mock.close_subscriptions();
        assert!(stream.next().await.is_none());
    }
}
