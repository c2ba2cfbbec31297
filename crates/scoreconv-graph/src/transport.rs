//! Transport abstraction for graph operations.
//!
//! A [`GraphTransport`] moves GraphQL documents to the store and hands back
//! raw responses. It knows nothing about jobs or documents; typed mapping
//! happens in [`crate::client`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

use scoreconv_core::Result;

/// A single GraphQL operation ready to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRequest {
    /// Logical name used for logging and mock routing (e.g. `ControlAction`).
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none", default)]
    pub operation: Option<String>,
    pub query: String,
    #[serde(default)]
    pub variables: JsonValue,
}

impl GraphRequest {
    pub fn new(operation: impl Into<String>, query: impl Into<String>, variables: JsonValue) -> Self {
        Self {
            operation: Some(operation.into()),
            query: query.into(),
            variables,
        }
    }

    /// Operation name, or `"anonymous"` when none was given.
    pub fn operation_name(&self) -> &str {
        self.operation.as_deref().unwrap_or("anonymous")
    }
}

/// One entry of a GraphQL `errors` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphErrorEntry {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<JsonValue>>,
}

/// Raw result of an operation: `data` and/or `errors`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphResponse {
    #[serde(default)]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphErrorEntry>>,
}

impl GraphResponse {
    pub fn from_data(data: JsonValue) -> Self {
        Self {
            data: Some(data),
            errors: None,
        }
    }

    pub fn from_error(message: impl Into<String>) -> Self {
        Self {
            data: None,
            errors: Some(vec![GraphErrorEntry {
                message: message.into(),
                path: None,
            }]),
        }
    }

    /// Whether the server reported at least one error.
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// All error messages joined with `"; "`.
    pub fn error_message(&self) -> String {
        self.errors
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Live stream of subscription notifications.
///
/// Ends when the server completes the subscription or the transport shuts
/// down. Dropping it unsubscribes.
pub type NotificationStream = futures::channel::mpsc::UnboundedReceiver<GraphResponse>;

/// Connection lifecycle events observed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// First successful connection.
    Connected,
    /// An established connection was lost.
    Disconnected { reason: String },
    /// A new connection attempt is scheduled.
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Connection restored after one or more failed attempts.
    Reconnected,
    /// A connection attempt or the protocol handshake failed.
    Error { message: String },
}

/// Injected capability for talking to the graph store.
#[async_trait]
pub trait GraphTransport: Send + Sync {
    /// Run a query or mutation and wait for its single response.
    async fn execute(&self, request: GraphRequest) -> Result<GraphResponse>;

    /// Register a subscription. It survives reconnects of the transport.
    async fn subscribe(&self, request: GraphRequest) -> Result<NotificationStream>;

    /// Observe connection lifecycle events.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;
}
