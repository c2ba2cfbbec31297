//! Message types for the `graphql-ws` WebSocket sub-protocol.
//!
//! Every frame is a JSON object tagged by `type`. Queries, mutations and
//! subscriptions all travel as `start` operations correlated by `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::transport::{GraphRequest, GraphResponse};

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<JsonValue>,
    },
    Start {
        id: String,
        payload: GraphRequest,
    },
    Stop {
        id: String,
    },
    ConnectionTerminate {},
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<JsonValue>,
    },
    ConnectionError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<JsonValue>,
    },
    #[serde(rename = "ka")]
    KeepAlive {},
    Data {
        id: String,
        payload: GraphResponse,
    },
    Error {
        id: String,
        #[serde(default)]
        payload: JsonValue,
    },
    Complete {
        id: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Human-readable text for an `error` or `connection_error` payload.
///
/// Payloads arrive as a bare object, an array of GraphQL errors or a string.
pub fn describe_error_payload(payload: &JsonValue) -> String {
    match payload {
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(items) => items
            .iter()
            .map(describe_error_payload)
            .collect::<Vec<_>>()
            .join("; "),
        JsonValue::Object(map) => match map.get("message") {
            Some(JsonValue::String(msg)) => msg.clone(),
            _ => payload.to_string(),
        },
        JsonValue::Null => "unknown error".to_string(),
        other => other.to_string(),
    }
}
