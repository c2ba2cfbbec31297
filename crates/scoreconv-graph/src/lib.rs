//! # scoreconv-graph
//!
//! Client side of the graph store protocol.
//!
//! The worker never talks to the store directly: every read and write goes
//! through a [`GraphClient`], which wraps an injected [`GraphTransport`].
//! Production code uses [`WsTransport`] (the `graphql-ws` WebSocket
//! sub-protocol with automatic reconnect); tests use the scripted
//! `MockTransport` behind the `mock` feature.

pub mod client;
pub mod field;
pub mod operations;
pub mod protocol;
pub mod reconnect;
pub mod transport;
pub mod ws;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use client::GraphClient;
pub use field::Field;
pub use reconnect::ReconnectConfig;
pub use transport::{
    ConnectionEvent, GraphErrorEntry, GraphRequest, GraphResponse, GraphTransport,
    NotificationStream,
};
pub use ws::{WsTransport, WsTransportConfig};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockCall, MockTransport};
