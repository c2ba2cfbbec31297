//! Centralized default constants for the scoreconv worker.
//!
//! **This module is the single source of truth** for shared default values.
//! Environment-driven configuration falls back to these when a variable is
//! unset or unparseable.

// =============================================================================
// GRAPH API
// =============================================================================

/// Default graph subscription endpoint.
pub const GRAPHQL_WEBSOCKET_URL: &str = "ws://api-test.trompamusic.eu";

/// WebSocket sub-protocol spoken by the graph endpoint.
pub const GRAPHQL_WS_PROTOCOL: &str = "graphql-ws";

/// Timeout for a single query or mutation round trip.
pub const GRAPH_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Time allowed for the server to acknowledge `connection_init`.
pub const CONNECTION_ACK_TIMEOUT_SECS: u64 = 10;

/// First reconnect delay after the connection drops.
pub const RECONNECT_INITIAL_DELAY_MS: u64 = 1_000;

/// Upper bound on the reconnect delay.
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Broadcast capacity for connection lifecycle events.
pub const CONNECTION_EVENT_CAPACITY: usize = 64;

// =============================================================================
// CONVERSION
// =============================================================================

/// Conversion executable looked up on `PATH`.
pub const CONVERTER_BIN: &str = "verovio";

/// Source format argument passed to the conversion tool.
pub const CONVERTER_SOURCE_FORMAT: &str = "xml";

/// Target format argument passed to the conversion tool.
pub const CONVERTER_TARGET_FORMAT: &str = "mei";

/// Extension of converted output files.
pub const OUTPUT_EXTENSION: &str = "mei";

/// Timeout for one conversion subprocess (0 disables).
pub const CONVERT_TIMEOUT_SECS: u64 = 300;

/// Maximum diagnostic output kept per conversion (1 MiB).
pub const MAX_DIAGNOSTIC_BYTES: usize = 1024 * 1024;

// =============================================================================
// STAGING
// =============================================================================

/// Name of the working directory created under the system temp dir.
pub const WORK_DIR_NAME: &str = "scoreconv";

/// Timeout for downloading one input document.
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 120;

/// Fallback base name when a source URL has no usable path segment.
pub const FALLBACK_SOURCE_NAME: &str = "source.xml";

/// Manifest that names the canonical entry of a compressed container.
pub const CONTAINER_MANIFEST: &str = "META-INF/container.xml";

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default cap on concurrently running pipelines (0 = unbounded).
pub const JOB_MAX_CONCURRENT: usize = 0;

/// Capacity of the notification → pipeline dispatch channel.
pub const DISPATCH_CHANNEL_CAPACITY: usize = 256;

/// Broadcast capacity for worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Pause before re-registering the job subscription after it ends or fails.
pub const RESUBSCRIBE_DELAY_MS: u64 = 2_000;

// =============================================================================
// RESULT DOCUMENT METADATA
// =============================================================================

/// `contributor` attached to every result document.
pub const RESULT_CONTRIBUTOR: &str = "https://videodock.com";

/// `creator` attached to every result document.
pub const RESULT_CREATOR: &str = "Algorithm POC";

/// `description` attached to every result document.
pub const RESULT_DESCRIPTION: &str = "Result of the Verovio algorithm POC";

/// `format` tag of every result document.
pub const RESULT_FORMAT: &str = "mei";

/// `language` attached to every result document (graph enum value).
pub const RESULT_LANGUAGE: &str = "en";

/// `subject` attached to every result document.
pub const RESULT_SUBJECT: &str = "Verovio, XML to MEI";
