//! Typed operations against the graph store.
//!
//! [`GraphClient`] is the only place that knows the shape of the store's
//! responses. Everything above it works with [`Job`] and [`Document`].

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value as JsonValue};
use tracing::{debug, instrument, warn};

use scoreconv_core::{Document, Error, Job, JobStatus, Result};

use crate::field::Field;
use crate::operations::{self, *};
use crate::transport::{GraphRequest, GraphTransport, NotificationStream};

/// Typed client over an injected [`GraphTransport`].
#[derive(Clone)]
pub struct GraphClient {
    transport: Arc<dyn GraphTransport>,
}

impl GraphClient {
    pub fn new(transport: Arc<dyn GraphTransport>) -> Self {
        Self { transport }
    }

    /// Run a query and return its `data` object.
    pub async fn query(&self, operation: &str, document: &str, variables: JsonValue) -> Result<JsonValue> {
        self.run("query", operation, document, variables).await
    }

    /// Run a mutation and return its `data` object.
    pub async fn mutate(&self, operation: &str, document: &str, variables: JsonValue) -> Result<JsonValue> {
        self.run("mutation", operation, document, variables).await
    }

    /// Register a subscription and return its notification stream.
    pub async fn subscribe(&self, operation: &str, document: &str) -> Result<NotificationStream> {
        self.transport
            .subscribe(GraphRequest::new(operation, document, json!({})))
            .await
    }

    async fn run(
        &self,
        kind: &'static str,
        operation: &str,
        document: &str,
        variables: JsonValue,
    ) -> Result<JsonValue> {
        let start = Instant::now();
        let response = self
            .transport
            .execute(GraphRequest::new(operation, document, variables))
            .await?;
        let elapsed = start.elapsed().as_millis() as u64;

        if response.has_errors() {
            warn!(
                subsystem = "graph",
                op = operation,
                kind,
                duration_ms = elapsed,
                error = %response.error_message(),
                "Graph operation returned errors"
            );
            return Err(Error::Remote(format!(
                "{} failed: {}",
                operation,
                response.error_message()
            )));
        }

        debug!(subsystem = "graph", op = operation, kind, duration_ms = elapsed, "Graph operation complete");
        response
            .data
            .ok_or_else(|| Error::Remote(format!("{} returned no data", operation)))
    }

    /// Fetch one job by identifier.
    ///
    /// Fails with [`Error::NotFound`] when the store has no matching record.
    #[instrument(skip(self), fields(subsystem = "graph", op = OP_CONTROL_ACTION))]
    pub async fn fetch_job(&self, identifier: &str) -> Result<Job> {
        let data = self
            .query(
                OP_CONTROL_ACTION,
                CONTROL_ACTION_QUERY,
                json!({ "identifier": identifier }),
            )
            .await?;

        let jobs: Field<Vec<Job>> = Field::lookup(Some(&data), OP_CONTROL_ACTION).decode()?;
        match jobs {
            Field::Absent => Err(Error::Remote(format!(
                "{} response is missing the {} field",
                OP_CONTROL_ACTION, OP_CONTROL_ACTION
            ))),
            Field::Null => Err(not_found(identifier)),
            Field::Value(jobs) => jobs.into_iter().next().ok_or_else(|| not_found(identifier)),
        }
    }

    /// Set a job's status. `error` is sent as-is (`None` becomes `null`).
    #[instrument(skip(self, status, error), fields(subsystem = "graph", op = OP_UPDATE_CONTROL_ACTION, status = %status))]
    pub async fn update_job_status(
        &self,
        identifier: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let data = self
            .mutate(
                OP_UPDATE_CONTROL_ACTION,
                UPDATE_CONTROL_ACTION_MUTATION,
                json!({
                    "identifier": identifier,
                    "status": status.as_wire_str(),
                    "error": error,
                }),
            )
            .await?;

        match Field::lookup(Some(&data), OP_UPDATE_CONTROL_ACTION) {
            Field::Absent => Err(Error::Remote(format!(
                "{} response is missing its result",
                OP_UPDATE_CONTROL_ACTION
            ))),
            Field::Null => Err(not_found(identifier)),
            Field::Value(_) => Ok(()),
        }
    }

    /// Create the result document for a finished conversion.
    #[instrument(skip(self), fields(subsystem = "graph", op = OP_CREATE_DIGITAL_DOCUMENT))]
    pub async fn create_result_document(&self, source: &str, name: &str) -> Result<Document> {
        let document = operations::create_digital_document_mutation();
        let data = self
            .mutate(
                OP_CREATE_DIGITAL_DOCUMENT,
                &document,
                json!({ "source": source, "name": name }),
            )
            .await?;

        match Field::lookup(Some(&data), OP_CREATE_DIGITAL_DOCUMENT).decode::<Document>()? {
            Field::Value(document) => Ok(document),
            Field::Null | Field::Absent => Err(Error::Remote(format!(
                "{} did not return the created document",
                OP_CREATE_DIGITAL_DOCUMENT
            ))),
        }
    }

    /// Attach a document to a job as its `result`.
    #[instrument(skip(self), fields(subsystem = "graph", op = OP_ADD_RESULT))]
    pub async fn add_result_to_job(&self, job_identifier: &str, document_identifier: &str) -> Result<()> {
        let data = self
            .mutate(
                OP_ADD_RESULT,
                ADD_RESULT_MUTATION,
                json!({
                    "controlActionIdentifier": job_identifier,
                    "digitalDocumentIdentifier": document_identifier,
                }),
            )
            .await?;

        match Field::lookup(Some(&data), OP_ADD_RESULT) {
            Field::Value(_) => Ok(()),
            Field::Null | Field::Absent => Err(Error::Remote(format!(
                "Linking document {} to job {} had no effect",
                document_identifier, job_identifier
            ))),
        }
    }

    /// Subscribe to job-created notifications for one entry point.
    pub async fn subscribe_job_requests(&self, entry_point_identifier: &str) -> Result<NotificationStream> {
        let document = operations::control_action_request_subscription(entry_point_identifier);
        self.subscribe(OP_CONTROL_ACTION_REQUEST, &document).await
    }
}

/// Pull the job identifier out of one `ControlActionRequest` notification.
pub fn notification_job_identifier(data: Option<&JsonValue>) -> Result<String> {
    let request = Field::lookup(data, OP_CONTROL_ACTION_REQUEST).into_option();
    request
        .and_then(|r| r.get("identifier"))
        .and_then(JsonValue::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Remote(format!(
                "{} notification without an identifier",
                OP_CONTROL_ACTION_REQUEST
            ))
        })
}

fn not_found(identifier: &str) -> Error {
    Error::NotFound(format!(
        "Failed to query ControlAction with identifier: {}",
        identifier
    ))
}
