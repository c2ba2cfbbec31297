//! The per-job conversion pipeline and its status state machine.
//!
//! One run walks `Received → Validating → Staging → Converting → Publishing
//! → Done`. Every state before `Done` is shown to the outside world as
//! *Active*; reaching `Done` renders *Completed* and a failure in any state
//! renders *Failed* with that state's message. Exactly one terminal status
//! mutation is sent per run, and local files are removed on every exit path.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use scoreconv_core::{Document, Error, JobStatus, Result, ValidatedJob};
use scoreconv_graph::GraphClient;

use crate::converter::DocumentConverter;
use crate::results::ResultStore;
use crate::scratch::Scratch;
use crate::stager::SourceStager;
use crate::validator;

/// Internal pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Validating,
    Staging,
    Converting,
    Publishing,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Validating => "validating",
            Stage::Staging => "staging",
            Stage::Converting => "converting",
            Stage::Publishing => "publishing",
            Stage::Done => "done",
        }
    }

    /// Externally visible job status for this stage.
    pub fn rendered_status(&self, failed: bool) -> JobStatus {
        match (self, failed) {
            (_, true) => JobStatus::Failed,
            (Stage::Done, false) => JobStatus::Completed,
            _ => JobStatus::Active,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The job could not be loaded; nothing was mutated.
    Dropped { reason: String },
    /// The job already carried a terminal status.
    Skipped { status: JobStatus },
    Completed { document_identifier: String },
    Failed { stage: Stage, message: String },
}

/// Runs conversion jobs end to end.
#[derive(Clone)]
pub struct JobPipeline {
    client: GraphClient,
    stager: SourceStager,
    converter: Arc<dyn DocumentConverter>,
    results: ResultStore,
}

impl JobPipeline {
    pub fn new(
        client: GraphClient,
        stager: SourceStager,
        converter: Arc<dyn DocumentConverter>,
    ) -> Self {
        Self {
            client,
            stager,
            converter,
            results: ResultStore::local(),
        }
    }

    pub fn with_results(mut self, results: ResultStore) -> Self {
        self.results = results;
        self
    }

    /// Process the job with the given identifier.
    ///
    /// Never returns an error: every failure ends up either in the job's
    /// status or, when the job cannot be loaded, in the outcome only.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "pipeline", job_id = %identifier))]
    pub async fn process(&self, identifier: &str) -> PipelineOutcome {
        let start = Instant::now();
        debug!(stage = %Stage::Received, "Job notification received");

        let job = match self.client.fetch_job(identifier).await {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Could not load job, dropping notification");
                return PipelineOutcome::Dropped {
                    reason: e.job_message(),
                };
            }
        };

        if let Some(status) = job.status.filter(JobStatus::is_terminal) {
            info!(%status, "Job already finished, skipping");
            return PipelineOutcome::Skipped { status };
        }

        let validated = match validator::validate(&job) {
            Ok(validated) => validated,
            Err(e) => return self.fail(identifier, Stage::Validating, e).await,
        };

        // A lost Active update does not stop the conversion attempt.
        if let Err(e) = self
            .client
            .update_job_status(identifier, JobStatus::Active, None)
            .await
        {
            warn!(error = %e, "Failed to mark job active, continuing");
        }

        let mut scratch = Scratch::new();
        let result = self.run_stages(identifier, &validated, &mut scratch).await;
        let leftovers = scratch.cleanup().await;
        if leftovers > 0 {
            warn!(leftovers, "Some staged files could not be removed");
        }

        match result {
            Ok(document) => {
                if let Err(e) = self
                    .client
                    .update_job_status(identifier, JobStatus::Completed, Some(""))
                    .await
                {
                    error!(error = %e, "Failed to mark job completed");
                }
                info!(
                    document_id = %document.identifier,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job completed"
                );
                PipelineOutcome::Completed {
                    document_identifier: document.identifier,
                }
            }
            Err((stage, e)) => self.fail(identifier, stage, e).await,
        }
    }

    async fn run_stages(
        &self,
        identifier: &str,
        validated: &ValidatedJob,
        scratch: &mut Scratch,
    ) -> std::result::Result<Document, (Stage, Error)> {
        debug!(stage = %Stage::Staging, source = %validated.input.source, "Staging input");
        let staged = self
            .stager
            .stage(&validated.input, scratch)
            .await
            .map_err(|e| (Stage::Staging, e))?;

        debug!(stage = %Stage::Converting, input = %staged.display(), "Converting");
        scratch.track_file(self.converter.output_path(&staged));
        let output = self
            .converter
            .convert(&staged)
            .await
            .map_err(|e| (Stage::Converting, e))?;

        debug!(stage = %Stage::Publishing, "Publishing result");
        self.publish(identifier, &validated.result_name, &output)
            .await
            .map_err(|e| (Stage::Publishing, e))
    }

    async fn publish(
        &self,
        identifier: &str,
        result_name: &str,
        output: &std::path::Path,
    ) -> Result<Document> {
        let source = self.results.publish(output).await?;
        let document = self
            .client
            .create_result_document(&source, result_name)
            .await?;
        self.client
            .add_result_to_job(identifier, &document.identifier)
            .await?;
        Ok(document)
    }

    async fn fail(&self, identifier: &str, stage: Stage, e: Error) -> PipelineOutcome {
        let message = e.job_message();
        if e.is_terminal() {
            warn!(stage = %stage, error = %message, "Job failed");
        } else {
            error!(stage = %stage, error = %e, "Job failed");
        }

        if let Err(update) = self
            .client
            .update_job_status(identifier, stage.rendered_status(true), Some(&message))
            .await
        {
            error!(error = %update, "Failed to mark job failed");
        }

        PipelineOutcome::Failed { stage, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scoreconv_graph::MockTransport;
    use serde_json::{json, Value as JsonValue};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Converter that never runs anything and counts calls.
    #[derive(Default)]
    struct CountingConverter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentConverter for CountingConverter {
        async fn convert(&self, input: &Path) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.output_path(input))
        }

        async fn health_check(&self) -> Result<String> {
            Ok("counting".into())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn job_data(status: &str, object: JsonValue) -> JsonValue {
        json!({
            "ControlAction": [{
                "identifier": "job-1",
                "actionStatus": status,
                "object": object,
            }]
        })
    }

    fn pipeline(transport: &MockTransport, converter: Arc<CountingConverter>) -> JobPipeline {
        let work_dir = std::env::temp_dir().join("scoreconv-pipeline-unit");
        JobPipeline::new(
            GraphClient::new(transport.clone().into_shared()),
            SourceStager::new(work_dir),
            converter,
        )
    }

    fn status_updates(transport: &MockTransport) -> Vec<(String, JsonValue)> {
        transport
            .calls_for("UpdateControlAction")
            .into_iter()
            .map(|c| {
                (
                    c.variables["status"].as_str().unwrap_or_default().to_string(),
                    c.variables["error"].clone(),
                )
            })
            .collect()
    }

    #[test]
    fn test_stage_rendering() {
        assert_eq!(Stage::Received.rendered_status(false), JobStatus::Active);
        assert_eq!(Stage::Converting.rendered_status(false), JobStatus::Active);
        assert_eq!(Stage::Done.rendered_status(false), JobStatus::Completed);
        assert_eq!(Stage::Staging.rendered_status(true), JobStatus::Failed);
        assert_eq!(Stage::Done.rendered_status(true), JobStatus::Failed);
        assert_eq!(Stage::Publishing.to_string(), "publishing");
    }

    #[tokio::test]
    async fn test_unknown_job_is_dropped_without_mutation() {
        let transport = MockTransport::new().with_data("ControlAction", json!({ "ControlAction": [] }));
        let outcome = pipeline(&transport, Arc::default()).process("missing").await;

        assert!(matches!(outcome, PipelineOutcome::Dropped { .. }));
        assert_eq!(transport.operation_sequence(), vec!["ControlAction"]);
    }

    #[tokio::test]
    async fn test_fetch_transport_error_is_dropped() {
        let transport = MockTransport::new().with_transport_error("ControlAction", "not connected");
        let outcome = pipeline(&transport, Arc::default()).process("job-1").await;

        assert_eq!(
            outcome,
            PipelineOutcome::Dropped {
                reason: "not connected".into()
            }
        );
        assert!(status_updates(&transport).is_empty());
    }

    #[tokio::test]
    async fn test_finished_job_is_skipped() {
        let transport = MockTransport::new()
            .with_data("ControlAction", job_data("CompletedActionStatus", json!([])));
        let outcome = pipeline(&transport, Arc::default()).process("job-1").await;

        assert_eq!(
            outcome,
            PipelineOutcome::Skipped {
                status: JobStatus::Completed
            }
        );
        assert!(status_updates(&transport).is_empty());
    }

    #[tokio::test]
    async fn test_validation_failure_sends_single_failed_status() {
        let transport = MockTransport::new()
            .with_data("ControlAction", job_data("PotentialActionStatus", json!([])))
            .with_data("UpdateControlAction", json!({ "UpdateControlAction": { "identifier": "job-1" } }));
        let converter = Arc::new(CountingConverter::default());
        let outcome = pipeline(&transport, converter.clone()).process("job-1").await;

        assert_eq!(
            outcome,
            PipelineOutcome::Failed {
                stage: Stage::Validating,
                message: "The resultName is not given or empty!".into()
            }
        );
        assert_eq!(
            status_updates(&transport),
            vec![(
                "FailedActionStatus".to_string(),
                json!("The resultName is not given or empty!")
            )]
        );
        assert_eq!(converter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_active_update_does_not_stop_the_run() {
        let transport = MockTransport::new()
            .with_data(
                "ControlAction",
                job_data(
                    "PotentialActionStatus",
                    json!([
                        { "name": "resultName", "value": "Out" },
                        { "name": "targetFile", "nodeValue": { "format": "xml", "source": "ftp://host/a.xml" } }
                    ]),
                ),
            )
            .with_data("UpdateControlAction", json!({ "UpdateControlAction": { "identifier": "job-1" } }));
        transport.push_transport_error("UpdateControlAction", "connection reset");

        let converter = Arc::new(CountingConverter::default());
        let outcome = pipeline(&transport, converter.clone()).process("job-1").await;

        // The run went on to staging, which rejects the scheme.
        assert!(matches!(
            outcome,
            PipelineOutcome::Failed { stage: Stage::Staging, .. }
        ));
        let updates = status_updates(&transport);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].0, "ActiveActionStatus");
        assert_eq!(updates[0].1, JsonValue::Null);
        assert_eq!(updates[1].0, "FailedActionStatus");
        assert_eq!(converter.calls.load(Ordering::SeqCst), 0);
        assert!(transport.calls_for("CreateDigitalDocument").is_empty());
    }
}
