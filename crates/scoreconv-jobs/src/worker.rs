//! Subscription-driven job worker.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use scoreconv_core::{defaults, Error, JobStatus, Result};
use scoreconv_graph::GraphClient;

use crate::converter::{DocumentConverter, VerovioConverter};
use crate::listener::SubscriptionListener;
use crate::pipeline::{JobPipeline, PipelineOutcome, Stage};
use crate::results::ResultStore;
use crate::stager::SourceStager;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Graph subscription endpoint.
    pub graphql_url: String,
    /// Entry point whose jobs this worker handles.
    pub entry_point_identifier: String,
    /// Verbose logging toggle.
    pub debug: bool,
    /// Where inputs are staged and converted.
    pub work_dir: PathBuf,
    pub converter_bin: String,
    /// `None` lets the tool run as long as it likes.
    pub convert_timeout: Option<Duration>,
    pub download_timeout: Duration,
    pub graph_request_timeout: Duration,
    /// Maximum number of concurrently running pipelines (0 = unbounded).
    pub max_concurrent_jobs: usize,
    /// Persist converted output here before cleanup.
    pub result_dir: Option<PathBuf>,
    /// Public URL prefix for persisted results.
    pub result_base_url: Option<String>,
}

impl WorkerConfig {
    /// Config with defaults for everything but the entry point.
    pub fn new(entry_point_identifier: impl Into<String>) -> Self {
        Self {
            graphql_url: defaults::GRAPHQL_WEBSOCKET_URL.to_string(),
            entry_point_identifier: entry_point_identifier.into(),
            debug: false,
            work_dir: std::env::temp_dir().join(defaults::WORK_DIR_NAME),
            converter_bin: defaults::CONVERTER_BIN.to_string(),
            convert_timeout: Some(Duration::from_secs(defaults::CONVERT_TIMEOUT_SECS)),
            download_timeout: Duration::from_secs(defaults::DOWNLOAD_TIMEOUT_SECS),
            graph_request_timeout: Duration::from_secs(defaults::GRAPH_REQUEST_TIMEOUT_SECS),
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            result_dir: None,
            result_base_url: None,
        }
    }

    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `GRAPHQL_WEBSOCKET_URL` | `ws://api-test.trompamusic.eu` | Graph endpoint |
    /// | `ENTRY_POINT_IDENTIFIER` | *(required)* | Entry point scoping jobs |
    /// | `WORKER_DEBUG` | on unless `NODE_ENV`/`APP_ENV` is `production` | Verbose logging |
    /// | `WORK_DIR` | `<temp>/scoreconv` | Staging directory |
    /// | `VEROVIO_BIN` | `verovio` | Conversion executable |
    /// | `CONVERT_TIMEOUT_SECS` | `300` | Tool timeout, `0` disables |
    /// | `DOWNLOAD_TIMEOUT_SECS` | `120` | Input download timeout |
    /// | `GRAPH_REQUEST_TIMEOUT_SECS` | `30` | Query/mutation timeout |
    /// | `JOB_MAX_CONCURRENT` | `0` | Pipeline cap, `0` is unbounded |
    /// | `RESULT_DIR` | unset | Persist results here |
    /// | `RESULT_BASE_URL` | unset | Public prefix for persisted results |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secs = |key: &str, default: u64| {
            var(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };

        let entry_point_identifier = var("ENTRY_POINT_IDENTIFIER").ok_or_else(|| {
            Error::Config("ENTRY_POINT_IDENTIFIER must be set".to_string())
        })?;

        let production = ["NODE_ENV", "APP_ENV"]
            .iter()
            .any(|key| var(key).as_deref() == Some("production"));
        let debug = var("WORKER_DEBUG")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(!production);

        let convert_timeout = match secs("CONVERT_TIMEOUT_SECS", defaults::CONVERT_TIMEOUT_SECS) {
            0 => None,
            n => Some(Duration::from_secs(n)),
        };

        Ok(Self {
            graphql_url: var("GRAPHQL_WEBSOCKET_URL")
                .unwrap_or_else(|| defaults::GRAPHQL_WEBSOCKET_URL.to_string()),
            entry_point_identifier,
            debug,
            work_dir: var("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join(defaults::WORK_DIR_NAME)),
            converter_bin: var("VEROVIO_BIN").unwrap_or_else(|| defaults::CONVERTER_BIN.to_string()),
            convert_timeout,
            download_timeout: Duration::from_secs(secs(
                "DOWNLOAD_TIMEOUT_SECS",
                defaults::DOWNLOAD_TIMEOUT_SECS,
            )),
            graph_request_timeout: Duration::from_secs(secs(
                "GRAPH_REQUEST_TIMEOUT_SECS",
                defaults::GRAPH_REQUEST_TIMEOUT_SECS,
            )),
            max_concurrent_jobs: var("JOB_MAX_CONCURRENT")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults::JOB_MAX_CONCURRENT),
            result_dir: var("RESULT_DIR").map(PathBuf::from),
            result_base_url: var("RESULT_BASE_URL"),
        })
    }

    pub fn with_graphql_url(mut self, url: impl Into<String>) -> Self {
        self.graphql_url = url.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_converter_bin(mut self, bin: impl Into<String>) -> Self {
        self.converter_bin = bin.into();
        self
    }

    pub fn with_convert_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.convert_timeout = timeout;
        self
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_result_dir(mut self, dir: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        self.result_dir = Some(dir.into());
        self.result_base_url = base_url;
        self
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted,
    /// A pipeline run began for a job.
    JobStarted { job_id: String },
    JobCompleted { job_id: String, document_id: String },
    JobFailed {
        job_id: String,
        stage: Stage,
        error: String,
    },
    /// The job was already finished.
    JobSkipped { job_id: String, status: JobStatus },
    /// The notification was discarded without touching the job.
    JobDropped { job_id: String, reason: String },
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Wait for the worker to finish its in-flight jobs and stop.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Worker task failed: {}", e)))
    }
}

/// Identifiers with a pipeline currently running in this process.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    /// Claim `id`; `None` if it is already running.
    fn claim(&self, id: &str) -> Option<InFlightGuard> {
        let mut set = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        set.insert(id.to_string()).then(|| InFlightGuard {
            set: self.clone(),
            id: id.to_string(),
        })
    }
}

struct InFlightGuard {
    set: InFlight,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Job worker that runs one pipeline per job notification.
pub struct JobWorker {
    client: GraphClient,
    pipeline: JobPipeline,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    pub fn new(client: GraphClient, pipeline: JobPipeline, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            client,
            pipeline,
            config,
            event_tx,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();
        let task = tokio::spawn(self.run(shutdown_rx));

        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    /// Accept job identifiers until shut down, one pipeline task each.
    ///
    /// The listener only ever waits on the dispatch channel, never on a
    /// pipeline, so a slow job cannot hold up the next notification.
    #[instrument(skip_all, fields(subsystem = "jobs", component = "worker"))]
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            entry_point = %self.config.entry_point_identifier,
            max_concurrent = self.config.max_concurrent_jobs,
            work_dir = %self.config.work_dir.display(),
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(defaults::DISPATCH_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let listener = SubscriptionListener::new(
            self.client.clone(),
            self.config.entry_point_identifier.clone(),
        );
        let listener_task = tokio::spawn(listener.run(dispatch_tx, cancel.clone()));

        let limiter = (self.config.max_concurrent_jobs > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_concurrent_jobs)));
        let in_flight = InFlight::default();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Job worker received shutdown signal");
                    break;
                }
                next = dispatch_rx.recv() => {
                    let Some(job_id) = next else {
                        warn!("Job listener stopped");
                        break;
                    };
                    let Some(guard) = in_flight.claim(&job_id) else {
                        debug!(%job_id, "Job already in flight, dropping duplicate notification");
                        let _ = self.event_tx.send(WorkerEvent::JobDropped {
                            job_id,
                            reason: "already in flight".to_string(),
                        });
                        continue;
                    };

                    let pipeline = self.pipeline.clone();
                    let event_tx = self.event_tx.clone();
                    let limiter = limiter.clone();
                    tasks.spawn(async move {
                        let _guard = guard;
                        let _permit = match limiter {
                            Some(limiter) => limiter.acquire_owned().await.ok(),
                            None => None,
                        };
                        execute_job(pipeline, event_tx, job_id).await;
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = ?e, "Job task panicked");
                    }
                }
            }
        }

        cancel.cancel();
        if let Err(e) = listener_task.await {
            error!(error = ?e, "Job listener task panicked");
        }

        if !tasks.is_empty() {
            info!(remaining = tasks.len(), "Waiting for in-flight jobs");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = ?e, "Job task panicked");
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }
}

async fn execute_job(pipeline: JobPipeline, event_tx: broadcast::Sender<WorkerEvent>, job_id: String) {
    let _ = event_tx.send(WorkerEvent::JobStarted {
        job_id: job_id.clone(),
    });

    let event = match pipeline.process(&job_id).await {
        PipelineOutcome::Completed {
            document_identifier,
        } => WorkerEvent::JobCompleted {
            job_id,
            document_id: document_identifier,
        },
        PipelineOutcome::Failed { stage, message } => WorkerEvent::JobFailed {
            job_id,
            stage,
            error: message,
        },
        PipelineOutcome::Skipped { status } => WorkerEvent::JobSkipped { job_id, status },
        PipelineOutcome::Dropped { reason } => WorkerEvent::JobDropped { job_id, reason },
    };
    let _ = event_tx.send(event);
}

/// Builder for creating a job worker.
pub struct WorkerBuilder {
    client: GraphClient,
    config: WorkerConfig,
    converter: Option<Arc<dyn DocumentConverter>>,
}

impl WorkerBuilder {
    pub fn new(client: GraphClient, config: WorkerConfig) -> Self {
        Self {
            client,
            config,
            converter: None,
        }
    }

    /// Use a converter other than the configured verovio binary.
    pub fn with_converter(mut self, converter: Arc<dyn DocumentConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Build and return the worker.
    pub fn build(self) -> Result<JobWorker> {
        if self.config.entry_point_identifier.trim().is_empty() {
            return Err(Error::Config("Entry point identifier is empty".to_string()));
        }

        let converter = self.converter.unwrap_or_else(|| {
            Arc::new(
                VerovioConverter::new(&self.config.converter_bin)
                    .with_timeout(self.config.convert_timeout),
            )
        });
        let stager = SourceStager::new(&self.config.work_dir)
            .with_download_timeout(self.config.download_timeout);
        let results = match &self.config.result_dir {
            Some(dir) => ResultStore::persistent(dir, self.config.result_base_url.clone()),
            None => ResultStore::local(),
        };

        let pipeline = JobPipeline::new(self.client.clone(), stager, converter).with_results(results);
        Ok(JobWorker::new(self.client, pipeline, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoreconv_graph::MockTransport;
    use serde_json::json;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_requires_entry_point() {
        let err = WorkerConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("ENTRY_POINT_IDENTIFIER")));

        let err = WorkerConfig::from_lookup(lookup(&[("ENTRY_POINT_IDENTIFIER", "  ")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_config_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&[("ENTRY_POINT_IDENTIFIER", "ep-1")])).unwrap();
        assert_eq!(config.entry_point_identifier, "ep-1");
        assert_eq!(config.graphql_url, defaults::GRAPHQL_WEBSOCKET_URL);
        assert_eq!(config.converter_bin, "verovio");
        assert_eq!(config.convert_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.max_concurrent_jobs, 0);
        assert!(config.debug);
        assert!(config.result_dir.is_none());
        assert!(config.work_dir.ends_with("scoreconv"));
    }

    #[test]
    fn test_config_overrides() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("ENTRY_POINT_IDENTIFIER", "ep-1"),
            ("GRAPHQL_WEBSOCKET_URL", "wss://graph.example.org"),
            ("WORK_DIR", "/var/scoreconv"),
            ("VEROVIO_BIN", "/opt/verovio/bin/verovio"),
            ("CONVERT_TIMEOUT_SECS", "0"),
            ("DOWNLOAD_TIMEOUT_SECS", "15"),
            ("JOB_MAX_CONCURRENT", "3"),
            ("RESULT_DIR", "/srv/mei"),
            ("RESULT_BASE_URL", "https://files.example.org"),
        ]))
        .unwrap();

        assert_eq!(config.graphql_url, "wss://graph.example.org");
        assert_eq!(config.work_dir, PathBuf::from("/var/scoreconv"));
        assert_eq!(config.converter_bin, "/opt/verovio/bin/verovio");
        assert_eq!(config.convert_timeout, None);
        assert_eq!(config.download_timeout, Duration::from_secs(15));
        assert_eq!(config.max_concurrent_jobs, 3);
        assert_eq!(config.result_dir, Some(PathBuf::from("/srv/mei")));
        assert_eq!(config.result_base_url.as_deref(), Some("https://files.example.org"));
    }

    #[test]
    fn test_config_debug_toggle() {
        let production = WorkerConfig::from_lookup(lookup(&[
            ("ENTRY_POINT_IDENTIFIER", "ep"),
            ("NODE_ENV", "production"),
        ]))
        .unwrap();
        assert!(!production.debug);

        let forced = WorkerConfig::from_lookup(lookup(&[
            ("ENTRY_POINT_IDENTIFIER", "ep"),
            ("APP_ENV", "production"),
            ("WORKER_DEBUG", "true"),
        ]))
        .unwrap();
        assert!(forced.debug);
    }

    #[test]
    fn test_config_ignores_malformed_numbers() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("ENTRY_POINT_IDENTIFIER", "ep"),
            ("JOB_MAX_CONCURRENT", "many"),
        ]))
        .unwrap();
        assert_eq!(config.max_concurrent_jobs, defaults::JOB_MAX_CONCURRENT);
    }

    #[test]
    fn test_config_builder_chaining() {
        let config = WorkerConfig::new("ep")
            .with_max_concurrent(2)
            .with_debug(true)
            .with_work_dir("/tmp/x")
            .with_result_dir("/srv", None);
        assert_eq!(config.max_concurrent_jobs, 2);
        assert!(config.debug);
        assert_eq!(config.work_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.result_dir, Some(PathBuf::from("/srv")));
    }

    #[test]
    fn test_in_flight_claims_are_exclusive_until_dropped() {
        let in_flight = InFlight::default();
        let guard = in_flight.claim("job-1");
        assert!(guard.is_some());
        assert!(in_flight.claim("job-1").is_none());
        assert!(in_flight.claim("job-2").is_some());
        drop(guard);
        assert!(in_flight.claim("job-1").is_some());
    }

    #[test]
    fn test_builder_rejects_empty_entry_point() {
        let client = GraphClient::new(MockTransport::new().into_shared());
        assert!(WorkerBuilder::new(client, WorkerConfig::new("")).build().is_err());
    }

    /// Next event other than `WorkerStarted`, which a late receiver may miss.
    async fn next_event(events: &mut broadcast::Receiver<WorkerEvent>) -> WorkerEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for worker event")
                .expect("event bus closed");
            if event != WorkerEvent::WorkerStarted {
                return event;
            }
        }
    }

    async fn wait_for_listener(transport: &MockTransport) {
        for _ in 0..200 {
            if transport.open_subscriptions() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker never subscribed");
    }

    #[tokio::test]
    async fn test_unknown_job_is_dropped_and_worker_stops() {
        let transport = MockTransport::new().with_data("ControlAction", json!({ "ControlAction": [] }));
        let client = GraphClient::new(transport.clone().into_shared());
        let worker = WorkerBuilder::new(client, WorkerConfig::new("ep-1")).build().unwrap();

        let handle = worker.start();
        let mut events = handle.events();
        wait_for_listener(&transport).await;

        transport.notify(json!({ "ControlActionRequest": { "identifier": "ghost" } }));
        assert_eq!(
            next_event(&mut events).await,
            WorkerEvent::JobStarted {
                job_id: "ghost".into()
            }
        );
        assert!(matches!(
            next_event(&mut events).await,
            WorkerEvent::JobDropped { ref job_id, .. } if job_id == "ghost"
        ));

        handle.shutdown().await.unwrap();
        assert_eq!(next_event(&mut events).await, WorkerEvent::WorkerStopped);
        handle.join().await.unwrap();
        assert!(transport.calls_for("UpdateControlAction").is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_notification_while_in_flight_is_dropped() {
        let transport = MockTransport::new()
            .with_data(
                "ControlAction",
                json!({ "ControlAction": [{ "identifier": "job-1", "actionStatus": "CompletedActionStatus" }] }),
            )
            .with_latency("ControlAction", Duration::from_millis(200));
        let client = GraphClient::new(transport.clone().into_shared());
        let worker = WorkerBuilder::new(client, WorkerConfig::new("ep-1")).build().unwrap();

        let handle = worker.start();
        let mut events = handle.events();
        wait_for_listener(&transport).await;

        let request = json!({ "ControlActionRequest": { "identifier": "job-1" } });
        transport.notify(request.clone());
        transport.notify(request);

        let mut seen = Vec::new();
        while seen.len() < 3 {
            seen.push(next_event(&mut events).await);
        }

        assert!(seen.contains(&WorkerEvent::JobDropped {
            job_id: "job-1".into(),
            reason: "already in flight".into()
        }));
        assert!(seen.contains(&WorkerEvent::JobSkipped {
            job_id: "job-1".into(),
            status: JobStatus::Completed
        }));
        assert_eq!(transport.calls_for("ControlAction").len(), 1);

        handle.shutdown().await.unwrap();
        handle.join().await.unwrap();
    }
}
