//! Turns job-created notifications into job identifiers on a channel.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use scoreconv_core::defaults;
use scoreconv_graph::client::notification_job_identifier;
use scoreconv_graph::GraphClient;

/// Holds the job subscription open and forwards each new job identifier.
///
/// The listener never waits on a pipeline: identifiers go straight onto the
/// dispatch channel and the worker decides what to run. If the subscription
/// cannot be registered or its stream ends, it is registered again after a
/// short pause.
pub struct SubscriptionListener {
    client: GraphClient,
    entry_point: String,
    resubscribe_delay: Duration,
}

impl SubscriptionListener {
    pub fn new(client: GraphClient, entry_point: impl Into<String>) -> Self {
        Self {
            client,
            entry_point: entry_point.into(),
            resubscribe_delay: Duration::from_millis(defaults::RESUBSCRIBE_DELAY_MS),
        }
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Run until `cancel` fires or the dispatch channel closes.
    #[instrument(skip_all, fields(subsystem = "jobs", component = "listener", entry_point = %self.entry_point))]
    pub async fn run(self, dispatch: mpsc::Sender<String>, cancel: CancellationToken) {
        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.client.subscribe_job_requests(&self.entry_point) => result,
            };

            let mut stream = match subscribed {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to subscribe to job requests");
                    if self.pause(&cancel).await {
                        return;
                    }
                    continue;
                }
            };
            info!("Listening for job requests");

            loop {
                let notification = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = stream.next() => next,
                };
                let Some(notification) = notification else {
                    warn!("Job subscription ended");
                    break;
                };

                if notification.has_errors() {
                    warn!(error = %notification.error_message(), "Job subscription reported an error");
                    continue;
                }

                let identifier = match notification_job_identifier(notification.data.as_ref()) {
                    Ok(identifier) => identifier,
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed job notification");
                        continue;
                    }
                };

                debug!(job_id = %identifier, "Job request received");
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = dispatch.send(identifier) => sent,
                };
                if sent.is_err() {
                    debug!("Dispatch channel closed, stopping listener");
                    return;
                }
            }

            if self.pause(&cancel).await {
                return;
            }
        }
    }

    /// Wait before resubscribing. Returns `true` if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.resubscribe_delay) => false,
        }
    }
}
