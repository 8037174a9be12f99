// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client boundary to the container-orchestration platform.
//!
//! The platform itself (service scheduling, secret/config storage) is an
//! external collaborator; the agent only needs to assert that declared
//! workload services are running, and to be woken when something changes.
//! Responses meaning "already initialized"/"already exists" are successes:
//! re-asserting a running service is a no-op by design of the maintenance
//! loop.

use async_trait::async_trait;
use idstore::WorkloadService;
use slog::Logger;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("error reaching orchestration platform")]
    Transport(#[source] reqwest::Error),

    #[error("orchestration platform rejected {operation}: status {status}")]
    Status { operation: &'static str, status: u16 },
}

impl PlatformError {
    /// Transport-level failures are worth retrying next cycle; status
    /// failures describe a real disagreement with the platform.
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Transport(_))
    }
}

#[async_trait]
pub trait OrchestrationClient: Send + Sync {
    /// Assert that `service` is running. Idempotent.
    async fn ensure_service(
        &self,
        service: &WorkloadService,
    ) -> Result<(), PlatformError>;

    /// Block until the platform reports an event or `timeout` elapses.
    /// Returns whether an event arrived.
    async fn wait_event(
        &self,
        timeout: Duration,
    ) -> Result<bool, PlatformError>;

    /// Release the client. Further calls may fail.
    async fn close(&self);
}

/// HTTP implementation of [`OrchestrationClient`].
pub struct HttpOrchestration {
    log: Logger,
    client: reqwest::Client,
    base_url: String,
    closed: AtomicBool,
}

impl HttpOrchestration {
    pub fn new(log: &Logger, base_url: String) -> HttpOrchestration {
        HttpOrchestration {
            log: log.new(o!("component" => "HttpOrchestration")),
            client: reqwest::Client::new(),
            base_url,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl OrchestrationClient for HttpOrchestration {
    async fn ensure_service(
        &self,
        service: &WorkloadService,
    ) -> Result<(), PlatformError> {
        let url = format!("{}/v1/services/{}", self.base_url, service.name);
        let response = self
            .client
            .put(&url)
            .json(service)
            .send()
            .await
            .map_err(PlatformError::Transport)?;
        let status = response.status();
        // "Already exists" means the assertion already holds.
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        Err(PlatformError::Status {
            operation: "ensure_service",
            status: status.as_u16(),
        })
    }

    async fn wait_event(
        &self,
        timeout: Duration,
    ) -> Result<bool, PlatformError> {
        let url = format!("{}/v1/events", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("timeout_secs", timeout.as_secs())])
            .timeout(timeout + Duration::from_secs(5))
            .send()
            .await;
        match response {
            // An empty window is reported as 204.
            Ok(response)
                if response.status() == reqwest::StatusCode::NO_CONTENT =>
            {
                Ok(false)
            }
            Ok(response) if response.status().is_success() => Ok(true),
            Ok(response) => Err(PlatformError::Status {
                operation: "wait_event",
                status: response.status().as_u16(),
            }),
            // An elapsed long-poll is an empty window, not a failure.
            Err(err) if err.is_timeout() => Ok(false),
            Err(err) => Err(PlatformError::Transport(err)),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(self.log, "orchestration client closed");
        }
    }
}
