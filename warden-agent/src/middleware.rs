// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client boundary to the messaging/data middleware.
//!
//! Dependent nodes use this client for the correlated CSR-batch exchange
//! with the principal node and for relaying message-routing registrations;
//! every node uses it for the per-cycle connection attempt. Connection
//! failures are transient by design: the maintenance loop logs them and
//! retries on the next cycle.

use crate::params::{RoutingRegistration, SignBatchRequest, SignBatchResponse};
use async_trait::async_trait;
use slog::Logger;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;
use warden_common::backoff;

#[derive(Debug, thiserror::Error)]
pub enum MiddlewareError {
    /// Failure to reach the peer; abandoned for this cycle and retried on
    /// the next one.
    #[error("transient connectivity failure: {0}")]
    Transient(String),

    #[error("peer rejected request: status {status}")]
    Rejected { status: u16 },
}

impl From<reqwest::Error> for MiddlewareError {
    fn from(err: reqwest::Error) -> Self {
        MiddlewareError::Transient(err.to_string())
    }
}

#[async_trait]
pub trait MiddlewareClient: Send + Sync {
    /// Negotiate a connection. Transient failures are expected while the
    /// peer is still coming up.
    async fn connect(&self) -> Result<(), MiddlewareError>;

    fn is_connected(&self) -> bool;

    /// Fire a CSR batch at the signer. The reply arrives asynchronously and
    /// is observed via [`Self::poll_reply`].
    async fn submit_csr_batch(
        &self,
        batch: &SignBatchRequest,
    ) -> Result<(), MiddlewareError>;

    /// Check for the correlated reply to a previously submitted batch.
    async fn poll_reply(
        &self,
        request_id: Uuid,
    ) -> Result<Option<SignBatchResponse>, MiddlewareError>;

    /// Relay a message-routing registration to the principal.
    async fn register_routing(
        &self,
        registration: &RoutingRegistration,
    ) -> Result<(), MiddlewareError>;

    /// Stop the connection. Part of the shutdown discipline.
    async fn close(&self);
}

/// HTTP implementation of [`MiddlewareClient`], speaking to the principal
/// node's agent API.
pub struct HttpMiddleware {
    log: Logger,
    client: reqwest::Client,
    base_url: String,
    connected: AtomicBool,
}

impl HttpMiddleware {
    pub fn new(log: &Logger, base_url: String) -> HttpMiddleware {
        HttpMiddleware {
            log: log.new(o!("component" => "HttpMiddleware")),
            client: reqwest::Client::new(),
            base_url,
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MiddlewareClient for HttpMiddleware {
    async fn connect(&self) -> Result<(), MiddlewareError> {
        let url = format!("{}/status", self.base_url);
        // Probe with a short bounded backoff: enough to ride out a peer
        // mid-restart, short enough that the caller's own retry cadence
        // (next maintenance cycle) stays in charge.
        let probe = || async {
            let response = self.client.get(&url).send().await.map_err(
                |err| {
                    backoff::BackoffError::transient(MiddlewareError::from(
                        err,
                    ))
                },
            )?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(backoff::BackoffError::permanent(
                    MiddlewareError::Rejected {
                        status: response.status().as_u16(),
                    },
                ))
            }
        };
        let log = self.log.clone();
        let log_failure = |error, delay| {
            debug!(log, "middleware probe failed";
                "retry_after" => ?delay, "error" => %error);
        };
        backoff::retry_notify(
            backoff::peer_service_policy_bounded(
                std::time::Duration::from_secs(10),
            ),
            probe,
            log_failure,
        )
        .await?;

        if !self.connected.swap(true, Ordering::SeqCst) {
            info!(self.log, "middleware connection established";
                "peer" => %self.base_url);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn submit_csr_batch(
        &self,
        batch: &SignBatchRequest,
    ) -> Result<(), MiddlewareError> {
        let url = format!("{}/csr-batch", self.base_url);
        let response = self.client.post(&url).json(batch).send().await?;
        if !response.status().is_success() {
            return Err(MiddlewareError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn poll_reply(
        &self,
        request_id: Uuid,
    ) -> Result<Option<SignBatchResponse>, MiddlewareError> {
        let url = format!("{}/csr-batch/{}", self.base_url, request_id);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(MiddlewareError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(Some(response.json().await?))
    }

    async fn register_routing(
        &self,
        registration: &RoutingRegistration,
    ) -> Result<(), MiddlewareError> {
        let url = format!("{}/routing", self.base_url);
        let response =
            self.client.post(&url).json(registration).send().await?;
        if !response.status().is_success() {
            return Err(MiddlewareError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(self.log, "middleware connection stopped");
        }
    }
}
