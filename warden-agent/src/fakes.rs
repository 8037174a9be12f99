// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fake collaborators for tests.

use crate::config::Config;
use crate::detector::NodeKind;
use crate::middleware::{MiddlewareClient, MiddlewareError};
use crate::monitor::MonitorCore;
use crate::params::{RoutingRegistration, SignBatchRequest, SignBatchResponse};
use crate::platform::{OrchestrationClient, PlatformError};
use crate::roles::{BootOutcome, ControllerError, RoleController};
use async_trait::async_trait;
use idstore::{IdentityStore, MemoryStore, WorkloadService};
use slog::{Drain, Logger};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;
use warden_certificates::CertificateManager;
use warden_common::cluster::Role;

pub fn test_log() -> Logger {
    Logger::root(slog::Discard.fuse(), o!())
}

pub fn test_config() -> Config {
    toml::from_str(
        r#"
        maintenance_interval_secs = 1
        # Keep the back-pressure check out of the way on busy test hosts.
        max_load = 1000.0
        [log]
        mode = "stderr-terminal"
        level = "error"
        "#,
    )
    .unwrap()
}

/// A core over a fresh in-memory store and fake collaborators.
pub fn test_core() -> MonitorCore {
    test_core_parts(
        Arc::new(MemoryStore::new()),
        Arc::new(FakeOrchestration::default()),
        Arc::new(FakeMiddleware::default()),
    )
    .0
}

/// Build a core around explicit store and fakes; also returns the
/// certificate manager backing it.
pub fn test_core_parts(
    store: Arc<dyn IdentityStore>,
    platform: Arc<dyn OrchestrationClient>,
    middleware: Arc<dyn MiddlewareClient>,
) -> (MonitorCore, Arc<CertificateManager>) {
    let log = test_log();
    let staging = camino_tempfile::tempdir().unwrap().into_path();
    let certificates = Arc::new(CertificateManager::new(
        &log,
        Arc::clone(&store),
        staging,
        "node1.cluster.internal".to_string(),
        false,
    ));
    let core = MonitorCore::new(
        &log,
        Arc::new(test_config()),
        store,
        Arc::clone(&certificates),
        platform,
        middleware,
    );
    (core, certificates)
}

/// A scratch manager over its own store, for fabricating authority material
/// in tests (plays the part of the principal or the operator).
pub fn scratch_manager() -> (Arc<MemoryStore>, CertificateManager) {
    let store = Arc::new(MemoryStore::new());
    let manager = CertificateManager::new(
        &test_log(),
        Arc::clone(&store) as Arc<dyn IdentityStore>,
        camino_tempfile::tempdir().unwrap().into_path(),
        "principal.cluster.internal".to_string(),
        false,
    );
    (store, manager)
}

#[derive(Default)]
pub struct FakeOrchestration {
    pub ensured: Mutex<Vec<String>>,
    pub closed: AtomicBool,
}

#[async_trait]
impl OrchestrationClient for FakeOrchestration {
    async fn ensure_service(
        &self,
        service: &WorkloadService,
    ) -> Result<(), PlatformError> {
        self.ensured.lock().unwrap().push(service.name.clone());
        Ok(())
    }

    async fn wait_event(
        &self,
        timeout: Duration,
    ) -> Result<bool, PlatformError> {
        tokio::time::sleep(timeout).await;
        Ok(false)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

type OnSubmit =
    Box<dyn Fn(&SignBatchRequest) -> Option<SignBatchResponse> + Send + Sync>;

#[derive(Default)]
pub struct FakeMiddleware {
    pub connected: AtomicBool,
    pub fail_connect: AtomicBool,
    pub submitted: Mutex<Vec<SignBatchRequest>>,
    pub replies: Mutex<HashMap<Uuid, SignBatchResponse>>,
    pub registrations: Mutex<Vec<RoutingRegistration>>,
    pub closed: AtomicBool,
    /// When set, a submitted batch is answered immediately (the signer is
    /// prompt in tests; the polling path is still exercised).
    pub on_submit: Mutex<Option<OnSubmit>>,
}

#[async_trait]
impl MiddlewareClient for FakeMiddleware {
    async fn connect(&self) -> Result<(), MiddlewareError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(MiddlewareError::Transient(
                "injected connect failure".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn submit_csr_batch(
        &self,
        batch: &SignBatchRequest,
    ) -> Result<(), MiddlewareError> {
        self.submitted.lock().unwrap().push(batch.clone());
        if let Some(on_submit) = &*self.on_submit.lock().unwrap() {
            if let Some(response) = on_submit(batch) {
                self.replies
                    .lock()
                    .unwrap()
                    .insert(batch.request_id, response);
            }
        }
        Ok(())
    }

    async fn poll_reply(
        &self,
        request_id: Uuid,
    ) -> Result<Option<SignBatchResponse>, MiddlewareError> {
        Ok(self.replies.lock().unwrap().get(&request_id).cloned())
    }

    async fn register_routing(
        &self,
        registration: &RoutingRegistration,
    ) -> Result<(), MiddlewareError> {
        self.registrations.lock().unwrap().push(registration.clone());
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A controller that counts maintenance cycles and can shut the core down
/// after a given number of them.
pub struct CountingController {
    pub maintain_calls: AtomicUsize,
    pub shutdown_after: Option<usize>,
}

impl CountingController {
    pub fn new(shutdown_after: Option<usize>) -> CountingController {
        CountingController {
            maintain_calls: AtomicUsize::new(0),
            shutdown_after,
        }
    }
}

#[async_trait]
impl RoleController for CountingController {
    fn kind(&self) -> NodeKind {
        NodeKind::Principal
    }

    fn owned_roles(&self) -> &[Role] {
        &[]
    }

    async fn prepare(
        &self,
        _core: &MonitorCore,
    ) -> Result<BootOutcome, ControllerError> {
        Ok(BootOutcome::Proceed)
    }

    async fn maintain(
        &self,
        core: &MonitorCore,
    ) -> Result<(), ControllerError> {
        let calls = self.maintain_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.shutdown_after {
            if calls >= limit {
                core.trigger_shutdown();
            }
        }
        Ok(())
    }
}
