// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Role controllers.
//!
//! All four node roles implement the same lifecycle contract with different
//! bootstrap and maintenance behavior. The shared lifecycle (maintenance
//! loop, shutdown) lives in the composed [`MonitorCore`]; a controller only
//! supplies the role-specific pieces. The detector picks the variant once
//! at startup.

use crate::detector::NodeKind;
use crate::middleware::MiddlewareError;
use crate::monitor::MonitorCore;
use crate::params::{
    DeliverCertificateParams, InitializeDomainParams, InitializeNodeParams,
    RoutingRegistration, SignBatchRequest, SignBatchResponse,
};
use crate::platform::PlatformError;
use async_trait::async_trait;
use idstore::StoreError;
use slog::Logger;
use std::sync::Arc;
use warden_common::cluster::Role;

mod dependent;
mod extension;
mod installer;
mod primary;

pub use dependent::DependentController;
pub use extension::ExtensionController;
pub use installer::InstallerController;
pub use primary::PrincipalController;

/// How a controller's bootstrap phase ended.
///
/// The restart signal is an explicit return value, not an exception: a
/// state-changing bootstrap step (finalizing a node, self-signing a new
/// root) ends the process on purpose so the next launch starts from the
/// persisted state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootOutcome {
    /// Enter the maintenance loop.
    Proceed,
    /// Exit with the restart code; the supervisor relaunches immediately.
    RestartRequested,
    /// Exit normally and wait for the operator to act before the next
    /// launch (a dependent node that just emitted its initial CSRs).
    StopForOperator,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("operation {0} is not supported by this node's role")]
    UnsupportedOperation(&'static str),

    #[error("bootstrap aborted: {0}")]
    BootstrapAborted(String),

    #[error("domain validation failed: {0}")]
    DomainValidation(String),

    #[error(transparent)]
    Certificates(#[from] warden_certificates::manager::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Middleware(#[from] MiddlewareError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("I/O error accessing {path}")]
    Io {
        path: camino::Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

impl ControllerError {
    /// Whether this error is the mismatch precondition failure of
    /// `initialize_node` (mapped to a client error on the API).
    pub fn is_key_cert_mismatch(&self) -> bool {
        matches!(
            self,
            ControllerError::Certificates(
                warden_certificates::manager::Error::Validation(
                    warden_certificates::CertificateError::KeyCertMismatch
                )
            )
        )
    }
}

/// The lifecycle contract every role controller implements.
///
/// `prepare` runs once at startup (certificates, cluster/workload setup,
/// any blocking bootstrap phases); `maintain` runs every maintenance cycle
/// while operational. The externally triggered operations default to
/// "unsupported" so each variant only implements what its role offers.
#[async_trait]
pub trait RoleController: Send + Sync {
    fn kind(&self) -> NodeKind;

    /// Certificate roles this node is responsible for keeping valid.
    fn owned_roles(&self) -> &[Role];

    async fn prepare(
        &self,
        core: &MonitorCore,
    ) -> Result<BootOutcome, ControllerError>;

    async fn maintain(&self, core: &MonitorCore)
        -> Result<(), ControllerError>;

    /// Drive domain validation against the external certificate authority
    /// (installer only).
    async fn initialize_domain(
        &self,
        _core: &MonitorCore,
        _params: InitializeDomainParams,
    ) -> Result<(), ControllerError> {
        Err(ControllerError::UnsupportedOperation("initialize_domain"))
    }

    /// Finalize cluster bootstrap from operator-supplied authority material
    /// (installer only).
    async fn initialize_node(
        &self,
        _core: &MonitorCore,
        _params: InitializeNodeParams,
    ) -> Result<(), ControllerError> {
        Err(ControllerError::UnsupportedOperation("initialize_node"))
    }

    /// Sign a dependent node's CSR batch (principal only).
    async fn sign_csr_batch(
        &self,
        _core: &MonitorCore,
        _request: SignBatchRequest,
    ) -> Result<SignBatchResponse, ControllerError> {
        Err(ControllerError::UnsupportedOperation("sign_csr_batch"))
    }

    /// Accept a certificate signed out-of-band for one of our roles,
    /// delivered over the command channel.
    async fn deliver_certificate(
        &self,
        core: &MonitorCore,
        params: DeliverCertificateParams,
    ) -> Result<(), ControllerError> {
        core.certificates()
            .adopt_certificate(params.role, params.chain_pem.as_bytes())
            .await?;
        // Whoever is blocked waiting for this certificate polls on wake.
        core.wake();
        Ok(())
    }

    /// Queue a message-routing registration for relay to the principal
    /// (dependent only).
    async fn relay_registration(
        &self,
        _core: &MonitorCore,
        _registration: RoutingRegistration,
    ) -> Result<(), ControllerError> {
        Err(ControllerError::UnsupportedOperation("relay_registration"))
    }

    /// Accept a relayed registration (principal only).
    async fn accept_registration(
        &self,
        _core: &MonitorCore,
        _registration: RoutingRegistration,
    ) -> Result<(), ControllerError> {
        Err(ControllerError::UnsupportedOperation("accept_registration"))
    }

    /// Stop any controller-owned helper tasks. Part of the shutdown
    /// discipline; must not fail the other release steps.
    async fn stop_helpers(&self, _core: &MonitorCore) {}
}

/// Construct the controller for a detected node kind.
pub fn controller_for(
    kind: NodeKind,
    log: &Logger,
) -> Arc<dyn RoleController> {
    match kind {
        NodeKind::Installer => Arc::new(InstallerController::new(log)),
        NodeKind::Principal => Arc::new(PrincipalController::new(log)),
        NodeKind::Dependent => Arc::new(DependentController::new(log)),
        NodeKind::Extension => Arc::new(ExtensionController::new(log)),
    }
}
