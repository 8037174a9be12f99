// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The principal node controller: owner of the cluster's certificate-signing
//! authority.

use super::{BootOutcome, ControllerError, RoleController};
use crate::detector::NodeKind;
use crate::monitor::MonitorCore;
use crate::params::{
    CertEntry, RoutingRegistration, SignBatchRequest, SignBatchResponse,
};
use slog::Logger;
use std::sync::Mutex;
use warden_common::cluster::{
    ClusterConfig, Role, SecurityLevel, Specialization,
};

const OWNED_ROLES: [Role; 5] = [
    Role::Intermediate,
    Role::Monitor,
    Role::Messaging,
    Role::Datastore,
    Role::Web,
];

pub struct PrincipalController {
    log: Logger,
    /// Registrations relayed by dependent nodes. Handing them to the broker
    /// is the provisioning collaborator's job; we are the cluster-side
    /// rendezvous.
    registrations: Mutex<Vec<RoutingRegistration>>,
}

impl PrincipalController {
    pub fn new(log: &Logger) -> PrincipalController {
        PrincipalController {
            log: log.new(o!("component" => "PrincipalController")),
            registrations: Mutex::new(Vec::new()),
        }
    }

    pub fn registrations(&self) -> Vec<RoutingRegistration> {
        self.registrations.lock().unwrap().clone()
    }
}

/// Startup for a node that authors its own certificates. Shared by the
/// principal and extension controllers; `owned` differs.
pub(super) async fn prepare_self_authoring(
    log: &Logger,
    core: &MonitorCore,
    owned: &[Role],
) -> Result<BootOutcome, ControllerError> {
    let certs = core.certificates();

    // Brand-new cluster: establish the root of trust, then restart so the
    // next launch finds a fully persisted identity.
    if certs.current_expiration(Role::Root).await?.is_none() {
        info!(log, "no root of trust found; bootstrapping a new cluster");
        let root = certs.bootstrap_root().await?;
        let cluster_id =
            warden_certificates::manager::fingerprint(&root.chain_pem)?;
        let mut config = match core.store().cluster_config().await {
            Ok(config) => config,
            Err(err) if err.is_not_found() => ClusterConfig {
                cluster_id: None,
                security_level: SecurityLevel::Protected,
                specialization: Specialization::Principal,
                principal_url: None,
            },
            Err(err) => return Err(err.into()),
        };
        config.cluster_id = Some(cluster_id);
        core.store().put_cluster_config(&config).await?;
        return Ok(BootOutcome::RestartRequested);
    }

    // The intermediate is the working signing authority; the root key only
    // ever signs it.
    if !certs.missing_roles(&[Role::Intermediate]).await?.is_empty() {
        let root = certs.signing_authority(Role::Root).await?;
        let pending = certs.generate_csr(Role::Intermediate, false).await?;
        let artifact =
            certs.sign_csr(Role::Intermediate, &pending.csr_pem, &root)?;
        certs.store_certificate(&artifact).await?;
        info!(log, "issued intermediate signing certificate");
    }

    certs.scan_and_renew(owned, core.config().renewal_horizon()).await?;
    certs.load_all(owned).await?;
    Ok(BootOutcome::Proceed)
}

/// Per-cycle upkeep for a self-authoring node.
pub(super) async fn maintain_self_authoring(
    log: &Logger,
    core: &MonitorCore,
    owned: &[Role],
) -> Result<(), ControllerError> {
    let renewed = core
        .certificates()
        .scan_and_renew(owned, core.config().renewal_horizon())
        .await?;
    if !renewed.is_empty() {
        info!(log, "renewed certificates";
            "roles" => ?renewed.iter().map(|r| r.as_str()).collect::<Vec<_>>());
        core.certificates().load_all(owned).await?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl RoleController for PrincipalController {
    fn kind(&self) -> NodeKind {
        NodeKind::Principal
    }

    fn owned_roles(&self) -> &[Role] {
        &OWNED_ROLES
    }

    async fn prepare(
        &self,
        core: &MonitorCore,
    ) -> Result<BootOutcome, ControllerError> {
        prepare_self_authoring(&self.log, core, &OWNED_ROLES).await
    }

    async fn maintain(
        &self,
        core: &MonitorCore,
    ) -> Result<(), ControllerError> {
        maintain_self_authoring(&self.log, core, &OWNED_ROLES).await
    }

    async fn sign_csr_batch(
        &self,
        core: &MonitorCore,
        request: SignBatchRequest,
    ) -> Result<SignBatchResponse, ControllerError> {
        let certs = core.certificates();
        let authority = certs.signing_authority(Role::Intermediate).await?;
        let mut certificates = Vec::with_capacity(request.csrs.len());
        for entry in &request.csrs {
            let artifact = certs.sign_csr_for_host(
                entry.role,
                entry.csr_pem.as_bytes(),
                &authority,
                &request.hostname,
            )?;
            certificates.push(CertEntry {
                role: entry.role,
                chain_pem: String::from_utf8_lossy(&artifact.chain_pem)
                    .into_owned(),
            });
        }
        info!(self.log, "signed CSR batch";
            "request_id" => %request.request_id,
            "node_id" => %request.node_id,
            "roles" => request.csrs.len());
        Ok(SignBatchResponse {
            request_id: request.request_id,
            certificates,
        })
    }

    async fn accept_registration(
        &self,
        _core: &MonitorCore,
        registration: RoutingRegistration,
    ) -> Result<(), ControllerError> {
        info!(self.log, "accepted routing registration";
            "domain" => %registration.domain,
            "routes" => registration.routes.len());
        let mut registrations = self.registrations.lock().unwrap();
        if !registrations.contains(&registration) {
            registrations.push(registration);
        }
        Ok(())
    }
}
