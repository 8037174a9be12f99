// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dependent node controller.
//!
//! A dependent node cannot self-sign. Its bootstrap runs a remote protocol
//! against the principal node: first its own monitor certificate arrives
//! out-of-band (via the command channel), then the remaining role
//! certificates are requested as one correlated CSR batch over the
//! middleware. Both phases block on the core's bounded wait and observe
//! shutdown.

use super::{BootOutcome, ControllerError, RoleController};
use crate::detector::NodeKind;
use crate::monitor::{MonitorCore, MonitorState, WaitOutcome};
use crate::params::{CsrEntry, RoutingRegistration, SignBatchRequest};
use slog::Logger;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;
use warden_common::cluster::Role;

const OWNED_ROLES: [Role; 4] =
    [Role::Monitor, Role::Messaging, Role::Datastore, Role::Web];

/// Roles a dependent node must obtain from the principal before becoming
/// operational.
const DOWNSTREAM_ROLES: [Role; 3] =
    [Role::Messaging, Role::Datastore, Role::Web];

/// How many complete submit-and-wait rounds we attempt before aborting
/// startup. The supervisor's restart loop is the escalation point.
const MAX_BATCH_ATTEMPTS: usize = 8;

/// Granularity of the reply poll within one bounded wait window.
const REPLY_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct DependentController {
    log: Logger,
    /// Registrations queued for relay to the principal; drained each
    /// maintenance cycle so a transient middleware failure just retries.
    pending_registrations: Mutex<Vec<RoutingRegistration>>,
}

impl DependentController {
    pub fn new(log: &Logger) -> DependentController {
        DependentController {
            log: log.new(o!("component" => "DependentController")),
            pending_registrations: Mutex::new(Vec::new()),
        }
    }

    /// First-boot path: no root of trust is cached yet. Emit the monitor
    /// CSR and the service passwords the operator needs, then stop.
    async fn initial_configuration(
        &self,
        core: &MonitorCore,
    ) -> Result<BootOutcome, ControllerError> {
        let certs = core.certificates();
        certs.generate_csr(Role::Monitor, false).await?;
        for role in [Role::Messaging, Role::Datastore] {
            certs.generate_csr(role, true).await?;
        }
        info!(
            self.log,
            "initial configuration emitted; provision the root certificate \
             and monitor certificate, then restart this node"
        );
        Ok(BootOutcome::StopForOperator)
    }

    /// Block until our own monitor certificate is present, polling the
    /// store on the bounded wait. The certificate arrives via the command
    /// channel (`deliver_certificate`), which wakes us.
    async fn await_own_certificate(
        &self,
        core: &MonitorCore,
    ) -> Result<Option<BootOutcome>, ControllerError> {
        core.set_state(MonitorState::AwaitingOwnCertificate);
        let certs = core.certificates();
        if certs.pending_csr(Role::Monitor).await.is_none()
            && certs.current_expiration(Role::Monitor).await?.is_none()
        {
            // Restarted with an unresolved CSR from a previous run: that
            // request is abandoned, emit a fresh one.
            certs.generate_csr(Role::Monitor, false).await?;
        }
        loop {
            if certs.current_expiration(Role::Monitor).await?.is_some() {
                return Ok(None);
            }
            info!(self.log, "waiting for signed monitor certificate");
            match core.wait(core.config().bounded_wait()).await {
                WaitOutcome::Shutdown => {
                    return Ok(Some(BootOutcome::Proceed));
                }
                WaitOutcome::Woken | WaitOutcome::TimedOut => continue,
            }
        }
    }

    /// Connect to the principal's messaging endpoint, retrying until
    /// shutdown.
    async fn connect_middleware(
        &self,
        core: &MonitorCore,
    ) -> Result<Option<BootOutcome>, ControllerError> {
        while !core.middleware().is_connected() {
            match core.middleware().connect().await {
                Ok(()) => break,
                Err(err) => {
                    info!(self.log, "principal not reachable yet";
                        "error" => %err);
                }
            }
            match core.wait(REPLY_POLL_INTERVAL).await {
                WaitOutcome::Shutdown => {
                    return Ok(Some(BootOutcome::Proceed));
                }
                WaitOutcome::Woken | WaitOutcome::TimedOut => continue,
            }
        }
        Ok(None)
    }

    /// Batch all outstanding CSRs into one signed request to the principal
    /// and wait for the correlated reply; retry the whole batch on timeout.
    async fn obtain_middleware_certificates(
        &self,
        core: &MonitorCore,
    ) -> Result<Option<BootOutcome>, ControllerError> {
        core.set_state(MonitorState::AwaitingMiddlewareCertificates);
        let certs = core.certificates();

        let mut attempts = 0;
        loop {
            let missing = certs.missing_roles(&DOWNSTREAM_ROLES).await?;
            if missing.is_empty() {
                return Ok(None);
            }
            if attempts >= MAX_BATCH_ATTEMPTS {
                return Err(ControllerError::BootstrapAborted(format!(
                    "no reply to CSR batch after {} attempts; \
                     roles still uncertified: {:?}",
                    attempts, missing,
                )));
            }
            attempts += 1;

            // Build (or reuse) a CSR per missing role. Already-certified
            // roles are excluded by construction.
            let mut entries = Vec::with_capacity(missing.len());
            for &role in &missing {
                let pending = match certs.pending_csr(role).await {
                    Some(pending) => pending,
                    None => {
                        let with_password = matches!(
                            role,
                            Role::Messaging | Role::Datastore
                        );
                        certs.generate_csr(role, with_password).await?
                    }
                };
                entries.push(CsrEntry {
                    role,
                    csr_pem: String::from_utf8_lossy(&pending.csr_pem)
                        .into_owned(),
                });
            }

            let request_id = Uuid::new_v4();
            for &role in &missing {
                certs.mark_submitted(role, request_id).await?;
            }
            let node = core.store().node_identity().await?;
            let batch = SignBatchRequest {
                request_id,
                node_id: node.node_id,
                hostname: node.hostname,
                csrs: entries,
            };
            info!(self.log, "submitting CSR batch";
                "request_id" => %request_id,
                "attempt" => attempts,
                "roles" => batch.csrs.len());
            if let Err(err) = core.middleware().submit_csr_batch(&batch).await
            {
                info!(self.log, "CSR batch submission failed";
                    "error" => %err);
                match core.wait(REPLY_POLL_INTERVAL).await {
                    WaitOutcome::Shutdown => {
                        return Ok(Some(BootOutcome::Proceed));
                    }
                    _ => continue,
                }
            }

            // Fire-and-wait: poll for the correlated reply within this
            // attempt's bounded window, then re-submit.
            let window = core.config().bounded_wait();
            let mut waited = Duration::ZERO;
            while waited < window {
                match core.middleware().poll_reply(request_id).await {
                    Ok(Some(reply)) => {
                        for entry in &reply.certificates {
                            certs
                                .adopt_certificate(
                                    entry.role,
                                    entry.chain_pem.as_bytes(),
                                )
                                .await?;
                        }
                        info!(self.log, "CSR batch resolved";
                            "request_id" => %request_id,
                            "certificates" => reply.certificates.len());
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        info!(self.log, "reply poll failed";
                            "error" => %err);
                    }
                }
                match core.wait(REPLY_POLL_INTERVAL).await {
                    WaitOutcome::Shutdown => {
                        return Ok(Some(BootOutcome::Proceed));
                    }
                    _ => waited += REPLY_POLL_INTERVAL,
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl RoleController for DependentController {
    fn kind(&self) -> NodeKind {
        NodeKind::Dependent
    }

    fn owned_roles(&self) -> &[Role] {
        &OWNED_ROLES
    }

    async fn prepare(
        &self,
        core: &MonitorCore,
    ) -> Result<BootOutcome, ControllerError> {
        let certs = core.certificates();

        // Sub-mode probe: the presence of a cached root of trust tells us
        // whether this node has ever been provisioned.
        if certs.current_expiration(Role::Root).await?.is_none() {
            return self.initial_configuration(core).await;
        }

        if let Some(outcome) = self.await_own_certificate(core).await? {
            return Ok(outcome);
        }
        if let Some(outcome) = self.connect_middleware(core).await? {
            return Ok(outcome);
        }
        if let Some(outcome) =
            self.obtain_middleware_certificates(core).await?
        {
            return Ok(outcome);
        }

        certs.load_all(&OWNED_ROLES).await?;
        Ok(BootOutcome::Proceed)
    }

    async fn maintain(
        &self,
        core: &MonitorCore,
    ) -> Result<(), ControllerError> {
        // Relay queued routing registrations; put back whatever fails so
        // the next cycle retries it.
        let queued: Vec<RoutingRegistration> = {
            let mut pending = self.pending_registrations.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for registration in queued {
            if let Err(err) =
                core.middleware().register_routing(&registration).await
            {
                info!(self.log, "registration relay failed; will retry";
                    "domain" => %registration.domain,
                    "error" => %err);
                self.pending_registrations
                    .lock()
                    .unwrap()
                    .push(registration);
            }
        }
        Ok(())
    }

    async fn relay_registration(
        &self,
        core: &MonitorCore,
        registration: RoutingRegistration,
    ) -> Result<(), ControllerError> {
        {
            let mut pending = self.pending_registrations.lock().unwrap();
            if !pending.contains(&registration) {
                pending.push(registration);
            }
        }
        // Ask for an early cycle to flush the queue.
        core.wake();
        Ok(())
    }

    async fn stop_helpers(&self, _core: &MonitorCore) {
        self.pending_registrations.lock().unwrap().clear();
    }
}
