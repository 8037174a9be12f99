// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The installer controller: bootstrap mode.
//!
//! A node with no cluster configuration starts here. The installer prepares
//! everything an operator needs to finalize the node — a temporary
//! self-signed web certificate, the intermediate-CA CSR, its own monitor
//! CSR — and then waits. The two externally triggered operations
//! (`initialize_domain`, `initialize_node`) arrive over the command channel
//! or the web API.

use super::{BootOutcome, ControllerError, RoleController};
use crate::detector::NodeKind;
use crate::monitor::{MonitorCore, WaitOutcome};
use crate::params::{InitializeDomainParams, InitializeNodeParams};
use camino::Utf8Path;
use serde::Deserialize;
use slog::Logger;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use warden_certificates::manager::SigningAuthority;
use warden_common::cluster::{ClusterConfig, Role};

const OWNED_ROLES: [Role; 1] = [Role::Monitor];

/// How long each poll of the certificate authority's order status waits,
/// and how many polls we make before giving up on a validation.
const ORDER_POLL_INTERVAL: std::time::Duration =
    std::time::Duration::from_secs(5);
const ORDER_POLL_ATTEMPTS: usize = 24;

pub struct InstallerController {
    log: Logger,
}

impl InstallerController {
    pub fn new(log: &Logger) -> InstallerController {
        InstallerController {
            log: log.new(o!("component" => "InstallerController")),
        }
    }

    // The fronting web proxy needs some certificate before the cluster has
    // a real one; a throwaway self-signed cert unblocks it.
    fn ensure_temporary_web_certificate(
        &self,
        core: &MonitorCore,
    ) -> Result<(), ControllerError> {
        let data_dir = &core.config().data_dir;
        let cert_path = data_dir.join("web-selfsigned.cert.pem");
        let key_path = data_dir.join("web-selfsigned.key.pem");
        if cert_path.exists() && key_path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(data_dir).map_err(|err| {
            ControllerError::Io { path: data_dir.clone(), err }
        })?;

        let hostname = core.config().hostname();
        let cert = rcgen::generate_simple_self_signed(vec![hostname])
            .map_err(|err| {
                ControllerError::DomainValidation(format!(
                    "generating self-signed certificate: {}",
                    err
                ))
            })?;
        let cert_pem = cert.serialize_pem().map_err(|err| {
            ControllerError::DomainValidation(format!(
                "serializing self-signed certificate: {}",
                err
            ))
        })?;
        write_private_file(&cert_path, cert_pem.as_bytes())?;
        write_private_file(
            &key_path,
            cert.serialize_private_key_pem().as_bytes(),
        )?;
        info!(self.log, "wrote temporary self-signed web certificate";
            "path" => %cert_path);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RoleController for InstallerController {
    fn kind(&self) -> NodeKind {
        NodeKind::Installer
    }

    fn owned_roles(&self) -> &[Role] {
        &OWNED_ROLES
    }

    async fn prepare(
        &self,
        core: &MonitorCore,
    ) -> Result<BootOutcome, ControllerError> {
        let certs = core.certificates();
        self.ensure_temporary_web_certificate(core)?;

        // Emit the CSRs the operator (or a remote signer) will resolve. A
        // CSR left over from a previous run was superseded by our restart;
        // generate fresh ones.
        certs.generate_csr(Role::Intermediate, false).await?;
        certs.generate_csr(Role::Monitor, false).await?;
        info!(
            self.log,
            "installer ready; waiting for initialize-node from the operator"
        );

        loop {
            if core.restart_requested() {
                return Ok(BootOutcome::RestartRequested);
            }
            match core.wait(core.config().bounded_wait()).await {
                WaitOutcome::Shutdown => return Ok(BootOutcome::Proceed),
                WaitOutcome::Woken | WaitOutcome::TimedOut => continue,
            }
        }
    }

    async fn maintain(
        &self,
        _core: &MonitorCore,
    ) -> Result<(), ControllerError> {
        // The installer exits for relaunch before ever reaching the
        // maintenance loop.
        Ok(())
    }

    async fn initialize_domain(
        &self,
        core: &MonitorCore,
        params: InitializeDomainParams,
    ) -> Result<(), ControllerError> {
        let Some(ca_url) = &core.config().certificate_authority_url else {
            return Err(ControllerError::DomainValidation(
                "no certificate authority configured".to_string(),
            ));
        };
        let fail = |context: &str, err: reqwest::Error| {
            ControllerError::DomainValidation(format!("{}: {}", context, err))
        };
        let client = reqwest::Client::new();

        // Open an order for the domain.
        let order: OrderResponse = client
            .post(format!("{}/order", ca_url))
            .json(&serde_json::json!({
                "domain": &params.domain,
                "contact": &params.contact_email,
            }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| fail("opening order", err))?
            .json()
            .await
            .map_err(|err| fail("reading order", err))?;
        info!(self.log, "opened certificate order";
            "domain" => %params.domain, "order_id" => %order.order_id);

        // Publish the challenge under the webroot, where the authority's
        // validator will fetch it over plain HTTP.
        let challenge_dir =
            core.config().webroot.join(".well-known/acme-challenge");
        std::fs::create_dir_all(&challenge_dir).map_err(|err| {
            ControllerError::Io { path: challenge_dir.clone(), err }
        })?;
        let token_path = challenge_dir.join(&order.token);
        std::fs::write(&token_path, &order.key_authorization).map_err(
            |err| ControllerError::Io { path: token_path.clone(), err },
        )?;

        let outcome = self
            .finish_order(core, &client, ca_url, &order, &params.domain)
            .await;

        // The token has served its purpose either way.
        if let Err(err) = std::fs::remove_file(&token_path) {
            debug!(self.log, "failed to remove challenge token";
                "path" => %token_path, "error" => %err);
        }
        outcome
    }

    async fn initialize_node(
        &self,
        core: &MonitorCore,
        params: InitializeNodeParams,
    ) -> Result<(), ControllerError> {
        let certs = core.certificates();

        // Hard precondition: the supplied intermediate private key and
        // certificate must form a matching pair. Checked before anything is
        // persisted, so a mismatch mutates no state.
        certs.validator().validate(
            params.intermediate_cert_pem.as_bytes(),
            params.intermediate_key_pem.as_bytes(),
            None,
        )
        .map_err(warden_certificates::manager::Error::Validation)?;

        // The cluster id is the fingerprint of the root of trust.
        let cluster_id = warden_certificates::manager::fingerprint(
            params.root_cert_pem.as_bytes(),
        )?;

        let mut intermediate_chain =
            params.intermediate_cert_pem.clone().into_bytes();
        intermediate_chain.extend_from_slice(params.root_cert_pem.as_bytes());
        let authority = SigningAuthority::from_pem(
            Role::Intermediate,
            &intermediate_chain,
            params.intermediate_key_pem.as_bytes(),
        )?;

        // Sign our own pending monitor CSR with the now-available
        // intermediate key.
        let pending = match certs.pending_csr(Role::Monitor).await {
            Some(pending) => pending,
            None => certs.generate_csr(Role::Monitor, false).await?,
        };
        let monitor_cert =
            certs.sign_csr(Role::Monitor, &pending.csr_pem, &authority)?;

        // Persist everything: the root of trust (public half only — its key
        // stays with the operator), the intermediate pair, our own
        // certificate, and the finalized cluster configuration.
        certs
            .store_trust_anchor(Role::Root, params.root_cert_pem.as_bytes())
            .await?;
        certs
            .store_external_bundle(
                Role::Intermediate,
                &intermediate_chain,
                params.intermediate_key_pem.as_bytes(),
            )
            .await?;
        certs.store_certificate(&monitor_cert).await?;

        let config = ClusterConfig {
            cluster_id: Some(cluster_id.clone()),
            security_level: params.security_level,
            specialization: params.specialization,
            principal_url: params.principal_url,
        };
        core.store().put_cluster_config(&config).await?;

        info!(self.log, "node finalized; requesting restart";
            "cluster_id" => cluster_id);
        core.request_restart();
        Ok(())
    }
}

impl InstallerController {
    async fn finish_order(
        &self,
        core: &MonitorCore,
        client: &reqwest::Client,
        ca_url: &str,
        order: &OrderResponse,
        domain: &str,
    ) -> Result<(), ControllerError> {
        let fail = |context: &str, err: reqwest::Error| {
            ControllerError::DomainValidation(format!("{}: {}", context, err))
        };

        // Tell the authority the challenge is in place, then poll for the
        // verdict on a bounded schedule.
        client
            .post(format!("{}/order/{}/ready", ca_url, order.order_id))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| fail("confirming readiness", err))?;

        let mut attempts = 0;
        let status = loop {
            attempts += 1;
            let status: OrderStatus = client
                .get(format!("{}/order/{}", ca_url, order.order_id))
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|err| fail("polling order", err))?
                .json()
                .await
                .map_err(|err| fail("reading order status", err))?;
            if status.status == "valid" {
                break status;
            }
            match status.status.as_str() {
                "pending" | "processing" if attempts < ORDER_POLL_ATTEMPTS => {
                    if core.wait(ORDER_POLL_INTERVAL).await
                        == WaitOutcome::Shutdown
                    {
                        return Err(ControllerError::DomainValidation(
                            "shutdown during validation".to_string(),
                        ));
                    }
                }
                other => {
                    return Err(ControllerError::DomainValidation(format!(
                        "order ended in state {:?}",
                        other
                    )));
                }
            }
        };

        let (chain_pem, key_pem) = match (
            status.certificate_pem,
            status.private_key_pem,
        ) {
            (Some(chain), Some(key)) => (chain, key),
            _ => {
                return Err(ControllerError::DomainValidation(
                    "order valid but no bundle returned".to_string(),
                ));
            }
        };

        // The bundle must be coherent and actually name the domain.
        core.certificates()
            .validator()
            .validate(chain_pem.as_bytes(), key_pem.as_bytes(), Some(domain))
            .map_err(warden_certificates::manager::Error::Validation)?;
        core.certificates()
            .store_external_bundle(
                Role::Web,
                chain_pem.as_bytes(),
                key_pem.as_bytes(),
            )
            .await?;
        info!(self.log, "stored domain certificate"; "domain" => domain);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order_id: String,
    token: String,
    key_authorization: String,
}

#[derive(Debug, Deserialize)]
struct OrderStatus {
    status: String,
    #[serde(default)]
    certificate_pem: Option<String>,
    #[serde(default)]
    private_key_pem: Option<String>,
}

// The file should be readable and writable by the user only.
fn write_private_file(
    path: &Utf8Path,
    contents: &[u8],
) -> Result<(), ControllerError> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|err| ControllerError::Io { path: path.to_owned(), err })?;
    file.write_all(contents)
        .map_err(|err| ControllerError::Io { path: path.to_owned(), err })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{
        scratch_manager, test_core_parts, FakeMiddleware, FakeOrchestration,
    };
    use idstore::{ArtifactKind, IdentityStore, MemoryStore, PKI_PREFIX};
    use std::sync::Arc;
    use warden_common::cluster::{SecurityLevel, Specialization};

    // Fabricate the material an operator would supply: a root of trust and
    // an intermediate signed by it.
    async fn operator_material() -> (String, String, String) {
        let (store, manager) = scratch_manager();
        let root = manager.bootstrap_root().await.unwrap();
        let root_pem = String::from_utf8(root.chain_pem).unwrap();

        let authority = manager.signing_authority(Role::Root).await.unwrap();
        let pending =
            manager.generate_csr(Role::Intermediate, false).await.unwrap();
        let artifact = manager
            .sign_csr(Role::Intermediate, &pending.csr_pem, &authority)
            .unwrap();
        // The issued chain is "intermediate + root"; peel the root back off
        // to get the bare intermediate certificate.
        let chain = String::from_utf8(artifact.chain_pem.clone()).unwrap();
        let intermediate_pem =
            chain.strip_suffix(&root_pem).expect("chain ends in root");
        manager.store_certificate(&artifact).await.unwrap();
        let intermediate_key = store
            .current_artifact(
                PKI_PREFIX,
                Role::Intermediate,
                ArtifactKind::Key,
            )
            .await
            .unwrap();

        (
            root_pem.clone(),
            intermediate_pem.to_string(),
            String::from_utf8(intermediate_key.bytes).unwrap(),
        )
    }

    fn params(
        root_pem: String,
        intermediate_cert_pem: String,
        intermediate_key_pem: String,
    ) -> InitializeNodeParams {
        InitializeNodeParams {
            intermediate_cert_pem,
            intermediate_key_pem,
            root_cert_pem: root_pem,
            security_level: SecurityLevel::Protected,
            specialization: Specialization::Principal,
            principal_url: None,
        }
    }

    #[tokio::test]
    async fn initialize_node_rejects_mismatched_key_and_persists_nothing() {
        let (root_pem, intermediate_pem, _) = operator_material().await;
        // A private key that does not correspond to the certificate.
        let (_, other) = scratch_manager();
        let foreign =
            other.generate_csr(Role::Intermediate, false).await.unwrap();

        let store = Arc::new(MemoryStore::new());
        let (core, _) = test_core_parts(
            store.clone(),
            Arc::new(FakeOrchestration::default()),
            Arc::new(FakeMiddleware::default()),
        );
        let controller = InstallerController::new(core.log());

        let err = controller
            .initialize_node(
                &core,
                params(
                    root_pem,
                    intermediate_pem,
                    String::from_utf8(foreign.key_pem).unwrap(),
                ),
            )
            .await
            .unwrap_err();
        assert!(err.is_key_cert_mismatch(), "got {:?}", err);

        // Nothing was persisted and no restart was raised.
        assert!(store.cluster_config().await.unwrap_err().is_not_found());
        assert!(store.list_keys(PKI_PREFIX).await.unwrap().is_empty());
        assert!(!core.restart_requested());
    }

    #[tokio::test]
    async fn initialize_node_finalizes_the_cluster_and_requests_restart() {
        let (root_pem, intermediate_pem, intermediate_key) =
            operator_material().await;

        let store = Arc::new(MemoryStore::new());
        let (core, certs) = test_core_parts(
            store.clone(),
            Arc::new(FakeOrchestration::default()),
            Arc::new(FakeMiddleware::default()),
        );
        let controller = InstallerController::new(core.log());

        controller
            .initialize_node(
                &core,
                params(root_pem.clone(), intermediate_pem, intermediate_key),
            )
            .await
            .unwrap();

        // The cluster identity derives from the root fingerprint.
        let config = store.cluster_config().await.unwrap();
        assert_eq!(
            config.cluster_id.unwrap(),
            warden_certificates::manager::fingerprint(root_pem.as_bytes())
                .unwrap()
        );

        // Our monitor certificate was signed with the supplied intermediate
        // key, and its spent CSR is gone.
        assert!(certs
            .current_expiration(Role::Monitor)
            .await
            .unwrap()
            .is_some());
        let keys = store.list_keys(PKI_PREFIX).await.unwrap();
        assert!(!keys
            .iter()
            .any(|k| k.role == Role::Monitor && k.kind == ArtifactKind::Csr));

        assert!(core.restart_requested());
    }
}
