// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request and response types shared by the web API and the command channel.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_common::cluster::{Role, SecurityLevel, Specialization};

use crate::monitor::MonitorState;

/// Operator-supplied node information.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct SetNodeInfoParams {
    pub hostname: String,
}

/// Parameters of the installer's domain-validation operation.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct InitializeDomainParams {
    /// Public domain name to validate and obtain a web certificate for.
    pub domain: String,
    /// Contact handed to the certificate authority.
    #[serde(default)]
    pub contact_email: Option<String>,
}

/// Parameters of the installer's node-finalization operation.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct InitializeNodeParams {
    /// PEM certificate of the signed intermediate CA for this cluster.
    pub intermediate_cert_pem: String,
    /// PEM private key matching `intermediate_cert_pem`. Must correspond, or
    /// the operation fails without mutating any state.
    pub intermediate_key_pem: String,
    /// PEM certificate of the cluster root of trust. The cluster id is
    /// derived from its fingerprint. The root private key is never supplied;
    /// it stays with the operator.
    pub root_cert_pem: String,
    #[serde(default = "default_security_level")]
    pub security_level: SecurityLevel,
    #[serde(default = "default_specialization")]
    pub specialization: Specialization,
    /// Agent API URL of the principal node, recorded for dependent nodes.
    #[serde(default)]
    pub principal_url: Option<String>,
}

fn default_security_level() -> SecurityLevel {
    SecurityLevel::Protected
}

fn default_specialization() -> Specialization {
    Specialization::Principal
}

/// One CSR within a signing batch.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct CsrEntry {
    pub role: Role,
    pub csr_pem: String,
}

/// A dependent node's batch of outstanding CSRs, submitted to the principal
/// as one correlated request.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct SignBatchRequest {
    pub request_id: Uuid,
    pub node_id: Uuid,
    /// Hostname the issued certificates must name.
    pub hostname: String,
    pub csrs: Vec<CsrEntry>,
}

/// One issued chain within a signing reply.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct CertEntry {
    pub role: Role,
    pub chain_pem: String,
}

/// The principal's correlated reply to a [`SignBatchRequest`].
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct SignBatchResponse {
    pub request_id: Uuid,
    pub certificates: Vec<CertEntry>,
}

/// A message-routing registration relayed to the principal on behalf of a
/// locally hosted domain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RoutingRegistration {
    /// The application domain registering routes.
    pub domain: String,
    /// Routing keys the domain consumes.
    pub routes: Vec<String>,
}

/// A certificate delivered over the command channel (a dependent node's own
/// monitor certificate, signed out-of-band).
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct DeliverCertificateParams {
    pub role: Role,
    pub chain_pem: String,
}

/// Current view of the agent, served by `GET /status`.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct StatusView {
    pub state: MonitorState,
    pub node_id: Uuid,
    pub hostname: String,
    pub cluster_id: Option<String>,
}
