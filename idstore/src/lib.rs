// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client interface to the cluster-wide identity store.
//!
//! The identity store holds labeled, timestamped artifacts (certificates,
//! keys, passwords), the cluster configuration object, this node's identity
//! record, and the declared workload set. Artifacts are addressed by a
//! dotted key convention:
//!
//! ```text
//! <prefix>.<role>.<kind>.<timestampOrNone>
//! pki.monitor.cert.20260807213000
//! ```
//!
//! Multiple dated versions of an artifact may coexist; the most recent
//! timestamp is authoritative. Artifacts are never mutated in place — a
//! renewal writes a new dated key and the old one is superseded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use warden_common::cluster::{ClusterConfig, NodeIdentity, Role};

mod directory;
mod memory;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;

/// Key prefix for PKI material (certs, keys, CSRs).
pub const PKI_PREFIX: &str = "pki";

/// Key prefix for generated service passwords.
pub const SECRETS_PREFIX: &str = "secrets";

/// Timestamp suffix format; lexicographic order is chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no such key: {key}")]
    NotFound { key: String },

    #[error("stored object under {key} is corrupt: {message}")]
    Corrupt { key: String, message: String },

    #[error("malformed artifact key {0:?}")]
    BadKey(String),

    #[error("I/O error accessing {path}: {err}")]
    Io {
        path: camino::Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("identity store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// The kind of payload stored under an artifact key.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Cert,
    Key,
    Csr,
    Password,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Cert => "cert",
            ArtifactKind::Key => "key",
            ArtifactKind::Csr => "csr",
            ArtifactKind::Password => "password",
        }
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cert" => Ok(ArtifactKind::Cert),
            "key" => Ok(ArtifactKind::Key),
            "csr" => Ok(ArtifactKind::Csr),
            "password" => Ok(ArtifactKind::Password),
            other => Err(format!("unknown artifact kind {:?}", other)),
        }
    }
}

/// A parsed artifact key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactKey {
    pub prefix: String,
    pub role: Role,
    pub kind: ArtifactKind,
    /// Creation timestamp rendered with [`TIMESTAMP_FORMAT`], or `None` for
    /// unversioned artifacts (pending CSRs).
    pub timestamp: Option<String>,
}

impl ArtifactKey {
    /// An unversioned key (serialized with a literal `none` suffix).
    pub fn unversioned(prefix: &str, role: Role, kind: ArtifactKind) -> Self {
        ArtifactKey {
            prefix: prefix.to_string(),
            role,
            kind,
            timestamp: None,
        }
    }

    /// A dated key whose version suffix is `created`.
    pub fn stamped(
        prefix: &str,
        role: Role,
        kind: ArtifactKind,
        created: DateTime<Utc>,
    ) -> Self {
        ArtifactKey {
            prefix: prefix.to_string(),
            role,
            kind,
            timestamp: Some(created.format(TIMESTAMP_FORMAT).to_string()),
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        let mut parts = s.split('.');
        let (prefix, role, kind, timestamp) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(p), Some(r), Some(k), Some(t), None) => (p, r, k, t),
            _ => return Err(StoreError::BadKey(s.to_string())),
        };
        let role =
            role.parse().map_err(|_| StoreError::BadKey(s.to_string()))?;
        let kind =
            kind.parse().map_err(|_| StoreError::BadKey(s.to_string()))?;
        let timestamp = match timestamp {
            "none" => None,
            t => Some(t.to_string()),
        };
        Ok(ArtifactKey { prefix: prefix.to_string(), role, kind, timestamp })
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.prefix,
            self.role,
            self.kind.as_str(),
            self.timestamp.as_deref().unwrap_or("none"),
        )
    }
}

/// An artifact as fetched from the store.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub key: ArtifactKey,
    pub bytes: Vec<u8>,
}

/// A declared workload service the monitor must keep running on this node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct WorkloadService {
    pub name: String,
    pub image: String,
}

/// Read/write access to the identity store.
///
/// "Not found" is a designed signal for several callers (the node-type
/// detector boots in installer mode on a missing cluster configuration), so
/// implementations must report it via [`StoreError::NotFound`] and reserve
/// the other variants for real failures.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn cluster_config(&self) -> Result<ClusterConfig, StoreError>;
    async fn put_cluster_config(
        &self,
        config: &ClusterConfig,
    ) -> Result<(), StoreError>;

    async fn node_identity(&self) -> Result<NodeIdentity, StoreError>;
    async fn put_node_identity(
        &self,
        node: &NodeIdentity,
    ) -> Result<(), StoreError>;

    async fn put_artifact(
        &self,
        key: &ArtifactKey,
        bytes: &[u8],
    ) -> Result<(), StoreError>;

    /// Fetch the authoritative (most recent) artifact for a role and kind.
    async fn current_artifact(
        &self,
        prefix: &str,
        role: Role,
        kind: ArtifactKind,
    ) -> Result<Artifact, StoreError>;

    /// List all keys under a prefix, sorted ascending.
    async fn list_keys(
        &self,
        prefix: &str,
    ) -> Result<Vec<ArtifactKey>, StoreError>;

    async fn delete_artifact(&self, key: &ArtifactKey)
        -> Result<(), StoreError>;

    /// Delete every version of an artifact. Deleting nothing is not an
    /// error; this is how spent CSR keys are retired.
    async fn delete_all(
        &self,
        prefix: &str,
        role: Role,
        kind: ArtifactKind,
    ) -> Result<(), StoreError>;

    async fn workloads(&self) -> Result<Vec<WorkloadService>, StoreError>;
}

/// Pick the authoritative key out of `keys`: the highest timestamp for the
/// given role and kind, preferring any dated version over an undated one.
pub fn current_key(
    keys: &[ArtifactKey],
    role: Role,
    kind: ArtifactKind,
) -> Option<&ArtifactKey> {
    keys.iter()
        .filter(|k| k.role == role && k.kind == kind)
        .max_by(|a, b| a.timestamp.cmp(&b.timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trip() {
        for raw in [
            "pki.monitor.cert.20260807213000",
            "pki.intermediate.csr.none",
            "secrets.messaging.password.20250101000000",
        ] {
            let key = ArtifactKey::parse(raw).unwrap();
            assert_eq!(key.to_string(), raw);
        }
    }

    #[test]
    fn key_rejects_garbage() {
        for raw in [
            "",
            "pki.monitor.cert",
            "pki.monitor.cert.1.2",
            "pki.nexus.cert.none",
            "pki.monitor.blob.none",
        ] {
            assert!(
                ArtifactKey::parse(raw).is_err(),
                "{:?} unexpectedly parsed",
                raw
            );
        }
    }

    #[test]
    fn current_key_prefers_latest_timestamp() {
        let keys = vec![
            ArtifactKey::parse("pki.monitor.cert.20240101000000").unwrap(),
            ArtifactKey::parse("pki.monitor.cert.20260807213000").unwrap(),
            ArtifactKey::parse("pki.monitor.cert.none").unwrap(),
            ArtifactKey::parse("pki.monitor.key.20270101000000").unwrap(),
            ArtifactKey::parse("pki.web.cert.20270101000000").unwrap(),
        ];
        let current =
            current_key(&keys, Role::Monitor, ArtifactKind::Cert).unwrap();
        assert_eq!(
            current.timestamp.as_deref(),
            Some("20260807213000"),
            "dated versions win over undated, latest wins over older"
        );
    }
}
