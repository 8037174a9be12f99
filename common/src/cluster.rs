// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cluster-wide data model: who this cluster is, and who this node is.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse trust tier of a node.
///
/// Only `protected` nodes run a full monitor today; the other tiers exist in
/// operator tooling and must round-trip through the cluster configuration
/// object unchanged.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Installation,
    Private,
    Protected,
    Secure,
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SecurityLevel::Installation => "installation",
            SecurityLevel::Private => "private",
            SecurityLevel::Protected => "protected",
            SecurityLevel::Secure => "secure",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SecurityLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "installation" => Ok(SecurityLevel::Installation),
            "private" => Ok(SecurityLevel::Private),
            "protected" => Ok(SecurityLevel::Protected),
            "secure" => Ok(SecurityLevel::Secure),
            other => Err(format!("unknown security level {:?}", other)),
        }
    }
}

/// A protected-tier node's role within the cluster.
///
/// Older operator tooling writes `"primary"` where newer tooling writes
/// `"principal"`; both deserialize to [`Specialization::Principal`].
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Specialization {
    #[default]
    None,
    #[serde(alias = "primary")]
    Principal,
    Dependent,
    Extension,
}

/// A named certificate purpose.
///
/// Each role gets its own key pair and certificate chain; the monitor role is
/// the agent's own identity, the remaining roles belong to the workload
/// services the agent manages on this node.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Root,
    Intermediate,
    Monitor,
    Messaging,
    Datastore,
    Web,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Intermediate => "intermediate",
            Role::Monitor => "monitor",
            Role::Messaging => "messaging",
            Role::Datastore => "datastore",
            Role::Web => "web",
        }
    }

    /// Roles that act as certificate authorities when issuing.
    pub fn is_authority(&self) -> bool {
        matches!(self, Role::Root | Role::Intermediate)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(Role::Root),
            "intermediate" => Ok(Role::Intermediate),
            "monitor" => Ok(Role::Monitor),
            "messaging" => Ok(Role::Messaging),
            "datastore" => Ok(Role::Datastore),
            "web" => Ok(Role::Web),
            other => Err(format!("unknown role {:?}", other)),
        }
    }
}

/// The identity of the whole cluster, established exactly once during
/// installer finalization and immutable afterwards.
///
/// `cluster_id` is the hex SHA-256 fingerprint of the cluster's root
/// certificate, so possession of the root of trust and knowledge of the
/// cluster id are the same fact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterIdentity {
    pub cluster_id: String,
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub specialization: Specialization,
}

/// The cluster configuration object as stored in the identity store.
///
/// Unlike [`ClusterIdentity`], the configuration object may exist before the
/// root of trust does (an operator can pre-assign a node's specialization);
/// `cluster_id` is filled in at finalization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterConfig {
    #[serde(default)]
    pub cluster_id: Option<String>,
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub specialization: Specialization,
    /// Base URL of the principal node's agent API, for dependent nodes.
    #[serde(default)]
    pub principal_url: Option<String>,
}

impl ClusterConfig {
    pub fn identity(&self) -> Option<ClusterIdentity> {
        self.cluster_id.as_ref().map(|id| ClusterIdentity {
            cluster_id: id.clone(),
            security_level: self.security_level,
            specialization: self.specialization,
        })
    }
}

/// This node's own identity, created at first boot and persisted in the
/// identity store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NodeIdentity {
    pub node_id: Uuid,
    pub hostname: String,
    /// Store key of the node's current monitor certificate, if one has been
    /// issued yet.
    #[serde(default)]
    pub monitor_cert_key: Option<String>,
}

impl NodeIdentity {
    pub fn new(hostname: String) -> NodeIdentity {
        NodeIdentity { node_id: Uuid::new_v4(), hostname, monitor_cert_key: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specialization_accepts_both_spellings() {
        let principal: Specialization =
            serde_json::from_str("\"principal\"").unwrap();
        let primary: Specialization =
            serde_json::from_str("\"primary\"").unwrap();
        assert_eq!(principal, Specialization::Principal);
        assert_eq!(primary, Specialization::Principal);
        // Canonical spelling on the way out.
        assert_eq!(
            serde_json::to_string(&Specialization::Principal).unwrap(),
            "\"principal\""
        );
    }

    #[test]
    fn cluster_config_without_id_has_no_identity() {
        let config = ClusterConfig {
            cluster_id: None,
            security_level: SecurityLevel::Protected,
            specialization: Specialization::Dependent,
            principal_url: None,
        };
        assert!(config.identity().is_none());

        let config = ClusterConfig { cluster_id: Some("abc".into()), ..config };
        let identity = config.identity().unwrap();
        assert_eq!(identity.cluster_id, "abc");
        assert_eq!(identity.specialization, Specialization::Dependent);
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in [
            Role::Root,
            Role::Intermediate,
            Role::Monitor,
            Role::Messaging,
            Role::Datastore,
            Role::Web,
        ] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("nexus".parse::<Role>().is_err());
    }
}
