// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node-type detection.
//!
//! The detector inspects the cluster configuration object in the identity
//! store and selects which role controller to instantiate. A missing or
//! corrupt configuration object is not an error: it is the designed signal
//! for installer (bootstrap) mode. Any other read failure aborts startup.

use idstore::{IdentityStore, StoreError};
use slog::Logger;
use warden_common::cluster::{ClusterConfig, SecurityLevel, Specialization};

/// Which role controller runs this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Installer,
    Principal,
    Dependent,
    Extension,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeKind::Installer => "installer",
            NodeKind::Principal => "principal",
            NodeKind::Dependent => "dependent",
            NodeKind::Extension => "extension",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("security level {level} has no monitor role on this node")]
    UnsupportedNodeType { level: SecurityLevel },

    #[error("failed to read cluster configuration: {0}")]
    Store(#[source] StoreError),
}

/// Select the role controller for this node.
///
/// Returns the cluster configuration alongside the kind when one exists so
/// callers don't re-read it. `level_override` substitutes for the
/// configured security level when set (a development aid).
pub async fn detect_node_kind(
    log: &Logger,
    store: &dyn IdentityStore,
    level_override: Option<SecurityLevel>,
) -> Result<(NodeKind, Option<ClusterConfig>), DetectorError> {
    let config = match store.cluster_config().await {
        Ok(config) => config,
        Err(StoreError::NotFound { .. }) => {
            info!(
                log,
                "no cluster configuration found; starting in installer mode"
            );
            return Ok((NodeKind::Installer, None));
        }
        Err(err @ StoreError::Corrupt { .. }) => {
            warn!(
                log,
                "cluster configuration is corrupt; starting in installer mode";
                "error" => %err,
            );
            return Ok((NodeKind::Installer, None));
        }
        Err(err) => return Err(DetectorError::Store(err)),
    };

    let level = match level_override {
        Some(level) => {
            warn!(
                log,
                "security level overridden on the command line";
                "configured" => %config.security_level,
                "override" => %level,
            );
            level
        }
        None => config.security_level,
    };
    let kind = match (level, config.specialization) {
        (SecurityLevel::Protected, Specialization::Dependent) => {
            NodeKind::Dependent
        }
        (SecurityLevel::Protected, Specialization::Principal)
        | (SecurityLevel::Protected, Specialization::None) => {
            NodeKind::Principal
        }
        (SecurityLevel::Protected, Specialization::Extension) => {
            NodeKind::Extension
        }
        (level, _) => {
            return Err(DetectorError::UnsupportedNodeType { level });
        }
    };
    info!(
        log, "detected node type";
        "kind" => %kind,
        "security_level" => %config.security_level,
    );
    Ok((kind, Some(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use idstore::MemoryStore;
    use slog::Drain;

    fn test_log() -> Logger {
        Logger::root(slog::Discard.fuse(), o!())
    }

    fn config(
        level: SecurityLevel,
        specialization: Specialization,
    ) -> ClusterConfig {
        ClusterConfig {
            cluster_id: Some("d00d".to_string()),
            security_level: level,
            specialization,
            principal_url: None,
        }
    }

    #[tokio::test]
    async fn missing_config_selects_installer() {
        let store = MemoryStore::new();
        let (kind, config) =
            detect_node_kind(&test_log(), &store, None).await.unwrap();
        assert_eq!(kind, NodeKind::Installer);
        assert!(config.is_none());
    }

    #[tokio::test]
    async fn corrupt_config_selects_installer() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store =
            idstore::DirectoryStore::new(dir.path().to_owned()).unwrap();
        std::fs::write(dir.path().join("cluster.json"), b"{not json").unwrap();
        let (kind, config) =
            detect_node_kind(&test_log(), &store, None).await.unwrap();
        assert_eq!(kind, NodeKind::Installer);
        assert!(config.is_none());
    }

    #[tokio::test]
    async fn protected_specializations_map_to_controllers() {
        let cases = [
            (Specialization::Dependent, NodeKind::Dependent),
            (Specialization::Principal, NodeKind::Principal),
            (Specialization::None, NodeKind::Principal),
            (Specialization::Extension, NodeKind::Extension),
        ];
        for (specialization, expected) in cases {
            let store = MemoryStore::with_cluster_config(config(
                SecurityLevel::Protected,
                specialization,
            ));
            let (kind, _) =
                detect_node_kind(&test_log(), &store, None).await.unwrap();
            assert_eq!(kind, expected, "for {:?}", specialization);
        }
    }

    #[tokio::test]
    async fn other_security_levels_fail_fast() {
        for level in [
            SecurityLevel::Installation,
            SecurityLevel::Private,
            SecurityLevel::Secure,
        ] {
            let store = MemoryStore::with_cluster_config(config(
                level,
                Specialization::None,
            ));
            match detect_node_kind(&test_log(), &store, None).await {
                Err(DetectorError::UnsupportedNodeType { level: got }) => {
                    assert_eq!(got, level);
                }
                other => panic!("expected UnsupportedNodeType, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn store_failures_other_than_not_found_are_fatal() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        match detect_node_kind(&test_log(), &store, None).await {
            Err(DetectorError::Store(_)) => (),
            other => panic!("expected fatal store error, got {:?}", other),
        }
    }
}
