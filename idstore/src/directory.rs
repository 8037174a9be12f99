// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A file-backed identity store.
//!
//! Each artifact lives in its own file named after its key; the cluster
//! configuration, node identity and workload set are JSON documents at the
//! store root. Writes go through a temporary file and a rename so a crashed
//! write never leaves a half-written authoritative object. Key material is
//! written with owner-only permissions.

use crate::{
    Artifact, ArtifactKey, ArtifactKind, IdentityStore, StoreError,
    WorkloadService,
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use warden_common::cluster::{ClusterConfig, NodeIdentity, Role};

const CLUSTER_CONFIG_FILE: &str = "cluster.json";
const NODE_IDENTITY_FILE: &str = "node.json";
const WORKLOADS_FILE: &str = "workloads.json";
const ARTIFACT_DIR: &str = "artifacts";

pub struct DirectoryStore {
    base: Utf8PathBuf,
}

impl DirectoryStore {
    pub fn new(base: Utf8PathBuf) -> Result<DirectoryStore, StoreError> {
        let artifacts = base.join(ARTIFACT_DIR);
        std::fs::create_dir_all(&artifacts)
            .map_err(|err| StoreError::Io { path: artifacts, err })?;
        Ok(DirectoryStore { base })
    }

    fn artifact_path(&self, key: &ArtifactKey) -> Utf8PathBuf {
        self.base.join(ARTIFACT_DIR).join(key.to_string())
    }

    fn read_json<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<T, StoreError> {
        let path = self.base.join(name);
        let bytes = read_file(&path, name)?;
        serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt {
            key: name.to_string(),
            message: err.to_string(),
        })
    }

    fn write_json<T: Serialize>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value).expect("json of plain struct");
        write_private_file(&self.base.join(name), &bytes)
    }
}

fn read_file(path: &Utf8Path, key: &str) -> Result<Vec<u8>, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(StoreError::NotFound { key: key.to_string() })
        }
        Err(err) => Err(StoreError::Io { path: path.to_owned(), err }),
    }
}

// The file should be readable and writable by the user only; artifacts
// include private keys and passwords.
fn write_private_file(
    path: &Utf8Path,
    contents: &[u8],
) -> Result<(), StoreError> {
    let tmp = path.with_file_name(format!(
        ".tmp-{}",
        path.file_name().unwrap_or("artifact")
    ));
    let map_err = |err| StoreError::Io { path: tmp.clone(), err };
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)
        .map_err(map_err)?;
    file.write_all(contents).map_err(map_err)?;
    file.sync_all().map_err(map_err)?;
    drop(file);
    std::fs::rename(&tmp, path)
        .map_err(|err| StoreError::Io { path: path.to_owned(), err })
}

#[async_trait]
impl IdentityStore for DirectoryStore {
    async fn cluster_config(&self) -> Result<ClusterConfig, StoreError> {
        self.read_json(CLUSTER_CONFIG_FILE)
    }

    async fn put_cluster_config(
        &self,
        config: &ClusterConfig,
    ) -> Result<(), StoreError> {
        self.write_json(CLUSTER_CONFIG_FILE, config)
    }

    async fn node_identity(&self) -> Result<NodeIdentity, StoreError> {
        self.read_json(NODE_IDENTITY_FILE)
    }

    async fn put_node_identity(
        &self,
        node: &NodeIdentity,
    ) -> Result<(), StoreError> {
        self.write_json(NODE_IDENTITY_FILE, node)
    }

    async fn put_artifact(
        &self,
        key: &ArtifactKey,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        write_private_file(&self.artifact_path(key), bytes)
    }

    async fn current_artifact(
        &self,
        prefix: &str,
        role: Role,
        kind: ArtifactKind,
    ) -> Result<Artifact, StoreError> {
        let keys = self.list_keys(prefix).await?;
        let key = crate::current_key(&keys, role, kind).cloned().ok_or_else(
            || StoreError::NotFound {
                key: format!("{}.{}.{}.*", prefix, role, kind.as_str()),
            },
        )?;
        let bytes = read_file(&self.artifact_path(&key), &key.to_string())?;
        Ok(Artifact { key, bytes })
    }

    async fn list_keys(
        &self,
        prefix: &str,
    ) -> Result<Vec<ArtifactKey>, StoreError> {
        let dir = self.base.join(ARTIFACT_DIR);
        let entries = std::fs::read_dir(&dir)
            .map_err(|err| StoreError::Io { path: dir.clone(), err })?;
        let mut keys = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|err| StoreError::Io { path: dir.clone(), err })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(".tmp-") {
                continue;
            }
            // Foreign files in the artifact directory are not ours to judge.
            let Ok(key) = ArtifactKey::parse(name) else { continue };
            if key.prefix == prefix {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete_artifact(
        &self,
        key: &ArtifactKey,
    ) -> Result<(), StoreError> {
        let path = self.artifact_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound { key: key.to_string() })
            }
            Err(err) => Err(StoreError::Io { path, err }),
        }
    }

    async fn delete_all(
        &self,
        prefix: &str,
        role: Role,
        kind: ArtifactKind,
    ) -> Result<(), StoreError> {
        for key in self.list_keys(prefix).await? {
            if key.role == role && key.kind == kind {
                self.delete_artifact(&key).await?;
            }
        }
        Ok(())
    }

    async fn workloads(&self) -> Result<Vec<WorkloadService>, StoreError> {
        match self.read_json(WORKLOADS_FILE) {
            Ok(workloads) => Ok(workloads),
            Err(StoreError::NotFound { .. }) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_common::cluster::{SecurityLevel, Specialization};

    fn store() -> (camino_tempfile::Utf8TempDir, DirectoryStore) {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path().to_owned()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn missing_cluster_config_is_not_found() {
        let (_dir, store) = store();
        assert!(store.cluster_config().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn corrupt_cluster_config_is_distinguishable() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("cluster.json"), b"{not json").unwrap();
        match store.cluster_config().await.unwrap_err() {
            StoreError::Corrupt { .. } => (),
            other => panic!("expected Corrupt, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cluster_config_round_trips() {
        let (_dir, store) = store();
        let config = ClusterConfig {
            cluster_id: Some("f00d".into()),
            security_level: SecurityLevel::Protected,
            specialization: Specialization::Principal,
            principal_url: None,
        };
        store.put_cluster_config(&config).await.unwrap();
        assert_eq!(store.cluster_config().await.unwrap(), config);
    }

    #[tokio::test]
    async fn artifacts_version_by_timestamp() {
        let (_dir, store) = store();
        let old =
            ArtifactKey::parse("pki.monitor.cert.20240101000000").unwrap();
        let new =
            ArtifactKey::parse("pki.monitor.cert.20260807213000").unwrap();
        store.put_artifact(&old, b"old").await.unwrap();
        store.put_artifact(&new, b"new").await.unwrap();

        let current = store
            .current_artifact(crate::PKI_PREFIX, Role::Monitor, ArtifactKind::Cert)
            .await
            .unwrap();
        assert_eq!(current.key, new);
        assert_eq!(current.bytes, b"new");

        // Both versions still listed; superseded, not destroyed.
        let keys = store.list_keys(crate::PKI_PREFIX).await.unwrap();
        assert_eq!(keys, vec![old, new]);
    }

    #[tokio::test]
    async fn delete_all_retires_every_version() {
        let (_dir, store) = store();
        for ts in ["20240101000000", "20250101000000"] {
            let key =
                ArtifactKey::parse(&format!("pki.web.csr.{}", ts)).unwrap();
            store.put_artifact(&key, b"csr").await.unwrap();
        }
        store
            .delete_all(crate::PKI_PREFIX, Role::Web, ArtifactKind::Csr)
            .await
            .unwrap();
        assert!(store.list_keys(crate::PKI_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, store) = store();
        let key = ArtifactKey::parse("pki.monitor.key.20260807213000").unwrap();
        store.put_artifact(&key, b"secret").await.unwrap();
        let path = dir.path().join("artifacts").join(key.to_string());
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
