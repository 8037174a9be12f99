// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory identity store, used by tests and by the simulated agent.

use crate::{
    Artifact, ArtifactKey, ArtifactKind, IdentityStore, StoreError,
    WorkloadService,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use warden_common::cluster::{ClusterConfig, NodeIdentity, Role};

#[derive(Default)]
struct Inner {
    cluster_config: Option<ClusterConfig>,
    node_identity: Option<NodeIdentity>,
    artifacts: BTreeMap<String, Vec<u8>>,
    workloads: Vec<WorkloadService>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    // When set, every operation fails with `Unavailable`; lets tests drive
    // the fatal (non-NotFound) startup path.
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn with_cluster_config(config: ClusterConfig) -> MemoryStore {
        let store = MemoryStore::new();
        store.inner.lock().unwrap().cluster_config = Some(config);
        store
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_workloads(&self, workloads: Vec<WorkloadService>) {
        self.inner.lock().unwrap().workloads = workloads;
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn cluster_config(&self) -> Result<ClusterConfig, StoreError> {
        self.check_available()?;
        self.inner.lock().unwrap().cluster_config.clone().ok_or_else(|| {
            StoreError::NotFound { key: "cluster".to_string() }
        })
    }

    async fn put_cluster_config(
        &self,
        config: &ClusterConfig,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner.lock().unwrap().cluster_config = Some(config.clone());
        Ok(())
    }

    async fn node_identity(&self) -> Result<NodeIdentity, StoreError> {
        self.check_available()?;
        self.inner
            .lock()
            .unwrap()
            .node_identity
            .clone()
            .ok_or_else(|| StoreError::NotFound { key: "node".to_string() })
    }

    async fn put_node_identity(
        &self,
        node: &NodeIdentity,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner.lock().unwrap().node_identity = Some(node.clone());
        Ok(())
    }

    async fn put_artifact(
        &self,
        key: &ArtifactKey,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner
            .lock()
            .unwrap()
            .artifacts
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
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
        let bytes = self
            .inner
            .lock()
            .unwrap()
            .artifacts
            .get(&key.to_string())
            .cloned()
            .ok_or_else(|| StoreError::NotFound { key: key.to_string() })?;
        Ok(Artifact { key, bytes })
    }

    async fn list_keys(
        &self,
        prefix: &str,
    ) -> Result<Vec<ArtifactKey>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().unwrap();
        let mut keys = Vec::new();
        for name in inner.artifacts.keys() {
            let key = ArtifactKey::parse(name)?;
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
        self.check_available()?;
        self.inner
            .lock()
            .unwrap()
            .artifacts
            .remove(&key.to_string())
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { key: key.to_string() })
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
        self.check_available()?;
        Ok(self.inner.lock().unwrap().workloads.clone())
    }
}
