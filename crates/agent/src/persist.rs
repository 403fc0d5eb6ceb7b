//! Durable state: two external key/value blobs, one sensitive (Secret), one
//! plain (ConfigMap).
//!
//! Each blob is a single JSON document behind a compare-and-swap `BlobStore`.
//! A [`BlobHandle`] keeps the authoritative in-memory copy under a writer
//! lock; every mutation serializes and writes back immediately, retrying on
//! version conflicts with the in-memory copy winning (the registry is the
//! single writer, so a conflict only means an external actor touched the
//! object).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use common::api::{Notification, PendingApproval, RemoteApp, Settings};

const BLOB_KEY: &str = "blob";
const SAVE_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("version conflict writing blob")]
    Conflict,
    #[error("blob store error: {0}")]
    Api(#[source] anyhow::Error),
}

/// Raw blob contents plus the store's version token.
#[derive(Debug, Clone)]
pub struct RawBlob {
    pub data: String,
    pub version: Option<String>,
}

/// A versioned single-document store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn load(&self) -> Result<Option<RawBlob>, PersistError>;

    /// Compare-and-swap write. `expected` of `None` creates the document and
    /// fails with [`PersistError::Conflict`] if it already exists.
    async fn store(&self, data: String, expected: Option<String>)
        -> Result<String, PersistError>;
}

pub type DynBlobStore = Arc<dyn BlobStore>;

// ── Blob schemas ──────────────────────────────────────────────

/// A peer as persisted in the sensitive blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedPeer {
    pub name: String,
    pub url: String,
    pub ca_pem: String,
    pub ca_fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

/// Keypairs, invite token and pinned peer CAs.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SensitiveBlob {
    #[serde(default)]
    pub ca_pem: String,
    #[serde(default)]
    pub ca_key: String,
    #[serde(default)]
    pub leaf_pem: String,
    #[serde(default)]
    pub leaf_key: String,
    #[serde(default)]
    pub invite_token: String,
    #[serde(default)]
    pub peers: Vec<PersistedPeer>,
}

impl SensitiveBlob {
    /// Whether the keypair material is present and loadable.
    pub fn has_credentials(&self) -> bool {
        !self.ca_pem.is_empty()
            && !self.ca_key.is_empty()
            && !self.leaf_pem.is_empty()
            && !self.leaf_key.is_empty()
    }
}

/// Apps, approvals, settings and notifications. Executing apps are absent on
/// purpose; the reconciler rebuilds them from labeled Deployments.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StateBlob {
    #[serde(default)]
    pub submitted: Vec<RemoteApp>,
    #[serde(default)]
    pub pending_approval: Vec<PendingApproval>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub notifications: Vec<Notification>,
}

// ── Versioned handle ──────────────────────────────────────────

struct Cached<T> {
    value: T,
    version: Option<String>,
}

/// Authoritative in-memory copy of one blob, flushed on every mutation.
pub struct BlobHandle<T> {
    store: DynBlobStore,
    inner: Mutex<Cached<T>>,
}

impl<T> BlobHandle<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send,
{
    /// Read the existing blob or start from `T::default()`.
    pub async fn open(store: DynBlobStore) -> Result<Self, PersistError> {
        let cached = match store.load().await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw.data)
                    .map_err(|err| PersistError::Api(anyhow::anyhow!("corrupt blob: {err}")))?;
                Cached {
                    value,
                    version: raw.version,
                }
            }
            None => Cached {
                value: T::default(),
                version: None,
            },
        };
        Ok(Self {
            store,
            inner: Mutex::new(cached),
        })
    }

    /// Immutable snapshot of the current value.
    pub async fn snapshot(&self) -> T {
        self.inner.lock().await.value.clone()
    }

    /// Mutate under the writer lock and persist synchronously.
    pub async fn update<R>(
        &self,
        mutate: impl FnOnce(&mut T) -> R + Send,
    ) -> Result<R, PersistError> {
        let mut cached = self.inner.lock().await;
        let out = mutate(&mut cached.value);
        let data = serde_json::to_string(&cached.value)
            .map_err(|err| PersistError::Api(anyhow::anyhow!("serialize blob: {err}")))?;

        for attempt in 1..=SAVE_ATTEMPTS {
            match self
                .store
                .store(data.clone(), cached.version.clone())
                .await
            {
                Ok(version) => {
                    cached.version = Some(version);
                    return Ok(out);
                }
                Err(PersistError::Conflict) if attempt < SAVE_ATTEMPTS => {
                    // Someone else touched the object; take their version and
                    // write our value over it.
                    warn!(attempt, "blob version conflict; retrying write");
                    cached.version = self
                        .store
                        .load()
                        .await?
                        .and_then(|raw| raw.version);
                }
                Err(err) => return Err(err),
            }
        }
        Err(PersistError::Conflict)
    }
}

pub type SensitiveHandle = BlobHandle<SensitiveBlob>;
pub type StateHandle = BlobHandle<StateBlob>;

// ── Kubernetes-backed stores ──────────────────────────────────

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Sensitive blob in a Kubernetes Secret.
pub struct KubeSecretStore {
    api: Api<Secret>,
    name: String,
}

impl KubeSecretStore {
    pub fn new(client: kube::Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for KubeSecretStore {
    async fn load(&self) -> Result<Option<RawBlob>, PersistError> {
        match self.api.get(&self.name).await {
            Ok(secret) => {
                let data = secret
                    .data
                    .as_ref()
                    .and_then(|d| d.get(BLOB_KEY))
                    .map(|ByteString(bytes)| String::from_utf8_lossy(bytes).into_owned())
                    .unwrap_or_default();
                if data.is_empty() {
                    return Ok(None);
                }
                Ok(Some(RawBlob {
                    data,
                    version: secret.metadata.resource_version,
                }))
            }
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(PersistError::Api(err.into())),
        }
    }

    async fn store(
        &self,
        data: String,
        expected: Option<String>,
    ) -> Result<String, PersistError> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                resource_version: expected.clone(),
                ..ObjectMeta::default()
            },
            string_data: Some(BTreeMap::from([(BLOB_KEY.to_string(), data)])),
            ..Secret::default()
        };

        let result = if expected.is_some() {
            self.api
                .replace(&self.name, &PostParams::default(), &secret)
                .await
        } else {
            self.api.create(&PostParams::default(), &secret).await
        };

        match result {
            Ok(stored) => stored
                .metadata
                .resource_version
                .ok_or_else(|| PersistError::Api(anyhow::anyhow!("secret has no version"))),
            Err(err) if is_conflict(&err) => Err(PersistError::Conflict),
            Err(err) => Err(PersistError::Api(err.into())),
        }
    }
}

/// Plain blob in a Kubernetes ConfigMap.
pub struct KubeConfigMapStore {
    api: Api<ConfigMap>,
    name: String,
}

impl KubeConfigMapStore {
    pub fn new(client: kube::Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for KubeConfigMapStore {
    async fn load(&self) -> Result<Option<RawBlob>, PersistError> {
        match self.api.get(&self.name).await {
            Ok(cm) => {
                let data = cm
                    .data
                    .as_ref()
                    .and_then(|d| d.get(BLOB_KEY))
                    .cloned()
                    .unwrap_or_default();
                if data.is_empty() {
                    return Ok(None);
                }
                Ok(Some(RawBlob {
                    data,
                    version: cm.metadata.resource_version,
                }))
            }
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(PersistError::Api(err.into())),
        }
    }

    async fn store(
        &self,
        data: String,
        expected: Option<String>,
    ) -> Result<String, PersistError> {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                resource_version: expected.clone(),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(BLOB_KEY.to_string(), data)])),
            ..ConfigMap::default()
        };

        let result = if expected.is_some() {
            self.api.replace(&self.name, &PostParams::default(), &cm).await
        } else {
            self.api.create(&PostParams::default(), &cm).await
        };

        match result {
            Ok(stored) => stored
                .metadata
                .resource_version
                .ok_or_else(|| PersistError::Api(anyhow::anyhow!("configmap has no version"))),
            Err(err) if is_conflict(&err) => Err(PersistError::Conflict),
            Err(err) => Err(PersistError::Api(err.into())),
        }
    }
}

// ── In-memory store (tests) ───────────────────────────────────

/// Test double with the same CAS semantics as the Kubernetes stores.
#[derive(Default)]
pub struct MemoryBlobStore {
    inner: std::sync::Mutex<Option<(String, u64)>>,
}

impl MemoryBlobStore {
    pub fn shared() -> DynBlobStore {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn load(&self) -> Result<Option<RawBlob>, PersistError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.as_ref().map(|(data, version)| RawBlob {
            data: data.clone(),
            version: Some(version.to_string()),
        }))
    }

    async fn store(
        &self,
        data: String,
        expected: Option<String>,
    ) -> Result<String, PersistError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let current = inner.as_ref().map(|(_, v)| v.to_string());
        if current != expected {
            return Err(PersistError::Conflict);
        }
        let next = inner.as_ref().map(|(_, v)| v + 1).unwrap_or(1);
        *inner = Some((data, next));
        Ok(next.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_starts_from_default_and_persists_updates() {
        let store = MemoryBlobStore::shared();
        let handle: StateHandle = BlobHandle::open(store.clone()).await.expect("open");

        assert!(handle.snapshot().await.submitted.is_empty());

        handle
            .update(|blob| blob.settings.max_total_deployments = 7)
            .await
            .expect("update persists");

        // A fresh handle over the same store observes the write.
        let reopened: StateHandle = BlobHandle::open(store).await.expect("reopen");
        assert_eq!(reopened.snapshot().await.settings.max_total_deployments, 7);
    }

    #[tokio::test]
    async fn handle_retries_on_external_conflict() {
        let store = MemoryBlobStore::shared();
        let handle: StateHandle = BlobHandle::open(store.clone()).await.expect("open");
        handle
            .update(|blob| blob.settings.max_total_pods = 1)
            .await
            .expect("seed");

        // External writer bumps the version behind our back.
        let raw = store.load().await.expect("load").expect("present");
        store
            .store("{}".into(), raw.version)
            .await
            .expect("external write");

        handle
            .update(|blob| blob.settings.max_total_pods = 2)
            .await
            .expect("retry wins");

        let raw = store.load().await.expect("load").expect("present");
        let parsed: StateBlob = serde_json::from_str(&raw.data).expect("parses");
        assert_eq!(parsed.settings.max_total_pods, 2);
    }

    #[tokio::test]
    async fn memory_store_rejects_stale_versions() {
        let store = MemoryBlobStore::default();
        let v1 = store.store("a".into(), None).await.expect("create");
        let err = store
            .store("b".into(), None)
            .await
            .expect_err("second create conflicts");
        assert!(matches!(err, PersistError::Conflict));
        store.store("c".into(), Some(v1)).await.expect("cas ok");
    }

    #[test]
    fn sensitive_blob_completeness_check() {
        let mut blob = SensitiveBlob::default();
        assert!(!blob.has_credentials());
        blob.ca_pem = "a".into();
        blob.ca_key = "b".into();
        blob.leaf_pem = "c".into();
        blob.leaf_key = "d".into();
        assert!(blob.has_credentials());
    }
}
