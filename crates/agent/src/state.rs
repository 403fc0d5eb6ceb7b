//! In-memory canonical store of peers, apps, approvals, settings and
//! notifications.
//!
//! The registry exclusively owns these records; other components read
//! immutable snapshots and issue explicit mutation calls. Every mutation of
//! persisted data flushes the owning blob before returning. Executing apps
//! are deliberately never persisted; the reconciler rebuilds them from the
//! labeled Deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use common::api::{
    AppOrigin, ChannelState, InboundHandshake, Notification, NotificationLevel, PeerInfo,
    PeerStatus, PendingApproval, RemoteApp, RemoteAppStatus, Settings, SettingsPatch,
};

use crate::persist::{PersistError, PersistedPeer, SensitiveHandle, StateHandle};

const NOTIFICATION_CAP: usize = 200;

/// A peer as held by the registry. `ca_pem` never leaves the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEntry {
    pub name: String,
    pub url: String,
    pub ca_pem: String,
    pub ca_fingerprint: String,
    pub status: PeerStatus,
    pub channel: ChannelState,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl PeerEntry {
    pub fn to_info(&self) -> PeerInfo {
        PeerInfo {
            name: self.name.clone(),
            url: self.url.clone(),
            ca_fingerprint: self.ca_fingerprint.clone(),
            status: self.status,
            channel: self.channel,
            connected_at: self.connected_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// An outbound handshake that has not produced a peer record yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOutbound {
    pub name: String,
    pub url: String,
    pub started_at: DateTime<Utc>,
    pub failed: bool,
    pub error: Option<String>,
}

/// An inbound handshake waiting for operator confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEntry {
    pub id: String,
    pub name: String,
    pub url: String,
    pub ca_pem: String,
    pub ca_fingerprint: String,
    pub arrived_at: DateTime<Utc>,
}

impl InboundEntry {
    pub fn to_api(&self) -> InboundHandshake {
        InboundHandshake {
            id: self.id.clone(),
            name: self.name.clone(),
            url: self.url.clone(),
            ca_fingerprint: self.ca_fingerprint.clone(),
            arrived_at: self.arrived_at,
        }
    }
}

#[derive(Debug, Clone)]
struct ExecutingEntry {
    app: RemoteApp,
    /// Status push failed with channel_down; reconciler re-emits on reconnect.
    dirty: bool,
}

#[derive(Default)]
struct RegistryInner {
    peers: HashMap<String, PeerEntry>,
    pending_outbound: HashMap<String, PendingOutbound>,
    pending_inbound: HashMap<String, InboundEntry>,
    submitted: HashMap<String, RemoteApp>,
    executing: HashMap<String, ExecutingEntry>,
    pending_approval: HashMap<String, PendingApproval>,
    settings: Settings,
    notifications: VecDeque<Notification>,
}

/// The canonical state registry (C3).
pub struct Registry {
    inner: RwLock<RegistryInner>,
    sensitive: Arc<SensitiveHandle>,
    state: Arc<StateHandle>,
    generation: AtomicU64,
}

pub type SharedRegistry = Arc<Registry>;

impl Registry {
    /// Restore the registry from the persisted blobs. Peers come back with a
    /// disconnected channel; the channel manager re-dials them on startup.
    pub async fn restore(
        sensitive: Arc<SensitiveHandle>,
        state: Arc<StateHandle>,
    ) -> SharedRegistry {
        let sensitive_blob = sensitive.snapshot().await;
        let state_blob = state.snapshot().await;

        let mut inner = RegistryInner {
            settings: state_blob.settings,
            ..RegistryInner::default()
        };
        for peer in sensitive_blob.peers {
            inner.peers.insert(
                peer.name.clone(),
                PeerEntry {
                    name: peer.name,
                    url: peer.url,
                    ca_pem: peer.ca_pem,
                    ca_fingerprint: peer.ca_fingerprint,
                    status: PeerStatus::Connected,
                    channel: ChannelState::Disconnected,
                    connected_at: peer.connected_at,
                    last_error: None,
                },
            );
        }
        for app in state_blob.submitted {
            inner.submitted.insert(app.id.clone(), app);
        }
        for approval in state_blob.pending_approval {
            inner.pending_approval.insert(approval.id.clone(), approval);
        }
        inner.notifications = state_blob.notifications.into_iter().collect();

        Arc::new(Self {
            inner: RwLock::new(inner),
            sensitive,
            state,
            generation: AtomicU64::new(1),
        })
    }

    /// Monotonic change counter for UI polling.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    // ── Persistence helpers ───────────────────────────────────

    async fn persist_peers(&self, inner: &RegistryInner) -> Result<(), PersistError> {
        let peers: Vec<PersistedPeer> = inner
            .peers
            .values()
            .map(|p| PersistedPeer {
                name: p.name.clone(),
                url: p.url.clone(),
                ca_pem: p.ca_pem.clone(),
                ca_fingerprint: p.ca_fingerprint.clone(),
                connected_at: p.connected_at,
            })
            .collect();
        self.sensitive
            .update(move |blob| blob.peers = peers)
            .await?;
        Ok(())
    }

    async fn persist_state(&self, inner: &RegistryInner) -> Result<(), PersistError> {
        let submitted: Vec<RemoteApp> = inner.submitted.values().cloned().collect();
        let pending: Vec<PendingApproval> = inner.pending_approval.values().cloned().collect();
        let settings = inner.settings.clone();
        let notifications: Vec<Notification> = inner.notifications.iter().cloned().collect();
        self.state
            .update(move |blob| {
                blob.submitted = submitted;
                blob.pending_approval = pending;
                blob.settings = settings;
                blob.notifications = notifications;
            })
            .await?;
        Ok(())
    }

    // ── Peers ─────────────────────────────────────────────────

    pub async fn peers(&self) -> Vec<PeerEntry> {
        let inner = self.inner.read().await;
        let mut peers: Vec<PeerEntry> = inner.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    pub async fn peer(&self, name: &str) -> Option<PeerEntry> {
        self.inner.read().await.peers.get(name).cloned()
    }

    pub async fn peer_by_fingerprint(&self, fingerprint: &str) -> Option<PeerEntry> {
        let inner = self.inner.read().await;
        inner
            .peers
            .values()
            .find(|p| p.ca_fingerprint == fingerprint)
            .cloned()
    }

    /// Insert (or replace) a peer and persist. Clears any pending outbound
    /// entry with the same name.
    pub async fn insert_peer(&self, peer: PeerEntry) -> Result<(), PersistError> {
        let mut inner = self.inner.write().await;
        inner.pending_outbound.remove(&peer.name);
        inner.peers.insert(peer.name.clone(), peer);
        self.persist_peers(&inner).await?;
        self.bump();
        Ok(())
    }

    pub async fn remove_peer(&self, name: &str) -> Result<Option<PeerEntry>, PersistError> {
        let mut inner = self.inner.write().await;
        let removed = inner.peers.remove(name);
        if removed.is_some() {
            self.persist_peers(&inner).await?;
            self.bump();
        }
        Ok(removed)
    }

    pub async fn set_peer_status(&self, name: &str, status: PeerStatus) {
        let mut inner = self.inner.write().await;
        if let Some(peer) = inner.peers.get_mut(name) {
            peer.status = status;
            self.bump();
        }
    }

    pub async fn set_peer_error(&self, name: &str, error: impl Into<String>) {
        let mut inner = self.inner.write().await;
        if let Some(peer) = inner.peers.get_mut(name) {
            peer.last_error = Some(error.into());
            self.bump();
        }
    }

    /// Record a channel transition. The first successful connect promotes the
    /// peer to `connected` and stamps `connected_at` (persisted).
    pub async fn set_peer_channel(
        &self,
        name: &str,
        channel: ChannelState,
    ) -> Result<(), PersistError> {
        let mut inner = self.inner.write().await;
        let Some(peer) = inner.peers.get_mut(name) else {
            return Ok(());
        };
        if peer.channel == channel {
            return Ok(());
        }
        peer.channel = channel;
        let mut persist = false;
        if channel == ChannelState::Connected {
            peer.last_error = None;
            if peer.status != PeerStatus::Connected {
                peer.status = PeerStatus::Connected;
                persist = true;
            }
            if peer.connected_at.is_none() {
                peer.connected_at = Some(Utc::now());
                persist = true;
            }
        }
        if persist {
            self.persist_peers(&inner).await?;
        }
        self.bump();
        Ok(())
    }

    // ── Pending outbound handshakes ───────────────────────────

    pub async fn begin_outbound(&self, name: &str, url: &str) {
        let mut inner = self.inner.write().await;
        inner.pending_outbound.insert(
            name.to_string(),
            PendingOutbound {
                name: name.to_string(),
                url: url.to_string(),
                started_at: Utc::now(),
                failed: false,
                error: None,
            },
        );
        self.bump();
    }

    pub async fn fail_outbound(&self, name: &str, error: impl Into<String>) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.pending_outbound.get_mut(name) {
            entry.failed = true;
            entry.error = Some(error.into());
            self.bump();
        }
    }

    pub async fn clear_outbound(&self, name: &str) {
        let mut inner = self.inner.write().await;
        if inner.pending_outbound.remove(name).is_some() {
            self.bump();
        }
    }

    pub async fn pending_outbound(&self) -> Vec<PendingOutbound> {
        self.inner
            .read()
            .await
            .pending_outbound
            .values()
            .cloned()
            .collect()
    }

    // ── Pending inbound handshakes ────────────────────────────

    pub async fn add_inbound(&self, entry: InboundEntry) {
        let mut inner = self.inner.write().await;
        inner.pending_inbound.insert(entry.id.clone(), entry);
        self.bump();
    }

    pub async fn take_inbound(&self, id: &str) -> Option<InboundEntry> {
        let mut inner = self.inner.write().await;
        let taken = inner.pending_inbound.remove(id);
        if taken.is_some() {
            self.bump();
        }
        taken
    }

    pub async fn inbound_list(&self) -> Vec<InboundHandshake> {
        let inner = self.inner.read().await;
        let mut list: Vec<InboundHandshake> =
            inner.pending_inbound.values().map(InboundEntry::to_api).collect();
        list.sort_by(|a, b| a.arrived_at.cmp(&b.arrived_at));
        list
    }

    // ── Submitted apps ────────────────────────────────────────

    pub async fn submitted(&self) -> Vec<RemoteApp> {
        let inner = self.inner.read().await;
        let mut apps: Vec<RemoteApp> = inner.submitted.values().cloned().collect();
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        apps
    }

    pub async fn get_submitted(&self, id: &str) -> Option<RemoteApp> {
        self.inner.read().await.submitted.get(id).cloned()
    }

    pub async fn insert_submitted(&self, app: RemoteApp) -> Result<(), PersistError> {
        debug_assert_eq!(app.origin, AppOrigin::Submitted);
        let mut inner = self.inner.write().await;
        inner.submitted.insert(app.id.clone(), app);
        self.persist_state(&inner).await?;
        self.bump();
        Ok(())
    }

    pub async fn update_submitted(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut RemoteApp) + Send,
    ) -> Result<bool, PersistError> {
        let mut inner = self.inner.write().await;
        let Some(app) = inner.submitted.get_mut(id) else {
            return Ok(false);
        };
        mutate(app);
        app.updated_at = Utc::now();
        self.persist_state(&inner).await?;
        self.bump();
        Ok(true)
    }

    pub async fn remove_submitted(&self, id: &str) -> Result<Option<RemoteApp>, PersistError> {
        let mut inner = self.inner.write().await;
        let removed = inner.submitted.remove(id);
        if removed.is_some() {
            self.persist_state(&inner).await?;
            self.bump();
        }
        Ok(removed)
    }

    /// Mark every submitted app targeting `peer` as failed.
    pub async fn fail_submitted_for_peer(
        &self,
        peer: &str,
        message: &str,
    ) -> Result<Vec<String>, PersistError> {
        let mut inner = self.inner.write().await;
        let mut affected = Vec::new();
        for app in inner.submitted.values_mut() {
            if app.target_peer.as_deref() == Some(peer) && !app.status.is_terminal() {
                app.status = RemoteAppStatus::Failed;
                app.message = Some(message.to_string());
                app.updated_at = Utc::now();
                affected.push(app.name.clone());
            }
        }
        if !affected.is_empty() {
            self.persist_state(&inner).await?;
            self.bump();
        }
        Ok(affected)
    }

    // ── Executing apps (never persisted) ──────────────────────

    pub async fn executing(&self) -> Vec<RemoteApp> {
        let inner = self.inner.read().await;
        let mut apps: Vec<RemoteApp> =
            inner.executing.values().map(|e| e.app.clone()).collect();
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        apps
    }

    pub async fn get_executing(&self, id: &str) -> Option<RemoteApp> {
        self.inner.read().await.executing.get(id).map(|e| e.app.clone())
    }

    pub async fn insert_executing(&self, app: RemoteApp) {
        debug_assert_eq!(app.origin, AppOrigin::Executing);
        let mut inner = self.inner.write().await;
        inner
            .executing
            .insert(app.id.clone(), ExecutingEntry { app, dirty: false });
        self.bump();
    }

    pub async fn update_executing(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut RemoteApp) + Send,
    ) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.executing.get_mut(id) else {
            return false;
        };
        mutate(&mut entry.app);
        entry.app.updated_at = Utc::now();
        self.bump();
        true
    }

    pub async fn remove_executing(&self, id: &str) -> Option<RemoteApp> {
        let mut inner = self.inner.write().await;
        let removed = inner.executing.remove(id).map(|e| e.app);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    pub async fn mark_executing_dirty(&self, id: &str, dirty: bool) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.executing.get_mut(id) {
            entry.dirty = dirty;
        }
    }

    pub async fn dirty_executing(&self) -> Vec<RemoteApp> {
        let inner = self.inner.read().await;
        inner
            .executing
            .values()
            .filter(|e| e.dirty)
            .map(|e| e.app.clone())
            .collect()
    }

    // ── Approval queue ────────────────────────────────────────

    pub async fn approvals(&self) -> Vec<PendingApproval> {
        let inner = self.inner.read().await;
        let mut list: Vec<PendingApproval> = inner.pending_approval.values().cloned().collect();
        list.sort_by(|a, b| a.arrived_at.cmp(&b.arrived_at));
        list
    }

    pub async fn queue_approval(&self, approval: PendingApproval) -> Result<(), PersistError> {
        let mut inner = self.inner.write().await;
        inner
            .pending_approval
            .insert(approval.id.clone(), approval);
        self.persist_state(&inner).await?;
        self.bump();
        Ok(())
    }

    pub async fn take_approval(
        &self,
        id: &str,
    ) -> Result<Option<PendingApproval>, PersistError> {
        let mut inner = self.inner.write().await;
        let taken = inner.pending_approval.remove(id);
        if taken.is_some() {
            self.persist_state(&inner).await?;
            self.bump();
        }
        Ok(taken)
    }

    // ── Settings ──────────────────────────────────────────────

    pub async fn settings(&self) -> Settings {
        self.inner.read().await.settings.clone()
    }

    pub async fn merge_settings(&self, patch: SettingsPatch) -> Result<Settings, PersistError> {
        let mut inner = self.inner.write().await;
        inner.settings.merge(patch);
        let merged = inner.settings.clone();
        self.persist_state(&inner).await?;
        self.bump();
        Ok(merged)
    }

    // ── Notifications ─────────────────────────────────────────

    pub async fn notify(
        &self,
        level: NotificationLevel,
        title: impl Into<String>,
        message: impl Into<String>,
    ) {
        let notification = Notification {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            ts: Utc::now(),
            level,
            title: title.into(),
            message: message.into(),
            ack: false,
        };
        let mut inner = self.inner.write().await;
        inner.notifications.push_front(notification);
        inner.notifications.truncate(NOTIFICATION_CAP);
        // Best-effort: a notification is not worth failing the caller over.
        let _ = self.persist_state(&inner).await;
        self.bump();
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.inner.read().await.notifications.iter().cloned().collect()
    }

    pub async fn ack_notification(&self, id: &str) -> Result<bool, PersistError> {
        let mut inner = self.inner.write().await;
        let Some(notification) = inner.notifications.iter_mut().find(|n| n.id == id) else {
            return Ok(false);
        };
        notification.ack = true;
        self.persist_state(&inner).await?;
        self.bump();
        Ok(true)
    }

    pub async fn clear_notifications(&self) -> Result<(), PersistError> {
        let mut inner = self.inner.write().await;
        inner.notifications.clear();
        self.persist_state(&inner).await?;
        self.bump();
        Ok(())
    }
}
