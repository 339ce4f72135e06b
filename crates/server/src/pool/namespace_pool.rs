//! Composed namespace session pool.
//!
//! One *idle* composed session per namespace, ready for the next downstream
//! attach, plus zero or more *active* sessions keyed by downstream session
//! id. Invalidation only ever touches the idle slot; active sessions keep
//! their snapshot and their upstream refcounts until the downstream detaches.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use metamcp_core::{McpServer, MembershipStatus, Namespace, Repository, Result};

use crate::aggregator::AggregatedTool;
use crate::pool::server_pool::{McpServerPool, UpstreamClient};

/// One upstream member of a composed session.
pub struct MemberServer {
    pub server: McpServer,
    pub client: Arc<dyn UpstreamClient>,
}

/// A namespace's composed view of its upstreams.
///
/// Snapshot semantics: the member list and merged registry are fixed at build
/// time; config changes surface through pool invalidation, which replaces the
/// idle slot rather than mutating live sessions.
pub struct NamespaceSession {
    pub namespace: Namespace,
    members: Vec<MemberServer>,
    registry: tokio::sync::RwLock<Option<Arc<Vec<AggregatedTool>>>>,
}

impl NamespaceSession {
    pub(crate) fn new(namespace: Namespace, members: Vec<MemberServer>) -> Self {
        Self {
            namespace,
            members,
            registry: tokio::sync::RwLock::new(None),
        }
    }

    pub fn members(&self) -> &[MemberServer] {
        &self.members
    }

    /// Member lookup by server name, used by dispatch.
    pub fn find_member(&self, server_name: &str) -> Option<&MemberServer> {
        self.members.iter().find(|m| m.server.name == server_name)
    }

    pub(crate) async fn cached_registry(&self) -> Option<Arc<Vec<AggregatedTool>>> {
        self.registry.read().await.clone()
    }

    pub(crate) async fn store_registry(&self, registry: Arc<Vec<AggregatedTool>>) {
        *self.registry.write().await = Some(registry);
    }
}

/// Pool status for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub idle: usize,
    pub active: usize,
    pub active_session_ids: Vec<String>,
    pub idle_namespace_uuids: Vec<Uuid>,
    pub idle_server_uuids: Vec<Uuid>,
}

/// Idle/active pool of composed namespace sessions.
pub struct NamespacePool {
    repo: Arc<dyn Repository>,
    servers: Arc<McpServerPool>,
    idle: Mutex<HashMap<Uuid, Arc<NamespaceSession>>>,
    active: Mutex<HashMap<String, Arc<NamespaceSession>>>,
    /// Per-namespace build/invalidate locks. Never held across anything but
    /// the build itself; in-flight calls on existing sessions are unaffected.
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl NamespacePool {
    pub fn new(repo: Arc<dyn Repository>, servers: Arc<McpServerPool>) -> Self {
        Self {
            repo,
            servers,
            idle: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn namespace_lock(&self, namespace_uuid: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(namespace_uuid)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn build_session(&self, namespace_uuid: Uuid) -> Result<Arc<NamespaceSession>> {
        let namespace = self.repo.get_namespace(namespace_uuid).await?;
        let memberships = self.repo.list_namespace_servers(namespace_uuid).await?;

        let mut members = Vec::new();
        for (server, status) in memberships {
            if status != MembershipStatus::Active {
                continue;
            }
            match self.servers.acquire(&server).await {
                Ok(client) => members.push(MemberServer { server, client }),
                Err(err) => {
                    // Roll back the refcounts taken so far.
                    for member in &members {
                        self.servers.release(member.server.uuid);
                    }
                    return Err(err);
                }
            }
        }

        debug!(
            target: "metamcp::pool",
            namespace = %namespace.name,
            members = members.len(),
            "composed session built"
        );
        Ok(Arc::new(NamespaceSession::new(namespace, members)))
    }

    fn release_members(&self, session: &NamespaceSession) {
        for member in session.members() {
            self.servers.release(member.server.uuid);
        }
    }

    /// Make sure the namespace has an idle slot, building one if missing.
    /// There is never more than one idle entry per namespace.
    pub async fn ensure_idle(&self, namespace_uuid: Uuid) -> Result<()> {
        let lock = self.namespace_lock(namespace_uuid);
        let _guard = lock.lock().await;
        if self.idle.lock().contains_key(&namespace_uuid) {
            return Ok(());
        }
        let session = self.build_session(namespace_uuid).await?;
        self.idle.lock().insert(namespace_uuid, session);
        Ok(())
    }

    /// Fire-and-forget idle construction; failures are logged, never
    /// propagated to the control-plane operation that triggered them.
    pub fn ensure_idle_background(self: &Arc<Self>, namespace_uuid: Uuid) {
        let pool = self.clone();
        tokio::spawn(async move {
            if let Err(err) = pool.ensure_idle(namespace_uuid).await {
                error!(
                    target: "metamcp::pool",
                    namespace = %namespace_uuid,
                    error = %err,
                    "background idle construction failed"
                );
            }
        });
    }

    /// Hand a composed session to a downstream attach: the idle slot if one
    /// is ready, otherwise a fresh build. A replacement idle slot is built in
    /// the background.
    pub async fn checkout(
        self: &Arc<Self>,
        namespace_uuid: Uuid,
        session_id: &str,
    ) -> Result<Arc<NamespaceSession>> {
        let session = {
            let lock = self.namespace_lock(namespace_uuid);
            let _guard = lock.lock().await;
            let idle_session = self.idle.lock().remove(&namespace_uuid);
            match idle_session {
                Some(session) => session,
                None => self.build_session(namespace_uuid).await?,
            }
        };
        self.active
            .lock()
            .insert(session_id.to_string(), session.clone());
        self.ensure_idle_background(namespace_uuid);
        info!(
            target: "metamcp::pool",
            namespace = %session.namespace.name,
            session_id,
            "session checked out"
        );
        Ok(session)
    }

    /// Borrow the idle session without activating it (control-plane reads
    /// such as `refresh_tools`).
    pub async fn idle_session(&self, namespace_uuid: Uuid) -> Result<Arc<NamespaceSession>> {
        let lock = self.namespace_lock(namespace_uuid);
        let _guard = lock.lock().await;
        if let Some(session) = self.idle.lock().get(&namespace_uuid) {
            return Ok(session.clone());
        }
        let session = self.build_session(namespace_uuid).await?;
        self.idle.lock().insert(namespace_uuid, session.clone());
        Ok(session)
    }

    /// Downstream detached: drop the active entry and its upstream refs.
    pub fn release_session(&self, session_id: &str) {
        if let Some(session) = self.active.lock().remove(session_id) {
            debug!(
                target: "metamcp::pool",
                namespace = %session.namespace.name,
                session_id,
                "session released"
            );
            self.release_members(&session);
        }
    }

    /// Tear down the idle slot; the next attach rebuilds against fresh
    /// config. Active sessions are left untouched.
    pub async fn invalidate_idle(&self, namespace_uuid: Uuid) {
        let lock = self.namespace_lock(namespace_uuid);
        let _guard = lock.lock().await;
        if let Some(session) = self.idle.lock().remove(&namespace_uuid) {
            info!(
                target: "metamcp::pool",
                namespace = %session.namespace.name,
                "idle session invalidated"
            );
            self.release_members(&session);
        }
    }

    /// Namespace deleted: same teardown as invalidation, plus the lock entry.
    pub async fn cleanup_namespace(&self, namespace_uuid: Uuid) {
        self.invalidate_idle(namespace_uuid).await;
        self.locks.lock().remove(&namespace_uuid);
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self.idle.lock();
        let active = self.active.lock();
        let mut active_session_ids: Vec<String> = active.keys().cloned().collect();
        active_session_ids.sort();
        let mut idle_namespace_uuids: Vec<Uuid> = idle.keys().copied().collect();
        idle_namespace_uuids.sort();
        PoolStatus {
            idle: idle.len(),
            active: active.len(),
            active_session_ids,
            idle_namespace_uuids,
            idle_server_uuids: self.servers.connected_servers(),
        }
    }
}
