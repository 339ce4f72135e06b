//! Live downstream session registry.
//!
//! Tracks which downstream clients are currently attached, by endpoint and
//! transport. Sessions are added on transport handshake and removed on
//! disconnect; both operations are idempotent so transport-layer retries
//! cannot skew the counts.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use metamcp_core::{LiveSession, SessionTransport};

/// Registry of currently attached downstream sessions.
#[derive(Default)]
pub struct LiveSessionRegistry {
    sessions: RwLock<HashMap<String, LiveSession>>,
}

/// Per-transport counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportCounts {
    #[serde(rename = "SSE")]
    pub sse: usize,
    #[serde(rename = "StreamableHTTP")]
    pub streamable_http: usize,
}

impl TransportCounts {
    fn bump(&mut self, transport: SessionTransport) {
        match transport {
            SessionTransport::Sse => self.sse += 1,
            SessionTransport::StreamableHttp => self.streamable_http += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.sse + self.streamable_http
    }
}

/// Counts for one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub count: usize,
    pub by_transport: TransportCounts,
}

/// Snapshot of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub by_transport: TransportCounts,
    /// Sorted by `count` descending.
    pub by_endpoint: Vec<EndpointStats>,
}

impl LiveSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Repeated adds with the same id are a no-op.
    pub fn add(&self, session: LiveSession) {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.session_id) {
            warn!(
                target: "metamcp::sessions",
                session_id = %session.session_id,
                "session already registered, ignoring duplicate add"
            );
            return;
        }
        debug!(
            target: "metamcp::sessions",
            session_id = %session.session_id,
            endpoint = %session.endpoint_name,
            transport = session.transport.label(),
            "session attached"
        );
        sessions.insert(session.session_id.clone(), session);
    }

    /// Remove a session. Absent ids are ignored.
    pub fn remove(&self, session_id: &str) {
        if self.sessions.write().remove(session_id).is_some() {
            debug!(
                target: "metamcp::sessions",
                session_id = %session_id,
                "session detached"
            );
        }
    }

    pub fn get(&self, session_id: &str) -> Option<LiveSession> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn total(&self) -> usize {
        self.sessions.read().len()
    }

    /// Aggregate view, endpoints sorted by session count descending.
    pub fn stats(&self) -> SessionStats {
        let sessions = self.sessions.read();
        let mut by_transport = TransportCounts::default();
        let mut per_endpoint: HashMap<&str, TransportCounts> = HashMap::new();
        for session in sessions.values() {
            by_transport.bump(session.transport);
            per_endpoint
                .entry(session.endpoint_name.as_str())
                .or_default()
                .bump(session.transport);
        }

        let mut by_endpoint: Vec<EndpointStats> = per_endpoint
            .into_iter()
            .map(|(endpoint, counts)| EndpointStats {
                endpoint: endpoint.to_string(),
                count: counts.total(),
                by_transport: counts,
            })
            .collect();
        by_endpoint.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.endpoint.cmp(&b.endpoint)));

        SessionStats {
            total: sessions.len(),
            by_transport,
            by_endpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn session(id: &str, endpoint: &str, transport: SessionTransport) -> LiveSession {
        LiveSession {
            session_id: id.into(),
            endpoint_name: endpoint.into(),
            namespace_uuid: Uuid::new_v4(),
            transport,
        }
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let registry = LiveSessionRegistry::new();
        registry.add(session("a", "dev", SessionTransport::Sse));
        registry.add(session("a", "dev", SessionTransport::Sse));
        assert_eq!(registry.total(), 1);

        registry.remove("a");
        registry.remove("a");
        registry.remove("never-existed");
        assert_eq!(registry.total(), 0);
    }

    #[test]
    fn totals_line_up_across_views() {
        let registry = LiveSessionRegistry::new();
        registry.add(session("a", "dev", SessionTransport::Sse));
        registry.add(session("b", "dev", SessionTransport::StreamableHttp));
        registry.add(session("c", "prod", SessionTransport::StreamableHttp));

        let stats = registry.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_transport.total(), stats.total);
        assert_eq!(
            stats.by_endpoint.iter().map(|e| e.count).sum::<usize>(),
            stats.total
        );
    }

    #[test]
    fn endpoints_sort_by_count_descending() {
        let registry = LiveSessionRegistry::new();
        registry.add(session("a", "small", SessionTransport::Sse));
        registry.add(session("b", "big", SessionTransport::Sse));
        registry.add(session("c", "big", SessionTransport::StreamableHttp));

        let stats = registry.stats();
        assert_eq!(stats.by_endpoint[0].endpoint, "big");
        assert_eq!(stats.by_endpoint[0].count, 2);
        assert_eq!(stats.by_endpoint[0].by_transport.sse, 1);
        assert_eq!(stats.by_endpoint[0].by_transport.streamable_http, 1);
        assert_eq!(stats.by_endpoint[1].endpoint, "small");
    }

    #[test]
    fn removed_endpoint_disappears_from_stats() {
        let registry = LiveSessionRegistry::new();
        registry.add(session("a", "dev", SessionTransport::Sse));
        registry.remove("a");
        assert!(registry.stats().by_endpoint.is_empty());
        assert!(registry.get("a").is_none());
    }
}
