//! Per-namespace vector index with incremental re-indexing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::warn;
use uuid::Uuid;

use metamcp_core::{content_hash, GatewayError, Result};

use crate::embedder::{embedding_text, Embedder};

/// Similarity floor below which search hits are dropped.
pub const DEFAULT_SEARCH_THRESHOLD: f32 = 0.3;

/// How many embeddings run in parallel during indexing.
const EMBED_BATCH: usize = 5;

/// One aggregated tool as the index sees it.
#[derive(Debug, Clone)]
pub struct ToolSummary {
    /// `serverName__toolName`.
    pub full_name: String,
    pub server_name: String,
    pub original_name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Clone)]
struct IndexedTool {
    server_name: String,
    original_name: String,
    description: Option<String>,
    input_schema: Value,
    embedding: Vec<f32>,
    content_hash: String,
}

/// One search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub full_name: String,
    pub server_name: String,
    pub original_name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub score: f32,
}

/// Counts exposed for diagnostics and the smart-discovery usage payload.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub namespaces: usize,
    pub total_tools: usize,
    pub tools_by_namespace: HashMap<Uuid, usize>,
}

/// Per-namespace in-memory vector index.
///
/// `index_tools` is incremental: tools whose content hash is unchanged keep
/// their cached embedding. Callers launch it in the background and do not
/// await it; failures are logged, never surfaced.
pub struct DiscoveryIndex {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<HashMap<Uuid, HashMap<String, IndexedTool>>>,
    /// Serializes indexing per namespace; a re-entrant call waits, then sees
    /// fresh hashes and embeds nothing.
    indexing: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl DiscoveryIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(HashMap::new()),
            indexing: Mutex::new(HashMap::new()),
        }
    }

    fn namespace_lock(&self, namespace_uuid: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.indexing
            .lock()
            .entry(namespace_uuid)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// (Re-)index a namespace's tools.
    ///
    /// Embeds only tools whose content hash changed, at most [`EMBED_BATCH`]
    /// in parallel. Entries for tools no longer listed are dropped. A tool
    /// whose embedding fails is skipped with a warning; the rest of the batch
    /// still lands.
    pub async fn index_tools(&self, namespace_uuid: Uuid, tools: Vec<ToolSummary>) -> Result<()> {
        let lock = self.namespace_lock(namespace_uuid);
        let _guard = lock.lock().await;

        let listed: Vec<(ToolSummary, String)> = tools
            .into_iter()
            .map(|tool| {
                let hash = content_hash(
                    &tool.original_name,
                    tool.title.as_deref(),
                    tool.description.as_deref(),
                );
                (tool, hash)
            })
            .collect();

        let changed: Vec<(ToolSummary, String)> = {
            let entries = self.entries.read();
            let existing = entries.get(&namespace_uuid);
            listed
                .iter()
                .filter(|(tool, hash)| {
                    existing
                        .and_then(|map| map.get(&tool.full_name))
                        .map(|entry| entry.content_hash != *hash)
                        .unwrap_or(true)
                })
                .cloned()
                .collect()
        };

        let mut embedded: Vec<(ToolSummary, String, Vec<f32>)> = Vec::with_capacity(changed.len());
        for batch in changed.chunks(EMBED_BATCH) {
            let mut join_set = JoinSet::new();
            for (tool, hash) in batch.iter().cloned() {
                let embedder = self.embedder.clone();
                let text = embedding_text(
                    &tool.server_name,
                    &tool.original_name,
                    tool.title.as_deref(),
                    tool.description.as_deref(),
                );
                join_set.spawn(async move {
                    let vector = embedder.embed(&text).await;
                    (tool, hash, vector)
                });
            }
            while let Some(joined) = join_set.join_next().await {
                let (tool, hash, vector) = joined.map_err(GatewayError::internal)?;
                match vector {
                    Ok(vector) => embedded.push((tool, hash, vector)),
                    Err(err) => warn!(
                        target: "metamcp::discovery",
                        tool = %tool.full_name,
                        error = %err,
                        "skipping tool whose embedding failed"
                    ),
                }
            }
        }

        let mut entries = self.entries.write();
        let map = entries.entry(namespace_uuid).or_default();
        // Drop stale entries for tools the namespace no longer lists.
        let listed_names: std::collections::HashSet<&str> =
            listed.iter().map(|(t, _)| t.full_name.as_str()).collect();
        map.retain(|name, _| listed_names.contains(name.as_str()));
        for (tool, hash, embedding) in embedded {
            map.insert(
                tool.full_name,
                IndexedTool {
                    server_name: tool.server_name,
                    original_name: tool.original_name,
                    description: tool.description,
                    input_schema: tool.input_schema,
                    embedding,
                    content_hash: hash,
                },
            );
        }
        Ok(())
    }

    /// Cosine search over one namespace's cached vectors.
    ///
    /// Hits below `threshold` are dropped; the rest are sorted by score
    /// descending and truncated to `limit`.
    pub async fn search(
        &self,
        namespace_uuid: Uuid,
        query: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        let query_vector = self.embedder.embed(query).await?;

        let mut hits: Vec<SearchHit> = {
            let entries = self.entries.read();
            let Some(map) = entries.get(&namespace_uuid) else {
                return Ok(Vec::new());
            };
            map.iter()
                .filter_map(|(full_name, entry)| {
                    let score = cosine_similarity(&query_vector, &entry.embedding);
                    (score >= threshold).then(|| SearchHit {
                        full_name: full_name.clone(),
                        server_name: entry.server_name.clone(),
                        original_name: entry.original_name.clone(),
                        description: entry.description.clone(),
                        input_schema: entry.input_schema.clone(),
                        score,
                    })
                })
                .collect()
        };

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.full_name.cmp(&b.full_name))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Number of indexed tools for one namespace.
    pub fn namespace_size(&self, namespace_uuid: Uuid) -> usize {
        self.entries
            .read()
            .get(&namespace_uuid)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> IndexStats {
        let entries = self.entries.read();
        let tools_by_namespace: HashMap<Uuid, usize> =
            entries.iter().map(|(ns, map)| (*ns, map.len())).collect();
        IndexStats {
            namespaces: entries.len(),
            total_tools: tools_by_namespace.values().sum(),
            tools_by_namespace,
        }
    }

    pub fn clear_namespace(&self, namespace_uuid: Uuid) {
        self.entries.write().remove(&namespace_uuid);
        self.indexing.lock().remove(&namespace_uuid);
    }

    pub fn clear_all(&self) {
        self.entries.write().clear();
        self.indexing.lock().clear();
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
