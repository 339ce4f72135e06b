//! Embedding provider port and the deterministic offline implementation.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use metamcp_core::Result;

/// Text handed to the embedder for one tool.
///
/// Kept in one place so index entries and queries agree on the format.
pub fn embedding_text(
    server_name: &str,
    tool_name: &str,
    title: Option<&str>,
    description: Option<&str>,
) -> String {
    let mut text = format!("Server: {server_name}. Tool: {tool_name}.");
    if let Some(title) = title {
        text.push_str(&format!(" Title: {title}."));
    }
    text.push_str(&format!(
        " Description: {}",
        description.unwrap_or("No description")
    ));
    text
}

/// Embedding provider.
///
/// Vectors are normalized and of a fixed dimension. Implementations that load
/// a model lazily must share one loading future between concurrent callers;
/// the index calls `embed` from several tasks at once.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Dimension of every vector this provider returns.
    fn dimension(&self) -> usize;

    /// Embed one text. The returned vector has unit length.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Deterministic hashing embedder.
///
/// Buckets hashed character trigrams into a fixed-dimension vector and
/// normalizes it. No model download, no randomness: the same text always maps
/// to the same vector, which is what the search tests rely on. Real
/// deployments plug a model-backed [`Embedder`] in instead.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub const DEFAULT_DIMENSION: usize = 384;

    pub fn new() -> Self {
        Self::with_dimension(Self::DEFAULT_DIMENSION)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self { dimension }
    }

    fn bucket(&self, trigram: &str) -> usize {
        let digest = Sha256::digest(trigram.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(raw) % self.dimension as u64) as usize
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();
        for window in chars.windows(3) {
            let trigram: String = window.iter().collect();
            vector[self.bucket(&trigram)] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}
