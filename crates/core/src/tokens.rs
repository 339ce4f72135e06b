//! Per-model token counting.
//!
//! Used to enforce the agent document budget and to pre-check ask-agent
//! prompt size before any LLM call. Encoders are expensive to construct, so
//! they are cached per model; unknown models fall back to the `o200k_base`
//! encoding.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tiktoken_rs::{get_bpe_from_model, o200k_base, CoreBPE};

use crate::error::{GatewayError, Result};

/// Combined token budget for an agent run and for an agent's document set.
pub const AGENT_TOKEN_BUDGET: usize = 200_000;

/// Cached per-model tokenizer.
pub struct TokenCounter {
    encoders: Mutex<HashMap<String, Arc<CoreBPE>>>,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            encoders: Mutex::new(HashMap::new()),
        }
    }

    /// Count tokens in `text` under `model`'s encoding.
    pub fn count(&self, model: &str, text: &str) -> Result<usize> {
        let bpe = self.encoder_for(model)?;
        Ok(bpe.encode_with_special_tokens(text).len())
    }

    /// Drop all cached encoders.
    pub fn clear(&self) {
        self.encoders.lock().clear();
    }

    fn encoder_for(&self, model: &str) -> Result<Arc<CoreBPE>> {
        if let Some(bpe) = self.encoders.lock().get(model) {
            return Ok(bpe.clone());
        }
        // Built outside the lock; construction can take a moment.
        let bpe = match get_bpe_from_model(model) {
            Ok(bpe) => bpe,
            Err(_) => o200k_base().map_err(GatewayError::internal)?,
        };
        let bpe = Arc::new(bpe);
        self.encoders
            .lock()
            .entry(model.to_string())
            .or_insert_with(|| bpe.clone());
        Ok(bpe)
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}
