//! Embedding engine trait and vector utilities.
//!
//! Defines the [`EmbeddingEngine`] trait used by the vector-bearing
//! strategies, the [`EmbeddingCache`] that keeps chunk vectors across
//! requests, and pure helpers for vector serialization and similarity.
//!
//! Concrete engines (OpenAI, Ollama) live in the `memory-agent` app crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MemoryResult;

/// A vector together with the model that produced it.
///
/// Vectors from different model versions are never compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model_version: String,
}

/// External service mapping text to a vector.
#[async_trait]
pub trait EmbeddingEngine: Send + Sync {
    /// Identifier of the model (e.g. `"text-embedding-3-small"`).
    fn model_version(&self) -> &str;

    /// Embed one piece of text.
    async fn embed(&self, text: &str) -> MemoryResult<Embedding>;
}

/// Chunk vectors keyed by content hash and model version.
///
/// A miss is not an error; the vector strategy computes and stores the
/// vector on demand.
#[async_trait]
pub trait EmbeddingCache: Send + Sync {
    async fn get(&self, content_hash: &str, model_version: &str) -> MemoryResult<Option<Vec<f32>>>;

    async fn put(&self, content_hash: &str, model_version: &str, vector: &[f32]) -> MemoryResult<()>;
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use memory_agent_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a BLOB produced by [`vec_to_blob`]. Trailing partial values are
/// ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-magnitude operand.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
