//! Embedder trait and vector utilities.
//!
//! Defines the [`Embedder`] trait that every dual-encoder backend
//! implements, plus pure helpers for vector serialization, normalization,
//! and similarity computation.
//!
//! The text path and the image path are different functions, but both
//! must land in the same space (identified by [`Embedder::space`]) so
//! that a text query can retrieve image chunks and vice versa.
//!
//! Concrete backends (local CLIP via fastembed, HTTP) live in the `mmrag`
//! app crate.

use async_trait::async_trait;

use crate::chunk::decode_image_payload;
use crate::error::EmbeddingError;
use crate::models::{Chunk, ChunkContent, SpaceVersion};

/// A dual encoder mapping text and images into one shared vector space.
///
/// Calls are stateless; implementations must be safe to invoke
/// concurrently.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Tag of the space this encoder produces vectors in.
    fn space(&self) -> SpaceVersion;

    /// Vector dimensionality (e.g. `512` for CLIP ViT-B/32).
    fn dims(&self) -> usize;

    /// Embed a piece of text (chunk content or a query).
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed raw encoded image bytes (PNG, JPEG, ...).
    async fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError>;
}

/// Embed a chunk through the encoder matching its content.
///
/// A vector of the wrong length is reported as
/// [`EmbeddingError::InvalidContent`].
pub async fn embed_chunk(
    embedder: &dyn Embedder,
    chunk: &Chunk,
) -> Result<Vec<f32>, EmbeddingError> {
    let vector = match &chunk.content {
        ChunkContent::Text(text) => embedder.embed_text(text).await?,
        ChunkContent::Image { .. } => {
            let bytes = decode_image_payload(&chunk.content).ok_or_else(|| {
                EmbeddingError::InvalidContent("image payload is not valid base64".to_string())
            })?;
            embedder.embed_image(&bytes).await?
        }
    };
    check_dims(embedder.dims(), vector)
}

/// Embed a query string into the shared space.
pub async fn embed_query(embedder: &dyn Embedder, query: &str) -> Result<Vec<f32>, EmbeddingError> {
    let vector = embedder.embed_text(query).await?;
    check_dims(embedder.dims(), vector)
}

fn check_dims(expected: usize, vector: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
    if vector.len() != expected {
        return Err(EmbeddingError::InvalidContent(format!(
            "encoder returned {} dimensions, expected {}",
            vector.len(),
            expected
        )));
    }
    Ok(vector)
}

/// Scale a vector to unit length. Zero vectors are returned unchanged.
pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        return vector.to_vec();
    }
    vector.iter().map(|v| v / norm).collect()
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// # Example
///
/// ```rust
/// use mmrag_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or
/// vectors of different lengths.
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
