//! Sentence embeddings for the knowledge base.
//!
//! Two providers implement [`EmbeddingProvider`]:
//!
//! - `local`: all-MiniLM-L6-v2 through ONNX Runtime (needs `medimimes model download`)
//! - `hashed`: feature-hashed bag of words, no model files, used in tests and
//!   as a fallback when the model is absent
//!
//! Both emit L2-normalized vectors of [`EMBEDDING_DIM`] floats so they can
//! share the `kb_vec` table.

pub mod hashed;
pub mod local;

use anyhow::Result;

/// Width of every stored vector.
pub const EMBEDDING_DIM: usize = 384;

/// Synchronous text encoder. Async callers go through `spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Identifier recorded in `schema_meta` so a model switch can be detected.
    fn model_name(&self) -> &str;
}

/// Build the provider named in config.
///
/// With `local`, a missing model falls back to `hashed` and logs a warning
/// rather than refusing to start.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => match local::LocalEmbeddingProvider::new(config) {
            Ok(provider) => Ok(Box::new(provider)),
            Err(e) => {
                tracing::warn!(error = %e, "local embedding model unavailable, using hashed embeddings");
                Ok(Box::new(hashed::HashedEmbeddingProvider::new()))
            }
        },
        "hashed" => Ok(Box::new(hashed::HashedEmbeddingProvider::new())),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, hashed"),
    }
}

/// Scale `v` to unit length in place. Zero vectors are left alone.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Dot product; equals cosine similarity for normalized inputs.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
