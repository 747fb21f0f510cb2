//! Feature-hashed bag-of-words embeddings.
//!
//! Each lowercase alphanumeric token (and each adjacent token pair) is hashed
//! with SHA-256 into one of [`EMBEDDING_DIM`] buckets with a sign bit. Texts
//! sharing vocabulary land close together, which is enough for keyword-heavy
//! medical notes and keeps tests free of model downloads.

use anyhow::Result;
use sha2::{Digest, Sha256};

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};

#[derive(Debug, Default, Clone)]
pub struct HashedEmbeddingProvider;

impl HashedEmbeddingProvider {
    pub fn new() -> Self {
        Self
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn bucket(feature: &str) -> (usize, f32) {
    let digest = Sha256::digest(feature.as_bytes());
    let idx = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % EMBEDDING_DIM;
    let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
    (idx, sign)
}

impl EmbeddingProvider for HashedEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        let toks = tokens(text);
        for tok in &toks {
            let (i, s) = bucket(tok);
            v[i] += s;
        }
        for pair in toks.windows(2) {
            let (i, s) = bucket(&format!("{} {}", pair[0], pair[1]));
            v[i] += 0.5 * s;
        }
        l2_normalize(&mut v);
        Ok(v)
    }

    fn model_name(&self) -> &str {
        "hashed-bow-384"
    }
}
