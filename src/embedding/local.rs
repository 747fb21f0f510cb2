//! all-MiniLM-L6-v2 via ONNX Runtime.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::{Encoding, Tokenizer};

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};
use crate::config::EmbeddingConfig;

/// Knowledge chunks are ~500 chars, well under this.
const MAX_SEQ_LEN: usize = 256;

pub const MODEL_FILE: &str = "model.onnx";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

pub struct LocalEmbeddingProvider {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    model: String,
}

// Safety: Tokenizer is Send + Sync and the Session is only reached through the Mutex.
unsafe impl Send for LocalEmbeddingProvider {}
unsafe impl Sync for LocalEmbeddingProvider {}

/// Paths of the model and tokenizer inside the configured cache dir.
pub fn model_files(config: &EmbeddingConfig) -> (PathBuf, PathBuf) {
    let dir = crate::config::expand_tilde(&config.cache_dir);
    (dir.join(MODEL_FILE), dir.join(TOKENIZER_FILE))
}

fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    let mut tokenizer =
        Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;
    tokenizer
        .with_truncation(Some(tokenizers::TruncationParams {
            max_length: MAX_SEQ_LEN,
            ..Default::default()
        }))
        .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;
    tokenizer.with_padding(Some(tokenizers::PaddingParams {
        strategy: tokenizers::PaddingStrategy::BatchLongest,
        ..Default::default()
    }));
    Ok(tokenizer)
}

impl LocalEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model_path, tokenizer_path) = model_files(config);
        anyhow::ensure!(
            model_path.exists() && tokenizer_path.exists(),
            "embedding model not found in {}. Run `medimimes model download` first.",
            crate::config::expand_tilde(&config.cache_dir).display()
        );

        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(&model_path)
            .context("failed to load ONNX model")?;
        let tokenizer = load_tokenizer(&tokenizer_path)?;

        tracing::info!(model = %config.model, dir = %config.cache_dir, "local embedding model loaded");
        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            model: config.model.clone(),
        })
    }
}

/// Flatten a padded batch into `[batch, seq]` i64 rows.
fn batch_tensor(encodings: &[Encoding], field: fn(&Encoding) -> &[u32]) -> (Vec<i64>, Vec<i64>) {
    let seq_len = encodings.first().map_or(0, |e| e.get_ids().len());
    let flat = encodings
        .iter()
        .flat_map(|e| field(e).iter().map(|&v| v as i64))
        .collect();
    (vec![encodings.len() as i64, seq_len as i64], flat)
}

/// Attention-weighted mean over the token axis of a `[batch, seq, dim]` tensor.
fn mean_pool(data: &[f32], mask: &[i64], batch: usize, seq: usize, dim: usize) -> Vec<Vec<f32>> {
    (0..batch)
        .map(|b| {
            let mut pooled = vec![0.0f32; dim];
            let mut weight = 0.0f32;
            for s in 0..seq {
                if mask[b * seq + s] == 0 {
                    continue;
                }
                let row = &data[(b * seq + s) * dim..(b * seq + s + 1) * dim];
                pooled.iter_mut().zip(row).for_each(|(p, x)| *p += x);
                weight += 1.0;
            }
            if weight > 0.0 {
                pooled.iter_mut().for_each(|p| *p /= weight);
            }
            l2_normalize(&mut pooled);
            pooled
        })
        .collect()
}

impl EmbeddingProvider for LocalEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])?
            .pop()
            .context("embedding batch returned no vectors")
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;

        let (shape, ids) = batch_tensor(&encodings, Encoding::get_ids);
        let (_, mask) = batch_tensor(&encodings, Encoding::get_attention_mask);
        let type_ids = vec![0i64; ids.len()];

        let input_ids = Tensor::from_array((shape.clone(), ids.into_boxed_slice()))?;
        let attention = Tensor::from_array((shape.clone(), mask.clone().into_boxed_slice()))?;
        let token_types = Tensor::from_array((shape.clone(), type_ids.into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs! {
            "input_ids" => input_ids,
            "attention_mask" => attention,
            "token_type_ids" => token_types,
        })?;

        let hidden = outputs
            .get("last_hidden_state")
            .or_else(|| outputs.get("token_embeddings"))
            .unwrap_or_else(|| &outputs[0]);
        let (out_shape, data) = hidden
            .try_extract_tensor::<f32>()
            .context("failed to read hidden states")?;
        let dims: &[i64] = &out_shape;
        anyhow::ensure!(
            dims.len() == 3 && dims[2] == EMBEDDING_DIM as i64,
            "unexpected hidden state shape {dims:?}"
        );

        Ok(mean_pool(
            data,
            &mask,
            dims[0] as usize,
            dims[1] as usize,
            EMBEDDING_DIM,
        ))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_pool_ignores_padding() {
        // batch 1, seq 3, dim 2; last token is padding
        let data = [1.0, 0.0, 3.0, 0.0, 100.0, 100.0];
        let mask = [1, 1, 0];
        let pooled = mean_pool(&data, &mask, 1, 3, 2);
        assert_eq!(pooled.len(), 1);
        assert!((pooled[0][0] - 1.0).abs() < 1e-6);
        assert!(pooled[0][1].abs() < 1e-6);
    }

    #[test]
    fn missing_model_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = EmbeddingConfig {
            cache_dir: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let err = LocalEmbeddingProvider::new(&config).err().unwrap();
        assert!(err.to_string().contains("model download"));
    }

    #[test]
    #[ignore] // needs `medimimes model download`
    fn encodes_related_sentences_closer() {
        let provider = LocalEmbeddingProvider::new(&EmbeddingConfig::default()).unwrap();
        let a = provider.embed("Take metformin with meals").unwrap();
        let b = provider.embed("Metformin should be taken with food").unwrap();
        let c = provider.embed("The train leaves at noon").unwrap();
        assert_eq!(a.len(), EMBEDDING_DIM);
        assert!(super::super::cosine(&a, &b) > super::super::cosine(&a, &c));
    }
}
