//! JinaBERT embedding model via Candle.
//!
//! JinaBERT is a BERT-family encoder with ALiBi positional embeddings.
//! Inference runs in F32 (candle's jina_bert hardcodes F32 for the ALiBi
//! bias). Batched inputs are padded to the longest sequence in the batch;
//! token embeddings are mean-pooled and L2-normalized.

use super::tokenizer::TokenizerHandle;
use super::Embedder;
use crate::error::EmbeddingError;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Activation, VarBuilder};
use candle_transformers::models::jina_bert::{BertModel, Config, PositionEmbeddingType};
use std::path::Path;
use tracing::info;

/// Model hyperparameters. Defaults match jina-embeddings-v2-small-en.
#[derive(Debug, Clone)]
pub struct JinaBertConfig {
    pub model_id: String,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    /// Max texts per forward pass
    pub batch_size: usize,
}

impl Default for JinaBertConfig {
    fn default() -> Self {
        Self {
            model_id: "jinaai/jina-embeddings-v2-small-en".to_string(),
            hidden_size: 512,
            num_hidden_layers: 4,
            num_attention_heads: 8,
            intermediate_size: 2048,
            max_position_embeddings: 8192,
            batch_size: 32,
        }
    }
}

/// Candle-backed embedder. Loaded once at startup; reentrant thereafter.
pub struct JinaBertEmbedder {
    model: BertModel,
    tokenizer: TokenizerHandle,
    config: JinaBertConfig,
    device: Device,
}

impl JinaBertEmbedder {
    /// Loads model weights (safetensors) and tokenizer from disk.
    pub fn from_files(
        model_path: &Path,
        tokenizer_path: &Path,
        config: JinaBertConfig,
    ) -> Result<Self, EmbeddingError> {
        let model_bytes = std::fs::read(model_path).map_err(|e| {
            EmbeddingError::ModelLoad(format!("failed to read model {:?}: {}", model_path, e))
        })?;
        let tokenizer =
            TokenizerHandle::from_file(tokenizer_path, config.max_position_embeddings)?;
        Self::from_bytes(model_bytes, tokenizer, config)
    }

    /// Builds the model from safetensors bytes and a configured tokenizer.
    pub fn from_bytes(
        model_bytes: Vec<u8>,
        tokenizer: TokenizerHandle,
        config: JinaBertConfig,
    ) -> Result<Self, EmbeddingError> {
        info!(
            "Loading embedding model '{}' ({:.2} MB)",
            config.model_id,
            model_bytes.len() as f64 / 1_000_000.0
        );
        let device = select_device();
        let vocab_size = tokenizer.vocab_size();

        let model_config = Config::new(
            vocab_size,
            config.hidden_size,
            config.num_hidden_layers,
            config.num_attention_heads,
            config.intermediate_size,
            Activation::Gelu,
            config.max_position_embeddings,
            2,     // type_vocab_size
            0.02,  // initializer_range
            1e-12, // layer_norm_eps
            0,     // pad_token_id
            PositionEmbeddingType::Alibi,
        );

        let vb = VarBuilder::from_buffered_safetensors(model_bytes, DType::F32, &device)
            .map_err(|e| EmbeddingError::ModelLoad(format!("failed to read safetensors: {}", e)))?;
        let model = BertModel::new(vb, &model_config)
            .map_err(|e| EmbeddingError::ModelLoad(format!("failed to build model: {}", e)))?;
        info!("Embedding model ready on {:?}", device);

        Ok(Self {
            model,
            tokenizer,
            config,
            device,
        })
    }

    pub fn config(&self) -> &JinaBertConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &TokenizerHandle {
        &self.tokenizer
    }

    /// Runs one padded forward pass over up to `batch_size` token
    /// sequences.
    fn forward_batch(&self, batch: &[Vec<u32>]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let max_len = batch.iter().map(|ids| ids.len()).max().unwrap_or(0);
        let padded: Vec<u32> = batch
            .iter()
            .flat_map(|ids| {
                let mut row = ids.clone();
                row.resize(max_len, 0);
                row
            })
            .collect();

        let input = Tensor::from_vec(padded, (batch.len(), max_len), &self.device)
            .map_err(|e| EmbeddingError::Inference(format!("failed to build input tensor: {}", e)))?;

        // [batch, seq, hidden]
        let hidden = self
            .model
            .forward(&input)
            .map_err(|e| EmbeddingError::Inference(format!("forward pass failed: {}", e)))?;
        let (_batch, n_tokens, _hidden) = hidden
            .dims3()
            .map_err(|e| EmbeddingError::Inference(format!("unexpected output shape: {}", e)))?;

        let pooled = mean_pool(&hidden, n_tokens)?;
        let normalized = normalize_l2(&pooled)?;

        let mut out = Vec::with_capacity(batch.len());
        for i in 0..batch.len() {
            let row = normalized
                .get(i)
                .map_err(|e| EmbeddingError::Inference(format!("failed to index row {}: {}", i, e)))?
                .to_vec1::<f32>()
                .map_err(|e| EmbeddingError::Inference(format!("failed to extract row: {}", e)))?;
            out.push(row);
        }
        Ok(out)
    }
}

impl Embedder for JinaBertEmbedder {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn dimension(&self) -> usize {
        self.config.hidden_size
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut token_batches: Vec<Vec<u32>> = Vec::with_capacity(texts.len());
        for text in texts {
            token_batches.push(self.tokenizer.tokenize(text)?);
        }

        let mut out = Vec::with_capacity(texts.len());
        for group in token_batches.chunks(self.config.batch_size.max(1)) {
            out.extend(self.forward_batch(group)?);
        }
        Ok(out)
    }
}

/// Mean pooling across the token dimension.
fn mean_pool(hidden: &Tensor, n_tokens: usize) -> Result<Tensor, EmbeddingError> {
    hidden
        .sum(1)
        .map_err(|e| EmbeddingError::Inference(format!("failed to sum: {}", e)))?
        .affine(1.0 / n_tokens as f64, 0.0)
        .map_err(|e| EmbeddingError::Inference(format!("failed to scale: {}", e)))
}

/// L2 normalization to unit vectors.
fn normalize_l2(v: &Tensor) -> Result<Tensor, EmbeddingError> {
    v.broadcast_div(
        &v.sqr()
            .map_err(|e| EmbeddingError::Inference(format!("failed to square: {}", e)))?
            .sum_keepdim(1)
            .map_err(|e| EmbeddingError::Inference(format!("failed to sum: {}", e)))?
            .sqrt()
            .map_err(|e| EmbeddingError::Inference(format!("failed to sqrt: {}", e)))?,
    )
    .map_err(|e| EmbeddingError::Inference(format!("failed to normalize: {}", e)))
}

/// Best available device: CUDA, then Metal, then CPU.
fn select_device() -> Device {
    if let Ok(device) = Device::new_cuda(0) {
        info!("Using CUDA GPU");
        return device;
    }
    if let Ok(device) = Device::new_metal(0) {
        info!("Using Metal GPU");
        return device;
    }
    info!("Using CPU");
    Device::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_invalid_bytes_fails() {
        // Not a safetensors file; tokenizer construction also fails cleanly
        let err = TokenizerHandle::from_bytes(vec![1, 2, 3], 512).unwrap_err();
        assert!(matches!(err, EmbeddingError::ModelLoad(_)));
    }

    #[test]
    fn test_default_config() {
        let config = JinaBertConfig::default();
        assert_eq!(config.hidden_size, 512);
        assert_eq!(config.batch_size, 32);
    }
}
