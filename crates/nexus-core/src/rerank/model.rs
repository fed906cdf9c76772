//! BERT cross-encoder with a single-logit classification head.
//!
//! Follows the BGE-reranker architecture: encode the pair, take the [CLS]
//! hidden state, apply a linear head, and calibrate with a sigmoid. The
//! model config is read from the checkpoint's `config.json`.

use super::CrossEncoder;
use crate::error::EmbeddingError;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config};
use std::path::Path;
use tokenizers::tokenizer::{
    EncodeInput, Tokenizer, TruncationDirection, TruncationParams, TruncationStrategy,
};
use tracing::info;

/// Pairs scored per forward pass.
const RERANK_BATCH: usize = 8;

pub struct BertCrossEncoder {
    model: BertModel,
    classifier: Linear,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
}

impl BertCrossEncoder {
    /// Loads weights, model config, and tokenizer from a checkpoint
    /// directory layout (`model.safetensors`, `config.json`,
    /// `tokenizer.json`).
    pub fn from_files(
        model_path: &Path,
        config_path: &Path,
        tokenizer_path: &Path,
        model_id: &str,
    ) -> Result<Self, EmbeddingError> {
        let model_bytes = std::fs::read(model_path).map_err(|e| {
            EmbeddingError::ModelLoad(format!("failed to read model {:?}: {}", model_path, e))
        })?;
        let config_bytes = std::fs::read(config_path).map_err(|e| {
            EmbeddingError::ModelLoad(format!("failed to read config {:?}: {}", config_path, e))
        })?;
        let config: Config = serde_json::from_slice(&config_bytes).map_err(|e| {
            EmbeddingError::ModelLoad(format!("invalid model config: {}", e))
        })?;

        let tokenizer_bytes = std::fs::read(tokenizer_path).map_err(|e| {
            EmbeddingError::ModelLoad(format!(
                "failed to read tokenizer {:?}: {}",
                tokenizer_path, e
            ))
        })?;
        let mut tokenizer = Tokenizer::from_bytes(tokenizer_bytes).map_err(|e| {
            EmbeddingError::ModelLoad(format!("failed to deserialize tokenizer: {}", e))
        })?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.max_position_embeddings,
                stride: 0,
                strategy: TruncationStrategy::LongestFirst,
                direction: TruncationDirection::Right,
            }))
            .map_err(|e| {
                EmbeddingError::InvalidConfig(format!("failed to configure truncation: {}", e))
            })?;

        let device = Device::Cpu;
        let vb = VarBuilder::from_buffered_safetensors(model_bytes, DType::F32, &device)
            .map_err(|e| EmbeddingError::ModelLoad(format!("failed to read safetensors: {}", e)))?;
        let model = BertModel::load(vb.pp("bert"), &config)
            .map_err(|e| EmbeddingError::ModelLoad(format!("failed to build model: {}", e)))?;
        let classifier = candle_nn::linear(config.hidden_size, 1, vb.pp("classifier"))
            .map_err(|e| EmbeddingError::ModelLoad(format!("failed to build classifier: {}", e)))?;

        info!("Cross-encoder '{}' ready", model_id);
        Ok(Self {
            model,
            classifier,
            tokenizer,
            device,
            model_id: model_id.to_string(),
        })
    }

    fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, EmbeddingError> {
        let mut encodings = Vec::with_capacity(passages.len());
        for passage in passages {
            let input: EncodeInput = (query.to_string(), passage.clone()).into();
            let encoding = self
                .tokenizer
                .encode(input, true)
                .map_err(|e| EmbeddingError::Tokenization(format!("pair encoding failed: {}", e)))?;
            encodings.push(encoding);
        }

        let max_len = encodings.iter().map(|e| e.get_ids().len()).max().unwrap_or(0);
        let batch = encodings.len();
        let mut ids = Vec::with_capacity(batch * max_len);
        let mut type_ids = Vec::with_capacity(batch * max_len);
        let mut mask = Vec::with_capacity(batch * max_len);
        for encoding in &encodings {
            let row_ids = encoding.get_ids();
            let row_types = encoding.get_type_ids();
            ids.extend_from_slice(row_ids);
            ids.extend(std::iter::repeat(0).take(max_len - row_ids.len()));
            type_ids.extend_from_slice(row_types);
            type_ids.extend(std::iter::repeat(0).take(max_len - row_types.len()));
            mask.extend(std::iter::repeat(1u32).take(row_ids.len()));
            mask.extend(std::iter::repeat(0u32).take(max_len - row_ids.len()));
        }

        let infer = |name: &str, e: candle_core::Error| {
            EmbeddingError::Inference(format!("{}: {}", name, e))
        };
        let input_ids = Tensor::from_vec(ids, (batch, max_len), &self.device)
            .map_err(|e| infer("input tensor", e))?;
        let token_type_ids = Tensor::from_vec(type_ids, (batch, max_len), &self.device)
            .map_err(|e| infer("type tensor", e))?;
        let attention_mask = Tensor::from_vec(mask, (batch, max_len), &self.device)
            .map_err(|e| infer("mask tensor", e))?;

        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))
            .map_err(|e| infer("forward pass", e))?;
        // [batch, hidden]: the [CLS] position
        let cls = hidden.i((.., 0)).map_err(|e| infer("cls slice", e))?;
        let logits = self
            .classifier
            .forward(&cls)
            .map_err(|e| infer("classifier", e))?;
        let scores = candle_nn::ops::sigmoid(&logits)
            .map_err(|e| infer("sigmoid", e))?
            .squeeze(1)
            .map_err(|e| infer("squeeze", e))?
            .to_vec1::<f32>()
            .map_err(|e| infer("extract scores", e))?;
        Ok(scores)
    }
}

impl CrossEncoder for BertCrossEncoder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, EmbeddingError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(passages.len());
        for group in passages.chunks(RERANK_BATCH) {
            out.extend(self.score_batch(query, group)?);
        }
        Ok(out)
    }
}
