//! Shared test doubles and fixtures for integration tests.
//!
//! The stub embedder hashes words into a fixed-dimension bag-of-words
//! vector: deterministic, unit-norm, and similar texts get similar vectors,
//! which is all the retrieval pipeline needs to be exercised end to end
//! without model files.

use nexus_core::chunking::HeuristicSizer;
use nexus_core::embedding::Embedder;
use nexus_core::error::EmbeddingError;
use nexus_core::rerank::CrossEncoder;
use nexus_core::{Nexus, NexusConfig};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const STUB_MODEL_ID: &str = "stub-embedder";
pub const STUB_DIM: usize = 64;

/// Deterministic bag-of-words embedder.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self { dim: STUB_DIM }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for token in tokenize(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let idx = (hasher.finish() % self.dim as u64) as usize;
            v[idx] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        } else {
            v[0] = 1.0;
        }
        v
    }
}

impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        STUB_MODEL_ID
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Embedder that burns wall-clock time before answering, for exercising the
/// per-query deadline.
pub struct SlowEmbedder {
    delay: Duration,
    inner: HashEmbedder,
}

impl SlowEmbedder {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: HashEmbedder::new(),
        }
    }
}

impl Embedder for SlowEmbedder {
    fn model_id(&self) -> &str {
        STUB_MODEL_ID
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        std::thread::sleep(self.delay);
        self.inner.embed_batch(texts)
    }
}

/// Reranker scoring by query-token overlap.
pub struct OverlapReranker;

impl CrossEncoder for OverlapReranker {
    fn model_id(&self) -> &str {
        "stub-reranker"
    }

    fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, EmbeddingError> {
        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
        Ok(passages
            .iter()
            .map(|p| {
                if query_tokens.is_empty() {
                    return 0.0;
                }
                let passage_tokens: HashSet<String> = tokenize(p).into_iter().collect();
                let overlap = query_tokens.intersection(&passage_tokens).count();
                overlap as f32 / query_tokens.len() as f32
            })
            .collect())
    }
}

/// Reranker that blocks past any reasonable budget.
pub struct SleepyReranker {
    pub delay: Duration,
}

impl CrossEncoder for SleepyReranker {
    fn model_id(&self) -> &str {
        "sleepy-reranker"
    }

    fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, EmbeddingError> {
        std::thread::sleep(self.delay);
        OverlapReranker.score(query, passages)
    }
}

pub fn test_config(dir: &Path) -> NexusConfig {
    let mut config = NexusConfig::with_data_dir(dir);
    config.embedding.model_id = STUB_MODEL_ID.to_string();
    // Keep overlap small relative to the short fixture sections so each
    // chunk is dominated by its own content.
    config.chunking.overlap_tokens = 10;
    config
}

pub async fn open_nexus(dir: &Path) -> Nexus {
    open_nexus_with_config(test_config(dir)).await
}

pub async fn open_nexus_with_config(config: NexusConfig) -> Nexus {
    Nexus::with_components(
        config,
        Arc::new(HashEmbedder::new()),
        Some(Arc::new(OverlapReranker)),
        Arc::new(HeuristicSizer),
    )
    .await
    .expect("nexus should start")
}

/// Six headings -> six chunks with the default chunker.
pub const MACHINE_LEARNING_MD: &str = "\
---
tags: [ai]
---

# Machine Learning

Machine learning is a subfield of artificial intelligence focused on
algorithms that improve automatically through experience.

## Overview

Instead of explicit programming, models learn statistical patterns directly
from example data.

## Types of Machine Learning

Supervised learning uses labeled examples to train predictive models.
Unsupervised learning discovers hidden structure in unlabeled data.
Reinforcement learning optimizes behavior through reward signals.

## Applications

Neural networks power recommendation engines, fraud detection, and medical
imaging systems in production today.

## Evaluation

Held-out validation sets measure how well a model generalizes beyond its
training distribution.

## Limitations

Bias present in training data propagates into model predictions and can be
hard to detect after deployment.
";

pub const PYTHON_PROGRAMMING_MD: &str = "\
---
tags: [tutorial]
---

# Python Programming

Python is a high-level language prized for readability and a huge package
ecosystem.

## Basics

Variables, loops, and functions form the core of the language; indentation
defines block structure.

## Best Practices

The PEP 8 style guide defines naming and layout conventions for Python
code. Following PEP 8 keeps large codebases consistent.

## Libraries

Frameworks like PyTorch make it straightforward to build neural networks
directly in Python.
";
