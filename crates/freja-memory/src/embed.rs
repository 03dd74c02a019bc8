// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: MIT
//! Embedding providers.
//!
//! Two implementations, one scoring path: both return L2-normalized
//! vectors, so cosine scoring never needs to know which produced them.
//! The hash embedder is fully deterministic and dependency-free; it is
//! what unit tests and keyless deployments run on.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

/// Dimensionality of the fallback hash embedding.
pub const HASH_DIMENSIONS: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

// ─── Deterministic fallback ───────────────────────────────────────────────────

/// Character-trigram hashing embedder.
///
/// Every trigram is hashed with the rolling `hash = ((hash << 5) - hash) + c`
/// scheme, bumps `vec[|hash| % 384]` by one, and the vector is
/// L2-normalized at the end.
#[derive(Default)]
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn embed_one(text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; HASH_DIMENSIONS];
        let chars: Vec<char> = text.chars().collect();
        if chars.is_empty() {
            return vec;
        }
        let window = 3.min(chars.len());
        for tri in chars.windows(window) {
            let mut hash: i32 = 0;
            for &c in tri {
                hash = hash
                    .wrapping_shl(5)
                    .wrapping_sub(hash)
                    .wrapping_add(c as i32);
            }
            vec[hash.unsigned_abs() as usize % HASH_DIMENSIONS] += 1.0;
        }
        l2_normalize(&mut vec);
        vec
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }
}

// ─── Hosted embedder ──────────────────────────────────────────────────────────

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_MODEL: &str = "text-embedding-3-small";

/// OpenAI-compatible hosted embeddings endpoint.
pub struct HostedEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl HostedEmbedder {
    pub fn new(api_key: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            model: DEFAULT_MODEL.to_string(),
            api_key: api_key.into(),
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HostedEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await?
            .error_for_status()?
            .json::<EmbeddingsResponse>()
            .await?;
        let mut vectors: Vec<Vec<f32>> =
            response.data.into_iter().map(|d| d.embedding).collect();
        if vectors.len() != texts.len() {
            anyhow::bail!(
                "embeddings endpoint returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            );
        }
        for v in &mut vectors {
            l2_normalize(v);
        }
        Ok(vectors)
    }
}

// ─── Scoring ──────────────────────────────────────────────────────────────────

pub fn l2_normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity; tolerant of zero vectors (score 0).
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
