//! FNV-1a feature-hashing embedder
//!
//! Not semantic: texts sharing words land close together, which is enough for lexical
//! hit tests and for running the pipeline without a model server.

use async_trait::async_trait;
use unicode_segmentation::UnicodeSegmentation;

use super::embedding::EmbeddingProvider;
use crate::error::{Error, Result};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Deterministic hashing embedder
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Embed without going through the async trait
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimensions];

        for word in text.unicode_words() {
            let token = word.to_lowercase();
            let hash = fnv1a_hash(token.as_bytes());
            let index = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 63) == 1 { 1.0 } else { -1.0 };
            embedding[index] += sign;
        }

        l2_normalize(embedding)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(Error::embedding("cannot embed empty text"));
        }
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "fnv-hash"
    }
}

fn fnv1a_hash(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed_sync("Rust ownership and borrowing");
        let b = embedder.embed_sync("rust Ownership and Borrowing");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let embedder = HashEmbedder::new(16);
        assert!(embedder.embed("   ").await.is_err());
    }
}
