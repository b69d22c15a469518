use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use async_trait::async_trait;
use common::{
    error::AppError,
    types::{Record, Tensor},
};

use super::{EmbeddingService, EncodedBatch};

/// Deterministic per-residue encoder: each residue is bucketed together with its
/// neighbours, so identical local contexts produce identical rows.
#[derive(Debug, Clone)]
pub struct HashedEncoder {
    dimension: usize,
}

impl HashedEncoder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, sequence: &str) -> Result<Tensor, AppError> {
        let residues: Vec<char> = sequence.chars().collect();
        let rows = (0..residues.len())
            .map(|position| residue_vector(&residues, position, self.dimension))
            .collect::<Vec<_>>();
        if rows.is_empty() {
            return Tensor::new(vec![0, self.dimension], Vec::new());
        }
        Tensor::from_rows(rows)
    }
}

#[async_trait]
impl EmbeddingService for HashedEncoder {
    fn backend_label(&self) -> &str {
        "hashed"
    }

    async fn encode(&self, records: &[Record]) -> Result<EncodedBatch, AppError> {
        let mut embeddings = Vec::with_capacity(records.len());
        let mut attentions = Vec::with_capacity(records.len());
        for record in records {
            let embedding = self.embed(&record.sequence)?;
            attentions.push(attention(&embedding)?);
            embeddings.push(embedding);
        }
        Ok(EncodedBatch {
            embeddings,
            attentions,
            peak_device_memory_mb: None,
        })
    }
}

fn residue_vector(residues: &[char], position: usize, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension];
    let start = position.saturating_sub(1);
    let end = position.saturating_add(2).min(residues.len());

    let unigram: String = residues.get(position).into_iter().collect();
    let window: String = residues.get(start..end).unwrap_or_default().iter().collect();
    for token in [unigram, window] {
        if let Some(slot) = vector.get_mut(bucket(&token, dimension)) {
            *slot += 1.0;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

/// Row-normalised similarity between residue rows; uniform when a row has no overlap.
fn attention(embedding: &Tensor) -> Result<Tensor, AppError> {
    let width = embedding.shape().get(1).copied().unwrap_or(0);
    if width == 0 {
        return Tensor::new(vec![0, 0], Vec::new());
    }
    let rows: Vec<&[f32]> = embedding.data().chunks(width).collect();
    #[allow(clippy::cast_precision_loss)]
    let uniform = 1.0 / rows.len() as f32;

    let matrix = rows
        .iter()
        .map(|left| {
            let scores: Vec<f32> = rows
                .iter()
                .map(|right| left.iter().zip(right.iter()).map(|(a, b)| a * b).sum())
                .collect();
            let total: f32 = scores.iter().sum();
            if total > 0.0 {
                scores.into_iter().map(|score| score / total).collect()
            } else {
                vec![uniform; scores.len()]
            }
        })
        .collect();
    Tensor::from_rows(matrix)
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    #[allow(clippy::cast_possible_truncation)]
    let hash = hasher.finish() as usize;
    hash % dimension
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn encodes_one_row_per_residue() {
        let encoder = HashedEncoder::new(16);
        let records = vec![Record::new("a", "MKV"), Record::new("b", "GG")];

        let batch = encoder.encode(&records).await.unwrap();

        assert_eq!(batch.embeddings.len(), 2);
        assert_eq!(batch.embeddings[0].shape(), &[3, 16]);
        assert_eq!(batch.attentions[0].shape(), &[3, 3]);
        assert_eq!(batch.embeddings[1].shape(), &[2, 16]);
        batch.ensure_aligned(records.len()).unwrap();
    }

    #[tokio::test]
    async fn attention_rows_sum_to_one() {
        let encoder = HashedEncoder::new(8);
        let batch = encoder.encode(&[Record::new("a", "MKVLA")]).await.unwrap();

        for row in batch.attentions[0].data().chunks(5) {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-4, "row sums to {total}");
        }
    }

    #[tokio::test]
    async fn encoding_is_deterministic() {
        let encoder = HashedEncoder::new(8);
        let records = [Record::new("a", "MKTAYIAKQR")];
        let first = encoder.encode(&records).await.unwrap();
        let second = encoder.encode(&records).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn empty_sequence_yields_empty_tensors() {
        let encoder = HashedEncoder::new(4);
        let batch = encoder.encode(&[Record::new("empty", "")]).await.unwrap();
        assert_eq!(batch.embeddings[0].shape(), &[0, 4]);
        assert_eq!(batch.attentions[0].shape(), &[0, 0]);
    }
}
