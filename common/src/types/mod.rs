pub mod tensor;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use tensor::{StoredValue, Tensor};

/// One identifier/sequence pair read from a FASTA source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub identifier: String,
    pub sequence: String,
}

impl Record {
    pub fn new(identifier: impl Into<String>, sequence: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            sequence: sequence.into(),
        }
    }

    /// Sequence length in characters (residues), not bytes.
    pub fn residue_count(&self) -> usize {
        self.sequence.chars().count()
    }
}

/// Zero-based position of a batch in processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchIndex(u64);

impl BatchIndex {
    pub const FIRST: Self = Self(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for BatchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category of per-record encoder output, persisted and aggregated independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Embeddings,
    Attention,
}

impl ResultKind {
    pub const ALL: [Self; 2] = [Self::Embeddings, Self::Attention];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Embeddings => "embeddings",
            Self::Attention => "attention",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
