//! Error taxonomy shared by every component.
//!
//! Errors are split by who can act on them:
//!
//! | Type | Retryable | Surfaces as |
//! |------|-----------|-------------|
//! | [`ValidationError`] | no | `IngestionStatus::Rejected` |
//! | [`ExtractionWarning`] | n/a | entry in `IngestionResult::warnings` |
//! | [`EmbeddingError::Unavailable`] | yes | retried, then `Degraded` |
//! | [`EmbeddingError::InvalidContent`] | no | per-chunk warning |
//! | [`GenerationError`] | `Unavailable` only | degraded answer |
//! | [`IndexError`] | `Backend` only | retried, then `Degraded` |
//!
//! Nothing in this module panics or crosses a component boundary as a raw
//! error: the ingestion coordinator and retrieval orchestrator fold every
//! variant into a structured result.

use serde::Serialize;
use thiserror::Error;

/// Input rejected before anything is written to the index.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported modality for '{0}'")]
    UnsupportedModality(String),

    #[error("corrupt document: {0}")]
    CorruptDocument(String),

    #[error("document is {size} bytes, limit is {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("document is empty")]
    Empty,

    #[error("document produced no chunks")]
    NoChunks,
}

/// Failure of the embedding backend for a single input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmbeddingError {
    /// Transient: network hiccup, rate limit, timeout, model not loaded.
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),

    /// The encoder cannot interpret this payload for its declared modality.
    #[error("invalid content for encoder: {0}")]
    InvalidContent(String),
}

impl EmbeddingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbeddingError::Unavailable(_))
    }
}

/// Failure of the text generation backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the request (bad model name, prompt too long).
    #[error("generation request rejected: {0}")]
    Rejected(String),
}

impl GenerationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerationError::Unavailable(_))
    }
}

/// Failure of the vector index backend.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index backend error: {0}")]
    Backend(#[from] anyhow::Error),

    /// The index holds a state no completed ingestion could have produced.
    #[error("consistency violation for document {document_id}: {detail}")]
    ConsistencyViolation { document_id: String, detail: String },

    #[error("vector has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl IndexError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexError::Backend(_))
    }
}

/// Where in the pipeline a partial failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningStage {
    TextExtraction,
    ImageExtraction,
    Embedding,
}

/// A non-fatal, per-item failure recorded during ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionWarning {
    pub stage: WarningStage,
    /// 1-based page number, for PDF items.
    pub page: Option<u32>,
    /// 1-based image index within the page, or the chunk sequence for
    /// embedding warnings.
    pub item: Option<u32>,
    pub message: String,
}

impl ExtractionWarning {
    pub fn new(stage: WarningStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            page: None,
            item: None,
            message: message.into(),
        }
    }

    pub fn on_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    pub fn item(mut self, item: u32) -> Self {
        self.item = Some(item);
        self
    }
}

impl std::fmt::Display for ExtractionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self.stage {
            WarningStage::TextExtraction => "text extraction",
            WarningStage::ImageExtraction => "image extraction",
            WarningStage::Embedding => "embedding",
        };
        write!(f, "{}", stage)?;
        if let Some(page) = self.page {
            write!(f, " (page {})", page)?;
        }
        if let Some(item) = self.item {
            write!(f, " (item {})", item)?;
        }
        write!(f, ": {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability() {
        assert!(EmbeddingError::Unavailable("x".into()).is_retryable());
        assert!(!EmbeddingError::InvalidContent("x".into()).is_retryable());
        assert!(GenerationError::Unavailable("x".into()).is_retryable());
        assert!(!GenerationError::Rejected("x".into()).is_retryable());
        assert!(IndexError::Backend(anyhow::anyhow!("db locked")).is_retryable());
        assert!(!IndexError::DimensionMismatch {
            expected: 512,
            actual: 3
        }
        .is_retryable());
    }

    #[test]
    fn warning_display_includes_location() {
        let w = ExtractionWarning::new(WarningStage::ImageExtraction, "bad jpeg")
            .on_page(3)
            .item(2);
        assert_eq!(w.to_string(), "image extraction (page 3) (item 2): bad jpeg");
    }
}
