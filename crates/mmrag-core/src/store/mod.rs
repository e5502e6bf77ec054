//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait defines every storage operation the ingestion
//! and retrieval pipeline needs, enabling pluggable backends (SQLite,
//! in-memory, remote vector databases).
//!
//! Implementations must be `Send + Sync` and must make each document's
//! entries change as a single unit: a concurrent [`search`](VectorIndex::search)
//! sees either the previous generation of a document or the new one,
//! never a mix.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::IndexError;
use crate::models::{ChunkModality, Document, IndexEntry, SpaceVersion};

/// Restricts search and count candidates before ranking.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    pub document_id: Option<String>,
    pub modality: Option<ChunkModality>,
    /// Drops entries of this modality; combines with `modality`.
    pub exclude_modality: Option<ChunkModality>,
    pub filename: Option<String>,
    /// Only entries embedded in this space. Search already scopes by the
    /// request's space, so this matters for counts.
    pub space: Option<SpaceVersion>,
}

impl MetadataFilter {
    pub fn document(id: &str) -> Self {
        Self {
            document_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn modality(modality: ChunkModality) -> Self {
        Self {
            modality: Some(modality),
            ..Default::default()
        }
    }

    pub fn excluding(mut self, modality: ChunkModality) -> Self {
        self.exclude_modality = Some(modality);
        self
    }

    pub fn in_space(mut self, space: &SpaceVersion) -> Self {
        self.space = Some(space.clone());
        self
    }

    /// Whether an entry passes every set field of the filter.
    pub fn matches(&self, entry: &IndexEntry) -> bool {
        self.document_id
            .as_deref()
            .is_none_or(|id| entry.metadata.document_id == id)
            && self.modality.is_none_or(|m| entry.metadata.modality == m)
            && self
                .exclude_modality
                .is_none_or(|m| entry.metadata.modality != m)
            && self
                .filename
                .as_deref()
                .is_none_or(|f| entry.metadata.filename == f)
            && self.space.as_ref().is_none_or(|s| entry.space == *s)
    }
}

/// Bundles the inputs of a single nearest-neighbor query.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub vector: &'a [f32],
    /// Only entries embedded in this space are candidates.
    pub space: &'a SpaceVersion,
    pub k: usize,
    pub filter: &'a MetadataFilter,
}

/// A ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub entry: IndexEntry,
    /// Cosine similarity in `[-1.0, 1.0]`; higher is closer.
    pub score: f64,
}

/// Counts reported by [`VectorIndex::stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub entries: usize,
    pub entries_by_modality: BTreeMap<String, usize>,
    pub entries_by_space: BTreeMap<String, usize>,
}

impl IndexStats {
    /// Entries embedded in any space other than `current`; these need a
    /// re-index before they can be searched again.
    pub fn stale_entries(&self, current: &SpaceVersion) -> usize {
        self.entries_by_space
            .iter()
            .filter(|(space, _)| space.as_str() != current.as_str())
            .map(|(_, n)| *n)
            .sum()
    }
}

/// Abstract vector index backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Atomically replace a document and all its entries |
/// | [`search`](VectorIndex::search) | k-NN search by cosine similarity |
/// | [`delete`](VectorIndex::delete) | Remove a document and all its entries |
/// | [`get_document`](VectorIndex::get_document) | Look up a document record |
/// | [`list_documents`](VectorIndex::list_documents) | All document records, newest first |
/// | [`count_entries`](VectorIndex::count_entries) | Count entries passing a filter |
/// | [`stats`](VectorIndex::stats) | Totals by modality and space |
/// | [`reset`](VectorIndex::reset) | Drop every document and entry |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Store `document` and replace every entry it previously owned with
    /// `entries`, as one unit relative to readers.
    ///
    /// Every entry must belong to `document` and `(document_id, sequence)`
    /// must be unique within `entries`.
    async fn upsert(&self, document: &Document, entries: &[IndexEntry]) -> Result<(), IndexError>;

    /// Return up to `k` entries closest to the query vector, best first.
    ///
    /// Ties on score are broken by insertion order (earlier first).
    async fn search(&self, request: &SearchRequest<'_>) -> Result<Vec<SearchHit>, IndexError>;

    /// Remove the document and all of its entries.
    ///
    /// Returns `true` if anything was deleted; deleting an unknown id is a
    /// no-op.
    async fn delete(&self, document_id: &str) -> Result<bool, IndexError>;

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, IndexError>;

    async fn list_documents(&self) -> Result<Vec<Document>, IndexError>;

    async fn count_entries(&self, filter: &MetadataFilter) -> Result<usize, IndexError>;

    async fn stats(&self) -> Result<IndexStats, IndexError>;

    /// Remove every document and entry as one unit. Returns how many
    /// documents were dropped.
    async fn reset(&self) -> Result<usize, IndexError>;
}

/// Reject batches that would break the per-document invariants.
///
/// Shared by backends so every implementation enforces the same rules.
pub fn validate_batch(document: &Document, entries: &[IndexEntry]) -> Result<(), IndexError> {
    let mut seen = std::collections::HashSet::new();
    let dims = entries.first().map(|e| e.vector.len());
    for entry in entries {
        if entry.chunk.document_id != document.id || entry.metadata.document_id != document.id {
            return Err(IndexError::ConsistencyViolation {
                document_id: document.id.clone(),
                detail: format!("entry {} belongs to another document", entry.chunk.id),
            });
        }
        if !seen.insert(entry.chunk.sequence) {
            return Err(IndexError::ConsistencyViolation {
                document_id: document.id.clone(),
                detail: format!("duplicate chunk sequence {}", entry.chunk.sequence),
            });
        }
        if let Some(expected) = dims {
            if entry.vector.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: entry.vector.len(),
                });
            }
        }
    }
    Ok(())
}

/// Sort hits best-first with insertion order as the tie-breaker, then
/// truncate to `k`.
///
/// `hits` pairs each hit with its insertion sequence.
pub fn rank_hits(mut hits: Vec<(u64, SearchHit)>, k: usize) -> Vec<SearchHit> {
    hits.sort_by(|(seq_a, a), (seq_b, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(seq_a.cmp(seq_b))
    });
    hits.truncate(k);
    hits.into_iter().map(|(_, h)| h).collect()
}
