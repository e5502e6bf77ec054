//! In-memory [`VectorIndex`] implementation for testing and embedding.
//!
//! Documents and entries live behind a single `std::sync::RwLock`, so an
//! upsert (remove old generation + insert new one) is one critical section
//! and readers never observe a half-replaced document. Search is
//! brute-force cosine similarity over the candidate entries.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::IndexError;
use crate::models::{Document, IndexEntry};

use super::{
    rank_hits, validate_batch, IndexStats, MetadataFilter, SearchHit, SearchRequest, VectorIndex,
};

struct StoredEntry {
    /// Global insertion sequence, used to break score ties.
    seq: u64,
    entry: IndexEntry,
}

#[derive(Default)]
struct State {
    docs: HashMap<String, Document>,
    entries: Vec<StoredEntry>,
    next_seq: u64,
}

/// In-memory vector index.
#[derive(Default)]
pub struct InMemoryIndex {
    state: RwLock<State>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, IndexError> {
        self.state
            .read()
            .map_err(|_| IndexError::Backend(anyhow::anyhow!("index lock poisoned")))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, IndexError> {
        self.state
            .write()
            .map_err(|_| IndexError::Backend(anyhow::anyhow!("index lock poisoned")))
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, document: &Document, entries: &[IndexEntry]) -> Result<(), IndexError> {
        validate_batch(document, entries)?;
        let mut state = self.write()?;
        state
            .entries
            .retain(|se| se.entry.metadata.document_id != document.id);
        for entry in entries {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push(StoredEntry {
                seq,
                entry: entry.clone(),
            });
        }
        state.docs.insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn search(&self, request: &SearchRequest<'_>) -> Result<Vec<SearchHit>, IndexError> {
        if request.k == 0 {
            return Ok(Vec::new());
        }
        let state = self.read()?;
        let hits: Vec<(u64, SearchHit)> = state
            .entries
            .iter()
            .filter(|se| se.entry.space == *request.space && request.filter.matches(&se.entry))
            .map(|se| {
                let score = cosine_similarity(request.vector, &se.entry.vector) as f64;
                (
                    se.seq,
                    SearchHit {
                        entry: se.entry.clone(),
                        score,
                    },
                )
            })
            .collect();
        Ok(rank_hits(hits, request.k))
    }

    async fn delete(&self, document_id: &str) -> Result<bool, IndexError> {
        let mut state = self.write()?;
        let before = state.entries.len();
        state
            .entries
            .retain(|se| se.entry.metadata.document_id != document_id);
        let removed_entries = state.entries.len() != before;
        let removed_doc = state.docs.remove(document_id).is_some();
        Ok(removed_entries || removed_doc)
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, IndexError> {
        Ok(self.read()?.docs.get(document_id).cloned())
    }

    async fn list_documents(&self) -> Result<Vec<Document>, IndexError> {
        let state = self.read()?;
        let mut docs: Vec<Document> = state.docs.values().cloned().collect();
        docs.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn count_entries(&self, filter: &MetadataFilter) -> Result<usize, IndexError> {
        let state = self.read()?;
        Ok(state
            .entries
            .iter()
            .filter(|se| filter.matches(&se.entry))
            .count())
    }

    async fn stats(&self) -> Result<IndexStats, IndexError> {
        let state = self.read()?;
        let mut by_modality: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_space: BTreeMap<String, usize> = BTreeMap::new();
        for se in &state.entries {
            *by_modality
                .entry(se.entry.metadata.modality.to_string())
                .or_default() += 1;
            *by_space.entry(se.entry.space.to_string()).or_default() += 1;
        }
        Ok(IndexStats {
            documents: state.docs.len(),
            entries: state.entries.len(),
            entries_by_modality: by_modality,
            entries_by_space: by_space,
        })
    }

    async fn reset(&self) -> Result<usize, IndexError> {
        let mut state = self.write()?;
        let documents = state.docs.len();
        state.docs.clear();
        state.entries.clear();
        Ok(documents)
    }
}
