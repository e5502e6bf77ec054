//! Ingestion coordinator.
//!
//! Drives one document through
//! `Validating → Chunking → Embedding → Storing → Committed`, ending in
//! `Rejected`, `PartiallyCommitted`, or `Degraded` when something fails:
//!
//! - **Validating**: size limit, non-empty, modality resolution
//!   (declared → filename extension → magic bytes) against the configured
//!   set. Failures are `Rejected`.
//! - **Dedup**: identical bytes already `Committed` return immediately,
//!   unless their entries were embedded in another space; those are
//!   re-embedded and replaced.
//! - **Chunking**: container decoding in [`crate::extract`], windowing in
//!   [`mmrag_core::chunk`]. Per-page and per-image failures are warnings.
//! - **Embedding**: distinct chunk contents are embedded once each,
//!   concurrently up to `ingest.embed_concurrency`, with retries. A chunk
//!   the encoder cannot interpret is dropped with a warning; an encoder that
//!   stays unavailable degrades the whole document.
//! - **Storing**: one transactional upsert, then a read-back count. A
//!   mismatch is compensated by deleting the document and storing it once
//!   more.
//!
//! Work on a single document id is serialized by a keyed async lock, so
//! concurrent uploads of the same bytes (or a removal racing an upload)
//! never interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use mmrag_core::chunk::{ChunkBuilder, ChunkingParams};
use mmrag_core::embedding::{embed_chunk, Embedder};
use mmrag_core::error::{
    EmbeddingError, ExtractionWarning, IndexError, ValidationError, WarningStage,
};
use mmrag_core::models::{
    document_id_for, Chunk, Document, IndexEntry, IngestionResult, IngestionStatus, Modality,
};
use mmrag_core::store::{MetadataFilter, VectorIndex};

use crate::config::Config;
use crate::extract::{decode_text, extract_pdf, prepare_image};
use crate::retry::{with_retry, RetryPolicy};

/// Async mutexes keyed by string id.
///
/// Entries nobody holds or waits on are pruned on the next acquisition.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|k, m| k == key || Arc::strong_count(m) > 1);
            locks.entry(key.to_string()).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Chunks produced from one document, before embedding.
struct Prepared {
    chunks: Vec<Chunk>,
    page_count: Option<u32>,
    warnings: Vec<ExtractionWarning>,
}

pub struct IngestionCoordinator {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    params: ChunkingParams,
    max_file_bytes: u64,
    modalities: Vec<Modality>,
    embed_concurrency: usize,
    embed_retry: RetryPolicy,
    index_retry: RetryPolicy,
    locks: KeyedLocks,
}

impl IngestionCoordinator {
    pub fn new(config: &Config, index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            index,
            embedder,
            params: config.chunking.params(),
            max_file_bytes: config.ingest.max_file_bytes,
            modalities: config.ingest.modalities.clone(),
            embed_concurrency: config.ingest.embed_concurrency.max(1),
            embed_retry: RetryPolicy::new(
                config.embedding.max_retries,
                config.embedding.backoff_base_ms,
                config.embedding.timeout_secs,
            ),
            index_retry: RetryPolicy::INDEX,
            locks: KeyedLocks::new(),
        }
    }

    /// Override the index retry policy.
    pub fn with_index_retry(mut self, policy: RetryPolicy) -> Self {
        self.index_retry = policy;
        self
    }

    /// Ingest one document. Every outcome, including rejection, is reported
    /// through the returned [`IngestionResult`].
    pub async fn ingest(
        &self,
        bytes: &[u8],
        filename: &str,
        declared: Option<Modality>,
    ) -> IngestionResult {
        let document_id = document_id_for(bytes);
        debug!(%document_id, filename, state = "validating", "ingest");

        let modality = match self.validate(bytes, filename, declared) {
            Ok(modality) => modality,
            Err(e) => {
                info!(%document_id, filename, reason = %e, "document rejected");
                return IngestionResult::rejected(&document_id, e.to_string());
            }
        };

        let _guard = self.locks.lock(&document_id).await;

        match self.find_committed(&document_id).await {
            Ok(Some(existing)) => {
                info!(%document_id, filename, "identical document already committed");
                return IngestionResult {
                    status: IngestionStatus::Committed,
                    document_id,
                    chunks_committed: existing.chunk_count,
                    deduplicated: true,
                    warnings: Vec::new(),
                    reason: None,
                };
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%document_id, error = %e, "index unavailable during dedup check");
                return IngestionResult::degraded(&document_id, e.to_string(), Vec::new());
            }
        }

        debug!(%document_id, state = "chunking", "ingest");
        let prepared = match self.prepare(bytes, filename, modality, &document_id).await {
            Ok(prepared) => prepared,
            Err(e) => {
                info!(%document_id, filename, reason = %e, "document rejected");
                return IngestionResult::rejected(&document_id, e.to_string());
            }
        };
        let Prepared {
            chunks,
            page_count,
            mut warnings,
        } = prepared;

        debug!(%document_id, chunks = chunks.len(), state = "embedding", "ingest");
        let embedded = match self.embed_all(chunks, &mut warnings).await {
            Ok(embedded) => embedded,
            Err(e) => {
                warn!(%document_id, error = %e, "embedding backend unavailable; nothing stored");
                return IngestionResult::degraded(&document_id, e.to_string(), warnings);
            }
        };

        if embedded.is_empty() {
            info!(%document_id, filename, "no chunk survived embedding");
            let mut result =
                IngestionResult::rejected(&document_id, ValidationError::NoChunks.to_string());
            result.warnings = warnings;
            return result;
        }

        let status = if warnings.is_empty() {
            IngestionStatus::Committed
        } else {
            IngestionStatus::PartiallyCommitted
        };
        let document = Document {
            id: document_id.clone(),
            filename: filename.to_string(),
            modality,
            size_bytes: bytes.len() as u64,
            uploaded_at: chrono::Utc::now().timestamp(),
            page_count,
            status,
            chunk_count: embedded.len(),
        };
        let space = self.embedder.space();
        let entries: Vec<IndexEntry> = embedded
            .into_iter()
            .map(|(chunk, vector)| IndexEntry::new(&document, chunk, vector, space.clone()))
            .collect();

        debug!(%document_id, entries = entries.len(), state = "storing", "ingest");
        if let Err(e) = self.store(&document, &entries).await {
            warn!(%document_id, error = %e, "store failed; document degraded");
            return IngestionResult::degraded(&document_id, e.to_string(), warnings);
        }

        info!(
            %document_id,
            filename,
            status = status.as_str(),
            chunks = entries.len(),
            warnings = warnings.len(),
            "document committed"
        );
        IngestionResult {
            status,
            document_id,
            chunks_committed: entries.len(),
            deduplicated: false,
            warnings,
            reason: None,
        }
    }

    /// Remove a document and all of its entries. Returns whether anything
    /// was removed.
    pub async fn remove(&self, document_id: &str) -> Result<bool, IndexError> {
        let _guard = self.locks.lock(document_id).await;
        let removed = with_retry(&self.index_retry, "index delete", || {
            self.index.delete(document_id)
        })
        .await?;
        if removed {
            info!(document_id, "document removed");
        }
        Ok(removed)
    }

    fn validate(
        &self,
        bytes: &[u8],
        filename: &str,
        declared: Option<Modality>,
    ) -> Result<Modality, ValidationError> {
        let size = bytes.len() as u64;
        if size > self.max_file_bytes {
            return Err(ValidationError::TooLarge {
                size,
                limit: self.max_file_bytes,
            });
        }
        if bytes.is_empty() {
            return Err(ValidationError::Empty);
        }
        let modality = declared
            .or_else(|| Modality::from_filename(filename))
            .or_else(|| Modality::sniff(bytes))
            .ok_or_else(|| ValidationError::UnsupportedModality(filename.to_string()))?;
        if !self.modalities.contains(&modality) {
            return Err(ValidationError::UnsupportedModality(format!(
                "{} ({} is not enabled)",
                filename,
                modality.as_str()
            )));
        }
        Ok(modality)
    }

    /// The stored document, if it is fully committed and every one of its
    /// entries is searchable in the current embedding space.
    async fn find_committed(&self, document_id: &str) -> Result<Option<Document>, IndexError> {
        let existing = with_retry(&self.index_retry, "index lookup", || {
            self.index.get_document(document_id)
        })
        .await?;
        let Some(document) = existing.filter(|d| d.status == IngestionStatus::Committed) else {
            return Ok(None);
        };

        let space = self.embedder.space();
        let filter = MetadataFilter::document(document_id).in_space(&space);
        let current = with_retry(&self.index_retry, "index count", || {
            self.index.count_entries(&filter)
        })
        .await?;
        if current != document.chunk_count {
            info!(
                document_id,
                %space,
                current,
                expected = document.chunk_count,
                "stored entries are from another embedding space; re-embedding"
            );
            return Ok(None);
        }
        Ok(Some(document))
    }

    async fn prepare(
        &self,
        bytes: &[u8],
        filename: &str,
        modality: Modality,
        document_id: &str,
    ) -> Result<Prepared, ValidationError> {
        let owned = bytes.to_vec();
        let filename = filename.to_string();
        let document_id = document_id.to_string();
        let params = self.params;

        // Decoding PDFs and images is CPU-bound.
        let prepared = tokio::task::spawn_blocking(move || {
            chunk_document(&owned, &filename, modality, &document_id, &params)
        })
        .await
        .map_err(|e| ValidationError::CorruptDocument(format!("extraction task failed: {}", e)))??;

        if prepared.chunks.is_empty() {
            return Err(ValidationError::NoChunks);
        }
        Ok(prepared)
    }

    /// Embed every chunk, keeping document order. Chunks sharing a content
    /// hash share one encoder call.
    async fn embed_all(
        &self,
        chunks: Vec<Chunk>,
        warnings: &mut Vec<ExtractionWarning>,
    ) -> Result<Vec<(Chunk, Vec<f32>)>, EmbeddingError> {
        let mut distinct: Vec<Chunk> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for chunk in &chunks {
            if seen.insert(chunk.hash.as_str()) {
                distinct.push(chunk.clone());
            }
        }

        // Each embedding future owns its chunk and encoder handle so the
        // whole ingestion stays `Send`.
        let policy = self.embed_retry;
        let results: Vec<(String, Result<Vec<f32>, EmbeddingError>)> = stream::iter(distinct)
            .map(|chunk| {
                let embedder = Arc::clone(&self.embedder);
                async move {
                    let result = with_retry(&policy, "embed chunk", || {
                        embed_chunk(embedder.as_ref(), &chunk)
                    })
                    .await;
                    (chunk.hash, result)
                }
            })
            .buffer_unordered(self.embed_concurrency)
            .collect()
            .await;

        let mut vectors: HashMap<String, Result<Vec<f32>, EmbeddingError>> =
            HashMap::with_capacity(results.len());
        for (hash, result) in results {
            if let Err(e @ EmbeddingError::Unavailable(_)) = &result {
                return Err(e.clone());
            }
            vectors.insert(hash, result);
        }

        let mut embedded = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match vectors.get(&chunk.hash) {
                Some(Ok(vector)) => {
                    let vector = vector.clone();
                    embedded.push((chunk, vector));
                }
                Some(Err(e)) => {
                    debug!(chunk_id = %chunk.id, error = %e, "chunk skipped");
                    let mut warning = ExtractionWarning::new(WarningStage::Embedding, e.to_string())
                        .item(chunk.sequence);
                    if let Some(page) = chunk.page_number {
                        warning = warning.on_page(page);
                    }
                    warnings.push(warning);
                }
                None => {}
            }
        }
        Ok(embedded)
    }

    /// Upsert, verify, and compensate once on a mismatch.
    async fn store(&self, document: &Document, entries: &[IndexEntry]) -> Result<(), IndexError> {
        let filter = MetadataFilter::document(&document.id);
        for attempt in 1..=2 {
            with_retry(&self.index_retry, "index upsert", || {
                self.index.upsert(document, entries)
            })
            .await?;

            let stored = with_retry(&self.index_retry, "index count", || {
                self.index.count_entries(&filter)
            })
            .await?;
            if stored == entries.len() {
                return Ok(());
            }

            error!(
                document_id = %document.id,
                expected = entries.len(),
                stored,
                attempt,
                "consistency violation after upsert; removing document"
            );
            with_retry(&self.index_retry, "index delete", || {
                self.index.delete(&document.id)
            })
            .await?;
        }

        Err(IndexError::ConsistencyViolation {
            document_id: document.id.clone(),
            detail: "entry count did not match after re-store".to_string(),
        })
    }
}

/// Decode `bytes` and cut them into chunks.
fn chunk_document(
    bytes: &[u8],
    filename: &str,
    modality: Modality,
    document_id: &str,
    params: &ChunkingParams,
) -> Result<Prepared, ValidationError> {
    let mut builder = ChunkBuilder::new(document_id);
    let mut warnings = Vec::new();
    let mut page_count = None;

    match modality {
        Modality::Text => {
            let (text, warning) = decode_text(bytes);
            warnings.extend(warning);
            builder.push_text(&text, params, None);
        }
        Modality::Image => {
            let image = prepare_image(bytes)?;
            builder.push_image(
                &image.bytes,
                image.mime,
                format!("Image: {}", filename),
                None,
                None,
            );
        }
        Modality::Pdf => {
            let pdf = extract_pdf(bytes)?;
            page_count = Some(pdf.page_count);
            warnings = pdf.warnings;
            for page in pdf.pages {
                builder.push_text(&page.text, params, Some(page.number));
                for (index, image) in page.images {
                    builder.push_image(
                        &image.bytes,
                        image.mime,
                        format!("Image from {}, page {}, image {}", filename, page.number, index),
                        Some(page.number),
                        Some(index),
                    );
                }
            }
        }
    }

    Ok(Prepared {
        chunks: builder.finish(),
        page_count,
        warnings,
    })
}
