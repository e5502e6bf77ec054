//! SQLite-backed [`VectorIndex`] implementation.
//!
//! Documents live in `documents`, chunks with their vectors in
//! `index_entries` (see [`crate::migrate`]). Every upsert and delete runs
//! in one transaction, so with WAL readers see either the previous
//! generation of a document or the new one.
//!
//! Search is brute-force cosine similarity over the candidate rows of the
//! query's embedding space, ranked in Rust with the row's `seq` as the
//! tie-breaker.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;

use mmrag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use mmrag_core::error::IndexError;
use mmrag_core::models::{
    CharSpan, Chunk, ChunkContent, ChunkModality, Document, EntryMetadata, IndexEntry,
    IngestionStatus, Modality, SpaceVersion,
};
use mmrag_core::store::{
    rank_hits, validate_batch, IndexStats, MetadataFilter, SearchHit, SearchRequest, VectorIndex,
};

/// SQLite implementation of the [`VectorIndex`] trait.
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn upsert_inner(&self, doc: &Document, entries: &[IndexEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM index_entries WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, filename, modality, size_bytes, uploaded_at,
                                   page_count, status, chunk_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                modality = excluded.modality,
                size_bytes = excluded.size_bytes,
                uploaded_at = excluded.uploaded_at,
                page_count = excluded.page_count,
                status = excluded.status,
                chunk_count = excluded.chunk_count
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.filename)
        .bind(doc.modality.as_str())
        .bind(doc.size_bytes as i64)
        .bind(doc.uploaded_at)
        .bind(doc.page_count.map(i64::from))
        .bind(doc.status.as_str())
        .bind(doc.chunk_count as i64)
        .execute(&mut *tx)
        .await?;

        for entry in entries {
            let chunk = &entry.chunk;
            let (kind, content, mime, caption) = match &chunk.content {
                ChunkContent::Text(text) => ("text", text.as_str(), None, None),
                ChunkContent::Image {
                    data,
                    mime,
                    caption,
                } => (
                    "image",
                    data.as_str(),
                    Some(mime.as_str()),
                    Some(caption.as_str()),
                ),
            };

            sqlx::query(
                r#"
                INSERT INTO index_entries (chunk_id, document_id, sequence, modality,
                                           content_kind, content, mime, caption,
                                           span_start, span_end, page_number, image_index,
                                           hash, filename, uploaded_at, space, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(i64::from(chunk.sequence))
            .bind(chunk.modality.as_str())
            .bind(kind)
            .bind(content)
            .bind(mime)
            .bind(caption)
            .bind(chunk.span.map(|s| s.start as i64))
            .bind(chunk.span.map(|s| s.end as i64))
            .bind(chunk.page_number.map(i64::from))
            .bind(chunk.image_index.map(i64::from))
            .bind(&chunk.hash)
            .bind(&entry.metadata.filename)
            .bind(entry.metadata.uploaded_at)
            .bind(entry.space.as_str())
            .bind(entry.vector.len() as i64)
            .bind(vec_to_blob(&entry.vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn search_inner(&self, request: &SearchRequest<'_>) -> Result<Vec<SearchHit>> {
        let filter = request.filter;
        let rows = sqlx::query(
            r#"
            SELECT * FROM index_entries
            WHERE space = ?
              AND (? IS NULL OR document_id = ?)
              AND (? IS NULL OR modality = ?)
              AND (? IS NULL OR modality != ?)
              AND (? IS NULL OR filename = ?)
            "#,
        )
        .bind(request.space.as_str())
        .bind(filter.document_id.as_deref())
        .bind(filter.document_id.as_deref())
        .bind(filter.modality.map(|m| m.as_str()))
        .bind(filter.modality.map(|m| m.as_str()))
        .bind(filter.exclude_modality.map(|m| m.as_str()))
        .bind(filter.exclude_modality.map(|m| m.as_str()))
        .bind(filter.filename.as_deref())
        .bind(filter.filename.as_deref())
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row.get("seq");
            let entry = entry_from_row(row)?;
            let score = cosine_similarity(request.vector, &entry.vector) as f64;
            hits.push((seq as u64, SearchHit { entry, score }));
        }
        Ok(rank_hits(hits, request.k))
    }

    async fn delete_inner(&self, document_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let entries = sqlx::query("DELETE FROM index_entries WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let docs = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(entries + docs > 0)
    }

    async fn get_document_inner(&self, document_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_documents_inner(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY uploaded_at DESC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn count_entries_inner(&self, filter: &MetadataFilter) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM index_entries
            WHERE (? IS NULL OR document_id = ?)
              AND (? IS NULL OR modality = ?)
              AND (? IS NULL OR modality != ?)
              AND (? IS NULL OR filename = ?)
              AND (? IS NULL OR space = ?)
            "#,
        )
        .bind(filter.document_id.as_deref())
        .bind(filter.document_id.as_deref())
        .bind(filter.modality.map(|m| m.as_str()))
        .bind(filter.modality.map(|m| m.as_str()))
        .bind(filter.exclude_modality.map(|m| m.as_str()))
        .bind(filter.exclude_modality.map(|m| m.as_str()))
        .bind(filter.filename.as_deref())
        .bind(filter.filename.as_deref())
        .bind(filter.space.as_ref().map(|s| s.as_str()))
        .bind(filter.space.as_ref().map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn stats_inner(&self) -> Result<IndexStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;

        let mut stats = IndexStats {
            documents: documents as usize,
            ..IndexStats::default()
        };

        let by_modality =
            sqlx::query("SELECT modality, COUNT(*) AS n FROM index_entries GROUP BY modality")
                .fetch_all(&self.pool)
                .await?;
        stats.entries_by_modality = group_counts(&by_modality, "modality");

        let by_space = sqlx::query("SELECT space, COUNT(*) AS n FROM index_entries GROUP BY space")
            .fetch_all(&self.pool)
            .await?;
        stats.entries_by_space = group_counts(&by_space, "space");

        stats.entries = stats.entries_by_space.values().sum();
        Ok(stats)
    }

    async fn reset_inner(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM index_entries")
            .execute(&mut *tx)
            .await?;
        let docs = sqlx::query("DELETE FROM documents")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(docs as usize)
    }
}

fn group_counts(rows: &[SqliteRow], key: &str) -> BTreeMap<String, usize> {
    rows.iter()
        .map(|row| {
            let k: String = row.get(key);
            let n: i64 = row.get("n");
            (k, n as usize)
        })
        .collect()
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let modality: String = row.get("modality");
    let status: String = row.get("status");
    let page_count: Option<i64> = row.get("page_count");
    let size_bytes: i64 = row.get("size_bytes");
    let chunk_count: i64 = row.get("chunk_count");
    Ok(Document {
        id: row.get("id"),
        filename: row.get("filename"),
        modality: Modality::from_str(&modality).map_err(|e| anyhow!(e))?,
        size_bytes: size_bytes as u64,
        uploaded_at: row.get("uploaded_at"),
        page_count: page_count.map(|p| p as u32),
        status: IngestionStatus::from_str(&status).map_err(|e| anyhow!(e))?,
        chunk_count: chunk_count as usize,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<IndexEntry> {
    let modality: String = row.get("modality");
    let modality = ChunkModality::from_str(&modality).map_err(|e| anyhow!(e))?;
    let kind: String = row.get("content_kind");
    let content: String = row.get("content");
    let content = match kind.as_str() {
        "text" => ChunkContent::Text(content),
        "image" => ChunkContent::Image {
            data: content,
            mime: row.get::<Option<String>, _>("mime").unwrap_or_default(),
            caption: row.get::<Option<String>, _>("caption").unwrap_or_default(),
        },
        other => return Err(anyhow!("unknown content kind '{}'", other)),
    };

    let span_start: Option<i64> = row.get("span_start");
    let span_end: Option<i64> = row.get("span_end");
    let span = match (span_start, span_end) {
        (Some(start), Some(end)) => Some(CharSpan {
            start: start as usize,
            end: end as usize,
        }),
        _ => None,
    };
    let page_number: Option<i64> = row.get("page_number");
    let image_index: Option<i64> = row.get("image_index");
    let sequence: i64 = row.get("sequence");
    let document_id: String = row.get("document_id");
    let blob: Vec<u8> = row.get("embedding");
    let space: String = row.get("space");

    let chunk = Chunk {
        id: row.get("chunk_id"),
        document_id: document_id.clone(),
        modality,
        sequence: sequence as u32,
        content,
        span,
        page_number: page_number.map(|p| p as u32),
        image_index: image_index.map(|i| i as u32),
        hash: row.get("hash"),
    };

    Ok(IndexEntry {
        metadata: EntryMetadata {
            document_id,
            filename: row.get("filename"),
            modality,
            uploaded_at: row.get("uploaded_at"),
            page_number: chunk.page_number,
        },
        chunk,
        vector: blob_to_vec(&blob),
        space: SpaceVersion::from_tag(space),
    })
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert(&self, document: &Document, entries: &[IndexEntry]) -> Result<(), IndexError> {
        validate_batch(document, entries)?;
        Ok(self.upsert_inner(document, entries).await?)
    }

    async fn search(&self, request: &SearchRequest<'_>) -> Result<Vec<SearchHit>, IndexError> {
        if request.k == 0 {
            return Ok(Vec::new());
        }
        Ok(self.search_inner(request).await?)
    }

    async fn delete(&self, document_id: &str) -> Result<bool, IndexError> {
        Ok(self.delete_inner(document_id).await?)
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, IndexError> {
        Ok(self.get_document_inner(document_id).await?)
    }

    async fn list_documents(&self) -> Result<Vec<Document>, IndexError> {
        Ok(self.list_documents_inner().await?)
    }

    async fn count_entries(&self, filter: &MetadataFilter) -> Result<usize, IndexError> {
        Ok(self.count_entries_inner(filter).await?)
    }

    async fn stats(&self) -> Result<IndexStats, IndexError> {
        Ok(self.stats_inner().await?)
    }

    async fn reset(&self) -> Result<usize, IndexError> {
        Ok(self.reset_inner().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use mmrag_core::chunk::{ChunkBuilder, ChunkingParams};
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> SqliteIndex {
        let config = Config::minimal(tmp.path().join("index.sqlite"));
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        SqliteIndex::new(pool)
    }

    fn doc(id: &str, modality: Modality) -> Document {
        Document {
            id: id.to_string(),
            filename: format!("{}.bin", id),
            modality,
            size_bytes: 42,
            uploaded_at: 1_700_000_000,
            page_count: None,
            status: IngestionStatus::Committed,
            chunk_count: 0,
        }
    }

    fn text_entries(d: &Document, vectors: &[Vec<f32>], space: &SpaceVersion) -> Vec<IndexEntry> {
        let params = ChunkingParams::new(4, 0).unwrap();
        let mut builder = ChunkBuilder::new(&d.id);
        builder.push_text(&"wxyz".repeat(vectors.len()), &params, None);
        builder
            .finish()
            .into_iter()
            .zip(vectors)
            .map(|(c, v)| IndexEntry::new(d, c, v.clone(), space.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_upsert_swaps_whole_generation() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let space = SpaceVersion::new("t", 2);
        let d = doc("d1", Modality::Text);

        let three = [vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]];
        index.upsert(&d, &text_entries(&d, &three, &space)).await.unwrap();
        index
            .upsert(&d, &text_entries(&d, &[vec![1.0, 0.0]], &space))
            .await
            .unwrap();

        let filter = MetadataFilter::document("d1");
        assert_eq!(index.count_entries(&filter).await.unwrap(), 1);
        assert_eq!(index.list_documents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_image_entries_round_trip() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let space = SpaceVersion::new("t", 2);
        let mut d = doc("pdf1", Modality::Pdf);
        d.page_count = Some(3);

        let mut builder = ChunkBuilder::new(&d.id);
        builder.push_image(&[9, 8, 7], "image/jpeg", "Image from pdf1.bin, page 3, image 2".into(), Some(3), Some(2));
        let chunk = builder.finish().remove(0);
        let entry = IndexEntry::new(&d, chunk.clone(), vec![0.6, 0.8], space.clone());
        index.upsert(&d, &[entry]).await.unwrap();

        let filter = MetadataFilter::default();
        let hits = index
            .search(&SearchRequest { vector: &[0.6, 0.8], space: &space, k: 5, filter: &filter })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.chunk, chunk);
        assert_eq!(hits[0].entry.metadata.page_number, Some(3));
        assert!((hits[0].score - 1.0).abs() < 1e-5);

        let stored = index.get_document("pdf1").await.unwrap().unwrap();
        assert_eq!(stored.page_count, Some(3));
        assert_eq!(stored.modality, Modality::Pdf);
    }

    #[tokio::test]
    async fn test_search_ties_and_spaces() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let current = SpaceVersion::new("t", 2);
        let old = SpaceVersion::new("old", 2);
        let a = doc("a", Modality::Text);
        let b = doc("b", Modality::Text);
        let c = doc("c", Modality::Text);
        index.upsert(&a, &text_entries(&a, &[vec![1.0, 0.0]], &current)).await.unwrap();
        index.upsert(&b, &text_entries(&b, &[vec![3.0, 0.0]], &current)).await.unwrap();
        index.upsert(&c, &text_entries(&c, &[vec![1.0, 0.0]], &old)).await.unwrap();

        let filter = MetadataFilter::default();
        let hits = index
            .search(&SearchRequest { vector: &[1.0, 0.0], space: &current, k: 10, filter: &filter })
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.entry.metadata.document_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.documents, 3);
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.stale_entries(&current), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_document_and_entries() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let space = SpaceVersion::new("t", 2);
        let d = doc("d1", Modality::Text);
        index
            .upsert(&d, &text_entries(&d, &[vec![1.0, 0.0], vec![0.0, 1.0]], &space))
            .await
            .unwrap();

        assert!(index.delete("d1").await.unwrap());
        assert!(!index.delete("d1").await.unwrap());
        assert!(index.get_document("d1").await.unwrap().is_none());
        assert_eq!(index.count_entries(&MetadataFilter::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_excluded_modality_and_space_counts() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let current = SpaceVersion::new("t", 2);
        let old = SpaceVersion::new("old", 2);
        let mut d = doc("pdf1", Modality::Pdf);
        d.page_count = Some(1);

        let params = ChunkingParams::new(50, 0).unwrap();
        let mut builder = ChunkBuilder::new(&d.id);
        builder.push_text("page one text", &params, Some(1));
        builder.push_image(&[1, 2, 3], "image/png", "Image from pdf1.bin, page 1, image 1".into(), Some(1), Some(1));
        let batch: Vec<IndexEntry> = builder
            .finish()
            .into_iter()
            .map(|c| IndexEntry::new(&d, c, vec![1.0, 0.0], current.clone()))
            .collect();
        index.upsert(&d, &batch).await.unwrap();

        let no_images = MetadataFilter::default().excluding(ChunkModality::Image);
        let hits = index
            .search(&SearchRequest { vector: &[1.0, 0.0], space: &current, k: 10, filter: &no_images })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.metadata.modality, ChunkModality::PdfPage);
        assert_eq!(index.count_entries(&no_images).await.unwrap(), 1);

        let in_current = MetadataFilter::document("pdf1").in_space(&current);
        assert_eq!(index.count_entries(&in_current).await.unwrap(), 2);
        let in_old = MetadataFilter::document("pdf1").in_space(&old);
        assert_eq!(index.count_entries(&in_old).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_clears_documents_and_entries() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        let space = SpaceVersion::new("t", 2);
        for id in ["a", "b", "c"] {
            let d = doc(id, Modality::Text);
            index.upsert(&d, &text_entries(&d, &[vec![1.0, 0.0]], &space)).await.unwrap();
        }

        assert_eq!(index.reset().await.unwrap(), 3);
        let stats = index.stats().await.unwrap();
        assert_eq!(stats.documents, 0);
        assert_eq!(stats.entries, 0);
        assert_eq!(index.reset().await.unwrap(), 0);

        // the index stays usable
        let d = doc("d", Modality::Text);
        index.upsert(&d, &text_entries(&d, &[vec![0.0, 1.0]], &space)).await.unwrap();
        assert_eq!(index.list_documents().await.unwrap().len(), 1);
    }
}
