//! Engine facade.
//!
//! Wires the index, encoder, generator, and session store from
//! configuration and exposes the in-process entry points: [`Engine::ingest`],
//! [`Engine::remove`], [`Engine::answer`] and [`Engine::end_session`], plus
//! the helpers the CLI uses.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info};

use mmrag_core::embedding::Embedder;
use mmrag_core::generation::Generator;
use mmrag_core::models::{ConversationTurn, Document, IngestionResult, Modality, SpaceVersion};
use mmrag_core::store::{IndexStats, MetadataFilter, SearchHit, VectorIndex};

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::generation::create_generator;
use crate::ingest::IngestionCoordinator;
use crate::migrate;
use crate::retrieve::{Answer, AnswerOptions, RetrievalOrchestrator};
use crate::session::SessionStore;
use crate::sqlite_store::SqliteIndex;

pub struct Engine {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    sessions: Arc<SessionStore>,
    ingestion: IngestionCoordinator,
    retrieval: RetrievalOrchestrator,
    pool: Option<SqlitePool>,
}

impl Engine {
    /// Open the configured database (creating the schema if needed) and
    /// build the configured backends.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;

        let index: Arc<dyn VectorIndex> = Arc::new(SqliteIndex::new(pool.clone()));
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        let sessions = if config.sessions.persist {
            SessionStore::persistent(pool.clone())
        } else {
            SessionStore::in_memory()
        }
        .with_idle_timeout(config.sessions.idle_timeout());
        debug!(
            db = %config.db.path.display(),
            space = %embedder.space(),
            generator = generator.model_name(),
            "engine opened"
        );

        let mut engine = Self::new(config, index, embedder, generator, sessions);
        engine.pool = Some(pool);
        Ok(engine)
    }

    /// Build an engine from already constructed parts.
    pub fn new(
        config: &Config,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        sessions: SessionStore,
    ) -> Self {
        let sessions = Arc::new(sessions);
        let ingestion = IngestionCoordinator::new(config, index.clone(), embedder.clone());
        let retrieval = RetrievalOrchestrator::new(
            config,
            index.clone(),
            embedder.clone(),
            generator,
            sessions.clone(),
        );
        Self {
            index,
            embedder,
            sessions,
            ingestion,
            retrieval,
            pool: None,
        }
    }

    pub async fn ingest(
        &self,
        bytes: &[u8],
        filename: &str,
        modality: Option<Modality>,
    ) -> IngestionResult {
        self.ingestion.ingest(bytes, filename, modality).await
    }

    /// Remove a document. Returns `false` when it was not indexed.
    pub async fn remove(&self, document_id: &str) -> Result<bool> {
        Ok(self.ingestion.remove(document_id).await?)
    }

    pub async fn answer(&self, query: &str, session_id: &str) -> Result<Answer> {
        self.answer_with(query, session_id, AnswerOptions::default())
            .await
    }

    pub async fn answer_with(
        &self,
        query: &str,
        session_id: &str,
        options: AnswerOptions,
    ) -> Result<Answer> {
        self.retrieval.answer(query, session_id, options).await
    }

    /// Retrieval without generation.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SearchHit>> {
        self.retrieval.search(query, k, filter).await
    }

    pub fn new_session(&self) -> String {
        self.sessions.create()
    }

    /// End a conversation and discard its turns. Returns `false` when the
    /// session was not known.
    pub async fn end_session(&self, session_id: &str) -> Result<bool> {
        self.sessions.end(session_id).await
    }

    /// Recorded turns of a session, oldest first. Waits for any answer in
    /// progress on that session.
    pub async fn session_turns(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        let handle = self.sessions.open(session_id).await?;
        let session = handle.lock().await;
        Ok(session.turns.clone())
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        Ok(self.index.get_document(document_id).await?)
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        Ok(self.index.list_documents().await?)
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        Ok(self.index.stats().await?)
    }

    /// Drop every document and entry. Returns how many documents were
    /// removed. Sessions are left alone.
    pub async fn reset(&self) -> Result<usize> {
        let removed = self.index.reset().await?;
        info!(documents = removed, "index reset");
        Ok(removed)
    }

    /// Space new vectors are written in.
    pub fn space(&self) -> SpaceVersion {
        self.embedder.space()
    }

    pub async fn close(self) {
        if let Some(pool) = self.pool {
            pool.close().await;
        }
    }
}
