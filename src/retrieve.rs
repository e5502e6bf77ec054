//! Retrieval orchestrator.
//!
//! `answer` runs one conversational turn:
//!
//! 1. Lock the session (held until the turn is recorded).
//! 2. Optionally rewrite a follow-up into a standalone question.
//! 3. Embed the question and search the index for the top-k hits.
//! 4. Assemble the numbered context block within its character budget.
//! 5. Replay bounded history, then ask the generator.
//! 6. Bind citations and append the exchange to the session.
//!
//! Backend failures, including a session store that cannot be read, never
//! surface as errors: once retries are spent the caller gets a degraded
//! [`Answer`] with a fixed message, no citations, and nothing recorded in
//! the session.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use mmrag_core::citation::{bind_citations, Citation, SourceRef};
use mmrag_core::context::assemble_context;
use mmrag_core::embedding::{embed_query, Embedder};
use mmrag_core::generation::Generator;
use mmrag_core::models::ChunkModality;
use mmrag_core::prompt::{
    build_answer_request, build_rewrite_request, standalone_question,
    GENERATION_UNAVAILABLE_MESSAGE, NO_RESULTS_MESSAGE, SEARCH_UNAVAILABLE_MESSAGE,
    SESSION_UNAVAILABLE_MESSAGE,
};
use mmrag_core::session::{HistoryLimits, Session};
use mmrag_core::store::{MetadataFilter, SearchHit, SearchRequest, VectorIndex};

use crate::config::{Config, NoResultsPolicy};
use crate::retry::{with_retry, RetryPolicy};
use crate::session::SessionStore;

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
    /// Every hit placed in the context, in marker order.
    pub sources: Vec<SourceRef>,
    /// True when a backend failure replaced the answer with a fixed message.
    pub degraded: bool,
    pub session_id: String,
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnswerOptions {
    /// Restrict retrieval to chunks of one modality.
    pub modality: Option<ChunkModality>,
    /// Leave chunks of this modality out of retrieval.
    pub exclude_modality: Option<ChunkModality>,
    /// Overrides `retrieval.top_k`.
    pub top_k: Option<usize>,
}

pub struct RetrievalOrchestrator {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    sessions: Arc<SessionStore>,
    top_k: usize,
    context_budget: usize,
    history: HistoryLimits,
    no_results: NoResultsPolicy,
    rewrite_followups: bool,
    temperature: f32,
    embed_retry: RetryPolicy,
    generation_retry: RetryPolicy,
    index_retry: RetryPolicy,
}

impl RetrievalOrchestrator {
    pub fn new(
        config: &Config,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            index,
            embedder,
            generator,
            sessions,
            top_k: config.retrieval.top_k,
            context_budget: config.retrieval.context_budget_chars,
            history: config.retrieval.history_limits(),
            no_results: config.retrieval.no_results,
            rewrite_followups: config.retrieval.rewrite_followups,
            temperature: config.generation.temperature,
            embed_retry: RetryPolicy::new(
                config.embedding.max_retries,
                config.embedding.backoff_base_ms,
                config.embedding.timeout_secs,
            ),
            generation_retry: RetryPolicy::new(
                config.generation.max_retries,
                config.generation.backoff_base_ms,
                config.generation.timeout_secs,
            ),
            index_retry: RetryPolicy::INDEX,
        }
    }

    /// Embed `query` and return the best `k` hits passing `filter`.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SearchHit>> {
        let embedder = self.embedder.as_ref();
        let vector = with_retry(&self.embed_retry, "embed query", || {
            embed_query(embedder, query)
        })
        .await
        .context("query embedding failed")?;

        let space = self.embedder.space();
        let request = SearchRequest {
            vector: &vector,
            space: &space,
            k,
            filter,
        };
        let hits = with_retry(&self.index_retry, "index search", || {
            self.index.search(&request)
        })
        .await
        .context("index search failed")?;
        Ok(hits)
    }

    pub async fn answer(
        &self,
        query: &str,
        session_id: &str,
        options: AnswerOptions,
    ) -> Result<Answer> {
        let handle = match self.sessions.open(session_id).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(session_id, error = %format!("{:#}", e), "session unavailable; degraded answer");
                return Ok(degraded(SESSION_UNAVAILABLE_MESSAGE, session_id));
            }
        };
        let mut session = handle.lock().await;

        let history = session.recent(&self.history).to_vec();
        let question = self.retrieval_question(query, &session).await;

        let filter = MetadataFilter {
            modality: options.modality,
            exclude_modality: options.exclude_modality,
            ..MetadataFilter::default()
        };
        let k = options.top_k.unwrap_or(self.top_k).max(1);
        let hits = match self.search(&question, k, &filter).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(session_id, error = %format!("{:#}", e), "search unavailable; degraded answer");
                return Ok(degraded(SEARCH_UNAVAILABLE_MESSAGE, session_id));
            }
        };
        debug!(session_id, hits = hits.len(), "retrieved");

        if hits.is_empty() && self.no_results == NoResultsPolicy::ShortCircuit {
            info!(session_id, "no matching sources");
            self.record(&mut session, query, NO_RESULTS_MESSAGE).await;
            return Ok(Answer {
                text: NO_RESULTS_MESSAGE.to_string(),
                citations: Vec::new(),
                sources: Vec::new(),
                degraded: false,
                session_id: session_id.to_string(),
            });
        }

        let context = assemble_context(&hits, self.context_budget);
        let request = build_answer_request(query, &context, &history, self.temperature);
        let generator = self.generator.as_ref();
        let text = match with_retry(&self.generation_retry, "generate answer", || {
            generator.generate(&request)
        })
        .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(session_id, error = %e, "generation failed; degraded answer");
                return Ok(degraded(GENERATION_UNAVAILABLE_MESSAGE, session_id));
            }
        };

        let citations = bind_citations(&text, &context);
        let sources = context.sources.iter().map(SourceRef::from).collect();
        self.record(&mut session, query, &text).await;

        info!(
            session_id,
            sources = context.sources.len(),
            citations = citations.len(),
            "answered"
        );
        Ok(Answer {
            text,
            citations,
            sources,
            degraded: false,
            session_id: session_id.to_string(),
        })
    }

    /// The question used for retrieval. Follow-ups are rewritten when
    /// enabled; any rewrite failure falls back to the user's text.
    async fn retrieval_question(&self, query: &str, session: &Session) -> String {
        if !self.rewrite_followups || session.is_empty() {
            return query.to_string();
        }
        let request = build_rewrite_request(query, &session.turns);
        let generator = self.generator.as_ref();
        match with_retry(&self.generation_retry, "rewrite follow-up", || {
            generator.generate(&request)
        })
        .await
        {
            Ok(rewritten) => {
                let question = standalone_question(&rewritten, query);
                debug!(original = query, rewritten = %question, "follow-up rewritten");
                question
            }
            Err(e) => {
                warn!(error = %e, "follow-up rewrite failed; using original question");
                query.to_string()
            }
        }
    }

    async fn record(&self, session: &mut Session, question: &str, answer: &str) {
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self
            .sessions
            .record_exchange(session, question, answer, now)
            .await
        {
            // Keep the turn in memory even if it could not be persisted.
            warn!(session_id = %session.id, error = %format!("{:#}", e), "failed to persist turn");
            session.record_exchange(question, answer, now);
        }
    }
}

fn degraded(message: &str, session_id: &str) -> Answer {
    Answer {
        text: message.to_string(),
        citations: Vec::new(),
        sources: Vec::new(),
        degraded: true,
        session_id: session_id.to_string(),
    }
}
