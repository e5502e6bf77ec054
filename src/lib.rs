//! # mmrag
//!
//! A local-first multimodal retrieval-augmented question answering engine.
//!
//! Text files, images, and PDFs are chunked, embedded into one shared vector
//! space by a dual encoder (CLIP ViT-B/32 by default), and stored in SQLite.
//! Questions are embedded into the same space, so a text question can
//! retrieve an image and the other way round. Retrieved chunks become a
//! numbered context for a chat model, and the answer comes back with
//! citations to the chunks it used.
//!
//! ## Architecture
//!
//! ```text
//!  bytes ─▶ extract ─▶ chunk ─▶ embed ─▶ ┌───────────────┐
//!            (ingest::IngestionCoordinator)│  SqliteIndex   │
//!                                         │ documents +    │
//!  question ─▶ embed ─▶ search ─────────▶ │ index_entries  │
//!        (retrieve::RetrievalOrchestrator)└───────┬───────┘
//!                 │                               │ hits
//!                 ▼                               ▼
//!        history + context ─▶ generator ─▶ answer + citations
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite-backed vector index |
//! | [`extract`] | Text, image, and PDF decoding |
//! | [`embedding`] | Dual-encoder backends |
//! | [`generation`] | Chat model backends |
//! | [`retry`] | Backoff, retry, and per-call timeouts |
//! | [`ingest`] | Ingestion coordinator |
//! | [`retrieve`] | Retrieval orchestrator |
//! | [`session`] | Conversation session store |
//! | [`engine`] | Facade wiring everything from config |
//! | [`commands`], [`stats`] | CLI command implementations |
//!
//! Models, chunking, context assembly, and citation binding live in the
//! runtime-agnostic `mmrag-core` crate.

pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod extract;
pub mod generation;
pub mod ingest;
pub mod migrate;
pub mod retrieve;
pub mod retry;
pub mod session;
pub mod sqlite_store;
pub mod stats;
