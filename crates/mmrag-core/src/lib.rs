//! # mmrag core
//!
//! Runtime-agnostic logic for mmrag: data models, chunking, the embedding
//! and generation traits, the vector index abstraction, context assembly,
//! citation binding, and conversation sessions.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! runtime-specific dependencies. Backends and orchestration live in the
//! `mmrag` application crate.

pub mod chunk;
pub mod citation;
pub mod context;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod models;
pub mod prompt;
pub mod session;
pub mod store;
