//! Core data models used throughout mmrag.
//!
//! These types represent the documents, chunks, index entries, and
//! conversation state that flow through the ingestion and retrieval
//! pipeline.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::ExtractionWarning;

/// Number of hex characters of the SHA-256 digest used as a document id.
const DOCUMENT_ID_HEX_LEN: usize = 16;

/// Declared or detected modality of a whole document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Pdf,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
            Modality::Pdf => "pdf",
        }
    }

    /// Classify a filename by extension.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = filename.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "txt" | "md" | "markdown" | "csv" | "log" => Some(Modality::Text),
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" => Some(Modality::Image),
            "pdf" => Some(Modality::Pdf),
            _ => None,
        }
    }

    /// Classify raw bytes by magic number, falling back to UTF-8 validity.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        const IMAGE_MAGIC: [&[u8]; 4] = [b"\x89PNG\r\n\x1a\n", b"\xFF\xD8\xFF", b"GIF87a", b"GIF89a"];
        if bytes.starts_with(b"%PDF-") {
            return Some(Modality::Pdf);
        }
        if IMAGE_MAGIC.iter().any(|m| bytes.starts_with(m)) {
            return Some(Modality::Image);
        }
        if bytes.len() > 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
            return Some(Modality::Image);
        }
        // "BM" alone is too common in text; require the header's size field to match.
        if bytes.len() > 14 && bytes.starts_with(b"BM") {
            let declared = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
            if declared as usize == bytes.len() {
                return Some(Modality::Image);
            }
        }
        if std::str::from_utf8(bytes).is_ok() {
            return Some(Modality::Text);
        }
        None
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Modality::Text),
            "image" => Ok(Modality::Image),
            "pdf" => Ok(Modality::Pdf),
            other => Err(format!(
                "unknown modality '{}': expected text, image, or pdf",
                other
            )),
        }
    }
}

/// Modality tag of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkModality {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "pdf-page")]
    PdfPage,
}

impl ChunkModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkModality::Text => "text",
            ChunkModality::Image => "image",
            ChunkModality::PdfPage => "pdf-page",
        }
    }

    /// True for chunks whose content goes through the text encoder.
    pub fn is_textual(&self) -> bool {
        !matches!(self, ChunkModality::Image)
    }
}

impl fmt::Display for ChunkModality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkModality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ChunkModality::Text),
            "image" => Ok(ChunkModality::Image),
            "pdf-page" => Ok(ChunkModality::PdfPage),
            other => Err(format!("unknown chunk modality '{}'", other)),
        }
    }
}

/// Outcome of the most recent ingestion of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Committed,
    PartiallyCommitted,
    Rejected,
    /// A transient backend failure exhausted its retry budget; nothing was
    /// written and the same request can be retried.
    Degraded,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Committed => "committed",
            IngestionStatus::PartiallyCommitted => "partially_committed",
            IngestionStatus::Rejected => "rejected",
            IngestionStatus::Degraded => "degraded",
        }
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "committed" => Ok(IngestionStatus::Committed),
            "partially_committed" => Ok(IngestionStatus::PartiallyCommitted),
            "rejected" => Ok(IngestionStatus::Rejected),
            "degraded" => Ok(IngestionStatus::Degraded),
            other => Err(format!("unknown ingestion status '{}'", other)),
        }
    }
}

/// A stored document. Immutable once committed; identity is content-derived.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub modality: Modality,
    pub size_bytes: u64,
    /// Unix seconds.
    pub uploaded_at: i64,
    pub page_count: Option<u32>,
    pub status: IngestionStatus,
    pub chunk_count: usize,
}

/// Derive the stable document id from raw bytes.
///
/// Identical bytes always map to the same id, regardless of filename.
pub fn document_id_for(bytes: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(bytes));
    digest[..DOCUMENT_ID_HEX_LEN].to_string()
}

/// SHA-256 hex digest of arbitrary content.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Character offsets `[start, end)` of a text window within its source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CharSpan {
    pub start: usize,
    pub end: usize,
}

/// Retrievable payload of a chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChunkContent {
    Text(String),
    Image {
        /// Base64 (standard alphabet) of the encoded image.
        data: String,
        mime: String,
        /// Human-readable description used in prompts and listings.
        caption: String,
    },
}

impl ChunkContent {
    /// Text shown to the generator and to users for this content.
    pub fn display_text(&self) -> &str {
        match self {
            ChunkContent::Text(t) => t,
            ChunkContent::Image { caption, .. } => caption,
        }
    }
}

/// A chunk of a document: the minimal retrievable unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub modality: ChunkModality,
    /// 0-based position within the document's chunk sequence.
    pub sequence: u32,
    pub content: ChunkContent,
    pub span: Option<CharSpan>,
    /// 1-based PDF page number.
    pub page_number: Option<u32>,
    /// 1-based image index within a PDF page.
    pub image_index: Option<u32>,
    /// SHA-256 of the content, used to skip duplicate embedding calls.
    pub hash: String,
}

/// Deterministic chunk id: stable for the same document and sequence.
pub fn chunk_id_for(document_id: &str, sequence: u32) -> String {
    format!("{}-{:05}", document_id, sequence)
}

/// Tag identifying the embedding space a vector was produced in.
///
/// Vectors from different spaces are never compared; changing the encoder
/// changes the tag, which makes stale entries detectable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SpaceVersion(String);

impl SpaceVersion {
    pub fn new(model: &str, dims: usize) -> Self {
        Self(format!("{}@{}", model, dims))
    }

    /// Wrap a tag read back from storage.
    pub fn from_tag(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpaceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata persisted next to every vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryMetadata {
    pub document_id: String,
    pub filename: String,
    pub modality: ChunkModality,
    pub uploaded_at: i64,
    pub page_number: Option<u32>,
}

/// A (vector, chunk payload, metadata) triple owned by the vector index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexEntry {
    pub chunk: Chunk,
    #[serde(skip)]
    pub vector: Vec<f32>,
    pub space: SpaceVersion,
    pub metadata: EntryMetadata,
}

impl IndexEntry {
    pub fn new(document: &Document, chunk: Chunk, vector: Vec<f32>, space: SpaceVersion) -> Self {
        let metadata = EntryMetadata {
            document_id: document.id.clone(),
            filename: document.filename.clone(),
            modality: chunk.modality,
            uploaded_at: document.uploaded_at,
            page_number: chunk.page_number,
        };
        Self {
            chunk,
            vector,
            space,
            metadata,
        }
    }
}

/// Report returned by the ingestion entry point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionResult {
    pub status: IngestionStatus,
    pub document_id: String,
    pub chunks_committed: usize,
    /// True when identical bytes were already committed and nothing was
    /// re-processed.
    pub deduplicated: bool,
    pub warnings: Vec<ExtractionWarning>,
    /// Cause of a rejection or degradation.
    pub reason: Option<String>,
}

impl IngestionResult {
    pub fn rejected(document_id: &str, reason: impl Into<String>) -> Self {
        Self {
            status: IngestionStatus::Rejected,
            document_id: document_id.to_string(),
            chunks_committed: 0,
            deduplicated: false,
            warnings: Vec::new(),
            reason: Some(reason.into()),
        }
    }

    pub fn degraded(
        document_id: &str,
        reason: impl Into<String>,
        warnings: Vec<ExtractionWarning>,
    ) -> Self {
        Self {
            status: IngestionStatus::Degraded,
            document_id: document_id.to_string(),
            chunks_committed: 0,
            deduplicated: false,
            warnings,
            reason: Some(reason.into()),
        }
    }
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub created_at: i64,
}
