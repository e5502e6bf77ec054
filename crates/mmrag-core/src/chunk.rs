//! Sliding-window text chunker and per-modality chunk builders.
//!
//! Text is split into fixed-size windows measured in Unicode scalar values
//! (never bytes), so a window boundary can never land inside a multibyte
//! character. Consecutive windows share `overlap` characters.
//!
//! # Algorithm
//!
//! 1. Collect the char offsets of the text (`len` = number of chars).
//! 2. If the text is empty or whitespace-only, produce no chunks.
//! 3. Emit `[start, min(start + window, len))`.
//! 4. Stop once a window reaches `len`; otherwise advance
//!    `start += window - overlap` and repeat.
//!
//! This yields exactly `ceil((len - overlap) / (window - overlap))` windows
//! for `len > window`, and one window otherwise.
//!
//! # Example
//!
//! ```rust
//! use mmrag_core::chunk::{text_windows, ChunkingParams};
//!
//! let text = "a".repeat(2400);
//! let windows = text_windows(&text, &ChunkingParams::default());
//! assert_eq!(windows.len(), 3);
//! assert_eq!(windows[2].0.start, 1600);
//! ```

use anyhow::{bail, Result};
use base64::Engine as _;

use crate::models::{
    chunk_id_for, content_hash, CharSpan, Chunk, ChunkContent, ChunkModality,
};

/// Window and overlap sizes, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    pub window: usize,
    pub overlap: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            window: 1000,
            overlap: 200,
        }
    }
}

impl ChunkingParams {
    pub fn new(window: usize, overlap: usize) -> Result<Self> {
        let params = Self { window, overlap };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            bail!("chunk window must be > 0");
        }
        if self.overlap >= self.window {
            bail!(
                "chunk overlap ({}) must be smaller than the window ({})",
                self.overlap,
                self.window
            );
        }
        Ok(())
    }

    fn step(&self) -> usize {
        self.window - self.overlap
    }
}

/// Number of windows [`text_windows`] produces for `char_len` characters.
pub fn expected_window_count(char_len: usize, params: &ChunkingParams) -> usize {
    if char_len == 0 {
        0
    } else if char_len <= params.window {
        1
    } else {
        (char_len - params.overlap).div_ceil(params.step())
    }
}

/// Split text into overlapping windows, returning each window's char span
/// and its text.
pub fn text_windows<'a>(text: &'a str, params: &ChunkingParams) -> Vec<(CharSpan, &'a str)> {
    if text.trim().is_empty() || params.validate().is_err() {
        return Vec::new();
    }

    // Byte offset of every char, plus the end of the string.
    let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let len = offsets.len();
    offsets.push(text.len());

    let mut windows = Vec::with_capacity(expected_window_count(len, params));
    let mut start = 0usize;
    loop {
        let end = (start + params.window).min(len);
        windows.push((CharSpan { start, end }, &text[offsets[start]..offsets[end]]));
        if end == len {
            break;
        }
        start += params.step();
    }
    windows
}

/// Incrementally assigns contiguous sequence numbers while chunks are built.
///
/// PDF chunking interleaves text windows and images page by page; the
/// builder keeps sequence numbers contiguous in emission order.
pub struct ChunkBuilder {
    document_id: String,
    next_sequence: u32,
    chunks: Vec<Chunk>,
}

impl ChunkBuilder {
    pub fn new(document_id: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            next_sequence: 0,
            chunks: Vec::new(),
        }
    }

    /// Window `text` and append one chunk per window.
    ///
    /// `page_number` set means the text came from a PDF page.
    pub fn push_text(&mut self, text: &str, params: &ChunkingParams, page_number: Option<u32>) {
        let modality = if page_number.is_some() {
            ChunkModality::PdfPage
        } else {
            ChunkModality::Text
        };
        for (span, window) in text_windows(text, params) {
            let sequence = self.bump();
            self.chunks.push(Chunk {
                id: chunk_id_for(&self.document_id, sequence),
                document_id: self.document_id.clone(),
                modality,
                sequence,
                content: ChunkContent::Text(window.to_string()),
                span: Some(span),
                page_number,
                image_index: None,
                hash: content_hash(window.as_bytes()),
            });
        }
    }

    /// Append one image chunk holding the full encoded image.
    pub fn push_image(
        &mut self,
        encoded: &[u8],
        mime: &str,
        caption: String,
        page_number: Option<u32>,
        image_index: Option<u32>,
    ) {
        let sequence = self.bump();
        self.chunks.push(Chunk {
            id: chunk_id_for(&self.document_id, sequence),
            document_id: self.document_id.clone(),
            modality: ChunkModality::Image,
            sequence,
            content: ChunkContent::Image {
                data: base64::engine::general_purpose::STANDARD.encode(encoded),
                mime: mime.to_string(),
                caption,
            },
            span: None,
            page_number,
            image_index,
            hash: content_hash(encoded),
        });
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn finish(self) -> Vec<Chunk> {
        self.chunks
    }

    fn bump(&mut self) -> u32 {
        let s = self.next_sequence;
        self.next_sequence += 1;
        s
    }
}

/// Chunk a plain-text document.
pub fn chunk_text(document_id: &str, text: &str, params: &ChunkingParams) -> Vec<Chunk> {
    let mut builder = ChunkBuilder::new(document_id);
    builder.push_text(text, params, None);
    builder.finish()
}

/// Decode the base64 payload of an image chunk.
pub fn decode_image_payload(content: &ChunkContent) -> Option<Vec<u8>> {
    match content {
        ChunkContent::Image { data, .. } => {
            base64::engine::general_purpose::STANDARD.decode(data).ok()
        }
        ChunkContent::Text(_) => None,
    }
}
